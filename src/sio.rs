//! SIOVの置き換え
//!
//! デバイス制御ブロック (DCB, $0300-$030B) のコマンドをホスト側で処理する。
//! 結果はDSTATSとYレジスタに入り、エラーならNフラグが立つ。

use crate::binload;
use crate::escape::EscapeHost;
use crate::patch_log;

/// DCB
pub const DDEVIC: u16 = 0x0300;
pub const DUNIT: u16 = 0x0301;
pub const DCOMND: u16 = 0x0302;
pub const DSTATS: u16 = 0x0303;
pub const DBUFLO: u16 = 0x0304;
pub const DBYTLO: u16 = 0x0308;
pub const DAUX1: u16 = 0x030A;

/// ディスクのデバイスID（ユニット番号を足す前）
pub const DISK_DEVICE: u8 = 0x31;
/// カセットのデバイスID
pub const CASSETTE_DEVICE: u8 = 0x60;

/// SIOコマンド
pub mod command {
    pub const READ: u8 = 0x52;
    pub const WRITE: u8 = 0x57;
    pub const PUT: u8 = 0x50;
    pub const STATUS: u8 = 0x53;
    pub const FORMAT: u8 = 0x21;
    pub const FORMAT_MEDIUM: u8 = 0x22;
}

/// SIOの結果コード
pub mod status {
    pub const OK: u8 = 1;
    pub const TIMEOUT: u8 = 138;
    pub const NAK: u8 = 139;
    pub const ERROR: u8 = 144;
}

/// DCBの内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dcb {
    pub device: u8,
    pub unit: u8,
    pub command: u8,
    pub buffer: u16,
    pub length: u16,
    pub aux: u16,
}

impl Dcb {
    pub fn read(host: &mut EscapeHost<'_>) -> Self {
        let memory = &mut *host.memory;
        Dcb {
            device: memory.dget_byte(DDEVIC),
            unit: memory.dget_byte(DUNIT),
            command: memory.dget_byte(DCOMND),
            buffer: memory.dget_word(DBUFLO),
            length: memory.dget_word(DBYTLO),
            aux: memory.dget_word(DAUX1),
        }
    }

    /// ディスクドライブの添字 (D1: = 0)
    pub fn drive_index(&self) -> Option<usize> {
        let index = (self.device as u16 + self.unit as u16).checked_sub(0x32)?;
        (index < 8).then_some(index as usize)
    }
}

/// SIOVエスケープのハンドラ
pub fn handle(host: &mut EscapeHost<'_>) {
    let dcb = Dcb::read(host);
    let result = if dcb.device == CASSETTE_DEVICE {
        cassette(host, &dcb)
    } else {
        match dcb.drive_index() {
            Some(index) => disk(host, &dcb, index),
            None => status::TIMEOUT,
        }
    };
    patch_log::log_sio_command(dcb.device, dcb.unit, dcb.command, dcb.aux, result);
    host.memory.dput_byte(DSTATS, result);
    host.set_status(result);
}

fn disk(host: &mut EscapeHost<'_>, dcb: &Dcb, index: usize) -> u8 {
    if index == 0
        && host.devices.start_binloading
        && dcb.command == command::READ
        && dcb.aux == 1
    {
        binload::inject_boot_sector(host, dcb.buffer);
        return status::OK;
    }

    let memory = &mut *host.memory;
    let Some(drive) = host.devices.drive_mut(index) else {
        return status::TIMEOUT;
    };
    let sector = dcb.aux as u32;

    match dcb.command {
        command::READ => match drive.image.read_sector(sector) {
            Some(data) => {
                let n = data.len().min(dcb.length as usize);
                memory.copy_in(dcb.buffer, &data[..n]);
                status::OK
            }
            None => status::NAK,
        },
        command::WRITE | command::PUT => {
            if drive.read_only {
                return status::ERROR;
            }
            let Some(len) = drive.image.sector_len(sector) else {
                return status::NAK;
            };
            let data = memory.copy_out(dcb.buffer, len.min(dcb.length as usize));
            if drive.image.write_sector(sector, &data) {
                drive.dirty = true;
                status::OK
            } else {
                status::NAK
            }
        }
        command::STATUS => {
            let first = drive.image.drive_status(drive.read_only);
            memory.copy_in(dcb.buffer, &[first, 0xFF, 0xE0, 0x00]);
            status::OK
        }
        command::FORMAT | command::FORMAT_MEDIUM => {
            if drive.read_only {
                return status::ERROR;
            }
            drive.image.format_blank();
            drive.dirty = true;
            // 不良セクタリスト（なし）
            let len = (dcb.length as usize).min(drive.image.sector_size() as usize);
            memory.copy_in(dcb.buffer, &vec![0xFF; len]);
            status::OK
        }
        _ => status::NAK,
    }
}

fn cassette(host: &mut EscapeHost<'_>, dcb: &Dcb) -> u8 {
    let memory = &mut *host.memory;
    let Some(tape) = host.devices.cassette.as_mut() else {
        return status::TIMEOUT;
    };
    match dcb.command {
        command::READ => match tape.next_record() {
            Some(record) => {
                // チェックサムはSIOが検査済みとして渡さない
                let body = &record.data[..record.data.len().saturating_sub(1)];
                let n = body.len().min(dcb.length as usize);
                memory.copy_in(dcb.buffer, &body[..n]);
                status::OK
            }
            None => status::TIMEOUT,
        },
        command::WRITE | command::PUT => status::ERROR,
        _ => status::NAK,
    }
}
