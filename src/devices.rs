//! ホスト側で実装する周辺装置
//!
//! ディスクドライブ、カセットデッキ、プリンタ、BASICローダ用のエディタ入力。
//! CIOハンドラはエスケープから呼ばれ、結果をYレジスタに返す。

use std::collections::VecDeque;

use crate::binload::BinLoader;
use crate::escape::{codes, CioEntry, EscapeHost};
use crate::media::basic::EOL;
use crate::media::{DiskImage, Tape};
use crate::patch_log;

/// ドライブ数 (D1: - D8:)
pub const DRIVE_COUNT: usize = 8;

/// CIOの結果コード
pub mod cio_status {
    pub const SUCCESS: u8 = 1;
    pub const FUNCTION_NOT_SUPPORTED: u8 = 146;
}

/// マウント中のディスク
#[derive(Debug, Clone)]
pub struct Drive {
    pub image: DiskImage,
    pub read_only: bool,
    /// 書き込みがあった
    pub dirty: bool,
}

impl Drive {
    pub fn new(image: DiskImage, read_only: bool) -> Self {
        Drive { image, read_only, dirty: false }
    }
}

/// プリンタ出力の蓄積
#[derive(Debug, Clone, Default)]
pub struct Printer {
    output: String,
    open: bool,
}

impl Printer {
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    fn put(&mut self, byte: u8) {
        if byte == EOL {
            self.output.push('\n');
        } else {
            self.output.push(byte as char);
        }
    }
}

/// エディタ入力として流し込むバイト列
#[derive(Debug, Clone, Default)]
pub struct BasicFeed {
    queue: VecDeque<u8>,
}

impl BasicFeed {
    pub fn new(queue: VecDeque<u8>) -> Self {
        BasicFeed { queue }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

/// 全装置
#[derive(Debug, Default)]
pub struct Devices {
    pub drives: [Option<Drive>; DRIVE_COUNT],
    pub cassette: Option<Tape>,
    pub printer: Printer,
    pub binloader: Option<BinLoader>,
    pub basic_feed: Option<BasicFeed>,
    /// 次のD1: セクタ1読み取りでバイナリローダを起動する
    pub start_binloading: bool,
    /// カセットブートのためにSTARTキーを押し続ける
    pub hold_start: bool,
}

impl Devices {
    pub fn drive(&self, index: usize) -> Option<&Drive> {
        self.drives.get(index).and_then(|d| d.as_ref())
    }

    pub fn drive_mut(&mut self, index: usize) -> Option<&mut Drive> {
        self.drives.get_mut(index).and_then(|d| d.as_mut())
    }

    /// 全メディアを外す
    pub fn eject_all(&mut self) {
        for drive in &mut self.drives {
            *drive = None;
        }
        self.cassette = None;
        self.binloader = None;
        self.basic_feed = None;
        self.start_binloading = false;
        self.hold_start = false;
    }
}

/// プリンタ (P:) の各エントリ
pub fn printer_entry(entry: CioEntry, host: &mut EscapeHost<'_>) {
    let printer = &mut host.devices.printer;
    let status = match entry {
        CioEntry::Open => {
            printer.open = true;
            cio_status::SUCCESS
        }
        CioEntry::Close => {
            printer.open = false;
            cio_status::SUCCESS
        }
        CioEntry::Write => {
            printer.put(host.regs.a);
            cio_status::SUCCESS
        }
        CioEntry::Status => cio_status::SUCCESS,
        CioEntry::Read | CioEntry::Special => cio_status::FUNCTION_NOT_SUPPORTED,
    };
    patch_log::log_escape_call(entry.code(codes::PHOPEN), host.regs.pc);
    host.set_status(status);
}

/// エディタ READ: 用意したバイトを1つずつ返す
///
/// 使い切ったらエスケープを外し、ROMのルーチンを最初から実行させる。
pub fn editor_read(host: &mut EscapeHost<'_>) {
    let next = host
        .devices
        .basic_feed
        .as_mut()
        .and_then(|feed| feed.queue.pop_front());
    match next {
        Some(byte) => {
            host.regs.a = byte;
            host.set_status(cio_status::SUCCESS);
        }
        None => {
            log::info!("BASIC program fed through E:");
            host.devices.basic_feed = None;
            host.regs.pc = host.regs.pc.wrapping_sub(2);
            host.remove_esc(codes::EHREAD);
        }
    }
}
