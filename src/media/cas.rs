//! カセットイメージ (CAS) とブートテープ
//!
//! CASはチャンクの並び: ID (4バイト)、長さ (LE16)、補助値 (LE16)、データ。
//! ブートテープはヘッダのない128バイトブロックの並び。

use crate::error::MediaError;

pub const CAS_MAGIC: &[u8; 4] = b"FUJI";

/// レコードの先頭マーカー
pub const RECORD_SYNC: [u8; 2] = [0x55, 0x55];
/// 128バイトのデータを持つレコード
pub const RECORD_FULL: u8 = 0xFC;
/// 最終レコード
pub const RECORD_END: u8 = 0xFE;

/// 既定の転送速度
pub const DEFAULT_BAUD: u16 = 600;

/// SIOのチェックサム（桁上がりを足し戻す加算）
pub fn sio_checksum(bytes: &[u8]) -> u8 {
    let mut sum: u16 = 0;
    for &b in bytes {
        sum += b as u16;
        if sum > 0xFF {
            sum = (sum & 0xFF) + 1;
        }
    }
    sum as u8
}

/// テープ上の1レコード
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeRecord {
    /// 同期マーカー・制御バイト・データ・チェックサムを含む
    pub data: Vec<u8>,
    /// 直前の無音区間 (ms)
    pub gap_ms: u16,
    pub baud: u16,
}

/// カセットテープ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tape {
    description: String,
    records: Vec<TapeRecord>,
    position: usize,
}

impl Tape {
    /// CASファイルを読む
    pub fn from_cas(bytes: &[u8]) -> Result<Self, MediaError> {
        if bytes.len() < 8 || &bytes[0..4] != CAS_MAGIC {
            return Err(MediaError::MalformedHeader("missing FUJI chunk"));
        }
        let mut tape = Tape::default();
        let mut baud = DEFAULT_BAUD;
        let mut pos = 0;
        while pos < bytes.len() {
            let header = bytes
                .get(pos..pos + 8)
                .ok_or(MediaError::Truncated { what: "CAS chunk header", offset: pos })?;
            let id = [header[0], header[1], header[2], header[3]];
            let len = u16::from_le_bytes([header[4], header[5]]) as usize;
            let aux = u16::from_le_bytes([header[6], header[7]]);
            let body = bytes
                .get(pos + 8..pos + 8 + len)
                .ok_or(MediaError::Truncated { what: "CAS chunk data", offset: pos + 8 })?;
            match &id {
                b"FUJI" => tape.description = String::from_utf8_lossy(body).trim_end().to_string(),
                b"baud" => baud = aux,
                b"data" => tape.records.push(TapeRecord {
                    data: body.to_vec(),
                    gap_ms: aux,
                    baud,
                }),
                other => log::debug!("CAS: skipping chunk {:?}", String::from_utf8_lossy(other)),
            }
            pos += 8 + len;
        }
        log::info!("CAS: {} record(s) \"{}\"", tape.records.len(), tape.description);
        Ok(tape)
    }

    /// ブートテープ（128バイトブロック）をレコードに組み立てる
    pub fn from_boot_tape(bytes: &[u8]) -> Result<Self, MediaError> {
        if bytes.is_empty() || bytes.len() % 128 != 0 {
            return Err(MediaError::MalformedHeader("boot tape length is not a multiple of 128"));
        }
        let mut records: Vec<TapeRecord> = bytes
            .chunks(128)
            .enumerate()
            .map(|(i, block)| Self::framed(RECORD_FULL, block, if i == 0 { 20000 } else { 250 }))
            .collect();
        records.push(Self::framed(RECORD_END, &[0; 128], 250));
        Ok(Tape {
            description: String::from("boot tape"),
            records,
            position: 0,
        })
    }

    fn framed(control: u8, block: &[u8], gap_ms: u16) -> TapeRecord {
        let mut data = Vec::with_capacity(132);
        data.extend_from_slice(&RECORD_SYNC);
        data.push(control);
        data.extend_from_slice(block);
        let sum = sio_checksum(&data);
        data.push(sum);
        TapeRecord { data, gap_ms, baud: DEFAULT_BAUD }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn records(&self) -> &[TapeRecord] {
        &self.records
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn is_at_end(&self) -> bool {
        self.position >= self.records.len()
    }

    /// 次のレコードを読んで進める
    pub fn next_record(&mut self) -> Option<&TapeRecord> {
        let record = self.records.get(self.position)?;
        self.position += 1;
        Some(record)
    }
}
