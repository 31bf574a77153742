//! 実行ファイル (XEX) のセグメント
//!
//! `FF FF` ヘッダの後に「開始アドレス, 終了アドレス, データ」が続く。
//! セグメントの途中に `FF FF` が再び現れてもよい。

use crate::error::MediaError;

/// 1セグメント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start: u16,
    pub data: Vec<u8>,
}

impl Segment {
    /// 終了アドレス（含む）。空のセグメントは開始アドレスを返す
    pub fn end(&self) -> u16 {
        match self.data.len().checked_sub(1) {
            Some(last) => self.start.wrapping_add(last as u16),
            None => self.start,
        }
    }
}

fn word_at(bytes: &[u8], pos: usize) -> Result<u16, MediaError> {
    match bytes.get(pos..pos + 2) {
        Some(w) => Ok(u16::from_le_bytes([w[0], w[1]])),
        None => Err(MediaError::Truncated { what: "XEX segment header", offset: pos }),
    }
}

/// 全セグメントを読む。途中で切れていたらエラー
pub fn parse_segments(bytes: &[u8]) -> Result<Vec<Segment>, MediaError> {
    if bytes.len() < 2 || bytes[0..2] != [0xFF, 0xFF] {
        return Err(MediaError::MalformedHeader("missing XEX $FFFF header"));
    }
    let mut segments = Vec::new();
    let mut pos = 2;
    while pos < bytes.len() {
        let mut start = word_at(bytes, pos)?;
        pos += 2;
        if start == 0xFFFF {
            start = word_at(bytes, pos)?;
            pos += 2;
        }
        let end = word_at(bytes, pos)?;
        pos += 2;
        if end < start {
            return Err(MediaError::MalformedHeader("XEX segment ends before it starts"));
        }
        let len = (end - start) as usize + 1;
        let data = bytes
            .get(pos..pos + len)
            .ok_or(MediaError::Truncated { what: "XEX segment data", offset: bytes.len() })?;
        segments.push(Segment { start, data: data.to_vec() });
        pos += len;
    }
    if segments.is_empty() {
        return Err(MediaError::MalformedHeader("XEX file has no segments"));
    }
    log::debug!("XEX: {} segment(s)", segments.len());
    Ok(segments)
}
