//! BASICプログラム（トークン化 / リスト）
//!
//! どちらもエディタ (E:) からの入力としてBASICに流し込む。

use std::collections::VecDeque;

use crate::error::MediaError;

/// ATASCIIの改行 (EOL)
pub const EOL: u8 = 0x9B;

/// トークン化プログラムのヘッダ長（変数表などのポインタ）
pub const TOKENIZED_HEADER_SIZE: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasicProgram {
    /// SAVEされた形式
    Tokenized(Vec<u8>),
    /// LISTされた形式（テキスト）
    Listed(Vec<u8>),
}

impl BasicProgram {
    pub fn tokenized(bytes: &[u8]) -> Result<Self, MediaError> {
        if bytes.len() < TOKENIZED_HEADER_SIZE {
            return Err(MediaError::Truncated { what: "BASIC program header", offset: bytes.len() });
        }
        Ok(BasicProgram::Tokenized(bytes.to_vec()))
    }

    pub fn listed(bytes: &[u8]) -> Result<Self, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::Unrecognized);
        }
        Ok(BasicProgram::Listed(bytes.to_vec()))
    }

    /// エディタから読ませるバイト列
    ///
    /// SAVE形式は `RUN "E:"` を打ち込んでから本体を流す。
    /// LIST形式は改行を EOL に変え、最後に `RUN` を打ち込む。
    pub fn editor_stream(&self) -> VecDeque<u8> {
        let mut out = VecDeque::new();
        match self {
            BasicProgram::Tokenized(bytes) => {
                out.extend(b"RUN \"E:\"".iter().copied());
                out.push_back(EOL);
                out.extend(bytes.iter().copied());
            }
            BasicProgram::Listed(text) => {
                for &b in text {
                    match b {
                        b'\r' => {}
                        b'\n' => out.push_back(EOL),
                        _ => out.push_back(b),
                    }
                }
                if out.back() != Some(&EOL) {
                    out.push_back(EOL);
                }
                out.extend(b"RUN".iter().copied());
                out.push_back(EOL);
            }
        }
        out
    }
}

/// 先頭行が「行番号 + 空白」で始まる表示可能なテキストか（判定用）
pub fn looks_like_listing(bytes: &[u8]) -> bool {
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || digits > 5 || bytes.get(digits) != Some(&b' ') {
        return false;
    }
    bytes
        .iter()
        .take_while(|&&b| b != b'\n' && b != EOL)
        .all(|&b| b == b'\r' || (0x20..0x7F).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_detection() {
        assert!(looks_like_listing(b"10 PRINT \"HI\"\r\n20 GOTO 10\n"));
        assert!(!looks_like_listing(b"PRINT"));
        assert!(!looks_like_listing(b"10PRINT"));
        assert!(!looks_like_listing(b"10 \x01\x02"));
        assert!(!looks_like_listing(&[0; 64]));
    }

    #[test]
    fn test_listed_stream() {
        let program = BasicProgram::listed(b"10 ? 1\r\n20 END").unwrap();
        let stream: Vec<u8> = program.editor_stream().into_iter().collect();
        let mut expected = b"10 ? 1".to_vec();
        expected.push(EOL);
        expected.extend_from_slice(b"20 END");
        expected.push(EOL);
        expected.extend_from_slice(b"RUN");
        expected.push(EOL);
        assert_eq!(stream, expected);
    }

    #[test]
    fn test_tokenized_stream() {
        assert!(BasicProgram::tokenized(&[0, 0, 1]).is_err());
        let body = vec![0u8, 0, 0x10, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let program = BasicProgram::tokenized(&body).unwrap();
        let stream: Vec<u8> = program.editor_stream().into_iter().collect();
        assert_eq!(&stream[..8], b"RUN \"E:\"");
        assert_eq!(stream[8], EOL);
        assert_eq!(&stream[9..], &body[..]);
    }
}
