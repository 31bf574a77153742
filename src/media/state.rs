//! 保存されたマシン状態
//!
//! 中身の形式は外部の `StateRestorer` が解釈する。ここではシグネチャだけを見る。

use crate::error::MediaError;

pub const STATE_MAGIC: &[u8; 8] = b"ATARI800";
pub const STATE_HEADER_SIZE: usize = 10;

/// 状態ファイル（中身は不透明）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedState<'a> {
    pub version: u8,
    pub verbose: bool,
    /// gzipから展開したもの
    pub compressed: bool,
    pub bytes: &'a [u8],
}

impl<'a> SavedState<'a> {
    pub fn parse(bytes: &'a [u8], compressed: bool) -> Result<Self, MediaError> {
        if bytes.len() < STATE_HEADER_SIZE {
            return Err(MediaError::Truncated { what: "state header", offset: bytes.len() });
        }
        if &bytes[0..8] != STATE_MAGIC {
            return Err(MediaError::MalformedHeader("bad state signature"));
        }
        let verbose = match bytes[9] {
            0 => false,
            1 => true,
            _ => return Err(MediaError::MalformedHeader("bad state verbose flag")),
        };
        Ok(SavedState {
            version: bytes[8],
            verbose,
            compressed,
            bytes,
        })
    }
}

/// 状態を復元する外部コンポーネント
pub trait StateRestorer {
    fn restore(&mut self, state: &SavedState<'_>) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let mut bytes = STATE_MAGIC.to_vec();
        bytes.extend_from_slice(&[6, 1, 0xAA]);
        let state = SavedState::parse(&bytes, false).unwrap();
        assert_eq!(state.version, 6);
        assert!(state.verbose);
        assert_eq!(state.bytes.len(), 11);

        bytes[9] = 7;
        assert!(SavedState::parse(&bytes, false).is_err());
        assert!(SavedState::parse(b"ATARI80", false).is_err());
    }
}
