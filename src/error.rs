//! エラー型

use thiserror::Error;

/// メディアの判定・マウントの失敗
///
/// どのバリアントでもマウントは中断され、マシンの状態は変更されない。
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("unrecognized media format")]
    Unrecognized,

    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("image geometry mismatch: header declares {declared} bytes, payload has {actual}")]
    GeometryMismatch { declared: usize, actual: usize },

    #[error("unsupported sector size {0}")]
    BadSectorSize(u16),

    #[error("truncated {what} at offset {offset}")]
    Truncated { what: &'static str, offset: usize },

    #[error("unsupported cartridge type {0}")]
    UnsupportedCartridge(u32),

    #[error("cartridge type {kind} needs {expected} bytes, image has {actual}")]
    CartridgeSize { kind: u32, expected: usize, actual: usize },

    #[error("compressed images need an inflater")]
    CompressedUnsupported,

    #[error("inflate failed: {0}")]
    Inflate(String),

    #[error("invalid drive number {0} (expected 1-8)")]
    InvalidDrive(u8),

    #[error("no saved-state restorer attached")]
    NoStateRestorer,

    #[error("state restore failed: {0}")]
    StateRestore(String),

    #[error("editor handler table not found in OS ROM")]
    NoEditorHandler,

    #[error("executables need the SIO patch")]
    NeedsSioPatch,

    #[error("ROM image must be {expected} bytes, got {actual}")]
    RomSize { expected: &'static str, actual: usize },
}

/// 終了処理中に発生した障害
///
/// 障害があっても終了処理そのものは最後まで実行される。
#[derive(Debug, Error)]
#[error("{} fault(s) during shutdown: {}", .faults.len(), .faults.join("; "))]
pub struct ShutdownError {
    pub faults: Vec<String>,
}

impl ShutdownError {
    /// ホストへ返すステータスコード（0 = 正常）
    pub fn code(&self) -> i32 {
        if self.faults.is_empty() {
            0
        } else {
            1
        }
    }
}

/// 設定ファイルの読み書き
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("config format: {0}")]
    Json(#[from] serde_json::Error),
}

/// コア状態スナップショットの読み書き
#[derive(Debug, Error)]
pub enum StateError {
    #[error("incompatible core state version {0}")]
    Version(u32),

    #[error("core state RAM must be 65536 bytes, got {0}")]
    RamSize(usize),

    #[error("core state format: {0}")]
    Json(#[from] serde_json::Error),
}
