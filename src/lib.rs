//! A8RS - Atari 8-bit timing core in Rust
//!
//! Atari 800 のエミュレーションコア:
//! - スキャンライン/サイクルクロック（PAL 312 / NTSC 262 ライン）
//! - エスケープシーケンスによるOSルーチンの置き換え（SIO、P:、バイナリローダ）
//! - 特殊アドレス空間 ($D000-$D7FF) のルーティング
//! - メディア判定とマウント（ATR/XFD/DCM/XEX/BASIC/CART/CAS/状態ファイル）
//!
//! 6502コアと映像・音声チップは `CpuCore` / `Peripheral` として外部から差し込む。

pub mod atari;
pub mod binload;
pub mod clock;
pub mod config;
pub mod cpu;
pub mod devices;
pub mod error;
pub mod escape;
pub mod io;
pub mod media;
pub mod memory;
pub mod patch_log;
pub mod sio;

pub use atari::{Atari800, CoreOptions, CoreState, Diagnostic};
pub use clock::{Clock, TvMode};
pub use error::{ConfigError, MediaError, ShutdownError, StateError};
pub use media::{MediaKind, MountOptions};
