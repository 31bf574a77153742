//! パッチ/タイミングのカテゴリ別ログ
//!
//! `log` の出力に加えて、カテゴリ (ESCAPE / SIO / MOUNT / TIMING) ごとに
//! オン・オフできる。記録するのはパッチの登録・SIOの結果・マウントの判断・
//! タイミングの異常だけで、命令やバスアクセス単位の出力はしない。

use std::sync::atomic::{AtomicU32, Ordering};

use crate::sio;

bitflags::bitflags! {
    /// ログカテゴリ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PatchLogLevel: u32 {
        /// エスケープの登録・解除・呼び出し
        const ESCAPE = 0b0001;
        /// SIOコマンドと結果
        const SIO    = 0b0010;
        /// メディアの判定とマウント
        const MOUNT  = 0b0100;
        /// WSYNC停止、スキャンラインのはみ出し
        const TIMING = 0b1000;
    }
}

/// プロセス全体で有効なカテゴリ
static ACTIVE_CATEGORIES: AtomicU32 = AtomicU32::new(0);

impl PatchLogLevel {
    /// `escape+sio` 形式の文字列を読む（`all` / `none` も可）
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut level = PatchLogLevel::empty();
        for name in text.split(|c: char| c == '+' || c == ',').map(str::trim).filter(|s| !s.is_empty()) {
            level |= match name.to_lowercase().as_str() {
                "escape" => PatchLogLevel::ESCAPE,
                "sio" => PatchLogLevel::SIO,
                "mount" => PatchLogLevel::MOUNT,
                "timing" => PatchLogLevel::TIMING,
                "all" => PatchLogLevel::all(),
                "none" => PatchLogLevel::empty(),
                other => return Err(format!("unknown log category: {}", other)),
            };
        }
        Ok(level)
    }

    /// このセットを有効カテゴリとして差し替える
    pub fn install(self) {
        ACTIVE_CATEGORIES.store(self.bits(), Ordering::Relaxed);
    }

    pub fn active_set() -> Self {
        Self::from_bits_truncate(ACTIVE_CATEGORIES.load(Ordering::Relaxed))
    }

    /// いずれかのカテゴリが有効
    #[inline]
    pub fn is_active(self) -> bool {
        Self::active_set().intersects(self)
    }
}

fn command_name(command: u8) -> &'static str {
    match command {
        sio::command::READ => "READ",
        sio::command::WRITE => "WRITE",
        sio::command::PUT => "PUT",
        sio::command::STATUS => "STATUS",
        sio::command::FORMAT => "FORMAT",
        sio::command::FORMAT_MEDIUM => "FORMAT_MEDIUM",
        _ => "UNKNOWN",
    }
}

// ============================================================
// ログ出力関数
// ============================================================

/// [ESCAPE] 登録
pub fn log_escape_installed(code: u8, address: u16, replaced: bool) {
    if PatchLogLevel::ESCAPE.is_active() {
        if replaced {
            log::info!("[ESC] ${:02X} at ${:04X} (replaced previous handler)", code, address);
        } else {
            log::info!("[ESC] ${:02X} at ${:04X}", code, address);
        }
    }
}

/// [ESCAPE] 解除
pub fn log_escape_removed(code: u8) {
    if PatchLogLevel::ESCAPE.is_active() {
        log::info!("[ESC] ${:02X} removed", code);
    }
}

/// [ESCAPE] ハンドラ呼び出し
pub fn log_escape_call(code: u8, pc: u16) {
    if PatchLogLevel::ESCAPE.is_active() {
        log::debug!("[ESC] ${:02X} called, PC=${:04X}", code, pc);
    }
}

/// ハンドラのないエスケープ（カテゴリに関係なく警告）
pub fn log_escape_unhandled(code: u8, pc: u16) {
    log::warn!("Unhandled escape ${:02X} at ${:04X}", code, pc);
}

/// [SIO] コマンドと結果
pub fn log_sio_command(device: u8, unit: u8, command: u8, aux: u16, result: u8) {
    if PatchLogLevel::SIO.is_active() {
        log::info!(
            "[SIO] dev=${:02X} unit={} {} aux={} -> {}",
            device,
            unit,
            command_name(command),
            aux,
            result
        );
    }
}

/// [SIO] 実行ファイルのセグメント
pub fn log_segment(start: u16, end: u16) {
    if PatchLogLevel::SIO.is_active() {
        log::info!("[LOAD] ${:04X}-${:04X}", start, end);
    }
}

/// [MOUNT] マウント
pub fn log_mount(kind: &str, target: &str) {
    if PatchLogLevel::MOUNT.is_active() {
        log::info!("[MOUNT] {} -> {}", kind, target);
    }
}

/// [MOUNT] 判定失敗
pub fn log_mount_rejected(reason: &str) {
    if PatchLogLevel::MOUNT.is_active() {
        log::info!("[MOUNT] rejected: {}", reason);
    }
}

/// [TIMING] WSYNCで次のスキャンラインまで停止
pub fn log_wsync_halt(scanline: u32, position: u32) {
    if PatchLogLevel::TIMING.is_active() {
        log::debug!("[TIMING] WSYNC halt at line {} cycle {}", scanline, position);
    }
}

/// [TIMING] スキャンライン境界のはみ出し
pub fn log_overshoot(scanline: u32, cycles: u32) {
    if PatchLogLevel::TIMING.is_active() {
        log::debug!("[TIMING] line {} overshoot {} cycle(s)", scanline, cycles);
    }
}
