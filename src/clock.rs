//! スキャンライン/サイクルクロック
//!
//! CPU・ANTIC・POKEYなど全コンポーネントが合意するタイミングの基準。
//! 1スキャンライン = 114マシンサイクル、1フレーム = 312 (PAL) / 262 (NTSC) スキャンライン。

use serde::{Deserialize, Serialize};

/// 1スキャンラインあたりのサイクル数
pub const LINE_C: u32 = 114;

/// STA WSYNC の再開位置
pub const WSYNC_C: u32 = 106;

/// 1スキャンラインあたりのメモリリフレッシュサイクル数
/// フォントモードの最初のスキャンラインでは実際にはこれより少ない
pub const DMAR: u32 = 9;

/// スキャンライン境界を越える正常なはみ出しの上限
/// 最長命令 (7サイクル) + 割り込み受付 (7サイクル)。超えた分も持ち越すが診断を出す
pub const MAX_OVERSHOOT: u32 = 14;

/// テレビ方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TvMode {
    /// 312スキャンライン、50Hz
    Pal,
    /// 262スキャンライン、60Hz
    Ntsc,
}

impl TvMode {
    /// 1フレームあたりのスキャンライン数
    pub const fn scanlines(self) -> u32 {
        match self {
            TvMode::Pal => 312,
            TvMode::Ntsc => 262,
        }
    }

    pub const fn frames_per_second(self) -> u32 {
        match self {
            TvMode::Pal => 50,
            TvMode::Ntsc => 60,
        }
    }

    /// 1フレームあたりのサイクル数
    pub const fn cycles_per_frame(self) -> u32 {
        self.scanlines() * LINE_C
    }

    /// スキャンライン数からテレビ方式を判定
    pub fn from_scanlines(lines: u32) -> Option<Self> {
        match lines {
            312 => Some(TvMode::Pal),
            262 => Some(TvMode::Ntsc),
            _ => None,
        }
    }
}

impl Default for TvMode {
    fn default() -> Self {
        TvMode::Pal
    }
}

impl std::str::FromStr for TvMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pal" => Ok(TvMode::Pal),
            "ntsc" => Ok(TvMode::Ntsc),
            _ => Err(format!("unknown TV mode: {}", s)),
        }
    }
}

/// クロック状態
///
/// `cycle_position` はスキャンライン内の現在サイクル。CPUは命令単位で実行するため、
/// 境界をまたぐ命令の後では一時的に `LINE_C` 以上になることがある
/// （その場合は既に次のスキャンラインに入っている）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clock {
    tv_mode: TvMode,
    /// スキャンライン内の現在サイクル (xpos)
    cycle_position: u32,
    /// CPUが実行してよい上限サイクル (xpos_limit)
    cycle_limit: u32,
    /// 現在のスキャンライン開始時点のメインクロック値
    scanline_base: u32,
    /// フレーム内の現在スキャンライン (ypos)
    scanline: u32,
    /// WSYNCで次のスキャンラインまでCPUが停止中
    wsync_halt: bool,
    /// 完了したフレーム数
    frame_count: u64,
    /// 完了したスキャンラインの累積サイクル
    completed_cycles: u64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(TvMode::default())
    }
}

impl Clock {
    pub fn new(tv_mode: TvMode) -> Self {
        Clock {
            tv_mode,
            cycle_position: 0,
            cycle_limit: LINE_C,
            scanline_base: 0,
            scanline: 0,
            wsync_halt: false,
            frame_count: 0,
            completed_cycles: 0,
        }
    }

    pub fn tv_mode(&self) -> TvMode {
        self.tv_mode
    }

    /// テレビ方式を変更（次のフレームから有効）
    pub fn set_tv_mode(&mut self, tv_mode: TvMode) {
        self.tv_mode = tv_mode;
    }

    /// 1フレームあたりのスキャンライン数 (max_ypos)
    pub fn scanlines_per_frame(&self) -> u32 {
        self.tv_mode.scanlines()
    }

    /// フレーム開始: スキャンラインとベースクロックを先頭に戻す
    ///
    /// 前フレーム最後の命令によるはみ出しは `cycle_position` に残したまま持ち越す。
    pub fn begin_frame(&mut self) {
        if self.scanline > 0 {
            self.frame_count += 1;
        }
        self.scanline_base = 0;
        self.scanline = 0;
    }

    /// 次のスキャンラインへ進む
    ///
    /// ベースクロックは常に `LINE_C` だけ進む。`cycle_position` は0から数え直し、
    /// 前スキャンラインで `LINE_C` を超えた分だけを新しい位置に持ち越す。
    /// 戻り値は持ち越したサイクル数。
    pub fn begin_scanline(&mut self) -> u32 {
        let carry = self.cycle_position.saturating_sub(LINE_C);
        self.scanline_base = self.scanline_base.wrapping_add(LINE_C);
        self.completed_cycles += LINE_C as u64;
        self.scanline += 1;
        self.cycle_position = carry;
        carry
    }

    /// スキャンライン内の固定位置へ移動
    pub fn advance_to(&mut self, position: u32) {
        self.cycle_position = position;
    }

    /// CPUが消費したサイクルを加算
    #[inline]
    pub fn add_cycles(&mut self, cycles: u32) {
        self.cycle_position += cycles;
    }

    #[inline]
    pub fn cycle_position(&self) -> u32 {
        self.cycle_position
    }

    #[inline]
    pub fn cycle_limit(&self) -> u32 {
        self.cycle_limit
    }

    pub fn set_cycle_limit(&mut self, limit: u32) {
        self.cycle_limit = limit;
    }

    /// CPUが上限に達したか
    #[inline]
    pub fn budget_exhausted(&self) -> bool {
        self.cycle_position >= self.cycle_limit
    }

    /// 現在のメインクロック値 (cpu_clock)
    #[inline]
    pub fn current_clock(&self) -> u32 {
        self.scanline_base.wrapping_add(self.cycle_position)
    }

    pub fn scanline_base(&self) -> u32 {
        self.scanline_base
    }

    /// フレーム内の現在スキャンライン
    pub fn scanline(&self) -> u32 {
        self.scanline
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// 起動からの総サイクル
    pub fn total_cycles(&self) -> u64 {
        self.completed_cycles + self.cycle_position as u64
    }

    pub fn is_wsync_halted(&self) -> bool {
        self.wsync_halt
    }

    /// STA WSYNC
    ///
    /// 再開位置がまだ現在の実行範囲内なら同じスキャンラインの `WSYNC_C` から再開する。
    /// そうでなければCPUを上限まで止め（既に越えていれば位置はそのまま）、次のスキャンラインの `WSYNC_C` で再開する。
    pub fn wsync(&mut self) {
        if self.cycle_position <= WSYNC_C && self.cycle_limit >= WSYNC_C {
            self.cycle_position = WSYNC_C;
        } else {
            self.wsync_halt = true;
            self.cycle_position = self.cycle_position.max(self.cycle_limit);
        }
    }

    /// スキャンライン開始時にWSYNC停止を解除
    /// 解除した場合はtrue
    pub fn resume_after_wsync(&mut self) -> bool {
        if !self.wsync_halt {
            return false;
        }
        self.wsync_halt = false;
        self.cycle_position = WSYNC_C;
        true
    }

    /// 状態を初期化（フレーム数・総サイクルも含む）
    pub fn reset(&mut self) {
        *self = Clock::new(self.tv_mode);
    }
}
