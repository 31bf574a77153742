//! Atari 8ビット メモリイメージ
//!
//! 64KBのアドレス空間とページ単位の属性（RAM/ROM/ハードウェア）。
//! ハードウェアページへのアクセスはバスが `SpecialAddressSpace` に振り分ける。

use crate::error::MediaError;

/// ページ属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attrib {
    Ram,
    Rom,
    /// メモリマップドI/O ($D000-$D7FF)
    Hardware,
}

/// OS ROMのサイズ
pub const OS_ROM_XL_SIZE: usize = 0x4000;
pub const OS_ROM_800_SIZE: usize = 0x2800;
/// BASIC ROMのサイズ ($A000-$BFFF)
pub const BASIC_ROM_SIZE: usize = 0x2000;

/// OSのコールドスタートフラグ (COLDST)
pub const COLDST: u16 = 0x0244;

/// 語アクセスのアライメント統計
///
/// 8要素の配列はアドレス下位3ビットごとのアクセス回数。
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignmentStats {
    pub read_word: [u64; 8],
    pub write_word: [u64; 8],
}

/// メモリイメージ
#[derive(Clone)]
pub struct Memory {
    data: Box<[u8; 0x10000]>,
    attrib: [Attrib; 256],
    basic_rom: Option<Box<[u8; BASIC_ROM_SIZE]>>,
    basic_enabled: bool,
    #[cfg(feature = "stats")]
    stats: AlignmentStats,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("basic_loaded", &self.basic_rom.is_some())
            .field("basic_enabled", &self.basic_enabled)
            .finish_non_exhaustive()
    }
}

impl Memory {
    /// 電源投入時のメモリマップ: $0000-$BFFF RAM, $C000-$CFFF/$D800-$FFFF ROM,
    /// $D000-$D7FF ハードウェア。ROM領域はOS未ロードの間 $FF で埋める。
    pub fn new() -> Self {
        let mut mem = Memory {
            data: Box::new([0; 0x10000]),
            attrib: [Attrib::Ram; 256],
            basic_rom: None,
            basic_enabled: false,
            #[cfg(feature = "stats")]
            stats: AlignmentStats::default(),
        };
        mem.set_attrib(0xC0, 0xFF, Attrib::Rom);
        mem.set_attrib(0xD0, 0xD7, Attrib::Hardware);
        mem.data[0xC000..].fill(0xFF);
        mem
    }

    /// ページ範囲の属性を設定
    pub fn set_attrib(&mut self, first_page: u8, last_page: u8, attrib: Attrib) {
        for page in first_page..=last_page {
            self.attrib[page as usize] = attrib;
        }
    }

    #[inline]
    pub fn attrib(&self, address: u16) -> Attrib {
        self.attrib[(address >> 8) as usize]
    }

    #[inline]
    pub fn is_hardware(&self, address: u16) -> bool {
        self.attrib(address) == Attrib::Hardware
    }

    /// 属性を無視して読み取り
    #[inline]
    pub fn dget_byte(&self, address: u16) -> u8 {
        self.data[address as usize]
    }

    /// 属性を無視して書き込み（ROMへのパッチにも使う）
    #[inline]
    pub fn dput_byte(&mut self, address: u16, value: u8) {
        self.data[address as usize] = value;
    }

    /// リトルエンディアンの語を読み取り
    pub fn dget_word(&mut self, address: u16) -> u16 {
        #[cfg(feature = "stats")]
        {
            self.stats.read_word[(address & 7) as usize] += 1;
        }
        let lo = self.data[address as usize] as u16;
        let hi = self.data[address.wrapping_add(1) as usize] as u16;
        (hi << 8) | lo
    }

    /// リトルエンディアンの語を書き込み
    pub fn dput_word(&mut self, address: u16, value: u16) {
        #[cfg(feature = "stats")]
        {
            self.stats.write_word[(address & 7) as usize] += 1;
        }
        self.data[address as usize] = value as u8;
        self.data[address.wrapping_add(1) as usize] = (value >> 8) as u8;
    }

    /// CPUからの書き込み（RAMのみ反映、ROMは無視）
    /// ハードウェアページはバスが先に振り分けるのでここには来ない
    pub fn put_byte(&mut self, address: u16, value: u8) -> bool {
        if self.attrib(address) == Attrib::Ram {
            self.data[address as usize] = value;
            true
        } else {
            false
        }
    }

    /// 連続領域へコピー（属性無視、64KB境界で折り返す）
    pub fn copy_in(&mut self, address: u16, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.data[address.wrapping_add(i as u16) as usize] = b;
        }
    }

    /// 連続領域を取り出す（64KB境界で折り返す）
    pub fn copy_out(&self, address: u16, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.data[address.wrapping_add(i as u16) as usize])
            .collect()
    }

    /// RAM全体（保存用）
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    /// RAM全体を上書き（ROMページも含む）
    pub fn restore(&mut self, bytes: &[u8; 0x10000]) {
        self.data.copy_from_slice(bytes);
    }

    /// RAMページをゼロクリア
    pub fn clear_ram(&mut self) {
        for page in 0..256usize {
            if self.attrib[page] == Attrib::Ram {
                self.data[page << 8..(page + 1) << 8].fill(0);
            }
        }
    }

    /// OS ROMをロード
    /// 16KB (XL/XE): $C000-$CFFF と $D800-$FFFF（$D000-$D7FF部分は捨てる）
    /// 10KB (400/800): $D800-$FFFF
    pub fn load_os_rom(&mut self, rom: &[u8]) -> Result<(), MediaError> {
        match rom.len() {
            OS_ROM_XL_SIZE => {
                self.data[0xC000..0xD000].copy_from_slice(&rom[..0x1000]);
                self.data[0xD800..].copy_from_slice(&rom[0x1800..]);
                self.set_attrib(0xC0, 0xCF, Attrib::Rom);
            }
            OS_ROM_800_SIZE => {
                self.data[0xD800..].copy_from_slice(rom);
                self.set_attrib(0xC0, 0xCF, Attrib::Ram);
            }
            actual => {
                return Err(MediaError::RomSize { expected: "10240 or 16384", actual });
            }
        }
        self.set_attrib(0xD8, 0xFF, Attrib::Rom);
        log::info!("Loaded OS ROM ({} bytes)", rom.len());
        Ok(())
    }

    /// BASIC ROMをロード（有効化は `enable_basic`）
    pub fn load_basic_rom(&mut self, rom: &[u8]) -> Result<(), MediaError> {
        if rom.len() != BASIC_ROM_SIZE {
            return Err(MediaError::RomSize { expected: "8192", actual: rom.len() });
        }
        let mut buf = Box::new([0u8; BASIC_ROM_SIZE]);
        buf.copy_from_slice(rom);
        self.basic_rom = Some(buf);
        log::info!("Loaded BASIC ROM");
        Ok(())
    }

    pub fn has_basic(&self) -> bool {
        self.basic_rom.is_some()
    }

    pub fn basic_enabled(&self) -> bool {
        self.basic_enabled
    }

    /// BASIC ROMを $A000-$BFFF に出し入れする
    pub fn enable_basic(&mut self, enable: bool) {
        match (&self.basic_rom, enable) {
            (Some(rom), true) => {
                self.data[0xA000..0xC000].copy_from_slice(&rom[..]);
                self.set_attrib(0xA0, 0xBF, Attrib::Rom);
                self.basic_enabled = true;
            }
            _ => {
                if self.basic_enabled {
                    self.set_attrib(0xA0, 0xBF, Attrib::Ram);
                }
                self.basic_enabled = false;
            }
        }
    }

    /// ROMを配置（カートリッジ用）
    pub fn map_rom(&mut self, address: u16, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.copy_in(address, bytes);
        let first = (address >> 8) as u8;
        let last = ((address as usize + bytes.len() - 1) >> 8).min(0xFF) as u8;
        self.set_attrib(first, last, Attrib::Rom);
    }

    /// ROM領域をRAMに戻す
    pub fn unmap_rom(&mut self, address: u16, len: usize) {
        if len == 0 {
            return;
        }
        let first = (address >> 8) as u8;
        let last = ((address as usize + len - 1) >> 8).min(0xFF) as u8;
        self.set_attrib(first, last, Attrib::Ram);
    }

    /// 語アクセスのアライメント統計（読み取り専用）
    #[cfg(feature = "stats")]
    pub fn alignment_stats(&self) -> &AlignmentStats {
        &self.stats
    }
}
