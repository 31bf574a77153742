//! カートリッジ (CART / 生ROM)
//!
//! CARTヘッダ: "CART"、種類 (BE32)、チェックサム (BE32)、未使用4バイト、続いてROM。
//! 生ROMはサイズから既定の種類を決める。

use crate::error::MediaError;
use crate::memory::Memory;

pub const CART_MAGIC: &[u8; 4] = b"CART";
pub const CART_HEADER_SIZE: usize = 16;

/// バンク切り替えの方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// 8KB @ $A000
    Std8,
    /// 16KB @ $8000
    Std16,
    /// 8KB @ $8000
    Right8,
    /// $8000 が $D5xx への書き込みで切り替わり、$A000 は最終バンク固定
    Xegs,
    /// このクレートでは配置しない（外部のマッパーが必要）
    External,
}

/// カートリッジの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartType {
    pub code: u32,
    pub name: &'static str,
    pub size_kb: u32,
    pub mapping: Mapping,
}

const fn cart(code: u32, name: &'static str, size_kb: u32, mapping: Mapping) -> CartType {
    CartType { code, name, size_kb, mapping }
}

/// 種類コード 1..=33
pub const CART_TYPES: &[CartType] = &[
    cart(1, "Standard 8 KB", 8, Mapping::Std8),
    cart(2, "Standard 16 KB", 16, Mapping::Std16),
    cart(3, "OSS two chip 16 KB (034M)", 16, Mapping::External),
    cart(4, "Standard 32 KB 5200", 32, Mapping::External),
    cart(5, "DB 32 KB", 32, Mapping::External),
    cart(6, "Two chip 16 KB 5200", 16, Mapping::External),
    cart(7, "Bounty Bob 40 KB 5200", 40, Mapping::External),
    cart(8, "Williams 64 KB", 64, Mapping::External),
    cart(9, "Express 64 KB", 64, Mapping::External),
    cart(10, "Diamond 64 KB", 64, Mapping::External),
    cart(11, "SpartaDOS X 64 KB", 64, Mapping::External),
    cart(12, "XEGS 32 KB", 32, Mapping::Xegs),
    cart(13, "XEGS 64 KB (banks 0-7)", 64, Mapping::Xegs),
    cart(14, "XEGS 128 KB", 128, Mapping::Xegs),
    cart(15, "OSS one chip 16 KB", 16, Mapping::External),
    cart(16, "One chip 16 KB 5200", 16, Mapping::External),
    cart(17, "Decoded Atrax 128 KB", 128, Mapping::External),
    cart(18, "Bounty Bob 40 KB", 40, Mapping::External),
    cart(19, "Standard 8 KB 5200", 8, Mapping::External),
    cart(20, "Standard 4 KB 5200", 4, Mapping::External),
    cart(21, "Right slot 8 KB", 8, Mapping::Right8),
    cart(22, "Williams 32 KB", 32, Mapping::External),
    cart(23, "XEGS 256 KB", 256, Mapping::Xegs),
    cart(24, "XEGS 512 KB", 512, Mapping::Xegs),
    cart(25, "XEGS 1 MB", 1024, Mapping::Xegs),
    cart(26, "MegaCart 16 KB", 16, Mapping::External),
    cart(27, "MegaCart 32 KB", 32, Mapping::External),
    cart(28, "MegaCart 64 KB", 64, Mapping::External),
    cart(29, "MegaCart 128 KB", 128, Mapping::External),
    cart(30, "MegaCart 256 KB", 256, Mapping::External),
    cart(31, "MegaCart 512 KB", 512, Mapping::External),
    cart(32, "MegaCart 1 MB", 1024, Mapping::External),
    cart(33, "Switchable XEGS 32 KB", 32, Mapping::Xegs),
];

pub fn cart_type(code: u32) -> Option<&'static CartType> {
    CART_TYPES.iter().find(|t| t.code == code)
}

/// ヘッダなしROMのサイズから既定の種類
pub fn default_type_for_size(len: usize) -> Option<&'static CartType> {
    let code = match len / 1024 {
        8 => 1,
        16 => 2,
        32 => 12,
        64 => 13,
        128 => 14,
        256 => 23,
        512 => 24,
        1024 => 25,
        _ => return None,
    };
    if len % 1024 != 0 {
        return None;
    }
    cart_type(code)
}

/// ヘッダなしROMとして認められるサイズか（判定用）
pub fn is_rom_size(len: usize) -> bool {
    default_type_for_size(len).is_some()
}

/// ROMバイトの単純和
pub fn checksum(rom: &[u8]) -> u32 {
    rom.iter().fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}

/// マウントされたカートリッジ
#[derive(Debug, Clone)]
pub struct Cartridge {
    kind: &'static CartType,
    rom: Vec<u8>,
    bank: usize,
    /// ヘッダのチェックサム（生ROMはNone）
    declared_checksum: Option<u32>,
}

impl Cartridge {
    /// CARTファイルを読む
    pub fn from_cart(bytes: &[u8]) -> Result<Self, MediaError> {
        if bytes.len() < CART_HEADER_SIZE {
            return Err(MediaError::Truncated { what: "CART header", offset: bytes.len() });
        }
        if &bytes[0..4] != CART_MAGIC {
            return Err(MediaError::MalformedHeader("bad CART magic"));
        }
        let be = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let code = be(4);
        let declared = be(8);
        let kind = cart_type(code).ok_or(MediaError::UnsupportedCartridge(code))?;
        let rom = &bytes[CART_HEADER_SIZE..];
        let expected = kind.size_kb as usize * 1024;
        if rom.len() != expected {
            return Err(MediaError::CartridgeSize { kind: code, expected, actual: rom.len() });
        }
        Ok(Cartridge {
            kind,
            rom: rom.to_vec(),
            bank: 0,
            declared_checksum: Some(declared),
        })
    }

    /// ヘッダなしROMを読む
    pub fn from_rom(bytes: &[u8]) -> Result<Self, MediaError> {
        let kind = default_type_for_size(bytes.len()).ok_or(MediaError::Unrecognized)?;
        Ok(Cartridge {
            kind,
            rom: bytes.to_vec(),
            bank: 0,
            declared_checksum: None,
        })
    }

    pub fn kind(&self) -> &'static CartType {
        self.kind
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn bank(&self) -> usize {
        self.bank
    }

    /// ヘッダのチェックサムが合っているか（生ROMは常にtrue）
    pub fn checksum_ok(&self) -> bool {
        self.declared_checksum.map_or(true, |c| c == checksum(&self.rom))
    }

    pub fn declared_checksum(&self) -> Option<u32> {
        self.declared_checksum
    }

    /// このクレートでメモリに配置できるか
    pub fn is_mapped(&self) -> bool {
        self.kind.mapping != Mapping::External
    }

    /// $D5xx への書き込みでバンクを切り替えるか
    pub fn uses_cctl(&self) -> bool {
        self.kind.mapping == Mapping::Xegs
    }

    fn bank_count(&self) -> usize {
        (self.rom.len() / 0x2000).max(1)
    }

    fn bank_bytes(&self, bank: usize) -> &[u8] {
        let start = bank * 0x2000;
        &self.rom[start..start + 0x2000]
    }

    /// メモリに配置する
    pub fn map(&self, memory: &mut Memory) {
        match self.kind.mapping {
            Mapping::Std8 => memory.map_rom(0xA000, &self.rom),
            Mapping::Std16 => memory.map_rom(0x8000, &self.rom),
            Mapping::Right8 => memory.map_rom(0x8000, &self.rom),
            Mapping::Xegs => {
                memory.map_rom(0x8000, self.bank_bytes(self.bank));
                memory.map_rom(0xA000, self.bank_bytes(self.bank_count() - 1));
            }
            Mapping::External => {}
        }
    }

    /// 配置を外してRAMに戻す
    pub fn unmap(&self, memory: &mut Memory) {
        match self.kind.mapping {
            Mapping::Std8 => memory.unmap_rom(0xA000, 0x2000),
            Mapping::Right8 => memory.unmap_rom(0x8000, 0x2000),
            Mapping::Std16 | Mapping::Xegs => memory.unmap_rom(0x8000, 0x4000),
            Mapping::External => {}
        }
    }

    /// コールドスタート: バンク0に戻して配置し直す
    pub fn cold_restart(&mut self, memory: &mut Memory) {
        self.bank = 0;
        self.map(memory);
    }

    /// $D5xx 読み取り
    pub fn read_cctl(&self, _address: u16) -> u8 {
        0xFF
    }

    /// $D5xx 書き込み（XEGSのバンク切り替え）
    pub fn write_cctl(&mut self, _address: u16, value: u8, memory: &mut Memory) {
        if self.kind.mapping != Mapping::Xegs {
            return;
        }
        let bank = value as usize % self.bank_count();
        if bank != self.bank {
            self.bank = bank;
            memory.map_rom(0x8000, self.bank_bytes(bank));
        }
    }
}
