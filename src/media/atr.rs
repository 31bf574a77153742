//! ディスクイメージ (ATR / XFD)
//!
//! ATRは16バイトヘッダ + セクタデータ、XFDはヘッダなしのセクタデータ。
//! 倍密度 (256バイト/セクタ) でも最初の3セクタ（ブートセクタ）は128バイト。
//! 512バイト/セクタのイメージにはこの例外はない。

use crate::error::MediaError;

/// ATRヘッダのマジック
pub const ATR_MAGIC: [u8; 2] = [0x96, 0x02];
pub const ATR_HEADER_SIZE: usize = 16;

/// ブートセクタの数
pub const BOOT_SECTORS: u32 = 3;

/// ATRヘッダ（16バイト、リトルエンディアン）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtrHeader {
    pub count_low: u16,
    pub sector_size: u16,
    pub count_high: u16,
    pub write_protect: bool,
}

impl AtrHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, MediaError> {
        if bytes.len() < ATR_HEADER_SIZE {
            return Err(MediaError::Truncated { what: "ATR header", offset: bytes.len() });
        }
        if bytes[0..2] != ATR_MAGIC {
            return Err(MediaError::MalformedHeader("bad ATR magic"));
        }
        let word = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Ok(AtrHeader {
            count_low: word(2),
            sector_size: word(4),
            count_high: word(6),
            write_protect: bytes[15] != 0,
        })
    }

    /// 予約バイトはゼロで書く
    pub fn encode(&self) -> [u8; ATR_HEADER_SIZE] {
        let mut out = [0u8; ATR_HEADER_SIZE];
        out[0..2].copy_from_slice(&ATR_MAGIC);
        out[2..4].copy_from_slice(&self.count_low.to_le_bytes());
        out[4..6].copy_from_slice(&self.sector_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.count_high.to_le_bytes());
        out[15] = self.write_protect as u8;
        out
    }

    /// 下位/上位を合わせた32ビットのカウント
    pub fn count(&self) -> u32 {
        ((self.count_high as u32) << 16) | self.count_low as u32
    }

    fn with_count(count: u32, sector_size: u16, write_protect: bool) -> Self {
        AtrHeader {
            count_low: count as u16,
            sector_size,
            count_high: (count >> 16) as u16,
            write_protect,
        }
    }
}

/// ブートセクタの格納方法（倍密度のみ意味がある）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootLayout {
    /// 128バイト × 3
    Short,
    /// セクタサイズいっぱいに格納（後半は未使用）
    Padded,
}

/// 元のファイル形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Atr,
    Xfd,
    Dcm,
}

/// セクタ単位でアクセスできるディスクイメージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    sector_size: u16,
    sector_count: u32,
    boot_layout: BootLayout,
    format: DiskFormat,
    data: Vec<u8>,
}

fn check_sector_size(size: u16) -> Result<(), MediaError> {
    match size {
        128 | 256 | 512 => Ok(()),
        other => Err(MediaError::BadSectorSize(other)),
    }
}

/// セクタ数からイメージのバイト数を求める
fn image_bytes(sector_size: u16, count: u32, layout: BootLayout) -> usize {
    let size = sector_size as usize;
    let count = count as usize;
    if sector_size == 256 && layout == BootLayout::Short {
        let boot = count.min(BOOT_SECTORS as usize);
        boot * 128 + (count - boot) * size
    } else {
        count * size
    }
}

/// バイト数からセクタ数とブートセクタの格納方法を求める
fn sectors_for_bytes(sector_size: u16, bytes: usize) -> Option<(u32, BootLayout)> {
    let size = sector_size as usize;
    if sector_size == 256 {
        if bytes >= 384 && (bytes - 384) % 256 == 0 {
            return Some(((3 + (bytes - 384) / 256) as u32, BootLayout::Short));
        }
        if bytes % 256 == 0 {
            return Some(((bytes / 256) as u32, BootLayout::Padded));
        }
        return None;
    }
    if bytes % size == 0 {
        Some(((bytes / size) as u32, BootLayout::Short))
    } else {
        None
    }
}

impl DiskImage {
    /// ゼロで埋めた新しいイメージ
    pub fn blank(sector_size: u16, sector_count: u32) -> Result<Self, MediaError> {
        check_sector_size(sector_size)?;
        let len = image_bytes(sector_size, sector_count, BootLayout::Short);
        Ok(DiskImage {
            sector_size,
            sector_count,
            boot_layout: BootLayout::Short,
            format: DiskFormat::Atr,
            data: vec![0; len],
        })
    }

    /// ATRファイルを読み込む。戻り値の2番目は書き込み禁止フラグ
    ///
    /// カウント欄はセクタ数として解釈し、ペイロード長と合わなければ
    /// 16バイト単位（パラグラフ）の長さとして解釈し直す。
    /// どちらでもペイロード長と一致しなければ `GeometryMismatch`。
    pub fn from_atr(bytes: &[u8]) -> Result<(Self, bool), MediaError> {
        let header = AtrHeader::parse(bytes)?;
        check_sector_size(header.sector_size)?;
        let payload = &bytes[ATR_HEADER_SIZE..];
        let count = header.count();
        let size = header.sector_size;
        if count == 0 {
            return Err(MediaError::MalformedHeader("ATR image declares no sectors"));
        }

        // セクタ数としてぴったり一致
        for layout in [BootLayout::Short, BootLayout::Padded] {
            if image_bytes(size, count, layout) == payload.len() {
                return Ok((Self::with_data(size, count, layout, DiskFormat::Atr, payload), header.write_protect));
            }
        }

        // パラグラフ数としてぴったり一致
        if count as usize * 16 == payload.len() {
            if let Some((sectors, layout)) = sectors_for_bytes(size, payload.len()) {
                return Ok((Self::with_data(size, sectors, layout, DiskFormat::Atr, payload), header.write_protect));
            }
        }

        // どちらとも合わない: 切り詰めも補完もしない
        let declared = image_bytes(size, count, BootLayout::Short);
        Err(MediaError::GeometryMismatch { declared, actual: payload.len() })
    }

    /// XFD（ヘッダなし）を読み込む。ジオメトリは長さから推定する
    pub fn from_xfd(bytes: &[u8]) -> Result<Self, MediaError> {
        if bytes.is_empty() || bytes.len() % 128 != 0 {
            return Err(MediaError::MalformedHeader("XFD length is not a multiple of 128"));
        }
        // 倍密度の標準サイズ
        let short_dd = image_bytes(256, 720, BootLayout::Short);
        let padded_dd = image_bytes(256, 720, BootLayout::Padded);
        let image = if bytes.len() == short_dd {
            Self::with_data(256, 720, BootLayout::Short, DiskFormat::Xfd, bytes)
        } else if bytes.len() == padded_dd {
            Self::with_data(256, 720, BootLayout::Padded, DiskFormat::Xfd, bytes)
        } else {
            Self::with_data(128, (bytes.len() / 128) as u32, BootLayout::Short, DiskFormat::Xfd, bytes)
        };
        Ok(image)
    }

    pub(crate) fn with_data(
        sector_size: u16,
        sector_count: u32,
        boot_layout: BootLayout,
        format: DiskFormat,
        data: &[u8],
    ) -> Self {
        DiskImage {
            sector_size,
            sector_count,
            boot_layout,
            format,
            data: data.to_vec(),
        }
    }

    pub(crate) fn set_format(&mut self, format: DiskFormat) {
        self.format = format;
    }

    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    pub fn boot_layout(&self) -> BootLayout {
        self.boot_layout
    }

    pub fn format(&self) -> DiskFormat {
        self.format
    }

    /// イメージ全体のバイト数
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// セクタの長さ（1始まり）
    pub fn sector_len(&self, sector: u32) -> Option<usize> {
        if sector == 0 || sector > self.sector_count {
            return None;
        }
        if self.sector_size == 256 && sector <= BOOT_SECTORS {
            Some(128)
        } else {
            Some(self.sector_size as usize)
        }
    }

    fn sector_offset(&self, sector: u32) -> Option<usize> {
        self.sector_len(sector)?;
        let index = (sector - 1) as usize;
        let size = self.sector_size as usize;
        if self.sector_size == 256 {
            match self.boot_layout {
                BootLayout::Short if sector <= BOOT_SECTORS => Some(index * 128),
                BootLayout::Short => Some(BOOT_SECTORS as usize * 128 + (index - BOOT_SECTORS as usize) * size),
                BootLayout::Padded => Some(index * size),
            }
        } else {
            Some(index * size)
        }
    }

    pub fn read_sector(&self, sector: u32) -> Option<&[u8]> {
        let offset = self.sector_offset(sector)?;
        let len = self.sector_len(sector)?;
        self.data.get(offset..offset + len)
    }

    /// セクタに書き込む（長さが足りなければ残りはそのまま）
    pub fn write_sector(&mut self, sector: u32, bytes: &[u8]) -> bool {
        let (Some(offset), Some(len)) = (self.sector_offset(sector), self.sector_len(sector)) else {
            return false;
        };
        let n = len.min(bytes.len());
        match self.data.get_mut(offset..offset + n) {
            Some(dst) => {
                dst.copy_from_slice(&bytes[..n]);
                true
            }
            None => false,
        }
    }

    /// フォーマット（全セクタをゼロに）
    pub fn format_blank(&mut self) {
        self.data.fill(0);
    }

    /// ドライブステータスの1バイト目
    pub fn drive_status(&self, read_only: bool) -> u8 {
        let mut status = 0x10;
        if self.sector_size == 256 {
            status |= 0x20;
        }
        if read_only {
            status |= 0x08;
        }
        if self.sector_count == 1040 {
            status |= 0x80;
        }
        status
    }

    /// ATR形式に書き出す（カウント欄は16バイト単位）
    pub fn to_atr(&self, write_protect: bool) -> Vec<u8> {
        let paragraphs = (self.data.len() / 16) as u32;
        let header = AtrHeader::with_count(paragraphs, self.sector_size, write_protect);
        let mut out = Vec::with_capacity(ATR_HEADER_SIZE + self.data.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.data);
        out
    }
}
