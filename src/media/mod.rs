//! メディア判定
//!
//! ファイルの先頭数バイトと長さだけから種類を決める。
//! 判定は純粋関数で、同じバイト列には常に同じ結果を返す。

pub mod atr;
pub mod basic;
pub mod cart;
pub mod cas;
pub mod dcm;
pub mod state;
pub mod xex;

use std::borrow::Cow;

use crate::error::MediaError;

pub use atr::{AtrHeader, BootLayout, DiskFormat, DiskImage};
pub use basic::BasicProgram;
pub use cart::{CartType, Cartridge, Mapping};
pub use cas::{Tape, TapeRecord};
pub use state::{SavedState, StateRestorer};
pub use xex::Segment;

/// 判定に使う先頭バイト数
pub const SNIFF_LEN: usize = 16;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const STATE_PREFIX: &[u8; 4] = b"ATAR";

/// メディアの種類（数値はホストに返す固定コード）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaKind {
    Error = 0,
    Atr = 1,
    Xfd = 2,
    AtrGz = 3,
    XfdGz = 4,
    Dcm = 5,
    Xex = 6,
    Bas = 7,
    Lst = 8,
    Cart = 9,
    Rom = 10,
    Cas = 11,
    BootTape = 12,
    State = 13,
    StateGz = 14,
}

impl MediaKind {
    pub const ALL: [MediaKind; 15] = [
        MediaKind::Error,
        MediaKind::Atr,
        MediaKind::Xfd,
        MediaKind::AtrGz,
        MediaKind::XfdGz,
        MediaKind::Dcm,
        MediaKind::Xex,
        MediaKind::Bas,
        MediaKind::Lst,
        MediaKind::Cart,
        MediaKind::Rom,
        MediaKind::Cas,
        MediaKind::BootTape,
        MediaKind::State,
        MediaKind::StateGz,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            MediaKind::Error => "error",
            MediaKind::Atr => "ATR disk image",
            MediaKind::Xfd => "XFD disk image",
            MediaKind::AtrGz => "gzipped ATR disk image",
            MediaKind::XfdGz => "gzipped XFD disk image",
            MediaKind::Dcm => "DCM disk archive",
            MediaKind::Xex => "executable",
            MediaKind::Bas => "BASIC program",
            MediaKind::Lst => "BASIC listing",
            MediaKind::Cart => "CART cartridge",
            MediaKind::Rom => "raw cartridge ROM",
            MediaKind::Cas => "CAS tape image",
            MediaKind::BootTape => "boot tape",
            MediaKind::State => "saved state",
            MediaKind::StateGz => "gzipped saved state",
        }
    }

    /// ドライブにマウントする種類
    pub fn is_disk(self) -> bool {
        matches!(
            self,
            MediaKind::Atr | MediaKind::Xfd | MediaKind::AtrGz | MediaKind::XfdGz | MediaKind::Dcm
        )
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// gzip展開（外部コンポーネント）
pub trait Inflate {
    fn inflate(&self, compressed: &[u8]) -> Result<Vec<u8>, String>;
}

/// 判定結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor<'a> {
    pub kind: MediaKind,
    /// 圧縮されていたものは展開後のバイト列
    pub payload: Cow<'a, [u8]>,
}

/// マウント時の指定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// 1-8
    pub drive: u8,
    pub read_only: bool,
    /// マウント後にコールドスタートする（カートリッジ・実行ファイル・BASICは常に行う）
    pub reboot: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions { drive: 1, read_only: false, reboot: true }
    }
}

impl MountOptions {
    /// ドライブ番号を配列の添字に
    pub fn drive_index(&self) -> Result<usize, MediaError> {
        match self.drive {
            1..=8 => Ok((self.drive - 1) as usize),
            other => Err(MediaError::InvalidDrive(other)),
        }
    }
}

fn word_le(bytes: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([bytes[i], bytes[i + 1]])
}

/// ヘッダのシグネチャだけで決まる種類
fn classify_header(header: &[u8]) -> Option<MediaKind> {
    if header.len() < 4 {
        return None;
    }
    if header[0] == 0 && header[1] == 0 && (header[2] != 0 || header[3] != 0) {
        return Some(MediaKind::Bas);
    }
    if &header[0..4] == STATE_PREFIX {
        return Some(MediaKind::State);
    }
    if &header[0..4] == cart::CART_MAGIC {
        return Some(MediaKind::Cart);
    }
    if &header[0..4] == cas::CAS_MAGIC {
        return Some(MediaKind::Cas);
    }
    if header[0..2] == atr::ATR_MAGIC {
        return Some(MediaKind::Atr);
    }
    if (header[0] == 0xF9 || header[0] == 0xFA) && dcm::is_archive_byte(header[1]) {
        return Some(MediaKind::Dcm);
    }
    if header[0] == 0xFF && header[1] == 0xFF && (header[2] != 0xFF || header[3] != 0xFF) {
        return Some(MediaKind::Xex);
    }
    None
}

/// ヘッダなしROMの末尾: 開始アドレス上位が $80-$BF、カートリッジ存在フラグが0
fn has_cart_trailer(bytes: &[u8]) -> bool {
    let len = bytes.len();
    len >= 6 && (0x80..=0xBF).contains(&bytes[len - 5]) && bytes[len - 4] == 0
}

/// ブートセクタ形式で、先頭ブロックが宣言するブロック数と長さが一致
fn is_boot_tape(bytes: &[u8]) -> bool {
    bytes.len() >= 128 && bytes[1] != 0 && (bytes[1] as usize) << 7 == bytes.len()
}

fn is_xfd(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.len() % 128 == 0 && bytes[1] != 0 && word_le(bytes, 2) != 0
}

/// 長さと内容による判定（シグネチャがないもの）
fn classify_headerless(bytes: &[u8]) -> Option<MediaKind> {
    if bytes.len() < 4 {
        return None;
    }
    if cart::is_rom_size(bytes.len()) && has_cart_trailer(bytes) {
        return Some(MediaKind::Rom);
    }
    if is_boot_tape(bytes) {
        return Some(MediaKind::BootTape);
    }
    if is_xfd(bytes) {
        return Some(MediaKind::Xfd);
    }
    if basic::looks_like_listing(bytes) {
        return Some(MediaKind::Lst);
    }
    None
}

/// gzipの中身を判定
fn classify_inflated(inner: Vec<u8>) -> Result<MediaDescriptor<'static>, MediaError> {
    let kind = if inner.len() >= 2 && inner[0..2] == atr::ATR_MAGIC {
        MediaKind::AtrGz
    } else if inner.len() >= 4 && &inner[0..4] == STATE_PREFIX {
        MediaKind::StateGz
    } else if !inner.is_empty() && inner.len() % 128 == 0 {
        MediaKind::XfdGz
    } else {
        return Err(MediaError::Unrecognized);
    };
    Ok(MediaDescriptor { kind, payload: Cow::Owned(inner) })
}

/// バイト列の種類を判定する
///
/// gzipは展開器がなければ判定できない（`CompressedUnsupported`）。
pub fn classify<'a>(bytes: &'a [u8], inflater: Option<&dyn Inflate>) -> Result<MediaDescriptor<'a>, MediaError> {
    if bytes.len() >= 2 && bytes[0..2] == GZIP_MAGIC {
        let inflater = inflater.ok_or(MediaError::CompressedUnsupported)?;
        let inner = inflater.inflate(bytes).map_err(MediaError::Inflate)?;
        return classify_inflated(inner);
    }
    let header = &bytes[..bytes.len().min(SNIFF_LEN)];
    let kind = classify_header(header)
        .or_else(|| classify_headerless(bytes))
        .ok_or(MediaError::Unrecognized)?;
    Ok(MediaDescriptor { kind, payload: Cow::Borrowed(bytes) })
}

/// 種類だけを返す（失敗は `MediaKind::Error`）
pub fn detect(bytes: &[u8], inflater: Option<&dyn Inflate>) -> MediaKind {
    match classify(bytes, inflater) {
        Ok(descriptor) => descriptor.kind,
        Err(e) => {
            log::debug!("Media detection failed: {}", e);
            MediaKind::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;

    impl Inflate for Identity {
        fn inflate(&self, compressed: &[u8]) -> Result<Vec<u8>, String> {
            Ok(compressed[2..].to_vec())
        }
    }

    fn kind(bytes: &[u8]) -> MediaKind {
        detect(bytes, None)
    }

    #[test]
    fn test_codes_stable() {
        assert_eq!(MediaKind::Error.code(), 0);
        assert_eq!(MediaKind::Atr.code(), 1);
        assert_eq!(MediaKind::Rom.code(), 10);
        assert_eq!(MediaKind::StateGz.code(), 14);
        for k in MediaKind::ALL {
            assert_eq!(MediaKind::from_code(k.code()), Some(k));
        }
        assert_eq!(MediaKind::from_code(15), None);
    }

    #[test]
    fn test_signatures() {
        let mut atr_bytes = vec![0x96, 0x02];
        atr_bytes.resize(16 + 128, 0);
        assert_eq!(kind(&atr_bytes), MediaKind::Atr);
        assert_eq!(kind(b"CART\0\0\0\x01\0\0\0\0\0\0\0\0"), MediaKind::Cart);
        assert_eq!(kind(b"FUJI\0\0\0\0"), MediaKind::Cas);
        assert_eq!(kind(b"ATARI800\x06\x00"), MediaKind::State);
        assert_eq!(kind(&[0xFF, 0xFF, 0x00, 0x20, 0x00, 0x20, 0]), MediaKind::Xex);
        assert_eq!(kind(&[0xFF, 0xFF, 0xFF, 0xFF]), MediaKind::Error);
        assert_eq!(kind(&[0x00, 0x00, 0x10, 0x01, 0, 0]), MediaKind::Bas);
        assert_eq!(kind(&[0xF9, 0x81, 0x01, 0x00, 0x45]), MediaKind::Dcm);
        assert_eq!(kind(b"10 PRINT 1\n"), MediaKind::Lst);
    }

    #[test]
    fn test_headerless() {
        let mut rom = vec![0u8; 8192];
        rom[8192 - 5] = 0xA0;
        assert_eq!(kind(&rom), MediaKind::Rom);

        let mut tape = vec![0u8; 3 * 128];
        tape[1] = 3;
        assert_eq!(kind(&tape), MediaKind::BootTape);

        let mut xfd = vec![0u8; 720 * 128];
        xfd[1] = 3;
        xfd[2] = 0x00;
        xfd[3] = 0x07;
        assert_eq!(kind(&xfd), MediaKind::Xfd);
    }

    #[test]
    fn test_all_zero_unrecognized() {
        for len in [0usize, 1, 4, 128, 8192, 720 * 128] {
            assert_eq!(kind(&vec![0u8; len]), MediaKind::Error, "len {}", len);
        }
        assert!(matches!(classify(&[0; 300], None), Err(MediaError::Unrecognized)));
    }

    #[test]
    fn test_gzip() {
        let mut gz = vec![0x1F, 0x8B, 0x96, 0x02];
        gz.resize(20, 0);
        assert!(matches!(classify(&gz, None), Err(MediaError::CompressedUnsupported)));
        let descriptor = classify(&gz, Some(&Identity)).unwrap();
        assert_eq!(descriptor.kind, MediaKind::AtrGz);
        assert_eq!(&descriptor.payload[..2], &[0x96, 0x02]);

        let mut state = vec![0x1F, 0x8B];
        state.extend_from_slice(b"ATARI800\x06\x00");
        assert_eq!(detect(&state, Some(&Identity)), MediaKind::StateGz);

        let mut xfd = vec![0x1F, 0x8B];
        xfd.resize(2 + 256, 0);
        assert_eq!(detect(&xfd, Some(&Identity)), MediaKind::XfdGz);
    }

    #[test]
    fn test_deterministic() {
        let bytes = b"10 REM\n";
        assert_eq!(classify(bytes, None).unwrap(), classify(bytes, None).unwrap());
    }

    #[test]
    fn test_mount_options() {
        assert_eq!(MountOptions::default().drive_index().unwrap(), 0);
        let options = MountOptions { drive: 9, ..MountOptions::default() };
        assert!(matches!(options.drive_index(), Err(MediaError::InvalidDrive(9))));
    }
}
