//! DCM (DiskCommunicator) アーカイブの展開
//!
//! パス単位で圧縮されたセクタ列をディスクイメージに復元する。
//! パスヘッダ: 種類 ($F9/$FA)、アーカイブ情報、開始セクタ (LE16)。

use super::atr::{DiskFormat, DiskImage};
use crate::error::MediaError;

const PASS_MULTI: u8 = 0xFA;
const PASS_SINGLE: u8 = 0xF9;

/// アーカイブ情報バイトが妥当か（検出用）
pub fn is_archive_byte(value: u8) -> bool {
    density_of(value).is_some() && value & 0x1F == 1
}

/// アーカイブ情報の密度ビット (bit5-6) からジオメトリ
fn density_of(archive: u8) -> Option<(u16, u32)> {
    match (archive >> 5) & 0x03 {
        0 => Some((128, 720)),
        1 => Some((256, 720)),
        2 => Some((128, 1040)),
        _ => None,
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, MediaError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(MediaError::Truncated { what: "DCM stream", offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn word(&mut self) -> Result<u16, MediaError> {
        let lo = self.byte()? as u16;
        let hi = self.byte()? as u16;
        Ok((hi << 8) | lo)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

/// DCMをディスクイメージに展開する
pub fn decode(bytes: &[u8]) -> Result<DiskImage, MediaError> {
    let mut reader = Reader { bytes, pos: 0 };
    let mut image: Option<DiskImage> = None;
    let mut buf = [0u8; 256];
    let mut expected_pass = 1u8;

    loop {
        let kind = reader.byte()?;
        if kind != PASS_MULTI && kind != PASS_SINGLE {
            return Err(MediaError::MalformedHeader("bad DCM pass header"));
        }
        let archive = reader.byte()?;
        let (sector_size, sector_count) =
            density_of(archive).ok_or(MediaError::MalformedHeader("bad DCM density"))?;
        if archive & 0x1F != expected_pass {
            return Err(MediaError::MalformedHeader("DCM passes out of order"));
        }
        let last_pass = archive & 0x80 != 0;
        let image = match &mut image {
            Some(image) => image,
            slot => slot.insert(DiskImage::blank(sector_size, sector_count)?),
        };

        let mut sector = reader.word()? as u32;
        loop {
            let sector_type = reader.byte()?;
            if sector_type & 0x7F == 0x45 {
                break;
            }
            let len = image
                .sector_len(sector)
                .ok_or(MediaError::MalformedHeader("DCM sector out of range"))?;
            decode_sector(&mut reader, sector_type & 0x7F, &mut buf[..len])?;
            image.write_sector(sector, &buf[..len]);

            if sector_type & 0x80 != 0 {
                sector += 1;
            } else {
                sector = reader.word()? as u32;
            }
        }

        if last_pass {
            break;
        }
        expected_pass = expected_pass.wrapping_add(1);
        if reader.at_end() {
            return Err(MediaError::Truncated { what: "DCM pass", offset: reader.pos });
        }
    }

    let mut image = image.ok_or(MediaError::MalformedHeader("empty DCM archive"))?;
    image.set_format(DiskFormat::Dcm);
    Ok(image)
}

/// セクタ1つ分の展開。`buf` は直前のセクタの内容を保持している
fn decode_sector(reader: &mut Reader<'_>, kind: u8, buf: &mut [u8]) -> Result<(), MediaError> {
    let len = buf.len();
    match kind {
        // 変更部分: 先頭から offset までを逆順に
        0x41 => {
            let offset = reader.byte()? as usize;
            if offset >= len {
                return Err(MediaError::MalformedHeader("DCM $41 offset"));
            }
            for i in (0..=offset).rev() {
                buf[i] = reader.byte()?;
            }
        }
        // 128バイトセクタ: 末尾5バイト + 先頭を埋める値
        0x42 => {
            if len != 128 {
                return Err(MediaError::MalformedHeader("DCM $42 on long sector"));
            }
            for b in &mut buf[123..128] {
                *b = reader.byte()?;
            }
            let fill = buf[123];
            buf[..123].fill(fill);
        }
        // ランレングス: リテラル区間と繰り返し区間が交互
        0x43 => {
            let mut pos = 0usize;
            let mut literal = true;
            while pos < len {
                let raw = reader.byte()? as usize;
                let end = if raw == 0 { 256 } else { raw };
                if end < pos || end > len {
                    return Err(MediaError::MalformedHeader("DCM $43 run"));
                }
                if literal {
                    for b in &mut buf[pos..end] {
                        *b = reader.byte()?;
                    }
                } else {
                    let fill = reader.byte()?;
                    buf[pos..end].fill(fill);
                }
                if end == pos && !literal {
                    return Err(MediaError::MalformedHeader("DCM $43 no progress"));
                }
                pos = end;
                literal = !literal;
            }
        }
        // 変更部分: offset から末尾まで
        0x44 => {
            let offset = reader.byte()? as usize;
            if offset >= len {
                return Err(MediaError::MalformedHeader("DCM $44 offset"));
            }
            for b in &mut buf[offset..] {
                *b = reader.byte()?;
            }
        }
        // 直前のセクタと同じ
        0x46 => {}
        // 無圧縮
        0x47 => {
            for b in buf.iter_mut() {
                *b = reader.byte()?;
            }
        }
        _ => return Err(MediaError::MalformedHeader("unknown DCM sector type")),
    }
    Ok(())
}
