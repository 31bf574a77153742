//! 実行ファイルのロード
//!
//! D1: のブートセクタ読み取りを横取りして、`F2 0D` を含む偽のブートセクタを返す。
//! OSがそこへ飛んできたらセグメントを順にメモリへ書き込む。
//! INITAD が書かれたら、スタック上に置いたエスケープへRTSで戻るようにして
//! 初期化ルーチンを呼ぶ。最後に RUNAD へ飛ぶ。

use std::collections::VecDeque;

use crate::cpu::ESCAPE_OPCODE;
use crate::escape::{codes, EscapeHost, Handler};
use crate::media::Segment;
use crate::patch_log;

/// 実行開始アドレス
pub const RUNAD: u16 = 0x02E0;
/// 初期化ルーチンのアドレス
pub const INITAD: u16 = 0x02E2;
/// INITAD 上位に置く「書かれていない」印
const INITAD_SENTINEL: u8 = 0xD7;

/// 偽のブートセクタ ($0700 に読まれ、$0706 のエスケープに入る)
pub const BOOT_SECTOR: [u8; 8] = [0x00, 0x01, 0x00, 0x07, 0x77, 0xE4, ESCAPE_OPCODE, codes::BINLOADER_CONT];
/// ブートセクタ内のエスケープの位置
pub const BOOT_ESCAPE: u16 = 0x0706;

/// ロード中の実行ファイル
#[derive(Debug, Clone)]
pub struct BinLoader {
    segments: VecDeque<Segment>,
    started: bool,
    /// 初期化ルーチンから戻ったときに戻すスタックポインタ
    saved_sp: Option<u8>,
}

impl BinLoader {
    pub fn new(segments: Vec<Segment>) -> Self {
        BinLoader {
            segments: segments.into(),
            started: false,
            saved_sp: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.segments.len()
    }
}

/// SIOから: D1: セクタ1の代わりに偽のブートセクタを書く
pub fn inject_boot_sector(host: &mut EscapeHost<'_>, buffer: u16) {
    host.memory.copy_in(buffer, &BOOT_SECTOR);
    host.register_esc(BOOT_ESCAPE, codes::BINLOADER_CONT, Handler::BinLoaderCont);
    host.devices.start_binloading = false;
}

/// `BINLOADER_CONT` のハンドラ
pub fn cont(host: &mut EscapeHost<'_>) {
    let Some(mut loader) = host.devices.binloader.take() else {
        log::warn!("Binary loader escape without a loaded file");
        host.remove_esc(codes::BINLOADER_CONT);
        return;
    };

    if let Some(sp) = loader.saved_sp.take() {
        host.regs.sp = sp;
    }
    if !loader.started {
        loader.started = true;
        if let Some(first) = loader.segments.front() {
            host.memory.dput_word(RUNAD, first.start);
        }
    }

    while let Some(segment) = loader.segments.pop_front() {
        host.memory.dput_byte(INITAD + 1, INITAD_SENTINEL);
        host.memory.copy_in(segment.start, &segment.data);
        patch_log::log_segment(segment.start, segment.end());

        if host.memory.dget_byte(INITAD + 1) != INITAD_SENTINEL {
            let init = host.memory.dget_word(INITAD);
            call_init(host, &mut loader, init);
            host.devices.binloader = Some(loader);
            return;
        }
    }

    let run = host.memory.dget_word(RUNAD);
    log::info!("Binary load finished, running ${:04X}", run);
    host.regs.pc = run;
    host.remove_esc(codes::BINLOADER_CONT);
}

/// 初期化ルーチンを呼ぶ。RTSでスタック上のエスケープに戻ってくる
fn call_init(host: &mut EscapeHost<'_>, loader: &mut BinLoader, init: u16) {
    let sp = host.regs.sp;
    // マーカーの2バイトともスタックページ内に置く
    let marker = 0x0100 | sp.wrapping_sub(1) as u16;
    host.memory.dput_byte(marker, ESCAPE_OPCODE);
    host.memory.dput_byte(0x0100 | sp as u16, codes::BINLOADER_CONT);
    host.regs.sp = sp.wrapping_sub(2);
    host.push_word(marker.wrapping_sub(1));
    host.regs.pc = init;
    loader.saved_sp = Some(sp);
    host.register_esc(marker, codes::BINLOADER_CONT, Handler::BinLoaderCont);
    log::debug!("Binary loader: INIT ${:04X}", init);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::cpu::Registers;
    use crate::devices::Devices;
    use crate::escape::PatchOp;
    use crate::memory::Memory;

    struct Parts {
        regs: Registers,
        memory: Memory,
        clock: Clock,
        devices: Devices,
    }

    impl Parts {
        fn new(segments: Vec<Segment>) -> Self {
            let mut devices = Devices::default();
            devices.binloader = Some(BinLoader::new(segments));
            Parts {
                regs: Registers { sp: 0xF0, ..Registers::default() },
                memory: Memory::new(),
                clock: Clock::default(),
                devices,
            }
        }

        fn cont(&mut self) -> Vec<PatchOp> {
            let mut host = EscapeHost::new(&mut self.regs, &mut self.memory, &mut self.clock, &mut self.devices);
            cont(&mut host);
            host.into_ops()
        }
    }

    #[test]
    fn test_runs_first_segment_by_default() {
        let mut parts = Parts::new(vec![
            Segment { start: 0x2000, data: vec![1, 2, 3] },
            Segment { start: 0x3000, data: vec![4] },
        ]);
        let ops = parts.cont();
        assert_eq!(parts.memory.copy_out(0x2000, 3), vec![1, 2, 3]);
        assert_eq!(parts.memory.dget_byte(0x3000), 4);
        assert_eq!(parts.regs.pc, 0x2000);
        assert!(matches!(ops.as_slice(), [PatchOp::Remove(codes::BINLOADER_CONT)]));
        assert!(parts.devices.binloader.is_none());
    }

    #[test]
    fn test_init_segment_round_trip() {
        let mut parts = Parts::new(vec![
            Segment { start: 0x4000, data: vec![0x60] },
            Segment { start: INITAD, data: vec![0x00, 0x40] },
            Segment { start: RUNAD, data: vec![0x00, 0x50] },
        ]);
        let ops = parts.cont();
        assert_eq!(parts.regs.pc, 0x4000);
        // マーカーはスタック上、戻りアドレスはマーカー-1
        let marker = 0x01EF;
        assert_eq!(parts.memory.copy_out(marker, 2), vec![ESCAPE_OPCODE, codes::BINLOADER_CONT]);
        assert_eq!(parts.regs.sp, 0xEC);
        assert_eq!(parts.memory.dget_word(0x01ED), marker - 1);
        assert!(matches!(
            ops.as_slice(),
            [PatchOp::Register { address: 0x01EF, code: codes::BINLOADER_CONT, .. }]
        ));

        // 初期化ルーチンのRTSでマーカーに戻った
        parts.regs.sp = 0xEE;
        parts.regs.pc = marker + 2;
        parts.cont();
        assert_eq!(parts.regs.sp, 0xF0);
        assert_eq!(parts.regs.pc, 0x5000);
    }

    #[test]
    fn test_init_marker_stays_in_stack_page() {
        let mut parts = Parts::new(vec![
            Segment { start: 0x4000, data: vec![0x60] },
            Segment { start: INITAD, data: vec![0x00, 0x40] },
        ]);
        parts.regs.sp = 0x00;
        parts.memory.dput_byte(0x0200, 0x5A);
        parts.cont();
        assert_eq!(parts.memory.dget_byte(0x01FF), ESCAPE_OPCODE);
        assert_eq!(parts.memory.dget_byte(0x0100), codes::BINLOADER_CONT);
        assert_eq!(parts.memory.dget_byte(0x0200), 0x5A);
        assert_eq!(parts.regs.pc, 0x4000);
    }

    #[test]
    fn test_boot_sector_injection() {
        let mut parts = Parts::new(vec![]);
        parts.devices.start_binloading = true;
        let mut host = EscapeHost::new(&mut parts.regs, &mut parts.memory, &mut parts.clock, &mut parts.devices);
        inject_boot_sector(&mut host, 0x0700);
        let ops = host.into_ops();
        assert_eq!(parts.memory.copy_out(0x0700, 8), BOOT_SECTOR.to_vec());
        assert!(!parts.devices.start_binloading);
        assert!(matches!(ops.as_slice(), [PatchOp::Register { address: BOOT_ESCAPE, .. }]));
    }
}
