//! フレーム単位の結合テスト
//!
//! 数命令だけ解釈する `ScriptedCpu` でコアを回し、クロック・エスケープ・
//! 特殊アドレス空間・メディアのマウントが噛み合うことを確認する。

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use a8rs::clock::{Clock, LINE_C, MAX_OVERSHOOT, WSYNC_C};
use a8rs::cpu::{CpuBus, CpuCore, CpuExit, Registers, ESCAPE_OPCODE, ESCAPE_OPCODE_ALT, RESET_VECTOR};
use a8rs::escape::{codes, EscapeHost, Handler};
use a8rs::io::{Interrupt, Peripheral, ANTIC_PAGE, WSYNC};
use a8rs::media::{DiskImage, MediaKind, MountOptions};
use a8rs::sio;
use a8rs::{Atari800, CoreOptions, Diagnostic, MediaError, TvMode};

/// 割り込み受付の記録
#[derive(Default)]
struct Lines {
    nmi: Cell<u32>,
    irq: Cell<u32>,
}

/// テスト用の最小CPU
///
/// F2/D2 xx (エスケープ), 20 (JSR), 60 (RTS), 4C (JMP), 8D (STA abs), A9 (LDA #),
/// 02 (停止), DB (50サイクルかかる架空の命令)。それ以外は2サイクルのNOP。
struct ScriptedCpu {
    regs: Registers,
    lines: Rc<Lines>,
}

impl ScriptedCpu {
    fn new(lines: Rc<Lines>) -> Self {
        ScriptedCpu { regs: Registers::default(), lines }
    }

    fn operand(&self, bus: &mut dyn CpuBus) -> u16 {
        let lo = bus.read(self.regs.pc.wrapping_add(1)) as u16;
        let hi = bus.read(self.regs.pc.wrapping_add(2)) as u16;
        (hi << 8) | lo
    }

    fn push(&mut self, bus: &mut dyn CpuBus, value: u8) {
        bus.write(0x0100 | self.regs.sp as u16, value);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
    }

    fn pull(&mut self, bus: &mut dyn CpuBus) -> u8 {
        self.regs.sp = self.regs.sp.wrapping_add(1);
        bus.read(0x0100 | self.regs.sp as u16)
    }
}

impl CpuCore for ScriptedCpu {
    fn execute(&mut self, bus: &mut dyn CpuBus) -> CpuExit {
        while !bus.clock().budget_exhausted() {
            let pc = self.regs.pc;
            match bus.read(pc) {
                ESCAPE_OPCODE | ESCAPE_OPCODE_ALT => {
                    let code = bus.read(pc.wrapping_add(1));
                    self.regs.pc = pc.wrapping_add(2);
                    bus.clock().add_cycles(2);
                    return CpuExit::Escape(code);
                }
                0x20 => {
                    let target = self.operand(bus);
                    let ret = pc.wrapping_add(2);
                    self.push(bus, (ret >> 8) as u8);
                    self.push(bus, ret as u8);
                    self.regs.pc = target;
                    bus.clock().add_cycles(6);
                }
                0x60 => {
                    let lo = self.pull(bus) as u16;
                    let hi = self.pull(bus) as u16;
                    self.regs.pc = ((hi << 8) | lo).wrapping_add(1);
                    bus.clock().add_cycles(6);
                }
                0x4C => {
                    self.regs.pc = self.operand(bus);
                    bus.clock().add_cycles(3);
                }
                0x8D => {
                    let address = self.operand(bus);
                    bus.clock().add_cycles(4);
                    bus.write(address, self.regs.a);
                    self.regs.pc = pc.wrapping_add(3);
                }
                0xA9 => {
                    self.regs.a = bus.read(pc.wrapping_add(1));
                    self.regs.pc = pc.wrapping_add(2);
                    bus.clock().add_cycles(2);
                }
                0x02 => return CpuExit::Jammed,
                0xDB => {
                    self.regs.pc = pc.wrapping_add(1);
                    bus.clock().add_cycles(50);
                }
                _ => {
                    self.regs.pc = pc.wrapping_add(1);
                    bus.clock().add_cycles(2);
                }
            }
        }
        CpuExit::Budget
    }

    fn reset(&mut self, bus: &mut dyn CpuBus) {
        let lo = bus.read(RESET_VECTOR) as u16;
        let hi = bus.read(RESET_VECTOR + 1) as u16;
        self.regs = Registers { pc: (hi << 8) | lo, ..Registers::default() };
    }

    fn nmi(&mut self) {
        self.lines.nmi.set(self.lines.nmi.get() + 1);
    }

    fn irq(&mut self) {
        self.lines.irq.set(self.lines.irq.get() + 1);
    }

    fn registers(&self) -> &Registers {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }
}

/// ANTICの代わり: WSYNCでCPUを止め、VBIでNMIを出す
#[derive(Default)]
struct AnticTrace {
    /// (スキャンライン, 書き込み時のサイクル位置)
    wsync_writes: Vec<(u32, u32)>,
    scanlines: u32,
    vbi_line: Option<u32>,
    /// スキャンラインの開始・終了ごとの `current_clock`
    clocks: Vec<u32>,
}

struct Antic(Rc<RefCell<AnticTrace>>);

impl Peripheral for Antic {
    fn name(&self) -> &str {
        "ANTIC trace"
    }

    fn read(&mut self, _address: u16, clock: &mut Clock) -> u8 {
        (clock.scanline() >> 1) as u8
    }

    fn write(&mut self, address: u16, _value: u8, clock: &mut Clock) {
        if address == WSYNC {
            self.0
                .borrow_mut()
                .wsync_writes
                .push((clock.scanline(), clock.cycle_position()));
            clock.wsync();
        }
    }

    fn begin_scanline(&mut self, clock: &mut Clock) {
        self.0.borrow_mut().clocks.push(clock.current_clock());
    }

    fn end_scanline(&mut self, clock: &Clock) -> Option<Interrupt> {
        let mut trace = self.0.borrow_mut();
        trace.scanlines += 1;
        trace.clocks.push(clock.current_clock());
        (trace.vbi_line == Some(clock.scanline())).then_some(Interrupt::Nmi)
    }
}

struct Rig {
    atari: Atari800,
    lines: Rc<Lines>,
    antic: Rc<RefCell<AnticTrace>>,
}

fn rig(tv_mode: TvMode) -> Rig {
    let lines = Rc::new(Lines::default());
    let options = CoreOptions { tv_mode, ..CoreOptions::default() };
    let mut atari = Atari800::new(Box::new(ScriptedCpu::new(Rc::clone(&lines))), options);
    let antic = Rc::new(RefCell::new(AnticTrace::default()));
    atari.attach_peripheral(ANTIC_PAGE, ANTIC_PAGE, Box::new(Antic(Rc::clone(&antic))));
    Rig { atari, lines, antic }
}

impl Rig {
    /// RAMにプログラムを置いてPCを向ける
    fn program(&mut self, address: u16, code: &[u8]) {
        self.atari.memory_mut().copy_in(address, code);
        self.atari.cpu_mut().registers_mut().pc = address;
    }
}

fn counter(hits: &Rc<Cell<u32>>, a: u8) -> Handler {
    let hits = Rc::clone(hits);
    Handler::host(move |host: &mut EscapeHost<'_>| {
        hits.set(hits.get() + 1);
        host.regs.a = a;
    })
}

#[test]
fn scanlines_per_frame_follow_tv_mode() {
    for (tv_mode, lines) in [(TvMode::Pal, 312), (TvMode::Ntsc, 262)] {
        let mut rig = rig(tv_mode);
        rig.program(0x0600, &[0x4C, 0x00, 0x06]);
        rig.atari.frame();
        assert_eq!(rig.antic.borrow().scanlines, lines);
        assert_eq!(rig.atari.clock().scanline(), lines);
        assert_eq!(rig.atari.clock().total_cycles(), (lines * LINE_C) as u64);
        rig.atari.frame();
        assert_eq!(rig.antic.borrow().scanlines, 2 * lines);
        assert_eq!(rig.atari.clock().frame_count(), 1);
    }
}

#[test]
fn escape_runs_registered_handler_once() {
    let mut rig = rig(TvMode::Pal);
    rig.program(0x0600, &[0xEA, 0xEA, 0x4C, 0x02, 0x06]);
    let hits = Rc::new(Cell::new(0));
    rig.atari.add_esc(0x0600, 0x40, counter(&hits, 0x77));
    assert_eq!(rig.atari.memory().copy_out(0x0600, 2), vec![ESCAPE_OPCODE, 0x40]);

    rig.atari.frame();
    assert_eq!(hits.get(), 1);
    assert_eq!(rig.atari.cpu().registers().a, 0x77);
    assert!(rig.atari.take_diagnostics().is_empty());
}

#[test]
fn second_registration_supersedes_first() {
    let mut rig = rig(TvMode::Pal);
    rig.program(0x0600, &[0xEA, 0xEA, 0x4C, 0x02, 0x06]);
    let first = Rc::new(Cell::new(0));
    let second = Rc::new(Cell::new(0));
    rig.atari.add_esc(0x0600, 0x40, counter(&first, 1));
    rig.atari.add_esc(0x0600, 0x40, counter(&second, 2));
    rig.atari.frame();
    assert_eq!(first.get(), 0);
    assert_eq!(second.get(), 1);
    assert_eq!(rig.atari.escapes().get(0x40).map(|e| e.address), Some(0x0600));
}

#[test]
fn removed_escape_restores_code() {
    let mut rig = rig(TvMode::Pal);
    rig.program(0x0600, &[0xEA, 0xEA, 0x4C, 0x02, 0x06]);
    let hits = Rc::new(Cell::new(0));
    rig.atari.add_esc(0x0600, 0x40, counter(&hits, 1));
    rig.atari.remove_esc(0x40);
    rig.atari.remove_esc(0x40);
    assert_eq!(rig.atari.memory().copy_out(0x0600, 2), vec![0xEA, 0xEA]);
    rig.atari.frame();
    assert_eq!(hits.get(), 0);
    assert!(rig.atari.take_diagnostics().is_empty());
}

#[test]
fn unhandled_escape_is_reported_and_skipped() {
    let mut rig = rig(TvMode::Pal);
    rig.program(0x0600, &[ESCAPE_OPCODE, 0x41, 0xA9, 0x33, 0x4C, 0x04, 0x06]);
    rig.atari.frame();
    assert_eq!(
        rig.atari.take_diagnostics(),
        vec![Diagnostic::UnhandledEscape { code: 0x41, pc: 0x0600 }]
    );
    assert_eq!(rig.atari.escapes().unhandled_count(), 1);
    // マーカーの後ろから実行が続いた
    assert_eq!(rig.atari.cpu().registers().a, 0x33);
}

#[test]
fn wsync_resumes_at_fixed_cycle() {
    let mut rig = rig(TvMode::Pal);
    rig.program(0x0600, &[0x8D, 0x0A, 0xD4, 0x4C, 0x00, 0x06]);
    rig.atari.frame();

    let trace = rig.antic.borrow();
    // 1回目は同じライン内で WSYNC_C へ飛ぶ。以降は WSYNC_C + JMP + STA で
    // 再開位置を越えるので、毎ライン次のラインまで止まる
    assert_eq!(trace.wsync_writes[0], (0, 4));
    assert_eq!(trace.wsync_writes[1], (0, WSYNC_C + 7));
    assert_eq!(trace.wsync_writes[2], (1, WSYNC_C + 7));
    assert_eq!(trace.wsync_writes.len(), 313);
    assert!(rig.atari.take_diagnostics().is_empty());
}

#[test]
fn end_of_scanline_interrupts_reach_cpu() {
    let mut rig = rig(TvMode::Ntsc);
    rig.antic.borrow_mut().vbi_line = Some(248);
    rig.program(0x0600, &[0x4C, 0x00, 0x06]);
    rig.atari.frame();
    rig.atari.frame();
    assert_eq!(rig.lines.nmi.get(), 2);
    assert_eq!(rig.lines.irq.get(), 0);
}

#[test]
fn unmapped_hardware_writes_are_counted() {
    let mut rig = rig(TvMode::Pal);
    // STA $D000 (未接続), STA $0700, JMP
    rig.program(0x0600, &[0xA9, 0x12, 0x8D, 0x00, 0xD0, 0x8D, 0x00, 0x07, 0x4C, 0x08, 0x06]);
    rig.atari.frame();
    assert_eq!(rig.atari.memory().dget_byte(0x0700), 0x12);
    assert_eq!(rig.atari.io().unmapped_accesses(), 1);
}

#[test]
fn overshoot_is_carried_into_next_scanline() {
    let mut rig = rig(TvMode::Pal);
    rig.program(0x0600, &[0xDB; 0x2000]);
    rig.atari.frame();

    // 0, 50, 100 → 150: 36 サイクルはみ出し、次のラインは 36 から 136 まで
    let diagnostics = rig.atari.take_diagnostics();
    assert_eq!(diagnostics[0], Diagnostic::ExcessOvershoot { scanline: 0, cycles: 36 });
    assert_eq!(diagnostics[1], Diagnostic::ExcessOvershoot { scanline: 1, cycles: 22 });
    assert!(diagnostics
        .iter()
        .all(|d| matches!(d, Diagnostic::ExcessOvershoot { cycles, .. } if *cycles > MAX_OVERSHOOT)));

    let trace = rig.antic.borrow();
    assert_eq!(trace.clocks.len(), 2 * 312);
    for pair in trace.clocks.windows(2) {
        assert!(pair[0] <= pair[1], "current_clock went backwards: {} -> {}", pair[0], pair[1]);
    }

    // 実行した命令のサイクルは1つも失われない
    let executed = (rig.atari.cpu().registers().pc - 0x0600) as u64;
    assert_eq!(rig.atari.clock().total_cycles(), executed * 50);
}

#[test]
fn jammed_cpu_stops_until_coldstart() {
    let mut rig = rig(TvMode::Pal);
    rig.program(0x0600, &[0x02]);
    rig.atari.frame();
    assert!(rig.atari.is_jammed());
    assert_eq!(rig.atari.take_diagnostics(), vec![Diagnostic::CpuJammed { pc: 0x0600 }]);
    assert_eq!(rig.atari.clock().scanline(), 312);

    rig.atari.frame();
    assert!(rig.atari.take_diagnostics().is_empty());

    rig.atari.coldstart();
    assert!(!rig.atari.is_jammed());
}

#[test]
fn sio_patch_reads_sector() {
    let mut rig = rig(TvMode::Pal);
    let mut image = DiskImage::blank(128, 720).unwrap();
    image.write_sector(5, &[0x55; 128]);
    let options = MountOptions { reboot: false, ..MountOptions::default() };
    assert_eq!(rig.atari.open_file(&image.to_atr(false), options).unwrap(), MediaKind::Atr);

    let memory = rig.atari.memory_mut();
    memory.dput_byte(sio::DDEVIC, sio::DISK_DEVICE);
    memory.dput_byte(sio::DUNIT, 1);
    memory.dput_byte(sio::DCOMND, sio::command::READ);
    memory.dput_word(sio::DBUFLO, 0x2000);
    memory.dput_word(sio::DBYTLO, 128);
    memory.dput_word(sio::DAUX1, 5);
    // JSR SIOV; JMP *
    rig.program(0x0600, &[0x20, 0x59, 0xE4, 0x4C, 0x03, 0x06]);
    rig.atari.frame();

    assert_eq!(rig.atari.memory().copy_out(0x2000, 128), vec![0x55; 128]);
    assert_eq!(rig.atari.memory().dget_byte(sio::DSTATS), sio::status::OK);
    assert_eq!(rig.atari.cpu().registers().y, sio::status::OK);
    assert_eq!(rig.atari.cpu().registers().pc, 0x0603);
    assert_eq!(rig.atari.cpu().registers().sp, 0xFF);
}

#[test]
fn atr_with_high_count_word_mounts() {
    let mut rig = rig(TvMode::Pal);
    let mut image = DiskImage::blank(128, 8192).unwrap();
    image.write_sector(8192, &[0xA5; 128]);
    let atr = image.to_atr(true);
    // 1 MiB = 0x1_0000 パラグラフ: カウント上位ワードが 1
    assert_eq!(&atr[2..8], &[0x00, 0x00, 0x80, 0x00, 0x01, 0x00]);

    let options = MountOptions { drive: 2, reboot: false, ..MountOptions::default() };
    assert_eq!(rig.atari.open_file(&atr, options).unwrap(), MediaKind::Atr);
    let drive = rig.atari.drive(2).unwrap();
    assert_eq!((drive.image.sector_size(), drive.image.sector_count()), (128, 8192));
    assert_eq!(drive.image.byte_len(), 8192 * 128);
    assert!(drive.read_only);
    assert_eq!(drive.image.read_sector(8192).map(|s| s[0]), Some(0xA5));
}

#[test]
fn atr_with_extra_payload_is_rejected() {
    let mut rig = rig(TvMode::Pal);
    let mut atr = DiskImage::blank(128, 4).unwrap().to_atr(false);
    atr.extend_from_slice(&[0xEE; 300]);
    let result = rig.atari.open_file(&atr, MountOptions::default());
    assert!(matches!(result, Err(MediaError::GeometryMismatch { .. })));
    assert!(rig.atari.drive(1).is_none());
}

#[test]
fn executable_loads_through_boot_intercept() {
    let mut rig = rig(TvMode::Pal);
    let xex = [0xFF, 0xFF, 0x00, 0x30, 0x02, 0x30, 0x4C, 0x00, 0x30];
    assert_eq!(rig.atari.open_file(&xex, MountOptions::default()).unwrap(), MediaKind::Xex);

    let memory = rig.atari.memory_mut();
    memory.dput_byte(sio::DDEVIC, sio::DISK_DEVICE);
    memory.dput_byte(sio::DUNIT, 1);
    memory.dput_byte(sio::DCOMND, sio::command::READ);
    memory.dput_word(sio::DBUFLO, 0x0700);
    memory.dput_word(sio::DBYTLO, 128);
    memory.dput_word(sio::DAUX1, 1);
    // JSR SIOV; JMP $0706 (ブートセクタ内のエスケープ)
    rig.program(0x0600, &[0x20, 0x59, 0xE4, 0x4C, 0x06, 0x07]);
    rig.atari.frame();

    assert_eq!(rig.atari.memory().copy_out(0x3000, 3), vec![0x4C, 0x00, 0x30]);
    assert_eq!(rig.atari.cpu().registers().pc, 0x3000);
    assert!(rig.atari.devices().binloader.is_none());
    assert!(!rig.atari.escapes().contains(codes::BINLOADER_CONT));
    assert!(rig.atari.take_diagnostics().is_empty());
}

#[test]
fn xegs_bank_switch_through_cctl() {
    let mut rig = rig(TvMode::Pal);
    let mut rom = Vec::new();
    for bank in 0..4u8 {
        rom.extend(std::iter::repeat(bank).take(0x2000));
    }
    let sum = rom.iter().fold(0u32, |s, &b| s.wrapping_add(b as u32));
    let mut cart = b"CART".to_vec();
    cart.extend_from_slice(&12u32.to_be_bytes());
    cart.extend_from_slice(&sum.to_be_bytes());
    cart.extend_from_slice(&[0; 4]);
    cart.extend_from_slice(&rom);
    assert_eq!(rig.atari.open_file(&cart, MountOptions::default()).unwrap(), MediaKind::Cart);
    assert_eq!(rig.atari.memory().dget_byte(0x8000), 0);
    assert_eq!(rig.atari.memory().dget_byte(0xA000), 3);

    // LDA #2; STA $D500; STA $8000 (ROMなので無視); JMP *
    rig.program(0x0600, &[0xA9, 0x02, 0x8D, 0x00, 0xD5, 0x8D, 0x00, 0x80, 0x4C, 0x08, 0x06]);
    rig.atari.frame();
    assert_eq!(rig.atari.memory().dget_byte(0x8000), 2);
    assert_eq!(rig.atari.memory().dget_byte(0xA000), 3);
    assert!(rig.atari.take_diagnostics().is_empty());

    // コールドスタートでバンク0に戻る
    rig.atari.coldstart();
    assert_eq!(rig.atari.memory().dget_byte(0x8000), 0);
}

#[test]
fn unrecognized_media_is_a_no_op() {
    let mut rig = rig(TvMode::Pal);
    rig.program(0x0600, &[0x4C, 0x00, 0x06]);
    let before = rig.atari.memory().as_slice().to_vec();
    for len in [0usize, 3, 128, 40 * 1024] {
        let result = rig.atari.open_file(&vec![0u8; len], MountOptions::default());
        assert!(matches!(result, Err(MediaError::Unrecognized)), "len {}", len);
    }
    assert_eq!(rig.atari.memory().as_slice(), &before[..]);
    assert_eq!(rig.atari.cpu().registers().pc, 0x0600);
}

#[test]
fn warmstart_keeps_coldstart_flag_clear() {
    let mut rig = rig(TvMode::Pal);
    rig.atari.memory_mut().dput_byte(a8rs::memory::COLDST, 0);
    rig.atari.warmstart();
    assert_eq!(rig.atari.memory().dget_byte(a8rs::memory::COLDST), 0);
    rig.atari.coldstart();
    assert_eq!(rig.atari.memory().dget_byte(a8rs::memory::COLDST), 1);
}
