//! Atari 800 エミュレーションコア
//!
//! クロック、メモリ、特殊アドレス空間、エスケープ表、周辺装置を1つにまとめ、
//! フレーム単位で実行する。CPUと映像・音声チップは外部から差し込む。

use serde::{Deserialize, Serialize};

use crate::binload::BinLoader;
use crate::clock::{Clock, TvMode, LINE_C, MAX_OVERSHOOT};
use crate::cpu::{CpuBus, CpuCore, CpuExit, Registers};
use crate::devices::{BasicFeed, Devices, Drive};
use crate::error::{MediaError, ShutdownError, StateError};
use crate::escape::{
    cio_init_address, cio_table_in_rom, cio_vector, codes, CioEntry, EscapeHost, EscapeRegistry, Handler,
    PatchInstaller, PatchOp, EDITOR_TABLE, PRINTER_TABLE, SIOV,
};
use crate::io::{DeviceId, Peripheral, SpecialAddressSpace, CCTL_PAGE};
use crate::media::{
    self, cart, dcm, xex, BasicProgram, Cartridge, DiskImage, Inflate, MediaKind, MountOptions, SavedState,
    StateRestorer, Tape,
};
use crate::memory::{Memory, COLDST};
use crate::patch_log;

/// コアの起動オプション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreOptions {
    pub tv_mode: TvMode,
    /// SIOVを置き換える（実行ファイルのロードにも必要）
    pub sio_patch: bool,
    /// P: をホストのバッファへ
    pub printer_patch: bool,
    /// カートリッジがなければBASICを入れて起動
    pub basic_enabled: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        CoreOptions {
            tv_mode: TvMode::Pal,
            sio_patch: true,
            printer_patch: true,
            basic_enabled: false,
        }
    }
}

/// 実行を止めずに報告する異常
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// ハンドラのないエスケープ（PCはマーカーの位置）
    UnhandledEscape { code: u8, pc: u16 },
    /// スキャンライン境界のはみ出しが `MAX_OVERSHOOT` を超えた
    ExcessOvershoot { scanline: u32, cycles: u32 },
    CpuJammed { pc: u16 },
    CartridgeChecksum { declared: u32, actual: u32 },
    /// 配置方式を持たないカートリッジ
    UnmappedCartridge { kind: u32 },
    ShutdownFault(String),
}

/// CPUから見たバス
///
/// ハードウェアページ ($D000-$D7FF) は特殊アドレス空間へ、
/// $D5xx はバンク切り替えを持つカートリッジへ振り分ける。
struct SystemBus<'a> {
    memory: &'a mut Memory,
    io: &'a mut SpecialAddressSpace,
    clock: &'a mut Clock,
    cartridge: Option<&'a mut Cartridge>,
}

impl SystemBus<'_> {
    fn cctl_cartridge(&mut self, address: u16) -> Option<&mut Cartridge> {
        if (address >> 8) as u8 != CCTL_PAGE {
            return None;
        }
        self.cartridge.as_deref_mut().filter(|cart| cart.uses_cctl())
    }
}

impl CpuBus for SystemBus<'_> {
    fn read(&mut self, address: u16) -> u8 {
        if !self.memory.is_hardware(address) {
            return self.memory.dget_byte(address);
        }
        if let Some(cart) = self.cctl_cartridge(address) {
            return cart.read_cctl(address);
        }
        self.io.read(address, self.clock)
    }

    fn write(&mut self, address: u16, value: u8) {
        if !self.memory.is_hardware(address) {
            self.memory.put_byte(address, value);
            return;
        }
        if (address >> 8) as u8 == CCTL_PAGE {
            if let Some(cart) = self.cartridge.as_deref_mut().filter(|cart| cart.uses_cctl()) {
                cart.write_cctl(address, value, self.memory);
                return;
            }
        }
        self.io.write(address, value, self.clock)
    }

    fn clock(&mut self) -> &mut Clock {
        self.clock
    }
}

/// コア状態のスナップショット（クロック、レジスタ、64KBメモリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreState {
    pub version: u32,
    pub clock: Clock,
    pub registers: Registers,
    pub ram: Vec<u8>,
}

impl CoreState {
    pub const CURRENT_VERSION: u32 = 1;
}

/// Atari 800 のメイン構造体
pub struct Atari800 {
    clock: Clock,
    memory: Memory,
    io: SpecialAddressSpace,
    escapes: EscapeRegistry,
    patches: PatchInstaller,
    devices: Devices,
    cartridge: Option<Cartridge>,
    cpu: Box<dyn CpuCore>,
    inflater: Option<Box<dyn Inflate>>,
    restorer: Option<Box<dyn StateRestorer>>,
    diagnostics: Vec<Diagnostic>,
    options: CoreOptions,
    /// CPUが停止した（次のコールドスタートまで実行しない）
    jammed: bool,
}

impl Atari800 {
    /// 新しいコアを作成して初期化する
    pub fn new(cpu: Box<dyn CpuCore>, options: CoreOptions) -> Self {
        let mut atari = Atari800 {
            clock: Clock::new(options.tv_mode),
            memory: Memory::new(),
            io: SpecialAddressSpace::new(),
            escapes: EscapeRegistry::new(),
            patches: PatchInstaller::new(),
            devices: Devices::default(),
            cartridge: None,
            cpu,
            inflater: None,
            restorer: None,
            diagnostics: Vec::new(),
            options,
            jammed: false,
        };
        atari.initialise();
        atari
    }

    /// テレビ方式を設定し、OSパッチを入れてコールドスタート
    pub fn initialise(&mut self) {
        self.clock.set_tv_mode(self.options.tv_mode);
        log::info!(
            "Initialising core: {:?}, {} scanlines/frame",
            self.options.tv_mode,
            self.clock.scanlines_per_frame()
        );
        self.coldstart();
    }

    // ============================================================
    // エスケープ
    // ============================================================

    /// マーカーを書き込んでハンドラを登録
    pub fn add_esc(&mut self, address: u16, code: u8, handler: Handler) {
        self.patches.plant(&mut self.memory, address, code, false);
        let replaced = self.escapes.install(address, code, handler).is_some();
        patch_log::log_escape_installed(code, address, replaced);
    }

    /// マーカー + RTS を書き込んでハンドラを登録（ルーチン全体の置き換え）
    pub fn add_esc_rts(&mut self, address: u16, code: u8, handler: Handler) {
        self.patches.plant(&mut self.memory, address, code, true);
        let replaced = self.escapes.install_with_return(address, code, handler).is_some();
        patch_log::log_escape_installed(code, address, replaced);
    }

    /// ハンドラを外してマーカーの下のバイトを戻す（未登録なら何もしない）
    pub fn remove_esc(&mut self, code: u8) {
        self.patches.lift(&mut self.memory, code);
        if self.escapes.remove(code).is_some() {
            patch_log::log_escape_removed(code);
        }
    }

    fn apply_patch_op(&mut self, op: PatchOp) {
        match op {
            PatchOp::Add { address, code, handler, rts: true } => self.add_esc_rts(address, code, handler),
            PatchOp::Add { address, code, handler, rts: false } => self.add_esc(address, code, handler),
            PatchOp::Register { address, code, handler } => {
                // マーカーは呼び出し側が書いたので、別の場所の古いマーカーだけ戻す
                if self.patches.address_of(code) == Some(address) {
                    self.patches.forget(code);
                } else {
                    self.patches.lift(&mut self.memory, code);
                }
                let replaced = self.escapes.install(address, code, handler).is_some();
                patch_log::log_escape_installed(code, address, replaced);
            }
            PatchOp::Remove(code) => self.remove_esc(code),
        }
    }

    /// CPUが `F2 code` を実行した
    fn run_escape(&mut self, code: u8) {
        let pc = self.cpu.registers().pc.wrapping_sub(2);
        patch_log::log_escape_call(code, pc);
        let mut host = EscapeHost::new(
            self.cpu.registers_mut(),
            &mut self.memory,
            &mut self.clock,
            &mut self.devices,
        );
        let handled = self.escapes.dispatch(code, &mut host);
        let ops = host.into_ops();
        if !handled {
            patch_log::log_escape_unhandled(code, pc);
            self.diagnostics.push(Diagnostic::UnhandledEscape { code, pc });
        }
        for op in ops {
            self.apply_patch_op(op);
        }
    }

    /// OSのエントリポイントにパッチを入れる（オプションに合わせて入れ直す）
    fn patch_os(&mut self) {
        if self.options.sio_patch {
            self.add_esc_rts(SIOV, codes::SIOV, Handler::Sio);
        } else {
            self.remove_esc(codes::SIOV);
        }

        if self.options.printer_patch && cio_table_in_rom(&mut self.memory, PRINTER_TABLE) {
            for entry in CioEntry::ALL {
                let address = cio_vector(&mut self.memory, PRINTER_TABLE, entry);
                self.add_esc_rts(address, entry.code(codes::PHOPEN), Handler::Printer(entry));
            }
            if let Some(init) = cio_init_address(&mut self.memory, PRINTER_TABLE) {
                self.add_esc_rts(init, codes::PHINIT, Handler::PrinterInit);
            }
        } else {
            for code in codes::PHOPEN..=codes::PHINIT {
                self.remove_esc(code);
            }
        }
    }

    // ============================================================
    // 実行
    // ============================================================

    /// 1フレーム実行
    pub fn frame(&mut self) {
        self.clock.begin_frame();
        for _ in 0..self.clock.scanlines_per_frame() {
            self.run_scanline();
        }
    }

    fn run_scanline(&mut self) {
        if self.clock.resume_after_wsync() {
            patch_log::log_wsync_halt(self.clock.scanline(), self.clock.cycle_position());
        }
        self.io.begin_scanline(&mut self.clock);
        self.clock.set_cycle_limit(LINE_C);

        if self.jammed {
            if !self.clock.budget_exhausted() {
                self.clock.advance_to(LINE_C);
            }
        } else {
            self.run_cpu();
        }

        let pending = self.io.end_scanline(&self.clock);
        if pending.nmi {
            self.cpu.nmi();
        }
        if pending.irq {
            self.cpu.irq();
        }

        let scanline = self.clock.scanline();
        let carry = self.clock.begin_scanline();
        // はみ出しは全量を次のスキャンラインに持ち越す（上限超えは報告のみ）
        if carry > MAX_OVERSHOOT {
            log::warn!("Scanline {} overshot by {} cycles", scanline, carry);
            self.diagnostics.push(Diagnostic::ExcessOvershoot { scanline, cycles: carry });
        } else if carry > 0 {
            patch_log::log_overshoot(scanline, carry);
        }
    }

    /// 予算を使い切るまでCPUを回す。エスケープはその場で処理して続行
    fn run_cpu(&mut self) {
        loop {
            let exit = {
                let mut bus = SystemBus {
                    memory: &mut self.memory,
                    io: &mut self.io,
                    clock: &mut self.clock,
                    cartridge: self.cartridge.as_mut(),
                };
                self.cpu.execute(&mut bus)
            };
            match exit {
                CpuExit::Budget => break,
                CpuExit::Escape(code) => {
                    self.run_escape(code);
                    if self.clock.budget_exhausted() {
                        break;
                    }
                }
                CpuExit::Jammed => {
                    let pc = self.cpu.registers().pc;
                    log::warn!("CPU jammed at ${:04X}", pc);
                    self.diagnostics.push(Diagnostic::CpuJammed { pc });
                    self.jammed = true;
                    if !self.clock.budget_exhausted() {
                        self.clock.advance_to(LINE_C);
                    }
                    break;
                }
            }
        }
    }

    fn reset_cpu(&mut self) {
        let mut bus = SystemBus {
            memory: &mut self.memory,
            io: &mut self.io,
            clock: &mut self.clock,
            cartridge: self.cartridge.as_mut(),
        };
        self.cpu.reset(&mut bus);
        self.jammed = false;
    }

    /// コールドスタート（電源の入れ直し）
    pub fn coldstart(&mut self) {
        self.io.reset_all();

        let want_basic = (self.options.basic_enabled || self.devices.basic_feed.is_some())
            && self.cartridge.is_none()
            && self.devices.binloader.is_none();
        if want_basic && !self.memory.has_basic() {
            log::warn!("BASIC requested but no BASIC ROM loaded");
        }
        self.memory.enable_basic(want_basic);
        if let Some(cart) = self.cartridge.as_mut() {
            cart.cold_restart(&mut self.memory);
        }

        self.patch_os();
        self.memory.dput_byte(COLDST, 1);
        self.reset_cpu();
        log::info!("Cold start");
    }

    /// ウォームスタート（RESETキー）
    pub fn warmstart(&mut self) {
        self.io.reset_all();
        self.reset_cpu();
        log::info!("Warm start");
    }

    /// OS ROMを差し替えてコールドスタート
    pub fn load_os_rom(&mut self, rom: &[u8]) -> Result<(), MediaError> {
        self.patches.lift_all(&mut self.memory);
        let loaded = self.memory.load_os_rom(rom);
        self.patches.replant_all(&mut self.memory);
        loaded?;
        self.coldstart();
        Ok(())
    }

    /// BASIC ROMを読み込む（次のコールドスタートから有効）
    pub fn load_basic_rom(&mut self, rom: &[u8]) -> Result<(), MediaError> {
        self.memory.load_basic_rom(rom)
    }

    // ============================================================
    // メディア
    // ============================================================

    /// メディアを判定してマウントする
    ///
    /// 失敗したときはマシンの状態を一切変更しない。
    pub fn open_file(&mut self, bytes: &[u8], options: MountOptions) -> Result<MediaKind, MediaError> {
        let descriptor = match media::classify(bytes, self.inflater.as_deref()) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                patch_log::log_mount_rejected(&e.to_string());
                return Err(e);
            }
        };
        let kind = descriptor.kind;
        match self.mount(kind, &descriptor.payload, options) {
            Ok(()) => Ok(kind),
            Err(e) => {
                patch_log::log_mount_rejected(&format!("{}: {}", kind, e));
                Err(e)
            }
        }
    }

    /// `open_file` の結果をホスト向けの数値コードで返す（失敗は0）
    pub fn open_file_code(&mut self, bytes: &[u8], options: MountOptions) -> u8 {
        match self.open_file(bytes, options) {
            Ok(kind) => kind.code(),
            Err(e) => {
                log::warn!("Cannot open media: {}", e);
                MediaKind::Error.code()
            }
        }
    }

    fn mount(&mut self, kind: MediaKind, payload: &[u8], options: MountOptions) -> Result<(), MediaError> {
        match kind {
            MediaKind::Atr | MediaKind::AtrGz => {
                let index = options.drive_index()?;
                let (image, write_protect) = DiskImage::from_atr(payload)?;
                self.mount_disk(index, image, write_protect || options.read_only, kind, options.reboot);
            }
            MediaKind::Xfd | MediaKind::XfdGz => {
                let index = options.drive_index()?;
                let image = DiskImage::from_xfd(payload)?;
                self.mount_disk(index, image, options.read_only, kind, options.reboot);
            }
            MediaKind::Dcm => {
                let index = options.drive_index()?;
                let image = dcm::decode(payload)?;
                self.mount_disk(index, image, options.read_only, kind, options.reboot);
            }
            MediaKind::Xex => {
                if !self.options.sio_patch {
                    return Err(MediaError::NeedsSioPatch);
                }
                let segments = xex::parse_segments(payload)?;
                patch_log::log_mount(kind.name(), &format!("binary loader, {} segment(s)", segments.len()));
                self.stop_basic_feed();
                self.devices.binloader = Some(BinLoader::new(segments));
                self.devices.start_binloading = true;
                self.coldstart();
            }
            MediaKind::Bas | MediaKind::Lst => {
                let program = if kind == MediaKind::Bas {
                    BasicProgram::tokenized(payload)?
                } else {
                    BasicProgram::listed(payload)?
                };
                if !cio_table_in_rom(&mut self.memory, EDITOR_TABLE) {
                    return Err(MediaError::NoEditorHandler);
                }
                let address = cio_vector(&mut self.memory, EDITOR_TABLE, CioEntry::Read);
                patch_log::log_mount(kind.name(), "E:");
                self.devices.binloader = None;
                self.devices.start_binloading = false;
                self.devices.basic_feed = Some(BasicFeed::new(program.editor_stream()));
                self.add_esc_rts(address, codes::EHREAD, Handler::EditorRead);
                self.coldstart();
            }
            MediaKind::Cart | MediaKind::Rom => {
                let cartridge = if kind == MediaKind::Cart {
                    Cartridge::from_cart(payload)?
                } else {
                    Cartridge::from_rom(payload)?
                };
                self.insert_cartridge(cartridge);
            }
            MediaKind::Cas | MediaKind::BootTape => {
                let tape = if kind == MediaKind::Cas {
                    Tape::from_cas(payload)?
                } else {
                    Tape::from_boot_tape(payload)?
                };
                patch_log::log_mount(kind.name(), &format!("C: ({} records)", tape.records().len()));
                self.devices.cassette = Some(tape);
                self.devices.hold_start = true;
                if options.reboot {
                    self.coldstart();
                }
            }
            MediaKind::State | MediaKind::StateGz => {
                let state = SavedState::parse(payload, kind == MediaKind::StateGz)?;
                let restorer = self.restorer.as_mut().ok_or(MediaError::NoStateRestorer)?;
                restorer.restore(&state).map_err(MediaError::StateRestore)?;
                patch_log::log_mount(kind.name(), &format!("version {}", state.version));
            }
            MediaKind::Error => return Err(MediaError::Unrecognized),
        }
        Ok(())
    }

    fn mount_disk(&mut self, index: usize, image: DiskImage, read_only: bool, kind: MediaKind, reboot: bool) {
        patch_log::log_mount(
            kind.name(),
            &format!(
                "D{}: {} x {} bytes{}",
                index + 1,
                image.sector_count(),
                image.sector_size(),
                if read_only { " (read-only)" } else { "" }
            ),
        );
        self.devices.drives[index] = Some(Drive::new(image, read_only));
        if reboot {
            self.coldstart();
        }
    }

    fn insert_cartridge(&mut self, cartridge: Cartridge) {
        let kind = cartridge.kind();
        if !cartridge.checksum_ok() {
            let declared = cartridge.declared_checksum().unwrap_or(0);
            let actual = cart::checksum(cartridge.rom());
            log::warn!("Cartridge checksum mismatch: header {:08X}, ROM {:08X}", declared, actual);
            self.diagnostics.push(Diagnostic::CartridgeChecksum { declared, actual });
        }
        if !cartridge.is_mapped() {
            log::warn!("Cartridge type {} ({}) needs an external mapper", kind.code, kind.name);
            self.diagnostics.push(Diagnostic::UnmappedCartridge { kind: kind.code });
        }
        patch_log::log_mount(kind.name, "cartridge slot");
        if let Some(old) = self.cartridge.take() {
            old.unmap(&mut self.memory);
        }
        self.cartridge = Some(cartridge);
        self.coldstart();
    }

    fn stop_basic_feed(&mut self) {
        if self.devices.basic_feed.take().is_some() {
            self.remove_esc(codes::EHREAD);
        }
    }

    /// カートリッジを抜いてコールドスタート
    pub fn remove_cartridge(&mut self) -> Option<Cartridge> {
        let cartridge = self.cartridge.take()?;
        cartridge.unmap(&mut self.memory);
        self.coldstart();
        Some(cartridge)
    }

    /// ドライブ (1-8) のディスクを外す
    pub fn eject(&mut self, drive: u8) -> Option<Drive> {
        let index = (drive as usize).checked_sub(1)?;
        self.devices.drives.get_mut(index)?.take()
    }

    /// ドライブ (1-8) の内容をATRとして取り出し、変更フラグを下ろす
    pub fn save_drive(&mut self, drive: u8) -> Option<Vec<u8>> {
        let index = (drive as usize).checked_sub(1)?;
        let drive = self.devices.drive_mut(index)?;
        drive.dirty = false;
        Some(drive.image.to_atr(drive.read_only))
    }

    pub fn drive(&self, drive: u8) -> Option<&Drive> {
        self.devices.drive((drive as usize).checked_sub(1)?)
    }

    // ============================================================
    // 終了
    // ============================================================

    /// 周辺チップを終了させ、全メディアを外し、パッチを戻す
    ///
    /// 障害があっても最後まで実行し、まとめて返す。
    pub fn exit(&mut self) -> Result<(), ShutdownError> {
        let faults = self.io.shutdown_all();
        for (index, drive) in self.devices.drives.iter().enumerate() {
            if let Some(drive) = drive {
                if drive.dirty {
                    log::warn!("D{}: has unsaved changes", index + 1);
                }
            }
        }
        self.devices.eject_all();
        for code in self.escapes.codes() {
            self.remove_esc(code);
        }
        if faults.is_empty() {
            log::info!("Core shut down");
            return Ok(());
        }
        for fault in &faults {
            log::error!("Shutdown fault: {}", fault);
            self.diagnostics.push(Diagnostic::ShutdownFault(fault.clone()));
        }
        Err(ShutdownError { faults })
    }

    // ============================================================
    // 状態保存
    // ============================================================

    /// クロック・レジスタ・メモリをJSONで保存
    pub fn save_core_state(&self) -> Result<String, StateError> {
        let state = CoreState {
            version: CoreState::CURRENT_VERSION,
            clock: self.clock.clone(),
            registers: self.cpu.registers().clone(),
            ram: self.memory.as_slice().to_vec(),
        };
        Ok(serde_json::to_string(&state)?)
    }

    /// `save_core_state` の出力から復元
    pub fn load_core_state(&mut self, json: &str) -> Result<(), StateError> {
        let state: CoreState = serde_json::from_str(json)?;
        if state.version != CoreState::CURRENT_VERSION {
            return Err(StateError::Version(state.version));
        }
        let ram: &[u8; 0x10000] = state
            .ram
            .as_slice()
            .try_into()
            .map_err(|_| StateError::RamSize(state.ram.len()))?;
        self.memory.restore(ram);
        self.clock = state.clock;
        *self.cpu.registers_mut() = state.registers;
        self.jammed = false;
        Ok(())
    }

    // ============================================================
    // アクセサ
    // ============================================================

    /// 周辺チップをページ範囲に接続
    pub fn attach_peripheral(&mut self, first_page: u8, last_page: u8, device: Box<dyn Peripheral>) -> DeviceId {
        self.io.attach(first_page, last_page, device)
    }

    pub fn set_inflater(&mut self, inflater: Box<dyn Inflate>) {
        self.inflater = Some(inflater);
    }

    pub fn set_state_restorer(&mut self, restorer: Box<dyn StateRestorer>) {
        self.restorer = Some(restorer);
    }

    /// 溜まった診断を取り出す
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// プリンタ出力を取り出す
    pub fn take_printer_output(&mut self) -> String {
        self.devices.printer.take_output()
    }

    pub fn is_jammed(&self) -> bool {
        self.jammed
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn io(&self) -> &SpecialAddressSpace {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut SpecialAddressSpace {
        &mut self.io
    }

    pub fn escapes(&self) -> &EscapeRegistry {
        &self.escapes
    }

    pub fn patches(&self) -> &PatchInstaller {
        &self.patches
    }

    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cartridge.as_ref()
    }

    pub fn cpu(&self) -> &dyn CpuCore {
        self.cpu.as_ref()
    }

    pub fn cpu_mut(&mut self) -> &mut dyn CpuCore {
        self.cpu.as_mut()
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }
}
