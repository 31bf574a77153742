//! エスケープシーケンスによるOSルーチンの置き換え
//!
//! ROMのエントリポイントに `F2 xx` (不正オペコード + コード) を埋め込み、
//! CPUがそれを実行したらホスト側のハンドラを呼ぶ。
//!
//! - `EscapeRegistry`: コード → ハンドラの対応表（メモリには触らない）
//! - `PatchInstaller`: メモリにマーカーを書き込み、元のバイトを覚えて戻す
//!
//! 両者は `Atari800::add_esc` / `remove_esc` が必ず同時に更新する。

use std::collections::HashMap;

use crate::clock::Clock;
use crate::cpu::{flags, Registers, ESCAPE_OPCODE, RTS_OPCODE};
use crate::devices::{self, Devices};
use crate::memory::{Attrib, Memory};
use crate::{binload, sio};

/// エスケープコード
///
/// 値はデバイスごとの固定帯域に割り当てられている（`BANDS` 参照）。
pub mod codes {
    pub const SIOV: u8 = 0x00;

    pub const EHOPEN: u8 = 0x01;
    pub const EHCLOS: u8 = 0x02;
    pub const EHREAD: u8 = 0x03;
    pub const EHWRIT: u8 = 0x04;
    pub const EHSTAT: u8 = 0x05;
    pub const EHSPEC: u8 = 0x06;

    pub const KHOPEN: u8 = 0x07;
    pub const KHCLOS: u8 = 0x08;
    pub const KHREAD: u8 = 0x09;
    pub const KHWRIT: u8 = 0x0A;
    pub const KHSTAT: u8 = 0x0B;
    pub const KHSPEC: u8 = 0x0C;

    pub const BINLOADER_CONT: u8 = 0x0D;

    pub const COPENLOAD: u8 = 0xA8;
    pub const COPENSAVE: u8 = 0xA9;

    pub const PHOPEN: u8 = 0xB0;
    pub const PHCLOS: u8 = 0xB1;
    pub const PHREAD: u8 = 0xB2;
    pub const PHWRIT: u8 = 0xB3;
    pub const PHSTAT: u8 = 0xB4;
    pub const PHSPEC: u8 = 0xB5;
    pub const PHINIT: u8 = 0xB6;

    pub const HHOPEN: u8 = 0xC0;
    pub const HHCLOS: u8 = 0xC1;
    pub const HHREAD: u8 = 0xC2;
    pub const HHWRIT: u8 = 0xC3;
    pub const HHSTAT: u8 = 0xC4;
    pub const HHSPEC: u8 = 0xC5;
    pub const HHINIT: u8 = 0xC6;
}

/// デバイスごとのコード帯域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapeBand {
    pub name: &'static str,
    pub first: u8,
    pub len: u8,
}

impl EscapeBand {
    pub fn contains(&self, code: u8) -> bool {
        code >= self.first && (code - self.first) < self.len
    }
}

/// コード帯域の一覧
pub const BANDS: &[EscapeBand] = &[
    EscapeBand { name: "SIO", first: codes::SIOV, len: 1 },
    EscapeBand { name: "E:", first: codes::EHOPEN, len: 6 },
    EscapeBand { name: "K:", first: codes::KHOPEN, len: 6 },
    EscapeBand { name: "BINLOADER", first: codes::BINLOADER_CONT, len: 1 },
    EscapeBand { name: "C:", first: codes::COPENLOAD, len: 2 },
    EscapeBand { name: "P:", first: codes::PHOPEN, len: 7 },
    EscapeBand { name: "H:", first: codes::HHOPEN, len: 7 },
];

/// コードが属する帯域
pub fn band_of(code: u8) -> Option<&'static EscapeBand> {
    BANDS.iter().find(|band| band.contains(code))
}

/// CIOハンドラテーブルのエントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CioEntry {
    Open,
    Close,
    Read,
    Write,
    Status,
    Special,
}

impl CioEntry {
    pub const ALL: [CioEntry; 6] = [
        CioEntry::Open,
        CioEntry::Close,
        CioEntry::Read,
        CioEntry::Write,
        CioEntry::Status,
        CioEntry::Special,
    ];

    /// テーブル内の位置 (0..6)
    pub fn index(self) -> u8 {
        self as u8
    }

    /// 帯域の先頭コードからのコード
    pub fn code(self, band_first: u8) -> u8 {
        band_first + self.index()
    }
}

/// エディタ (E:) のハンドラテーブル
pub const EDITOR_TABLE: u16 = 0xE400;
/// プリンタ (P:) のハンドラテーブル
pub const PRINTER_TABLE: u16 = 0xE430;
/// SIOVエントリ
pub const SIOV: u16 = 0xE459;

/// CIOテーブルからルーチンの実アドレスを求める
/// （テーブルには「アドレス-1」が入っている）
pub fn cio_vector(memory: &mut Memory, table: u16, entry: CioEntry) -> u16 {
    memory
        .dget_word(table + entry.index() as u16 * 2)
        .wrapping_add(1)
}

/// テーブル末尾の `JMP init` の飛び先
pub fn cio_init_address(memory: &mut Memory, table: u16) -> Option<u16> {
    if memory.dget_byte(table + 12) == 0x4C {
        Some(memory.dget_word(table + 13))
    } else {
        None
    }
}

/// テーブルの全ルーチンがROM上にあるか（RAMに移されたOSには手を出さない）
pub fn cio_table_in_rom(memory: &mut Memory, table: u16) -> bool {
    for entry in CioEntry::ALL {
        let address = cio_vector(memory, table, entry);
        if memory.attrib(address) != Attrib::Rom {
            return false;
        }
    }
    true
}

/// ホストが登録する任意のハンドラ
pub trait EscapeHandler {
    fn invoke(&mut self, host: &mut EscapeHost<'_>);
}

impl<F> EscapeHandler for F
where
    F: FnMut(&mut EscapeHost<'_>),
{
    fn invoke(&mut self, host: &mut EscapeHost<'_>) {
        self(host)
    }
}

/// ハンドラの種類
pub enum Handler {
    /// SIOV (ディスク/カセットのセクタI/O)
    Sio,
    /// バイナリローダの続き
    BinLoaderCont,
    /// プリンタの各エントリ
    Printer(CioEntry),
    PrinterInit,
    /// BASICローダ用のエディタ READ
    EditorRead,
    Host(Box<dyn EscapeHandler>),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sio => write!(f, "Sio"),
            Handler::BinLoaderCont => write!(f, "BinLoaderCont"),
            Handler::Printer(entry) => write!(f, "Printer({:?})", entry),
            Handler::PrinterInit => write!(f, "PrinterInit"),
            Handler::EditorRead => write!(f, "EditorRead"),
            Handler::Host(_) => write!(f, "Host(..)"),
        }
    }
}

impl Handler {
    /// 任意のクロージャをハンドラにする
    pub fn host<H: EscapeHandler + 'static>(handler: H) -> Self {
        Handler::Host(Box::new(handler))
    }

    pub fn invoke(&mut self, host: &mut EscapeHost<'_>) {
        match self {
            Handler::Sio => sio::handle(host),
            Handler::BinLoaderCont => binload::cont(host),
            Handler::Printer(entry) => devices::printer_entry(*entry, host),
            Handler::PrinterInit => {}
            Handler::EditorRead => devices::editor_read(host),
            Handler::Host(handler) => handler.invoke(host),
        }
    }
}

/// ハンドラ実行中に要求されたパッチ操作
///
/// ハンドラはレジストリを借用中に呼ばれるので、その場では適用せず
/// ディスパッチ後にまとめて適用する。
#[derive(Debug)]
pub enum PatchOp {
    /// マーカーを書き込んで登録
    Add { address: u16, code: u8, handler: Handler, rts: bool },
    /// 登録だけ（マーカーは呼び出し側が既に書いた）
    Register { address: u16, code: u8, handler: Handler },
    /// 登録解除してマーカーを戻す
    Remove(u8),
}

/// ハンドラに渡すマシンの一部
pub struct EscapeHost<'a> {
    pub regs: &'a mut Registers,
    pub memory: &'a mut Memory,
    pub clock: &'a mut Clock,
    pub devices: &'a mut Devices,
    ops: Vec<PatchOp>,
}

impl<'a> EscapeHost<'a> {
    pub fn new(
        regs: &'a mut Registers,
        memory: &'a mut Memory,
        clock: &'a mut Clock,
        devices: &'a mut Devices,
    ) -> Self {
        EscapeHost { regs, memory, clock, devices, ops: Vec::new() }
    }

    pub fn add_esc(&mut self, address: u16, code: u8, handler: Handler) {
        self.ops.push(PatchOp::Add { address, code, handler, rts: false });
    }

    pub fn add_esc_rts(&mut self, address: u16, code: u8, handler: Handler) {
        self.ops.push(PatchOp::Add { address, code, handler, rts: true });
    }

    pub fn register_esc(&mut self, address: u16, code: u8, handler: Handler) {
        self.ops.push(PatchOp::Register { address, code, handler });
    }

    pub fn remove_esc(&mut self, code: u8) {
        self.ops.push(PatchOp::Remove(code));
    }

    pub fn into_ops(self) -> Vec<PatchOp> {
        self.ops
    }

    /// スタックにプッシュ
    pub fn push(&mut self, value: u8) {
        self.memory.dput_byte(0x0100 | self.regs.sp as u16, value);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
    }

    /// スタックからプル
    pub fn pull(&mut self) -> u8 {
        self.regs.sp = self.regs.sp.wrapping_add(1);
        self.memory.dget_byte(0x0100 | self.regs.sp as u16)
    }

    pub fn push_word(&mut self, value: u16) {
        self.push((value >> 8) as u8);
        self.push(value as u8);
    }

    /// RTSと同じ: 戻りアドレス+1 をPCへ
    pub fn rts(&mut self) {
        let lo = self.pull() as u16;
        let hi = self.pull() as u16;
        self.regs.pc = ((hi << 8) | lo).wrapping_add(1);
    }

    /// CIO/SIOの結果コード: Yに入れ、128以上ならNフラグを立てる
    pub fn set_status(&mut self, status: u8) {
        self.regs.y = status;
        self.regs.set_flag(flags::NEGATIVE, status >= 128);
        self.regs.set_flag(flags::ZERO, status == 0);
    }
}

/// 登録済みエスケープ
#[derive(Debug)]
pub struct EscapeEntry {
    pub address: u16,
    pub code: u8,
    /// マーカーの後ろにRTSが置かれている
    pub returns: bool,
    handler: Handler,
}

impl EscapeEntry {
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// コード → ハンドラの対応表
///
/// 同じコードへの再登録は前のハンドラを置き換える（エラーではない）。
#[derive(Debug, Default)]
pub struct EscapeRegistry {
    entries: HashMap<u8, EscapeEntry>,
    dispatched: u64,
    unhandled: u64,
}

impl EscapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 置き換えた古いエントリを返す
    pub fn install(&mut self, address: u16, code: u8, handler: Handler) -> Option<EscapeEntry> {
        self.insert(EscapeEntry { address, code, returns: false, handler })
    }

    /// マーカーの直後にRTSを置く呼び出し規約のエントリ
    pub fn install_with_return(&mut self, address: u16, code: u8, handler: Handler) -> Option<EscapeEntry> {
        self.insert(EscapeEntry { address, code, returns: true, handler })
    }

    fn insert(&mut self, entry: EscapeEntry) -> Option<EscapeEntry> {
        let code = entry.code;
        let address = entry.address;
        let previous = self.entries.insert(code, entry);
        if let Some(old) = &previous {
            log::debug!(
                "Escape ${:02X} superseded (${:04X} -> ${:04X})",
                code,
                old.address,
                address
            );
        }
        previous
    }

    /// 未登録なら何もしない
    pub fn remove(&mut self, code: u8) -> Option<EscapeEntry> {
        self.entries.remove(&code)
    }

    pub fn contains(&self, code: u8) -> bool {
        self.entries.contains_key(&code)
    }

    pub fn get(&self, code: u8) -> Option<&EscapeEntry> {
        self.entries.get(&code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 登録済みコード（昇順）
    pub fn codes(&self) -> Vec<u8> {
        let mut codes: Vec<u8> = self.entries.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// ハンドラを呼ぶ。未登録ならfalse
    pub fn dispatch(&mut self, code: u8, host: &mut EscapeHost<'_>) -> bool {
        match self.entries.get_mut(&code) {
            Some(entry) => {
                self.dispatched += 1;
                entry.handler.invoke(host);
                true
            }
            None => {
                self.unhandled += 1;
                false
            }
        }
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched
    }

    pub fn unhandled_count(&self) -> u64 {
        self.unhandled
    }
}

#[derive(Debug, Clone)]
struct Patch {
    address: u16,
    rts: bool,
    original: Vec<u8>,
}

/// メモリ上のマーカーの書き込み/復元
#[derive(Debug, Default)]
pub struct PatchInstaller {
    patches: HashMap<u8, Patch>,
}

impl PatchInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// マーカーを書き込む。同じコードが別の場所にあれば先に戻す
    pub fn plant(&mut self, memory: &mut Memory, address: u16, code: u8, rts: bool) {
        self.lift(memory, code);
        let len = if rts { 3 } else { 2 };
        let original = memory.copy_out(address, len);
        write_marker(memory, address, code, rts);
        self.patches.insert(code, Patch { address, rts, original });
    }

    /// 元のバイトに戻す。書き込んでいなければfalse
    pub fn lift(&mut self, memory: &mut Memory, code: u8) -> bool {
        match self.patches.remove(&code) {
            Some(patch) => {
                memory.copy_in(patch.address, &patch.original);
                true
            }
            None => false,
        }
    }

    /// 記録を捨てる（メモリはそのまま。コールドスタートでRAMを消した後など）
    pub fn forget(&mut self, code: u8) {
        self.patches.remove(&code);
    }

    pub fn is_planted(&self, code: u8) -> bool {
        self.patches.contains_key(&code)
    }

    pub fn address_of(&self, code: u8) -> Option<u16> {
        self.patches.get(&code).map(|p| p.address)
    }

    /// 全マーカーの下のバイトを一時的に戻す（ROM差し替えの前）
    /// 記録は残るので `replant_all` で書き直せる
    pub fn lift_all(&mut self, memory: &mut Memory) {
        for patch in self.patches.values() {
            memory.copy_in(patch.address, &patch.original);
        }
    }

    /// 覚えている位置にマーカーを書き直す（新しいROMの元バイトを保存し直す）
    pub fn replant_all(&mut self, memory: &mut Memory) {
        for patch in self.patches.values_mut() {
            let len = if patch.rts { 3 } else { 2 };
            patch.original = memory.copy_out(patch.address, len);
        }
        for (&code, patch) in &self.patches {
            write_marker(memory, patch.address, code, patch.rts);
        }
    }
}

fn write_marker(memory: &mut Memory, address: u16, code: u8, rts: bool) {
    memory.dput_byte(address, ESCAPE_OPCODE);
    memory.dput_byte(address.wrapping_add(1), code);
    if rts {
        memory.dput_byte(address.wrapping_add(2), RTS_OPCODE);
    }
}
