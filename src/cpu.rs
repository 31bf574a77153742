//! CPUインターフェース
//!
//! 6502の命令デコーダ/実行部は外部コンポーネント。
//! ここではコアとの境界（レジスタ、バス、実行結果）だけを定義する。

use crate::clock::Clock;
use serde::{Deserialize, Serialize};

/// CPUのステータスレジスタのフラグビット
pub mod flags {
    pub const CARRY: u8 = 0b0000_0001;      // C: キャリーフラグ
    pub const ZERO: u8 = 0b0000_0010;       // Z: ゼロフラグ
    pub const IRQ_DISABLE: u8 = 0b0000_0100; // I: 割り込み禁止フラグ
    pub const DECIMAL: u8 = 0b0000_1000;    // D: BCDモードフラグ
    pub const BREAK: u8 = 0b0001_0000;      // B: ブレークフラグ
    pub const UNUSED: u8 = 0b0010_0000;     // 未使用（常に1）
    pub const OVERFLOW: u8 = 0b0100_0000;   // V: オーバーフローフラグ
    pub const NEGATIVE: u8 = 0b1000_0000;   // N: 負数フラグ
}

/// エスケープシーケンスの先頭バイト（6502の不正オペコード）
pub const ESCAPE_OPCODE: u8 = 0xF2;
/// 同じ意味を持つもう一つの不正オペコード
pub const ESCAPE_OPCODE_ALT: u8 = 0xD2;
/// RTS
pub const RTS_OPCODE: u8 = 0x60;

/// リセットベクタ
pub const RESET_VECTOR: u16 = 0xFFFC;

/// CPUレジスタの状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    /// アキュムレータ（A）
    pub a: u8,
    /// Xインデックスレジスタ
    pub x: u8,
    /// Yインデックスレジスタ
    pub y: u8,
    /// スタックポインタ
    pub sp: u8,
    /// プログラムカウンタ
    pub pc: u16,
    /// ステータスレジスタ（プロセッサフラグ）
    pub status: u8,
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFF,
            pc: 0,
            status: flags::UNUSED | flags::IRQ_DISABLE,
        }
    }
}

impl Registers {
    /// フラグをセット
    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.status |= flag;
        } else {
            self.status &= !flag;
        }
    }

    /// フラグを取得
    pub fn get_flag(&self, flag: u8) -> bool {
        (self.status & flag) != 0
    }

    /// ゼロフラグと負数フラグを値に基づいて更新
    pub fn update_zero_negative_flags(&mut self, value: u8) {
        self.set_flag(flags::ZERO, value == 0);
        self.set_flag(flags::NEGATIVE, (value & 0x80) != 0);
    }
}

/// CPUから見たバス
///
/// RAM/ROMとハードウェアレジスタの振り分けはバス側の責任。
/// CPUは命令ごとに消費サイクルを `clock()` に加算する。
pub trait CpuBus {
    /// メモリから1バイト読み取り
    fn read(&mut self, address: u16) -> u8;
    /// メモリに1バイト書き込み
    fn write(&mut self, address: u16, value: u8);
    /// 共有クロック
    fn clock(&mut self) -> &mut Clock;
}

/// `CpuCore::execute` の終了理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// `cycle_position >= cycle_limit` に達した
    Budget,
    /// エスケープシーケンスを実行した（PCはシーケンスの直後）
    Escape(u8),
    /// CPUが停止した（JAM/KIL）
    Jammed,
}

/// 6502コア
///
/// `execute` は `clock.cycle_position() < clock.cycle_limit()` の間、命令単位で実行する。
/// 命令は途中で中断しないので、戻った時点の位置は上限を数サイクル超えていることがある。
/// `ESCAPE_OPCODE` (または `ESCAPE_OPCODE_ALT`) とそれに続くコードを読んだら
/// PCを2バイト進めて `CpuExit::Escape(code)` を返す。
pub trait CpuCore {
    fn execute(&mut self, bus: &mut dyn CpuBus) -> CpuExit;
    /// RESETライン（ベクタ $FFFC から再開）
    fn reset(&mut self, bus: &mut dyn CpuBus);
    fn nmi(&mut self);
    fn irq(&mut self);
    fn registers(&self) -> &Registers;
    fn registers_mut(&mut self) -> &mut Registers;
}

/// 命令を実行せずに予算だけ消費するコア
///
/// 6502コアを接続しないヘッドレス実行で、タイミング・マウント・リセットの流れを
/// 確認するために使う。
#[derive(Debug, Clone, Default)]
pub struct IdleCore {
    regs: Registers,
    /// 受け付けたNMI数
    pub nmi_count: u64,
    /// 受け付けたIRQ数
    pub irq_count: u64,
}

impl IdleCore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CpuCore for IdleCore {
    fn execute(&mut self, bus: &mut dyn CpuBus) -> CpuExit {
        let clock = bus.clock();
        if !clock.budget_exhausted() {
            let limit = clock.cycle_limit();
            clock.advance_to(limit);
        }
        CpuExit::Budget
    }

    fn reset(&mut self, bus: &mut dyn CpuBus) {
        let lo = bus.read(RESET_VECTOR) as u16;
        let hi = bus.read(RESET_VECTOR + 1) as u16;
        self.regs = Registers {
            pc: (hi << 8) | lo,
            ..Registers::default()
        };
    }

    fn nmi(&mut self) {
        self.nmi_count += 1;
    }

    fn irq(&mut self) {
        if !self.regs.get_flag(flags::IRQ_DISABLE) {
            self.irq_count += 1;
        }
    }

    fn registers(&self) -> &Registers {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatBus {
        ram: Vec<u8>,
        clock: Clock,
    }

    impl CpuBus for FlatBus {
        fn read(&mut self, address: u16) -> u8 {
            self.ram[address as usize]
        }
        fn write(&mut self, address: u16, value: u8) {
            self.ram[address as usize] = value;
        }
        fn clock(&mut self) -> &mut Clock {
            &mut self.clock
        }
    }

    #[test]
    fn test_flags() {
        let mut regs = Registers::default();
        regs.update_zero_negative_flags(0x80);
        assert!(regs.get_flag(flags::NEGATIVE));
        assert!(!regs.get_flag(flags::ZERO));
        regs.update_zero_negative_flags(0);
        assert!(regs.get_flag(flags::ZERO));
        assert!(!regs.get_flag(flags::NEGATIVE));
    }

    #[test]
    fn test_idle_core_consumes_budget() {
        let mut bus = FlatBus { ram: vec![0; 0x10000], clock: Clock::default() };
        bus.ram[0xFFFC] = 0x34;
        bus.ram[0xFFFD] = 0x12;
        let mut cpu = IdleCore::new();
        cpu.reset(&mut bus);
        assert_eq!(cpu.registers().pc, 0x1234);

        bus.clock.set_cycle_limit(100);
        assert_eq!(cpu.execute(&mut bus), CpuExit::Budget);
        assert_eq!(bus.clock.cycle_position(), 100);
    }
}
