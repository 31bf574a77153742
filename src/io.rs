//! 特殊アドレス空間（RAMでもROMでもないアドレス）
//!
//! ハードウェアページへの読み書きを、そのページを担当する周辺チップに振り分ける。
//! 周辺チップの中身（ANTIC/GTIA/POKEY/PIA）は外部コンポーネント。

use crate::clock::Clock;

/// 標準的なハードウェアページ
pub const GTIA_PAGE: u8 = 0xD0;
pub const POKEY_PAGE: u8 = 0xD2;
pub const PIA_PAGE: u8 = 0xD3;
pub const ANTIC_PAGE: u8 = 0xD4;
/// カートリッジ制御 (CCTL)
pub const CCTL_PAGE: u8 = 0xD5;

/// ANTIC WSYNCレジスタ
pub const WSYNC: u16 = 0xD40A;

/// 未接続アドレスの読み取り値
pub const UNMAPPED_READ: u8 = 0xFF;

/// 周辺チップが要求する割り込み
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Nmi,
    Irq,
}

/// メモリマップドI/Oを持つ周辺チップ
pub trait Peripheral {
    fn name(&self) -> &str;

    /// レジスタ読み取り（読み取りで状態が変わるレジスタもある）
    fn read(&mut self, address: u16, clock: &mut Clock) -> u8;

    /// レジスタ書き込み（WSYNCのようにクロックを止めるものもある）
    fn write(&mut self, address: u16, value: u8, clock: &mut Clock);

    /// スキャンライン開始。DMAで盗むサイクルは `clock.add_cycles` で進める
    fn begin_scanline(&mut self, _clock: &mut Clock) {}

    /// スキャンライン終了。割り込みを要求する場合は返す
    fn end_scanline(&mut self, _clock: &Clock) -> Option<Interrupt> {
        None
    }

    fn reset(&mut self) {}

    fn shutdown(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// 接続済み周辺チップのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(usize);

/// スキャンライン終了時に集めた割り込み要求
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingInterrupts {
    pub nmi: bool,
    pub irq: bool,
}

/// ページ単位のルーティングテーブル
pub struct SpecialAddressSpace {
    devices: Vec<Box<dyn Peripheral>>,
    pages: [Option<usize>; 256],
    /// 未接続アドレスへのアクセス回数（診断用）
    unmapped_accesses: u64,
}

impl Default for SpecialAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpecialAddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.devices.iter().map(|d| d.name()).collect();
        f.debug_struct("SpecialAddressSpace")
            .field("devices", &names)
            .field("unmapped_accesses", &self.unmapped_accesses)
            .finish()
    }
}

impl SpecialAddressSpace {
    pub fn new() -> Self {
        SpecialAddressSpace {
            devices: Vec::new(),
            pages: [None; 256],
            unmapped_accesses: 0,
        }
    }

    /// 周辺チップをページ範囲に接続する
    /// 既に他のチップが割り当てられていたページは上書きされる
    pub fn attach(&mut self, first_page: u8, last_page: u8, device: Box<dyn Peripheral>) -> DeviceId {
        let index = self.devices.len();
        log::debug!(
            "Attached {} at ${:02X}00-${:02X}FF",
            device.name(),
            first_page,
            last_page
        );
        self.devices.push(device);
        for page in first_page..=last_page {
            self.pages[page as usize] = Some(index);
        }
        DeviceId(index)
    }

    /// ページ範囲の割り当てを外す（チップ自体は残る）
    pub fn detach_pages(&mut self, first_page: u8, last_page: u8) {
        for page in first_page..=last_page {
            self.pages[page as usize] = None;
        }
    }

    /// アドレスを担当するチップ
    pub fn route(&self, address: u16) -> Option<DeviceId> {
        self.pages[(address >> 8) as usize].map(DeviceId)
    }

    pub fn device(&self, id: DeviceId) -> Option<&dyn Peripheral> {
        self.devices.get(id.0).map(|d| d.as_ref())
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut (dyn Peripheral + 'static)> {
        self.devices.get_mut(id.0).map(|d| d.as_mut())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn unmapped_accesses(&self) -> u64 {
        self.unmapped_accesses
    }

    /// 特殊アドレスから読み取り
    pub fn read(&mut self, address: u16, clock: &mut Clock) -> u8 {
        match self.pages[(address >> 8) as usize] {
            Some(index) => self.devices[index].read(address, clock),
            None => {
                self.unmapped_accesses += 1;
                log::trace!("Read from unmapped ${:04X}", address);
                UNMAPPED_READ
            }
        }
    }

    /// 特殊アドレスに書き込み
    pub fn write(&mut self, address: u16, value: u8, clock: &mut Clock) {
        match self.pages[(address >> 8) as usize] {
            Some(index) => self.devices[index].write(address, value, clock),
            None => {
                self.unmapped_accesses += 1;
                log::trace!("Write ${:02X} to unmapped ${:04X}", value, address);
            }
        }
    }

    pub fn begin_scanline(&mut self, clock: &mut Clock) {
        for device in &mut self.devices {
            device.begin_scanline(clock);
        }
    }

    pub fn end_scanline(&mut self, clock: &Clock) -> PendingInterrupts {
        let mut pending = PendingInterrupts::default();
        for device in &mut self.devices {
            match device.end_scanline(clock) {
                Some(Interrupt::Nmi) => pending.nmi = true,
                Some(Interrupt::Irq) => pending.irq = true,
                None => {}
            }
        }
        pending
    }

    pub fn reset_all(&mut self) {
        for device in &mut self.devices {
            device.reset();
        }
    }

    /// 全チップを終了させ、失敗を集めて返す
    pub fn shutdown_all(&mut self) -> Vec<String> {
        let mut faults = Vec::new();
        for device in &mut self.devices {
            if let Err(e) = device.shutdown() {
                faults.push(format!("{}: {}", device.name(), e));
            }
        }
        faults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Latch {
        value: u8,
        writes: u32,
        resets: u32,
    }

    impl Peripheral for Latch {
        fn name(&self) -> &str {
            "latch"
        }
        fn read(&mut self, address: u16, _clock: &mut Clock) -> u8 {
            self.value ^ (address as u8 & 0x0F)
        }
        fn write(&mut self, _address: u16, value: u8, _clock: &mut Clock) {
            self.value = value;
            self.writes += 1;
        }
        fn end_scanline(&mut self, clock: &Clock) -> Option<Interrupt> {
            (clock.scanline() == 3).then_some(Interrupt::Nmi)
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    struct Faulty;

    impl Peripheral for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }
        fn read(&mut self, _address: u16, _clock: &mut Clock) -> u8 {
            0
        }
        fn write(&mut self, _address: u16, _value: u8, _clock: &mut Clock) {}
        fn shutdown(&mut self) -> Result<(), String> {
            Err("stuck".to_string())
        }
    }

    #[test]
    fn test_routing() {
        let mut io = SpecialAddressSpace::new();
        let mut clock = Clock::default();
        let id = io.attach(POKEY_PAGE, POKEY_PAGE, Box::new(Latch::default()));

        io.write(0xD201, 0x40, &mut clock);
        assert_eq!(io.read(0xD203, &mut clock), 0x43);
        assert_eq!(io.route(0xD2FF), Some(id));

        // 未接続ページ
        assert_eq!(io.read(0xD000, &mut clock), UNMAPPED_READ);
        io.write(0xD400, 1, &mut clock);
        assert_eq!(io.unmapped_accesses(), 2);
    }

    #[test]
    fn test_reattach_overrides_pages() {
        let mut io = SpecialAddressSpace::new();
        let mut clock = Clock::default();
        io.attach(GTIA_PAGE, PIA_PAGE, Box::new(Latch::default()));
        let second = io.attach(PIA_PAGE, PIA_PAGE, Box::new(Latch { value: 0x80, ..Latch::default() }));
        assert_eq!(io.route(0xD300), Some(second));
        assert_eq!(io.read(0xD300, &mut clock), 0x80);
        io.detach_pages(PIA_PAGE, PIA_PAGE);
        assert_eq!(io.route(0xD300), None);
    }

    #[test]
    fn test_end_scanline_interrupts() {
        let mut io = SpecialAddressSpace::new();
        let mut clock = Clock::default();
        io.attach(ANTIC_PAGE, ANTIC_PAGE, Box::new(Latch::default()));
        for _ in 0..3 {
            clock.begin_scanline();
        }
        assert_eq!(io.end_scanline(&clock), PendingInterrupts { nmi: true, irq: false });
    }

    #[test]
    fn test_shutdown_collects_faults() {
        let mut io = SpecialAddressSpace::new();
        io.attach(GTIA_PAGE, GTIA_PAGE, Box::new(Latch::default()));
        io.attach(POKEY_PAGE, POKEY_PAGE, Box::new(Faulty));
        let faults = io.shutdown_all();
        assert_eq!(faults, vec!["faulty: stuck".to_string()]);
    }
}
