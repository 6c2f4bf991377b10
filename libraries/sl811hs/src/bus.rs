// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Register Port: typed accessors over the chip's two-register
//! address/data MMIO window, with the autoincrement-errata workaround.
//!
//! The chip exposes exactly two addressable locations, `addr` and `data`:
//! writing the internal register offset to `addr` selects a register, and
//! the next read or write to `data` touches it. A sequential-access helper
//! lets a caller stream several bytes without re-selecting the register for
//! every one of them, which the chip's silicon supports starting at errata
//! revision 1.5 and earlier (1.2) silicon does not honor reliably (§4.1).

use core::cell::Cell;

/// Register offsets, bank A. Bank B (when enabled) is the same layout at
/// `+0x8`. Values from the SL811HS datasheet / the `sl811hs.h` this crate's
/// behavior is grounded on.
pub mod regs {
    pub const HOSTCTRL: u8 = 0x0;
    pub const HOSTBASE: u8 = 0x1;
    pub const HOSTLEN: u8 = 0x2;
    pub const HOSTSTATUS: u8 = 0x3; // read
    pub const HOSTID: u8 = 0x3; // write
    pub const HOSTTXLEFT: u8 = 0x4; // read
    pub const HOSTDEVICEADDR: u8 = 0x4; // write
    pub const CONTROL1: u8 = 0x5;
    pub const INTENABLE: u8 = 0x6;
    pub const INTSTATUS: u8 = 0xd;
    pub const HWREVISION: u8 = 0xe; // read
    pub const SOFLOW: u8 = 0xe; // write
    pub const SOFHIGH: u8 = 0xf; // read
    pub const CONTROL2: u8 = 0xf; // write

    pub const BANK_B_OFFSET: u8 = 0x8;

    // HOSTCTRL bits.
    pub const HOSTCTRL_PREAMBLE: u8 = 1 << 7;
    pub const HOSTCTRL_DATA1: u8 = 1 << 6;
    pub const HOSTCTRL_SYNCSOF: u8 = 1 << 5;
    pub const HOSTCTRL_ISO: u8 = 1 << 4;
    pub const HOSTCTRL_DIR_OUT: u8 = 1 << 2;
    pub const HOSTCTRL_ENABLE: u8 = 1 << 1;
    pub const HOSTCTRL_ARM: u8 = 1 << 0;

    // HOSTSTATUS bits (read).
    pub const HOSTSTATUS_STALL: u8 = 1 << 7;
    pub const HOSTSTATUS_NAK: u8 = 1 << 6;
    pub const HOSTSTATUS_OVERFLOW: u8 = 1 << 5;
    pub const HOSTSTATUS_SETUP: u8 = 1 << 4;
    pub const HOSTSTATUS_SEQ: u8 = 1 << 3;
    pub const HOSTSTATUS_TIMEOUT: u8 = 1 << 2;
    pub const HOSTSTATUS_ERROR: u8 = 1 << 1;
    pub const HOSTSTATUS_ACK: u8 = 1 << 0;

    // CONTROL1 bits.
    pub const CONTROL1_SUSPEND: u8 = 1 << 6;
    pub const CONTROL1_LOW_SPEED: u8 = 1 << 5;
    pub const CONTROL1_USB_RESET: u8 = 1 << 3;
    pub const CONTROL1_SOF_ENABLE: u8 = 1 << 0;

    // CONTROL2 bits (write).
    pub const CONTROL2_MASTER: u8 = 1 << 7;
    pub const CONTROL2_LOW_SPEED: u8 = 1 << 6;

    // INTENABLE / INTSTATUS bits.
    pub const INT_FULLSPEED: u8 = 1 << 7;
    pub const INT_DETECT: u8 = 1 << 6;
    pub const INT_DEV_CHANGED: u8 = 1 << 5;
    pub const INT_SOF_TIMER: u8 = 1 << 4;
    pub const INT_USB_B: u8 = 1 << 1;
    pub const INT_USB_A: u8 = 1 << 0;

    // USB PIDs.
    pub const PID_SETUP: u8 = 0xd;
    pub const PID_IN: u8 = 0x9;
    pub const PID_OUT: u8 = 0x1;
    pub const PID_SOF: u8 = 0x5;
    pub const PID_PREAMBLE: u8 = 0xc;
    pub const PID_NAK: u8 = 0xa;
    pub const PID_STALL: u8 = 0xe;
    pub const PID_DATA0: u8 = 0x3;
    pub const PID_DATA1: u8 = 0xb;
    pub const PID_ACK: u8 = 0x2;

    /// Revision byte family nibble, ignoring low-order stepping bits. Both
    /// the errata-1.2 and errata-1.5 silicon families attach successfully
    /// (§9 open question: the strict equality check in the source this is
    /// grounded on is a family probe, not a single-silicon-rev gate); which
    /// family it is then selects the cosmetic `QUERYDEVICE` revision
    /// string (2 for 1.2, 5 for 1.5 — unrelated to the family probe).
    pub const REVISION_NIBBLE_MASK: u8 = 0xf0;
    pub const REVISION_1_2_FAMILY: u8 = 0x10;
    pub const REVISION_1_5_FAMILY: u8 = 0x20;
}

/// The two raw I/O operations the chip supports: select a register, then
/// read or write its data byte.
pub trait Bus {
    /// Latch `addr` as the currently selected register.
    fn write_addr(&self, addr: u8);
    /// Write a byte to the currently selected register.
    fn write_data(&self, value: u8);
    /// Read a byte from the currently selected register.
    fn read_data(&self) -> u8;
}

/// Typed accessors over a [`Bus`], implementing the errata-4.1 autoincrement
/// workaround and the shadow-address save/restore the ISR needs.
pub struct RegisterPort<'a, B: Bus> {
    bus: &'a B,
    /// Errata revision threshold: controllers at or below this revision
    /// byte need the address register re-written before every sequential
    /// access because their internal autoincrement is unreliable.
    errata_threshold: u8,
    /// Shadow of the last address written to the chip's address register.
    /// Saved and restored across the ISR per I5.
    shadow: Cell<u8>,
}

impl<'a, B: Bus> RegisterPort<'a, B> {
    pub fn new(bus: &'a B, errata_threshold: u8) -> Self {
        RegisterPort {
            bus,
            errata_threshold,
            shadow: Cell::new(0),
        }
    }

    fn needs_reselect(&self) -> bool {
        self.errata_threshold <= regs::REVISION_1_5_FAMILY
    }

    /// Read a single register, always re-selecting the address first.
    pub fn read_byte(&self, addr: u8) -> u8 {
        self.bus.write_addr(addr);
        self.shadow.set(addr);
        self.bus.read_data()
    }

    /// Write a single register, always re-selecting the address first.
    pub fn write_byte(&self, addr: u8, value: u8) {
        self.bus.write_addr(addr);
        self.shadow.set(addr);
        self.bus.write_data(value);
    }

    /// Read the next byte of a sequential burst starting at `addr`. `first`
    /// must be true for the first byte of the burst (it always reselects);
    /// subsequent bytes reselect only on errata silicon.
    pub fn read_next(&self, addr: u8, first: bool) -> u8 {
        if first || self.needs_reselect() {
            self.bus.write_addr(addr);
            self.shadow.set(addr);
        }
        self.bus.read_data()
    }

    /// Write the next byte of a sequential burst; see [`Self::read_next`].
    pub fn write_next(&self, addr: u8, first: bool, value: u8) {
        if first || self.needs_reselect() {
            self.bus.write_addr(addr);
            self.shadow.set(addr);
        }
        self.bus.write_data(value);
    }

    /// Snapshot the shadow address. Called by the ISR on entry so a worker
    /// sequential burst it preempts can resume afterward.
    pub fn save_shadow(&self) -> u8 {
        self.shadow.get()
    }

    /// Restore a previously saved shadow address. Called by the ISR on
    /// exit, and re-selects the address on the chip to match.
    pub fn restore_shadow(&self, saved: u8) {
        self.bus.write_addr(saved);
        self.shadow.set(saved);
    }
}

#[cfg(test)]
pub(crate) mod test_bus {
    use super::Bus;
    use core::cell::Cell;

    /// A byte-array-backed stand-in for the chip's 16-register window,
    /// used by unit tests across this crate in place of real hardware.
    pub struct FakeBus {
        pub regs: Cell<[u8; 16]>,
        addr: Cell<u8>,
        pub writes: std::cell::RefCell<std::vec::Vec<(u8, u8)>>,
    }

    impl FakeBus {
        pub fn new() -> Self {
            FakeBus {
                regs: Cell::new([0; 16]),
                addr: Cell::new(0),
                writes: std::cell::RefCell::new(std::vec::Vec::new()),
            }
        }

        pub fn set_reg(&self, addr: u8, value: u8) {
            let mut r = self.regs.get();
            r[(addr & 0xf) as usize] = value;
            self.regs.set(r);
        }

        pub fn get_reg(&self, addr: u8) -> u8 {
            self.regs.get()[(addr & 0xf) as usize]
        }
    }

    impl Bus for FakeBus {
        fn write_addr(&self, addr: u8) {
            self.addr.set(addr);
        }

        fn write_data(&self, value: u8) {
            let a = self.addr.get();
            self.set_reg(a, value);
            self.writes.borrow_mut().push((a, value));
        }

        fn read_data(&self) -> u8 {
            self.get_reg(self.addr.get())
        }
    }

    #[test]
    fn sequential_write_reselects_on_errata_silicon() {
        let bus = FakeBus::new();
        let rp = super::RegisterPort::new(&bus, super::regs::REVISION_1_5_FAMILY);
        rp.write_next(super::regs::HOSTBASE, true, 0x10);
        rp.write_next(super::regs::HOSTBASE, false, 0x20);
        // Both writes landed at HOSTBASE because errata silicon reselects
        // on every access, even though only `first` was requested once.
        assert_eq!(bus.get_reg(super::regs::HOSTBASE), 0x20);
        assert_eq!(bus.writes.borrow().len(), 2);
    }

    #[test]
    fn shadow_survives_save_restore() {
        let bus = FakeBus::new();
        let rp = super::RegisterPort::new(&bus, super::regs::REVISION_1_5_FAMILY);
        rp.write_byte(super::regs::HOSTLEN, 5);
        let saved = rp.save_shadow();
        rp.read_byte(super::regs::HOSTSTATUS);
        rp.restore_shadow(saved);
        assert_eq!(rp.save_shadow(), super::regs::HOSTLEN);
    }
}
