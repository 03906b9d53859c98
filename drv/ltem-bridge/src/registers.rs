// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SC16IS741A register definitions.
//!
//! The chip multiplexes three register sets onto a 4-bit address space,
//! selected through magic values written to LCR (the "general", "special",
//! and "enhanced" sets in the datasheet). [`Register::addr`] gives the
//! 4-bit address; which set a register lives in is noted per variant, and
//! the driver sequences the LCR writes.

use bitflags::bitflags;
use num_derive::FromPrimitive;

/// Register selector. Several registers share an address across register
/// sets (e.g. FCR/IIR/EFR are all at 0x02), which is why this is a plain
/// enum with an `addr` method instead of a `#[repr(u8)]` discriminant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Register {
    /// RX/TX FIFO window (general set).
    Fifo,
    /// Interrupt enable (general set).
    Ier,
    /// FIFO control, write-only (general set).
    Fcr,
    /// Interrupt identification, read-only (general set).
    Iir,
    /// Line control (always accessible).
    Lcr,
    /// Modem control (general set).
    Mcr,
    /// Line status, read-only (general set).
    Lsr,
    /// Transmission control (general set, MCR[2]=1).
    Tcr,
    /// Trigger level (general set, MCR[2]=1).
    Tlr,
    /// Free space in the TX FIFO, read-only (general set).
    TxLvl,
    /// Bytes waiting in the RX FIFO, read-only (general set).
    RxLvl,
    /// Software reset (general set).
    UartReset,
    /// Extra features (general set).
    Efcr,
    /// Divisor latch LSB (special set).
    Dll,
    /// Divisor latch MSB (special set).
    Dlh,
    /// Enhanced features (enhanced set).
    Efr,
}

impl Register {
    pub fn addr(self) -> u8 {
        match self {
            Register::Fifo => 0x00,
            Register::Ier => 0x01,
            Register::Fcr => 0x02,
            Register::Iir => 0x02,
            Register::Lcr => 0x03,
            Register::Mcr => 0x04,
            Register::Lsr => 0x05,
            Register::Tcr => 0x06,
            Register::Tlr => 0x07,
            Register::TxLvl => 0x08,
            Register::RxLvl => 0x09,
            Register::UartReset => 0x0e,
            Register::Efcr => 0x0f,
            Register::Dll => 0x00,
            Register::Dlh => 0x01,
            Register::Efr => 0x02,
        }
    }
}

/// LCR values selecting the alternate register sets.
pub const LCR_REG_SET_GENERAL: u8 = 0x00;
pub const LCR_REG_SET_SPECIAL: u8 = 0x80;
pub const LCR_REG_SET_ENHANCED: u8 = 0xbf;

/// 8 data bits, no parity, 1 stop bit -- the framing the BGx requires.
pub const LCR_FRAMING_8N1: u8 = 0x03;

/// Baud divisor for 115200 from the LTEm board's 7.378 MHz crystal
/// (divisor 4: 7_378_000 / 16 / 4 = 115_281).
pub const BAUD_DIVISOR_DLL: u8 = 0x04;
pub const BAUD_DIVISOR_DLH: u8 = 0x00;

/// Both FIFOs are 64 bytes deep.
pub const FIFO_SIZE: u8 = 64;

bitflags! {
    /// Interrupt enable register.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Ier: u8 {
        const RHR_DATA_AVAIL = 1 << 0;
        const THR_EMPTY = 1 << 1;
        const RX_LINE_STATUS = 1 << 2;
        const MODEM_STATUS = 1 << 3;
        const SLEEP_MODE = 1 << 4;
        const XOFF = 1 << 5;
        const RTS = 1 << 6;
        const CTS = 1 << 7;
    }
}

bitflags! {
    /// FIFO control register (write-only).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Fcr: u8 {
        const FIFO_ENABLE = 1 << 0;
        const RX_FIFO_RESET = 1 << 1;
        const TX_FIFO_RESET = 1 << 2;
        /// TX trigger at 56 spaces (0b11 in FCR[5:4]).
        const TX_TRIGGER_56 = 0b11 << 4;
        /// RX trigger at 56 characters (0b11 in FCR[7:6]).
        const RX_TRIGGER_56 = 0b11 << 6;
    }
}

bitflags! {
    /// Line status register (read-only).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Lsr: u8 {
        const DATA_IN_RECEIVER = 1 << 0;
        const OVERRUN = 1 << 1;
        const PARITY_ERROR = 1 << 2;
        const FRAMING_ERROR = 1 << 3;
        const BREAK = 1 << 4;
        const THR_EMPTY = 1 << 5;
        const THR_AND_TSR_EMPTY = 1 << 6;
        const FIFO_DATA_ERROR = 1 << 7;
    }
}

bitflags! {
    /// Modem control register.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Mcr: u8 {
        const DTR = 1 << 0;
        const RTS = 1 << 1;
        const TCR_TLR_ENABLE = 1 << 2;
        const LOOPBACK = 1 << 4;
        const XON_ANY = 1 << 5;
        const IRDA = 1 << 6;
        const CLOCK_DIV_4 = 1 << 7;
    }
}

bitflags! {
    /// Enhanced features register (enhanced set).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Efr: u8 {
        const ENHANCED_FUNCTIONS = 1 << 4;
        const SPECIAL_CHAR_DETECT = 1 << 5;
        const AUTO_RTS = 1 << 6;
        const AUTO_CTS = 1 << 7;
    }
}

/// TLR trigger levels, in units of 4 characters per the datasheet:
/// 15 * 4 = 60 for both directions.
pub const TLR_TRIGGER_15_15: u8 = 0xff;

/// Interrupt source as encoded in IIR[3:1]. Priorities follow the
/// datasheet: line status outranks receive, receive outranks transmit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum IirSource {
    ThrEmpty = 1,
    RhrData = 2,
    LineStatus = 3,
    RxTimeout = 6,
}

/// Decoded interrupt identification register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IirStatus(pub u8);

impl IirStatus {
    /// IIR[0] is *low* while an interrupt is pending.
    pub fn interrupt_pending(self) -> bool {
        self.0 & 0x01 == 0
    }

    pub fn source(self) -> Option<IirSource> {
        use num_traits::FromPrimitive;
        IirSource::from_u8((self.0 >> 1) & 0x07)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_addresses() {
        // FCR (write), IIR (read), and EFR (enhanced set) share 0x02.
        assert_eq!(Register::Fcr.addr(), 0x02);
        assert_eq!(Register::Iir.addr(), 0x02);
        assert_eq!(Register::Efr.addr(), 0x02);
        // Divisor latches shadow the FIFO/IER addresses in the special set.
        assert_eq!(Register::Dll.addr(), Register::Fifo.addr());
        assert_eq!(Register::Dlh.addr(), Register::Ier.addr());
    }

    #[test]
    fn iir_decoding() {
        // 0x01: no interrupt pending.
        assert!(!IirStatus(0x01).interrupt_pending());
        // 0x04: RHR data available.
        let s = IirStatus(0x04);
        assert!(s.interrupt_pending());
        assert_eq!(s.source(), Some(IirSource::RhrData));
        // 0x0c: RX timeout (0b0110 in [3:1]).
        assert_eq!(IirStatus(0x0c).source(), Some(IirSource::RxTimeout));
        // 0x06: line status error.
        assert_eq!(IirStatus(0x06).source(), Some(IirSource::LineStatus));
        // 0x02: THR empty.
        assert_eq!(IirStatus(0x02).source(), Some(IirSource::ThrEmpty));
    }

    #[test]
    fn fcr_init_value_matches_wire_program() {
        let fcr = Fcr::FIFO_ENABLE | Fcr::RX_TRIGGER_56 | Fcr::TX_TRIGGER_56;
        assert_eq!(fcr.bits(), 0xf1);
    }
}
