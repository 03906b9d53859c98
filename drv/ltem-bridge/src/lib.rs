// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the NXP SC16IS741A SPI-to-UART bridge between the host and
//! the BGx modem.
//!
//! Every register access is one 16-bit SPI exchange: the high byte carries
//! the register address and read/write flag, the low byte the data. FIFO
//! transfers burst an address byte plus up to 64 data bytes through a
//! single chip-select window.
//!
//! All SPI traffic runs inside [`Platform::with_irq_masked`], so a
//! foreground register access can never be torn by the bridge ISR starting
//! its own exchange mid-transfer.

#![cfg_attr(not(test), no_std)]

use drv_ltem_api::Platform;
use ringbuf::{ringbuf, ringbuf_entry};

mod registers;
pub use registers::{
    Efr, Fcr, Ier, IirSource, IirStatus, Lsr, Mcr, Register, BAUD_DIVISOR_DLH,
    BAUD_DIVISOR_DLL, FIFO_SIZE, LCR_FRAMING_8N1, LCR_REG_SET_ENHANCED,
    LCR_REG_SET_GENERAL, LCR_REG_SET_SPECIAL, TLR_TRIGGER_15_15,
};

////////////////////////////////////////////////////////////////////////////////

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    RegWrite(u8, u8),
    FifoRead(u8),
    FifoWrite(u8),
    RxFlushed(u8),
}
ringbuf!(Trace, 16, Trace::None);

////////////////////////////////////////////////////////////////////////////////

const RNW_READ: u8 = 0x80;

/// Handle to the bridge. Cheap to copy; all state lives in the chip.
#[derive(Copy, Clone)]
pub struct Sc16is741a<P: Platform> {
    platform: P,
}

impl<P: Platform> Sc16is741a<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    /// Builds the SPI address byte: `A[3:0]` in bits 6..3, read flag in
    /// bit 7, channel bits zero (single-channel part).
    fn addr_byte(r: Register, read: bool) -> u8 {
        (r.addr() << 3) | if read { RNW_READ } else { 0 }
    }

    pub fn read_reg(&self, r: Register) -> u8 {
        let word = u16::from(Self::addr_byte(r, true)) << 8;
        let reply = self
            .platform
            .with_irq_masked(|| self.platform.spi_transfer_word(word));
        reply as u8
    }

    pub fn write_reg(&self, r: Register, v: u8) {
        ringbuf_entry!(Trace::RegWrite(r.addr(), v));
        let word = u16::from(Self::addr_byte(r, false)) << 8 | u16::from(v);
        self.platform
            .with_irq_masked(|| self.platform.spi_transfer_word(word));
    }

    fn modify<F: FnOnce(&mut u8)>(&self, r: Register, f: F) {
        let mut v = self.read_reg(r);
        f(&mut v);
        self.write_reg(r, v);
    }

    /// Drains `dst.len()` bytes (at most one FIFO's worth) out of the RX
    /// FIFO in a single burst.
    pub fn fifo_read(&self, dst: &mut [u8]) {
        ringbuf_entry!(Trace::FifoRead(dst.len() as u8));
        let addr = Self::addr_byte(Register::Fifo, true);
        self.platform
            .with_irq_masked(|| self.platform.spi_transfer_buffer(addr, dst));
    }

    /// Bursts `src` (at most one FIFO's worth) into the TX FIFO.
    pub fn fifo_write(&self, src: &[u8]) {
        ringbuf_entry!(Trace::FifoWrite(src.len() as u8));
        let mut chunk = [0u8; FIFO_SIZE as usize];
        let n = src.len().min(chunk.len());
        chunk[..n].copy_from_slice(&src[..n]);
        let addr = Self::addr_byte(Register::Fifo, false);
        self.platform.with_irq_masked(|| {
            self.platform.spi_transfer_buffer(addr, &mut chunk[..n])
        });
    }

    /// Number of bytes waiting in the RX FIFO.
    pub fn rx_level(&self) -> u8 {
        self.read_reg(Register::RxLvl)
    }

    /// Free space in the TX FIFO.
    pub fn tx_available(&self) -> u8 {
        self.read_reg(Register::TxLvl)
    }

    pub fn read_iir(&self) -> IirStatus {
        IirStatus(self.read_reg(Register::Iir))
    }

    pub fn read_lsr(&self) -> Lsr {
        Lsr::from_bits_retain(self.read_reg(Register::Lsr))
    }

    /// Brings the UART up from scratch: FIFOs, interrupt sources, baud
    /// clock, framing.
    pub fn initialize(&self) {
        self.enable_fifo();
        self.enable_irq_mode();
        self.start_uart();
    }

    fn enable_fifo(&self) {
        let fcr = Fcr::FIFO_ENABLE | Fcr::RX_TRIGGER_56 | Fcr::TX_TRIGGER_56;
        self.write_reg(Register::Fcr, fcr.bits());
    }

    /// Arms the interrupt sources the IOP services: RX data available and
    /// THR empty. Also enables the enhanced function set and the TLR
    /// trigger levels, which both gate interrupt generation on this part.
    pub fn enable_irq_mode(&self) {
        let ier = Ier::RHR_DATA_AVAIL | Ier::THR_EMPTY;
        self.write_reg(Register::Ier, ier.bits());

        self.write_reg(Register::Lcr, LCR_REG_SET_ENHANCED);
        self.modify(Register::Efr, |v| {
            *v |= Efr::ENHANCED_FUNCTIONS.bits();
        });
        self.write_reg(Register::Lcr, LCR_REG_SET_GENERAL);

        self.modify(Register::Mcr, |v| {
            *v |= Mcr::TCR_TLR_ENABLE.bits();
        });
        self.write_reg(Register::Tlr, TLR_TRIGGER_15_15);
    }

    /// Programs the divisor latch and framing, then clears any power-on
    /// junk out of the RX FIFO. The UART is running when this returns.
    pub fn start_uart(&self) {
        self.write_reg(Register::Lcr, LCR_REG_SET_SPECIAL);
        self.write_reg(Register::Dll, BAUD_DIVISOR_DLL);
        self.write_reg(Register::Dlh, BAUD_DIVISOR_DLH);
        self.write_reg(Register::Lcr, LCR_REG_SET_GENERAL);

        self.write_reg(Register::Lcr, LCR_FRAMING_8N1);

        self.flush_rx_fifo();
    }

    /// Requests a software reset of the UART core.
    pub fn sw_reset(&self) {
        self.write_reg(Register::UartReset, 0x08);
    }

    /// Reads and discards the RX FIFO contents, e.g. after a line error.
    pub fn flush_rx_fifo(&self) {
        let mut flushed = 0u8;
        for _ in 0..u32::from(FIFO_SIZE) {
            let lsr = self.read_lsr();
            if !lsr.contains(Lsr::DATA_IN_RECEIVER) {
                break;
            }
            let _ = self.read_reg(Register::Fifo);
            flushed += 1;
        }
        ringbuf_entry!(Trace::RxFlushed(flushed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_ltem_api::{Level, Pin};
    use std::cell::RefCell;

    /// Register-transaction recorder: logs every SPI word and answers reads
    /// from a tiny register file.
    #[derive(Default)]
    struct BusState {
        words: Vec<u16>,
        bursts: Vec<(u8, usize)>,
        rx_level: u8,
        lsr: u8,
    }

    #[derive(Copy, Clone)]
    struct Bus<'a>(&'a RefCell<BusState>);

    impl<'a> Platform for Bus<'a> {
        fn spi_transfer_word(&self, word: u16) -> u16 {
            let mut s = self.0.borrow_mut();
            s.words.push(word);
            let addr = (word >> 8) as u8;
            if addr & RNW_READ != 0 {
                match (addr >> 3) & 0x0f {
                    0x09 => u16::from(s.rx_level),
                    0x05 => u16::from(s.lsr),
                    _ => 0,
                }
            } else {
                0
            }
        }

        fn spi_transfer_buffer(&self, addr_byte: u8, data: &mut [u8]) {
            self.0.borrow_mut().bursts.push((addr_byte, data.len()));
            data.fill(0);
        }

        fn gpio_read(&self, _pin: Pin) -> Level {
            Level::High
        }
        fn gpio_write(&self, _pin: Pin, _level: Level) {}
        fn now_ms(&self) -> u32 {
            0
        }
        fn delay_ms(&self, _ms: u32) {}
        fn yield_now(&self) {}
        fn with_irq_masked<R>(&self, body: impl FnOnce() -> R) -> R {
            body()
        }
    }

    fn wr(addr: u8, val: u8) -> u16 {
        u16::from(addr << 3) << 8 | u16::from(val)
    }

    #[test]
    fn register_write_word_layout() {
        let state = RefCell::new(BusState::default());
        let bridge = Sc16is741a::new(Bus(&state));

        bridge.write_reg(Register::Ier, 0x03);
        assert_eq!(state.borrow().words, vec![wr(0x01, 0x03)]);
    }

    #[test]
    fn register_read_sets_rnw() {
        let state = RefCell::new(BusState::default());
        state.borrow_mut().rx_level = 17;
        let bridge = Sc16is741a::new(Bus(&state));

        assert_eq!(bridge.rx_level(), 17);
        let word = state.borrow().words[0];
        assert_eq!(word >> 8, u16::from(0x80u8 | (0x09 << 3)));
    }

    #[test]
    fn init_register_program() {
        let state = RefCell::new(BusState::default());
        let bridge = Sc16is741a::new(Bus(&state));

        bridge.initialize();

        let writes: Vec<(u8, u8)> = state
            .borrow()
            .words
            .iter()
            .filter(|w| (*w >> 8) as u8 & RNW_READ == 0)
            .map(|w| (((w >> 8) as u8 >> 3) & 0x0f, *w as u8))
            .collect();

        // FIFO enable with 56-char triggers comes first.
        assert_eq!(writes[0], (0x02, 0xf1));
        // IER arms RX data + THR empty.
        assert_eq!(writes[1], (0x01, 0x03));
        // Enhanced-set excursion to set EFR[4].
        assert_eq!(writes[2], (0x03, LCR_REG_SET_ENHANCED));
        assert_eq!(writes[3], (0x02, Efr::ENHANCED_FUNCTIONS.bits()));
        assert_eq!(writes[4], (0x03, LCR_REG_SET_GENERAL));
        // MCR TLR enable, then trigger levels.
        assert_eq!(writes[5], (0x04, Mcr::TCR_TLR_ENABLE.bits()));
        assert_eq!(writes[6], (0x07, TLR_TRIGGER_15_15));
        // Divisor latch behind the special set: 115200 from 7.378 MHz.
        assert_eq!(writes[7], (0x03, LCR_REG_SET_SPECIAL));
        assert_eq!(writes[8], (0x00, 0x04));
        assert_eq!(writes[9], (0x01, 0x00));
        assert_eq!(writes[10], (0x03, LCR_REG_SET_GENERAL));
        // 8N1 framing last.
        assert_eq!(writes[11], (0x03, LCR_FRAMING_8N1));
    }

    #[test]
    fn flush_stops_when_receiver_empty() {
        let state = RefCell::new(BusState::default());
        // LSR shows no data waiting.
        state.borrow_mut().lsr = 0x60;
        let bridge = Sc16is741a::new(Bus(&state));

        bridge.flush_rx_fifo();
        // One LSR read, no FIFO reads.
        assert_eq!(state.borrow().words.len(), 1);
    }

    #[test]
    fn fifo_burst_uses_fifo_address() {
        let state = RefCell::new(BusState::default());
        let bridge = Sc16is741a::new(Bus(&state));

        let mut buf = [0u8; 8];
        bridge.fifo_read(&mut buf);
        bridge.fifo_write(b"AT\r");

        let bursts = &state.borrow().bursts;
        assert_eq!(bursts[0], (0x80, 8));
        assert_eq!(bursts[1], (0x00, 3));
    }
}
