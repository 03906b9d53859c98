// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test harness: a simulated SC16IS741A with a scriptable modem behind it.
//!
//! The simulation models what the driver can observe through SPI: the
//! IIR/LSR/RXLVL/TXLVL registers, a byte FIFO in each direction, and the
//! IRQ line (low whenever receive bytes or a TX-empty event are waiting).
//! The "modem" transmits instantly and answers from a script: when the
//! accumulated host-to-modem bytes contain a scripted pattern, the
//! scripted reply is queued into the RX FIFO.
//!
//! Tests install [`pump`] as the driver's yield hook, which mirrors a real
//! board's IRQ wiring: any time the foreground yields while the line is
//! low, the interrupt handler runs.

use std::cell::RefCell;
use std::collections::VecDeque;

use drv_ltem_api::{Level, Pin, Platform};

pub struct Exchange {
    expect: Vec<u8>,
    reply: Vec<u8>,
}

#[derive(Default)]
pub struct SimState {
    pub now: u32,
    /// Modem-to-host bytes waiting in the bridge RX FIFO.
    pub rx_fifo: VecDeque<u8>,
    /// Host-to-modem bytes, as the modem would see them.
    pub wire: Vec<u8>,
    /// A TX FIFO drain completed; the THR-empty interrupt is latched.
    pub thr_pending: bool,
    pub script: VecDeque<Exchange>,
}

impl SimState {
    fn check_script(&mut self) {
        while let Some(front) = self.script.front() {
            if crate::ascii::find(&self.wire, &front.expect).is_none() {
                break;
            }
            let ex = self.script.pop_front().unwrap();
            self.wire.clear();
            self.rx_fifo.extend(ex.reply.iter().copied());
        }
    }

    fn irq_asserted(&self) -> bool {
        !self.rx_fifo.is_empty() || self.thr_pending
    }
}

/// Cheap platform handle over shared simulator state.
#[derive(Copy, Clone)]
pub struct Sim<'a>(pub &'a RefCell<SimState>);

impl<'a> Sim<'a> {
    /// Queues unsolicited modem-to-host bytes (URCs, stream data).
    pub fn inject(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx_fifo.extend(bytes.iter().copied());
    }

    /// Scripts a reply: once `expect` shows up in the host's transmitted
    /// bytes, `reply` is queued for receive. Entries match in order.
    pub fn expect(&self, expect: &[u8], reply: &[u8]) {
        self.0.borrow_mut().script.push_back(Exchange {
            expect: expect.to_vec(),
            reply: reply.to_vec(),
        });
    }

    pub fn wire(&self) -> Vec<u8> {
        self.0.borrow().wire.clone()
    }

    pub fn clear_wire(&self) {
        self.0.borrow_mut().wire.clear();
    }

    pub fn has_traffic(&self) -> bool {
        self.0.borrow().irq_asserted()
    }

    pub fn now(&self) -> u32 {
        self.0.borrow().now
    }
}

impl<'a> Platform for Sim<'a> {
    fn spi_transfer_word(&self, word: u16) -> u16 {
        let mut s = self.0.borrow_mut();
        let hi = (word >> 8) as u8;
        let addr = (hi >> 3) & 0x0f;
        if hi & 0x80 == 0 {
            // Register writes configure the real chip; the simulation has
            // nothing to remember.
            return 0;
        }
        match addr {
            // IIR: RX outranks TX; reading the THR-empty source clears it.
            0x02 => {
                if !s.rx_fifo.is_empty() {
                    0x04
                } else if s.thr_pending {
                    s.thr_pending = false;
                    0x02
                } else {
                    0x01
                }
            }
            // LSR: data-in-receiver plus an always-idle transmitter.
            0x05 => {
                if s.rx_fifo.is_empty() {
                    0x60
                } else {
                    0x61
                }
            }
            // TXLVL: the modem drains instantly, so always a full FIFO of
            // space.
            0x08 => 64,
            0x09 => s.rx_fifo.len().min(64) as u16,
            // Single-byte FIFO read (the flush path).
            0x00 => u16::from(s.rx_fifo.pop_front().unwrap_or(0)),
            _ => 0,
        }
    }

    fn spi_transfer_buffer(&self, addr_byte: u8, data: &mut [u8]) {
        let mut s = self.0.borrow_mut();
        if (addr_byte >> 3) & 0x0f != 0x00 {
            return;
        }
        if addr_byte & 0x80 != 0 {
            for slot in data.iter_mut() {
                *slot = s.rx_fifo.pop_front().unwrap_or(0);
            }
        } else {
            s.wire.extend_from_slice(data);
            s.thr_pending = true;
            s.check_script();
        }
    }

    fn gpio_read(&self, _pin: Pin) -> Level {
        if self.0.borrow().irq_asserted() {
            Level::Low
        } else {
            Level::High
        }
    }

    fn gpio_write(&self, _pin: Pin, _level: Level) {}

    /// The simulated clock ticks on every read, so polled timeouts make
    /// progress without a real timer.
    fn now_ms(&self) -> u32 {
        let mut s = self.0.borrow_mut();
        s.now += 1;
        s.now
    }

    fn delay_ms(&self, ms: u32) {
        self.0.borrow_mut().now += ms;
    }

    fn yield_now(&self) {}

    fn with_irq_masked<R>(&self, body: impl FnOnce() -> R) -> R {
        body()
    }
}

/// Yield hook standing in for the board's IRQ wiring: while the simulated
/// line is asserted, run the interrupt handler.
pub fn pump<'a>(lt: &mut crate::Ltem<Sim<'a>>) {
    if lt.platform.has_traffic() {
        lt.interrupt();
    }
}
