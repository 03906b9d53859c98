// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The I/O processor: interrupt-driven multiplexing of the single UART
//! into command, URC, and stream traffic.
//!
//! The ISR ([`Ltem::interrupt`]) drains the bridge FIFOs and runs a
//! deliberately shallow *immediate classifier* over each received chunk:
//! just enough prefix matching to recognize stream headers and switch the
//! receive mode, because bulk payload bytes arrive faster than the
//! foreground can get scheduled. Everything heavier -- the full URC
//! catalogue, command-response assembly -- happens in the foreground
//! deferred parser ([`Ltem::recv_do_work`]).

use drv_ltem_api::{Level, MqttStatus, Notification, Platform, Protocol};
use drv_ltem_bridge::{IirSource, FIFO_SIZE};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::ascii;
use crate::rxpool::{Peer, PRIMARY_BUF_COUNT, PRIMARY_BUF_SIZE};
use crate::Ltem;
use crate::ReadyState;

/// How long the BGx gets to report `APP RDY` after start-up.
pub(crate) const APP_READY_TIMEOUT_MS: u32 = 5000;

/// `\r\n\r\nOK\r\n` after the declared payload of an IRD response.
pub(crate) const IRD_TRAILER: u16 = 8;

/// Terminator phrase for `+QMTRECV` payloads: the closing quote and CRLF.
const MQTT_EOT: &[u8] = b"\"\r\n";

/// Command/URC response assembly buffer.
pub(crate) const CMD_BUF_SIZE: usize = 512;

/// Bound on latch-nudge attempts when the IRQ line stays low with nothing
/// pending, so a wedged bridge cannot hang the ISR.
const IRQ_NUDGE_LIMIT: u8 = 3;

////////////////////////////////////////////////////////////////////////////////

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    RxChunk(u8),
    RxDropped(u8),
    TxChunk(u8),
    LineError(u8),
    SpuriousIrq,
    UnknownIrqSource(u8),
    StreamStart(u16),
    StreamDone,
    EmptyIrd,
    Deferred(u8),
}
ringbuf!(Trace, 32, Trace::None);

////////////////////////////////////////////////////////////////////////////////

/// Receive-stream mode. `Idle` opens a fresh primary buffer per chunk;
/// the other two route chunks into the bound data buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RxMode {
    Idle,
    /// Bulk read of a known byte count (`+QIRD`/`+QSSLRECV`).
    IrdBytes,
    /// Bulk read until a terminator phrase (`+QMTRECV`).
    EotPhrase,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Faults {
    pub rx_pool_exhausted: bool,
    pub data_buf_exhausted: bool,
}

/// ISR-side receive-stream state.
pub(crate) struct RxState {
    pub mode: RxMode,
    /// In `IrdBytes` mode, payload+trailer bytes still expected.
    pub remaining: u16,
    /// Data buffer bound to the active stream, if any.
    pub data_buf: Option<u8>,
    /// The peer the next stream response belongs to, set at IRD issue time
    /// (or `Peer::Mqtt` implicitly by the classifier).
    pub stream_peer: Peer,
    /// Set by the classifier when the modem reports a drained pipeline;
    /// consumed by the socket do-work pass.
    pub empty_ird: Option<u8>,
    /// PDP context the carrier deactivated, awaiting notification.
    pub pdp_deactivated: Option<u8>,
    pub faults: Faults,
}

impl RxState {
    pub const fn new() -> Self {
        Self {
            mode: RxMode::Idle,
            remaining: 0,
            data_buf: None,
            stream_peer: Peer::None,
            empty_ird: None,
            pdp_deactivated: None,
            faults: Faults {
                rx_pool_exhausted: false,
                data_buf_exhausted: false,
            },
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Linear assembly buffer for command responses and deferred URC text.
/// The ISR never touches this; the deferred parser appends and the action
/// machinery consumes from `tail`.
pub(crate) struct CmdBuffer {
    data: [u8; CMD_BUF_SIZE],
    head: usize,
    tail: usize,
}

impl CmdBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; CMD_BUF_SIZE],
            head: 0,
            tail: 0,
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Appends a chunk, returning false (and dropping the excess) on
    /// overflow.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let room = CMD_BUF_SIZE - self.head;
        let n = bytes.len().min(room);
        self.data[self.head..self.head + n].copy_from_slice(&bytes[..n]);
        self.head += n;
        n == bytes.len()
    }

    /// Unparsed response bytes.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.tail..self.head]
    }

    /// Everything consumed so far -- the response text of the current
    /// command.
    pub fn response(&self) -> &[u8] {
        &self.data[..self.tail]
    }

    /// Marks `n` pending bytes as consumed by a parser.
    pub fn consume(&mut self, n: usize) {
        self.tail = (self.tail + n).min(self.head);
    }

    /// Discards everything past the consumed region.
    pub fn drop_pending(&mut self) {
        self.head = self.tail;
    }
}

/// Which stream peers are live, so classification never string-searches
/// for protocols that cannot be active.
pub(crate) struct PeerMap {
    /// Bit per socket id bound as TCP or UDP.
    pub tcpudp: u8,
    /// Bit per socket id bound as SSL.
    pub ssl: u8,
    pub mqtt: MqttStatus,
    /// Bit per armed MQTT subscription slot.
    pub subscriptions: u8,
}

impl PeerMap {
    pub const fn new() -> Self {
        Self {
            tcpudp: 0,
            ssl: 0,
            mqtt: MqttStatus::Closed,
            subscriptions: 0,
        }
    }

    pub fn bind_socket(&mut self, id: u8, protocol: Protocol) {
        let bit = 1u8 << id;
        match protocol {
            Protocol::Ssl => self.ssl |= bit,
            Protocol::Tcp | Protocol::Udp => self.tcpudp |= bit,
        }
    }

    pub fn release_socket(&mut self, id: u8) {
        let bit = 1u8 << id;
        self.tcpudp &= !bit;
        self.ssl &= !bit;
    }

    pub fn socket_is_ssl(&self, id: u8) -> bool {
        self.ssl & (1 << id) != 0
    }

    pub fn any_sockets(&self) -> bool {
        self.tcpudp != 0 || self.ssl != 0
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

////////////////////////////////////////////////////////////////////////////////

impl<P: Platform> Ltem<P> {
    /// Bridge IRQ service entry point. The application's interrupt
    /// trampoline calls this on the falling edge of the bridge IRQ line.
    ///
    /// One pass services the highest-priority pending source, then the IIR
    /// is re-read; the handler returns only once the IIR reports nothing
    /// pending *and* the IRQ line has actually gone high again -- the
    /// bridge otherwise latches spurious interrupts.
    pub fn interrupt(&mut self) {
        let bridge = self.bridge;
        let mut nudges = 0;
        loop {
            let iir = bridge.read_iir();
            if iir.interrupt_pending() {
                match iir.source() {
                    Some(IirSource::LineStatus) => {
                        let lsr = bridge.read_lsr();
                        ringbuf_entry!(Trace::LineError(lsr.bits()));
                        bridge.flush_rx_fifo();
                        continue;
                    }
                    Some(IirSource::RhrData) | Some(IirSource::RxTimeout) => {
                        self.isr_service_rx();
                        continue;
                    }
                    Some(IirSource::ThrEmpty) => {
                        self.isr_service_tx();
                        continue;
                    }
                    None => {
                        ringbuf_entry!(Trace::UnknownIrqSource(iir.0));
                    }
                }
            }

            // Nothing pending. Make sure the line actually released before
            // trusting that; reading the level registers nudges the latch.
            if self.platform.gpio_read(self.config.pins.irq) == Level::Low
                && nudges < IRQ_NUDGE_LIMIT
            {
                ringbuf_entry!(Trace::SpuriousIrq);
                let _ = bridge.tx_available();
                let _ = bridge.rx_level();
                nudges += 1;
                continue;
            }
            break;
        }
    }

    /// RX data ready / RX timeout service: drain RXLVL bytes into a fresh
    /// primary buffer (idle) or the bound data buffer (stream modes).
    fn isr_service_rx(&mut self) {
        let bridge = self.bridge;
        let level = usize::from(bridge.rx_level()).min(PRIMARY_BUF_SIZE);
        if level == 0 {
            return;
        }

        match self.rx.mode {
            RxMode::Idle => {
                let Some(ix) = self.pool.alloc_primary() else {
                    // No buffer: drain the FIFO so the interrupt clears,
                    // and let the foreground report the loss.
                    let mut scratch = [0u8; PRIMARY_BUF_SIZE];
                    bridge.fifo_read(&mut scratch[..level]);
                    self.rx.faults.rx_pool_exhausted = true;
                    ringbuf_entry!(Trace::RxDropped(level as u8));
                    return;
                };
                {
                    let buf = &mut self.pool.primary[usize::from(ix)];
                    bridge.fifo_read(&mut buf.data[..level]);
                    buf.len = level as u8;
                }
                ringbuf_entry!(Trace::RxChunk(level as u8));
                self.classify_immediate(ix);
            }
            RxMode::IrdBytes | RxMode::EotPhrase => {
                let Some(dx) = self.rx.data_buf else {
                    self.rx.mode = RxMode::Idle;
                    return;
                };
                let buf = &mut self.pool.data[usize::from(dx)];
                let n = level.min(buf.space());
                if n == 0 {
                    let mut scratch = [0u8; PRIMARY_BUF_SIZE];
                    bridge.fifo_read(&mut scratch[..level]);
                    self.rx.faults.data_buf_exhausted = true;
                    ringbuf_entry!(Trace::RxDropped(level as u8));
                    return;
                }
                let head = usize::from(buf.head);
                bridge.fifo_read(&mut buf.data[head..head + n]);
                buf.head += n as u16;
                ringbuf_entry!(Trace::RxChunk(n as u8));

                match self.rx.mode {
                    RxMode::IrdBytes => {
                        self.rx.remaining =
                            self.rx.remaining.saturating_sub(n as u16);
                        if self.rx.remaining == 0 {
                            buf.data_ready = true;
                            self.rx.mode = RxMode::Idle;
                            self.rx.data_buf = None;
                            ringbuf_entry!(Trace::StreamDone);
                        }
                    }
                    RxMode::EotPhrase => {
                        if buf.contents().ends_with(MQTT_EOT) {
                            buf.data_ready = true;
                            self.rx.mode = RxMode::Idle;
                            self.rx.data_buf = None;
                            ringbuf_entry!(Trace::StreamDone);
                        }
                    }
                    RxMode::Idle => unreachable!(),
                }
            }
        }
    }

    /// TX THR-empty service: refill the FIFO from the ring.
    fn isr_service_tx(&mut self) {
        let bridge = self.bridge;
        let avail = usize::from(bridge.tx_available()).min(PRIMARY_BUF_SIZE);
        if avail == 0 {
            return;
        }
        let mut chunk = [0u8; PRIMARY_BUF_SIZE];
        let n = self.tx.pop_into(&mut chunk[..avail]);
        if n > 0 {
            ringbuf_entry!(Trace::TxChunk(n as u8));
            bridge.fifo_write(&chunk[..n]);
        }
    }

    /// ISR-resident classifier: recognizes only the stream headers that
    /// must switch receive mode before the next chunk lands. Everything
    /// else stays `Pending` for the deferred parser.
    fn classify_immediate(&mut self, ix: u8) {
        let mut chunk = [0u8; PRIMARY_BUF_SIZE];
        let len = {
            let src = self.pool.primary[usize::from(ix)].contents();
            chunk[..src.len()].copy_from_slice(src);
            src.len()
        };
        let body = &chunk[..len];
        let off = if body.starts_with(ascii::CRLF) { 2 } else { 0 };
        let after = &body[off..];

        let ird_hdr = if after.starts_with(b"+QIRD: ") {
            Some(7)
        } else if after.starts_with(b"+QSSLRECV: ") {
            Some(11)
        } else {
            None
        };

        if let Some(hdr_len) = ird_hdr {
            let Some((count, digits_end)) =
                ascii::parse_decimal(body, off + hdr_len)
            else {
                return; // malformed; deferred parser gets it
            };
            let count = count.max(0) as u16;

            if count == 0 {
                // Empty IRD: the modem's buffer for this socket is
                // drained. The foreground pipeline tears the stream down.
                ringbuf_entry!(Trace::EmptyIrd);
                if let Peer::Socket(s) = self.rx.stream_peer {
                    self.rx.empty_ird = Some(s);
                }
                self.rx.mode = RxMode::Idle;
                self.pool.release_primary(ix);
                return;
            }

            ringbuf_entry!(Trace::StreamStart(count));
            let Some(dx) = self.pool.alloc_data(self.rx.stream_peer) else {
                self.rx.faults.data_buf_exhausted = true;
                self.pool.release_primary(ix);
                return;
            };
            let dbuf = &mut self.pool.data[usize::from(dx)];
            dbuf.data[..len].copy_from_slice(body);
            dbuf.head = len as u16;
            dbuf.tail = (digits_end + 2).min(len) as u16;
            dbuf.ird_declared = count;

            if dbuf.ird_satisfied(IRD_TRAILER) {
                dbuf.data_ready = true;
                self.rx.mode = RxMode::Idle;
                self.rx.data_buf = None;
                ringbuf_entry!(Trace::StreamDone);
            } else {
                self.rx.remaining = (count + IRD_TRAILER)
                    .saturating_sub(dbuf.head - dbuf.tail);
                self.rx.mode = RxMode::IrdBytes;
                self.rx.data_buf = Some(dx);
            }
            self.pool.release_primary(ix);
            return;
        }

        if after.starts_with(b"+QMTRECV: ") {
            let Some(dx) = self.pool.alloc_data(Peer::Mqtt) else {
                self.rx.faults.data_buf_exhausted = true;
                self.pool.release_primary(ix);
                return;
            };
            let dbuf = &mut self.pool.data[usize::from(dx)];
            dbuf.data[..len].copy_from_slice(body);
            dbuf.head = len as u16;
            dbuf.tail = 0;

            if body.ends_with(MQTT_EOT) {
                dbuf.data_ready = true;
                ringbuf_entry!(Trace::StreamDone);
            } else {
                self.rx.mode = RxMode::EotPhrase;
                self.rx.data_buf = Some(dx);
            }
            self.pool.release_primary(ix);
        }
        // Anything else: peer stays Pending for the deferred parser.
    }

    /// Foreground half of the receive path: classify buffers the ISR left
    /// pending, in arrival order, against the full URC catalogue, and
    /// surface deferred events.
    pub(crate) fn recv_do_work(&mut self) {
        for step in 0..PRIMARY_BUF_COUNT {
            let ix = (self.pool.defer_start() + step) % PRIMARY_BUF_COUNT;
            if self.pool.primary[ix].peer == Peer::Pending {
                ringbuf_entry!(Trace::Deferred(ix as u8));
                self.classify_deferred(ix as u8);
            }
        }

        if let Some(ctx) = self.rx.pdp_deactivated.take() {
            let mut msg: heapless::String<32> = heapless::String::new();
            let _ = core::fmt::Write::write_fmt(
                &mut msg,
                format_args!("pdp context {} deactivated", ctx),
            );
            self.notify_app(Notification::PdpDeactivated, &msg);
        }
    }

    fn classify_deferred(&mut self, ix: u8) {
        let mut chunk = [0u8; PRIMARY_BUF_SIZE];
        let len = {
            let src = self.pool.primary[usize::from(ix)].contents();
            chunk[..src.len()].copy_from_slice(src);
            src.len()
        };
        let body = &chunk[..len];
        let after = ascii::after_crlf(body);

        if let Some(line) = ascii::lines(after).next() {
            if self.classify_urc_line(line) {
                self.pool.release_primary(ix);
                return;
            }
        }

        // Not a recognized URC: it belongs to the open command (or is an
        // unsolicited response nobody asked for, which the next action
        // reset will clear).
        self.cmd.append(body);
        self.pool.release_primary(ix);
    }

    /// Matches one CRLF-stripped line against the URC catalogue. Returns
    /// false if the line is not a URC the driver handles.
    pub(crate) fn classify_urc_line(&mut self, line: &[u8]) -> bool {
        const IP_RECV: &[u8] = b"+QIURC: \"recv\",";
        const SSL_RECV: &[u8] = b"+QSSLURC: \"recv\",";
        const PDP_DEACT: &[u8] = b"+QIURC: \"pdpdeact\",";

        if let Some(rest) = line.strip_prefix(IP_RECV) {
            return self.mark_socket_data_pending(rest);
        }
        if let Some(rest) = line.strip_prefix(SSL_RECV) {
            return self.mark_socket_data_pending(rest);
        }
        if let Some(rest) = line.strip_prefix(PDP_DEACT) {
            if let Some((ctx, _)) = ascii::parse_decimal(rest, 0) {
                self.rx.pdp_deactivated = Some(ctx.max(0) as u8);
            }
            return true;
        }
        if line.strip_prefix(b"+QIURC: ").is_some() {
            // State-change URC the driver has no handler for; hand the
            // text to the application and move on.
            if let Ok(text) = core::str::from_utf8(line) {
                self.notify_app(Notification::Info, text);
            }
            return true;
        }
        if line == b"APP RDY" {
            if self.ready_state != ReadyState::AppReady {
                self.ready_state = ReadyState::AppReady;
            }
            return true;
        }
        false
    }

    fn mark_socket_data_pending(&mut self, id_text: &[u8]) -> bool {
        if let Some((id, _)) = ascii::parse_decimal(id_text, 0) {
            if (0..crate::sockets::SOCKET_TABLE_SIZE as i32).contains(&id) {
                self.sockets.entries[id as usize].data_pending = true;
            }
        }
        true
    }

    /// Re-examines response bytes left over after a completion parser
    /// matched: URCs appended to a command response must not be lost.
    pub(crate) fn scan_trailing_urcs(&mut self) {
        let mut local = [0u8; 160];
        let pending = self.cmd.pending();
        let n = pending.len().min(local.len());
        local[..n].copy_from_slice(&pending[..n]);
        self.cmd.drop_pending();

        for line in ascii::lines(ascii::after_crlf(&local[..n])) {
            if !line.is_empty() {
                let _ = self.classify_urc_line(line);
            }
        }
    }

    /// Queues bytes on the TX ring. All-or-nothing: on overflow nothing is
    /// enqueued, the application is notified, and false comes back.
    /// `defer` suppresses the FIFO kick when more bytes follow
    /// immediately.
    pub(crate) fn tx_send(&mut self, data: &[u8], defer: bool) -> bool {
        let platform = self.platform;
        let tx = &mut self.tx;
        let ok = platform.with_irq_masked(|| {
            if tx.free() < data.len() {
                false
            } else {
                tx.push(data);
                true
            }
        });
        if !ok {
            self.notify_app(Notification::TxOverflow, "tx ring overflow");
            return false;
        }
        if !defer {
            self.tx_kick();
        }
        true
    }

    /// Starts a TX flow if one is not already in flight. With bytes in the
    /// bridge FIFO the THR-empty interrupt keeps the ring draining on its
    /// own.
    fn tx_kick(&mut self) {
        let platform = self.platform;
        let bridge = self.bridge;
        let tx = &mut self.tx;
        platform.with_irq_masked(|| {
            if bridge.tx_available() == FIFO_SIZE {
                let mut chunk = [0u8; FIFO_SIZE as usize];
                let n = tx.pop_into(&mut chunk);
                if n > 0 {
                    bridge.fifo_write(&chunk[..n]);
                }
            }
        });
    }

    /// Spins the foreground until the BGx announces `APP RDY`, failing
    /// fatally if it never does.
    pub(crate) fn await_app_ready(&mut self) -> drv_ltem_api::ResultCode {
        let started = self.platform.now_ms();
        while self.ready_state != ReadyState::AppReady {
            self.do_work();
            self.yield_now();
            if self.platform.now_ms().wrapping_sub(started)
                > APP_READY_TIMEOUT_MS
            {
                self.notify_app(
                    Notification::StartupTimeout,
                    "BGx module failed to start in the allowed time",
                );
                return drv_ltem_api::ResultCode::ERROR;
            }
        }
        drv_ltem_api::ResultCode::SUCCESS
    }

    /// Reports ISR-side resource losses through the notification callback.
    pub(crate) fn surface_faults(&mut self) {
        if self.rx.faults.rx_pool_exhausted {
            self.rx.faults.rx_pool_exhausted = false;
            self.notify_app(
                Notification::RxPoolExhausted,
                "rx primary pool exhausted, bytes dropped",
            );
        }
        if self.rx.faults.data_buf_exhausted {
            self.rx.faults.data_buf_exhausted = false;
            self.notify_app(
                Notification::DataBufferExhausted,
                "no data buffer for stream, chunk dropped",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_buffer_consume_and_pending() {
        let mut cmd = CmdBuffer::new();
        assert!(cmd.append(b"\r\nOK\r\n"));
        assert_eq!(cmd.pending(), b"\r\nOK\r\n");

        cmd.consume(6);
        assert!(cmd.pending().is_empty());
        assert_eq!(cmd.response(), b"\r\nOK\r\n");

        cmd.reset();
        assert!(cmd.pending().is_empty());
        assert!(cmd.response().is_empty());
    }

    #[test]
    fn cmd_buffer_overflow_drops_excess() {
        let mut cmd = CmdBuffer::new();
        let big = [b'x'; CMD_BUF_SIZE];
        assert!(cmd.append(&big));
        assert!(!cmd.append(b"y"));
        assert_eq!(cmd.pending().len(), CMD_BUF_SIZE);
    }

    #[test]
    fn peer_map_socket_bits() {
        let mut map = PeerMap::new();
        map.bind_socket(0, Protocol::Tcp);
        map.bind_socket(2, Protocol::Ssl);

        assert!(map.any_sockets());
        assert!(!map.socket_is_ssl(0));
        assert!(map.socket_is_ssl(2));

        map.release_socket(0);
        map.release_socket(2);
        assert!(!map.any_sockets());
    }
}
