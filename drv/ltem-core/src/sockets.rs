// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TCP/UDP/SSL sockets over the BGx, and the IRD receive pipeline.
//!
//! Receive is pull-based: the modem announces buffered data with a
//! `+QIURC: "recv"` URC, and the pipeline pulls it down in bounded chunks
//! with `AT+QIRD` (or `AT+QSSLRECV`). An IRD drain holds the action lock
//! from the first pull until the modem reports an empty buffer, so
//! foreground commands cannot interleave with stream traffic.

use core::fmt::Write;

use drv_ltem_api::{
    MqttStatus, Platform, Protocol, ResultCode, SocketId, SocketReceiver,
    SOCKET_COUNT,
};
use heapless::String;
use ringbuf::{ringbuf, ringbuf_entry};

use crate::action::{
    copy_truncated, timer_expired, ActionOwner, Parser, ACTION_DEFAULT_RETRIES,
};
use crate::rxpool::{Peer, DATA_BUF_COUNT};
use crate::streams::StreamKind;
use crate::Ltem;

pub(crate) const SOCKET_TABLE_SIZE: usize = SOCKET_COUNT;

/// Largest single IRD pull; also the modem-side maximum.
const IRD_REQUEST_MAX: u16 = 1500;
/// Window for the `+QIOPEN`/`+QSSLOPEN` service response -- the modem has
/// to finish a TCP (and possibly TLS) handshake first.
const SOCKET_OPEN_TIMEOUT_MS: u16 = 10_000;
/// Window for the `> ` data prompt after QISEND.
const SEND_PROMPT_TIMEOUT_MS: u16 = 500;
/// Window for `SEND OK` after the payload bytes.
const SOCKET_SEND_TIMEOUT_MS: u16 = 5_000;
/// Window for an IRD response; the watchdog below recovers the lock if a
/// drain dies without its empty-IRD terminator.
const IRD_TIMEOUT_MS: u16 = 2_500;

////////////////////////////////////////////////////////////////////////////////

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Open(SocketId),
    OpenResult(u16),
    Close(SocketId),
    SendPayload(u16),
    IrdRequest(SocketId),
    IrdDeferred(SocketId),
    Delivered(u16),
    FlushDiscard(u16),
    DrainDone(SocketId),
    IrdWatchdog,
}
ringbuf!(Trace, 32, Trace::None);

////////////////////////////////////////////////////////////////////////////////

/// Per-socket control state; entries are addressed by socket id.
pub(crate) struct SocketEntry {
    pub protocol: Option<Protocol>,
    pub context_id: u8,
    pub open: bool,
    /// A "recv" URC arrived and the drain has not finished.
    pub data_pending: bool,
    /// Discard inbound payloads instead of delivering them; used to clear
    /// a previously-open session's stale data.
    pub flushing: bool,
    /// RX data buffer bound to this socket while a completed payload is
    /// being delivered.
    pub data_buffer: Option<u8>,
    pub receiver: Option<SocketReceiver>,
}

impl SocketEntry {
    pub const fn new() -> Self {
        Self {
            protocol: None,
            context_id: 0,
            open: false,
            data_pending: false,
            flushing: false,
            data_buffer: None,
            receiver: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

pub(crate) struct SocketTable {
    pub entries: [SocketEntry; SOCKET_TABLE_SIZE],
}

impl SocketTable {
    pub const fn new() -> Self {
        const ENTRY: SocketEntry = SocketEntry::new();
        Self {
            entries: [ENTRY; SOCKET_TABLE_SIZE],
        }
    }

    pub fn reset(&mut self) {
        for e in &mut self.entries {
            e.reset();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

impl<P: Platform> Ltem<P> {
    /// Opens a socket to `host:rmt_port`. On [`ResultCode::PREVIOUSLY_OPEN`]
    /// the session survived a previous run; with `clean_session` the
    /// pipeline silently drains whatever the modem buffered in the
    /// meantime.
    #[allow(clippy::too_many_arguments)]
    pub fn sockets_open(
        &mut self,
        id: SocketId,
        protocol: Protocol,
        host: &str,
        rmt_port: u16,
        lcl_port: u16,
        clean_session: bool,
        receiver: SocketReceiver,
    ) -> ResultCode {
        let ix = usize::from(id);
        if ix >= SOCKET_TABLE_SIZE || self.sockets.entries[ix].protocol.is_some()
        {
            return ResultCode::BAD_REQUEST;
        }
        if id == crate::mqtt::MQTT_CONNECTION_ID
            && self.peer_map.mqtt != MqttStatus::Closed
        {
            return ResultCode::CONFLICT;
        }

        ringbuf_entry!(Trace::Open(id));
        self.peer_map.bind_socket(id, protocol);

        let ctx = self.config.data_context;
        let mut cmd: String<128> = String::new();
        let preamble = match protocol {
            Protocol::Tcp | Protocol::Udp => {
                let name = if protocol == Protocol::Tcp { "TCP" } else { "UDP" };
                let _ = write!(
                    cmd,
                    "AT+QIOPEN={},{},\"{}\",\"{}\",{},{},0",
                    ctx, id, name, host, rmt_port, lcl_port
                );
                "+QIOPEN: "
            }
            Protocol::Ssl => {
                let _ = write!(
                    cmd,
                    "AT+QSSLOPEN={},{},\"{}\",{},0",
                    ctx, id, host, rmt_port
                );
                "+QSSLOPEN: "
            }
        };

        if !self.action_try_invoke_adv(
            &cmd,
            ACTION_DEFAULT_RETRIES,
            SOCKET_OPEN_TIMEOUT_MS,
            Parser::ServiceResponse {
                preamble,
                value_index: 1,
            },
        ) {
            self.peer_map.release_socket(id);
            return ResultCode::CONFLICT;
        }

        let code = self.action_await_result(true).code;
        ringbuf_entry!(Trace::OpenResult(code.0));

        if code == ResultCode::SUCCESS || code == ResultCode::PREVIOUSLY_OPEN {
            let e = &mut self.sockets.entries[ix];
            e.protocol = Some(protocol);
            e.context_id = ctx;
            e.open = true;
            e.receiver = Some(receiver);
            self.streams.register(id, StreamKind::Sockets);
        } else {
            self.peer_map.release_socket(id);
        }

        if code == ResultCode::PREVIOUSLY_OPEN {
            // Stale session: prime the pipeline so buffered data drains
            // (and is discarded, if the caller asked for a clean start).
            let e = &mut self.sockets.entries[ix];
            e.flushing = clean_session;
            e.data_pending = true;
            self.sockets_do_work();
        }
        code
    }

    /// Closes `id` and releases its slot. The close command is chosen by
    /// how the peer map has the socket bound.
    pub fn sockets_close(&mut self, id: SocketId) {
        let ix = usize::from(id);
        if ix >= SOCKET_TABLE_SIZE {
            return;
        }
        let bit = 1u8 << id;

        let mut cmd: String<24> = String::new();
        if self.peer_map.tcpudp & bit != 0 {
            let _ = write!(cmd, "AT+QICLOSE={}", id);
        } else if self.peer_map.ssl & bit != 0 {
            let _ = write!(cmd, "AT+QSSLCLOSE={}", id);
        } else {
            return;
        }
        ringbuf_entry!(Trace::Close(id));
        self.peer_map.release_socket(id);

        if self.action_try_invoke(&cmd)
            && self.action_await_result(true).code.is_success()
        {
            if let Some(dx) = self.sockets.entries[ix].data_buffer {
                self.pool.release_data(dx);
            }
            self.sockets.entries[ix].reset();
            self.streams.deregister(id);
        }
    }

    /// Closes every socket riding on PDP context `ctx`.
    pub fn sockets_close_all(&mut self, ctx: u8) {
        for id in 0..SOCKET_TABLE_SIZE as u8 {
            let e = &self.sockets.entries[usize::from(id)];
            if e.protocol.is_some() && e.context_id == ctx {
                self.sockets_close(id);
            }
        }
    }

    /// Sends `data` on an open socket: QISEND, wait for the `> ` prompt,
    /// stream the payload, wait for `SEND OK`.
    pub fn sockets_send(&mut self, id: SocketId, data: &[u8]) -> ResultCode {
        let ix = usize::from(id);
        if ix >= SOCKET_TABLE_SIZE {
            return ResultCode::BAD_REQUEST;
        }
        {
            let e = &self.sockets.entries[ix];
            if !e.open
                || e.protocol.is_none()
                || data.len() > usize::from(IRD_REQUEST_MAX)
            {
                return ResultCode::BAD_REQUEST;
            }
        }

        let mut cmd: String<24> = String::new();
        let _ = write!(cmd, "AT+QISEND={},{}", id, data.len());

        if !self.action_try_invoke_adv(
            &cmd,
            ACTION_DEFAULT_RETRIES,
            SEND_PROMPT_TIMEOUT_MS,
            Parser::DataPrompt,
        ) {
            return ResultCode::CONFLICT;
        }

        let code = self.action_await_result(false).code;
        if !code.is_success() {
            self.action_close();
            return code;
        }

        ringbuf_entry!(Trace::SendPayload(data.len() as u16));
        self.action_send_raw(
            data,
            SOCKET_SEND_TIMEOUT_MS,
            Some(Parser::Default {
                preamble: "",
                preamble_reqd: false,
                min_gap: 0,
                terminator: Some("SEND OK\r\n"),
            }),
        );
        self.action_await_result(true).code
    }

    /// Drains an open socket's modem-side buffer, discarding the payloads.
    /// Returns false if the drain could not start (lock busy or socket
    /// not open).
    pub fn sockets_flush(&mut self, id: SocketId) -> bool {
        let ix = usize::from(id);
        if ix >= SOCKET_TABLE_SIZE || self.sockets.entries[ix].protocol.is_none()
        {
            return false;
        }
        self.sockets.entries[ix].flushing = true;
        self.sockets.entries[ix].data_pending = true;
        self.request_ird(id, true)
    }

    /// Queries `AT+QISTATE` for `id`; true when the modem reports the
    /// socket connected (state field 2).
    pub fn sockets_state(&mut self, id: SocketId) -> bool {
        let mut cmd: String<24> = String::new();
        let _ = write!(cmd, "AT+QISTATE=1,{}", id);

        if !self.action_try_invoke_adv(
            &cmd,
            ACTION_DEFAULT_RETRIES,
            crate::action::ACTION_DEFAULT_TIMEOUT_MS,
            Parser::ServiceResponse {
                preamble: "+QISTATE: ",
                value_index: 5,
            },
        ) {
            return false;
        }
        let code = self.action_await_result(true).code;
        code == ResultCode(u16::from(ResultCode::CUSTOM_BASE) + 2)
    }

    /// Issues the IRD pull for `id`. With `apply_lock` the action lock is
    /// taken (no retries -- a busy lock defers the request silently to the
    /// next do-work pass); without it the pipeline's already-held lock is
    /// refreshed for the next pull of the drain.
    pub(crate) fn request_ird(&mut self, id: SocketId, apply_lock: bool) -> bool {
        let mut cmd: String<24> = String::new();
        if self.peer_map.socket_is_ssl(id) {
            let _ = write!(cmd, "AT+QSSLRECV={},{}", id, IRD_REQUEST_MAX);
        } else {
            let _ = write!(cmd, "AT+QIRD={},{}", id, IRD_REQUEST_MAX);
        }

        if apply_lock {
            if !self.action_acquire(&cmd, 0) {
                ringbuf_entry!(Trace::IrdDeferred(id));
                return false;
            }
        } else {
            copy_truncated(&mut self.action.cmd, &cmd);
            self.cmd.reset();
        }
        self.action.owner = ActionOwner::IrdPipeline;
        self.action.parser = Parser::Ok;
        self.action.timeout_ms = IRD_TIMEOUT_MS;
        self.action.invoked_at = self.platform.now_ms();

        ringbuf_entry!(Trace::IrdRequest(id));
        self.rx.stream_peer = Peer::Socket(id);
        if !self.tx_send(cmd.as_bytes(), true) || !self.tx_send(b"\r", false) {
            self.action.is_open = false;
            self.rx.stream_peer = Peer::None;
            return false;
        }
        true
    }

    /// Background pass for the socket pipeline: finish drained streams,
    /// deliver completed payloads, start new drains, and recover a wedged
    /// IRD lock.
    pub(crate) fn sockets_do_work(&mut self) {
        // The classifier saw an empty IRD: this drain is complete.
        if let Some(s) = self.rx.empty_ird.take() {
            ringbuf_entry!(Trace::DrainDone(s));
            let e = &mut self.sockets.entries[usize::from(s)];
            e.data_pending = false;
            e.flushing = false;
            e.data_buffer = None;
            for dx in 0..DATA_BUF_COUNT {
                if self.pool.data[dx].peer == Peer::Socket(s) {
                    self.pool.release_data(dx as u8);
                }
            }
            self.rx.stream_peer = Peer::None;
            self.rx.data_buf = None;
            if self.action.is_open
                && self.action.owner == ActionOwner::IrdPipeline
            {
                self.action.is_open = false;
            }
        }

        // Deliver completed payloads and keep the drain pulling.
        for dx in 0..DATA_BUF_COUNT {
            let (peer, ready) = {
                let b = &self.pool.data[dx];
                (b.peer, b.data_ready)
            };
            if !ready {
                continue;
            }
            let Peer::Socket(s) = peer else { continue };
            let six = usize::from(s);

            let (flushing, receiver) = {
                let e = &mut self.sockets.entries[six];
                e.data_buffer = Some(dx as u8);
                (e.flushing, e.receiver)
            };

            let payload_len = self.pool.data[dx].ird_declared;
            if flushing {
                ringbuf_entry!(Trace::FlushDiscard(payload_len));
            } else if let Some(rcv) = receiver {
                ringbuf_entry!(Trace::Delivered(payload_len));
                rcv(s, self.pool.data[dx].ird_payload());
            }

            self.pool.release_data(dx as u8);
            self.sockets.entries[six].data_buffer = None;

            // The modem may hold more; pull again on the lock this drain
            // already owns. The drain ends at the empty-IRD reply.
            self.request_ird(s, false);
        }

        // No drain active: open one for the first socket with data
        // pending. A busy lock (a send underway) defers to the next pass.
        if self.rx.stream_peer == Peer::None && self.peer_map.any_sockets() {
            for s in 0..SOCKET_TABLE_SIZE as u8 {
                if self.sockets.entries[usize::from(s)].data_pending {
                    let _ = self.request_ird(s, true);
                    break;
                }
            }
        }

        // Watchdog: an IRD drain whose response never came must not hold
        // the lock forever.
        if self.action.is_open
            && self.action.owner == ActionOwner::IrdPipeline
            && timer_expired(
                self.platform.now_ms(),
                self.action.invoked_at,
                self.action.timeout_ms,
            )
        {
            ringbuf_entry!(Trace::IrdWatchdog);
            self.action.is_open = false;
            self.action.result = ResultCode::TIMEOUT;
            self.rx.stream_peer = Peer::None;
            self.rx.data_buf = None;
            self.rx.mode = crate::iop::RxMode::Idle;
        }
    }
}
