// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core driver for a Quectel BGx cellular modem (LTE Cat-M1/NB-IoT)
//! behind an NXP SC16IS741A SPI-to-UART bridge.
//!
//! The driver multiplexes one UART into three kinds of traffic:
//!
//! * a synchronous command/response channel (AT commands, completion
//!   parsing, the single action lock),
//! * asynchronous URC notifications from the modem,
//! * bulk data streams (socket IRD reads, MQTT subscription messages)
//!   that interleave with command traffic on the same wire.
//!
//! # Execution model
//!
//! Two contexts, no RTOS. The *foreground* is the application's
//! cooperative main loop: it invokes commands, polls for their
//! completion, and calls [`Ltem::do_work`] to push received data through
//! the protocol pipelines to application receivers. The *interrupt*
//! context is [`Ltem::interrupt`], called from the application's handler
//! for the bridge IRQ line; it drains the 64-byte bridge FIFOs and does
//! shallow classification only.
//!
//! All state lives in one [`Ltem`] value. The application owns it and
//! gives the ISR trampoline a raw back-reference valid for the life of
//! the program; the foreground's shared-state touches run under the
//! platform's scoped IRQ mask, so the two contexts never interleave
//! mid-update.

#![cfg_attr(not(test), no_std)]

use drv_ltem_api::{
    Notification, NotifyHandler, PinConfig, Platform, ResultCode,
};
use drv_ltem_bridge::Sc16is741a;

mod action;
mod ascii;
mod iop;
mod mdm;
mod mqtt;
mod rxpool;
mod sockets;
mod streams;
mod txring;

#[cfg(test)]
mod sim;

pub use action::{
    ActionHistory, ActionResult, Parser, ACTION_DEFAULT_RETRIES,
    ACTION_DEFAULT_TIMEOUT_MS,
};
pub use drv_ltem_api as api;
pub use mdm::RSSI_NO_SIGNAL;
pub use streams::StreamKind;

use action::ActionSlot;
use iop::{CmdBuffer, PeerMap, RxState};
use mdm::ModemInfo;
use mqtt::MqttService;
use rxpool::RxPool;
use sockets::SocketTable;
use streams::StreamRegistry;
use txring::TxRing;

/// Driver configuration, fixed at construction.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub pins: PinConfig,
    /// PDP context sockets are opened on (carriers allow up to three).
    pub data_context: u8,
}

/// BGx bring-up progress, advanced by the `APP RDY` URC.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum ReadyState {
    Off,
    Booting,
    AppReady,
}

/// The modem driver. One per modem, owned by the application.
pub struct Ltem<P: Platform> {
    pub(crate) platform: P,
    pub(crate) bridge: Sc16is741a<P>,
    pub(crate) config: Config,
    pub(crate) notify: Option<NotifyHandler>,
    yield_hook: Option<fn(&mut Ltem<P>)>,
    pub(crate) cancellation_request: bool,
    pub(crate) ready_state: ReadyState,

    pub(crate) tx: TxRing,
    pub(crate) pool: RxPool,
    pub(crate) cmd: CmdBuffer,
    pub(crate) rx: RxState,
    pub(crate) peer_map: PeerMap,
    pub(crate) action: ActionSlot,
    pub(crate) sockets: SocketTable,
    pub(crate) mqtt: MqttService,
    pub(crate) streams: StreamRegistry,
    pub(crate) info: ModemInfo,
}

impl<P: Platform> Ltem<P> {
    /// Creates the driver over `platform`. Nothing touches hardware until
    /// [`Ltem::start`].
    pub fn new(
        platform: P,
        config: Config,
        notify: Option<NotifyHandler>,
    ) -> Self {
        Self {
            bridge: Sc16is741a::new(platform),
            platform,
            config,
            notify,
            yield_hook: None,
            cancellation_request: false,
            ready_state: ReadyState::Off,
            tx: TxRing::new(),
            pool: RxPool::new(),
            cmd: CmdBuffer::new(),
            rx: RxState::new(),
            peer_map: PeerMap::new(),
            action: ActionSlot::new(),
            sockets: SocketTable::new(),
            mqtt: MqttService::new(),
            streams: StreamRegistry::new(),
            info: ModemInfo::new(),
        }
    }

    /// Brings the bridge UART up and waits for the modem's `APP RDY`.
    /// The application must have routed the bridge IRQ to
    /// [`Ltem::interrupt`] first.
    pub fn start(&mut self) -> ResultCode {
        self.bridge.initialize();
        if self.ready_state < ReadyState::AppReady {
            self.ready_state = ReadyState::Booting;
        }
        self.await_app_ready()
    }

    /// Stops driver operation and drops all session state. Modem power
    /// is the application's business.
    pub fn stop(&mut self) {
        self.clear_session_state();
        self.ready_state = ReadyState::Off;
    }

    /// Resets the bridge UART and the driver state, then waits for the
    /// modem again.
    pub fn reset(&mut self) -> ResultCode {
        self.bridge.sw_reset();
        self.clear_session_state();
        self.ready_state = ReadyState::Booting;
        self.bridge.initialize();
        self.await_app_ready()
    }

    /// Foreground background-work pass: deferred URC classification, then
    /// a pipeline pass for each registered stream kind, then fault
    /// reporting. Call this from the application main loop.
    pub fn do_work(&mut self) {
        self.recv_do_work();
        if self.streams.has_kind(StreamKind::Sockets) {
            self.sockets_do_work();
        }
        if self.streams.has_kind(StreamKind::Mqtt) {
            self.mqtt_do_work();
        }
        self.surface_faults();
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    /// Requests cancellation of the in-flight awaited action; it resolves
    /// with [`ResultCode::CANCELLED`] on the next poll.
    pub fn request_cancel(&mut self) {
        self.cancellation_request = true;
    }

    /// Installs a hook run at every foreground suspension point, in place
    /// of the platform yield. The hook receives the driver handle, so a
    /// polled (non-interrupt) integration can service the bridge from it.
    pub fn set_yield_hook(&mut self, hook: fn(&mut Ltem<P>)) {
        self.yield_hook = Some(hook);
    }

    pub(crate) fn yield_now(&mut self) {
        match self.yield_hook {
            Some(hook) => hook(self),
            None => self.platform.yield_now(),
        }
    }

    pub(crate) fn notify_app(&self, kind: Notification, msg: &str) {
        if let Some(cb) = self.notify {
            cb(kind, msg);
        }
    }

    fn clear_session_state(&mut self) {
        self.tx.clear();
        self.pool.reset_all();
        self.cmd.reset();
        self.rx.reset();
        self.peer_map.reset();
        self.action = ActionSlot::new();
        self.sockets.reset();
        self.mqtt.reset();
        self.streams.clear();
        self.cancellation_request = false;
    }
}
