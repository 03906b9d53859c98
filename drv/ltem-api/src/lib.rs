// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the LTEm modem driver.
//!
//! This crate defines the types shared between the driver crates and the
//! application: the [`Platform`] trait the driver is generic over, the
//! HTTP-shaped [`ResultCode`] status taxonomy, protocol enums, and the
//! callback signatures for received data and driver notifications.
//!
//! Nothing in here touches hardware; the board support code implements
//! [`Platform`] and everything above it stays architecture-neutral.

#![cfg_attr(not(test), no_std)]

/// A GPIO pin, identified by board-assigned number.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pin(pub u8);

/// Logic level of a GPIO pin.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    Low,
    High,
}

/// Pin direction/bias, for board support code configuring the modem pins.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PinMode {
    Input,
    InputPullup,
    InputPulldown,
    Output,
}

/// Edge/level condition for attaching the bridge IRQ handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqTrigger {
    Low,
    High,
    Rising,
    Falling,
    Change,
}

/// The modem-facing pins the driver needs to know about. Chip select for the
/// SPI bridge is owned by the [`Platform`] SPI implementation.
#[derive(Copy, Clone, Debug)]
pub struct PinConfig {
    /// Bridge IRQ line, active low. The ISR re-checks this pin before
    /// returning to catch the bridge's latched-interrupt quirk.
    pub irq: Pin,
    /// BGx STATUS output.
    pub status: Pin,
    /// BGx PWRKEY input (power sequencing is the application's business).
    pub power_key: Pin,
    /// BGx RESET input.
    pub reset: Pin,
}

/// Services the driver requires from the board.
///
/// Implementations are cheap handles (hence `Copy`): the driver keeps a
/// couple of copies internally, the way Hubris drivers keep `Sys`/`Spi`
/// handles.
///
/// # Critical sections
///
/// [`Platform::with_irq_masked`] must mask the bridge IRQ line for the
/// duration of the closure and restore the previous state afterwards, and it
/// must nest: the driver also calls it from within the interrupt handler,
/// where the line is already masked.
pub trait Platform: Copy {
    /// Performs one 16-bit full-duplex SPI exchange with the bridge and
    /// returns the word clocked in.
    fn spi_transfer_word(&self, word: u16) -> u16;

    /// Performs a burst exchange: one chip-select window clocking out
    /// `addr_byte` followed by `data`, replacing `data` in place with the
    /// bytes clocked in.
    fn spi_transfer_buffer(&self, addr_byte: u8, data: &mut [u8]);

    fn gpio_read(&self, pin: Pin) -> Level;
    fn gpio_write(&self, pin: Pin, level: Level);

    /// Monotonic milliseconds. Wraps; the driver only does wrapping
    /// interval arithmetic on it.
    fn now_ms(&self) -> u32;

    fn delay_ms(&self, ms: u32);

    /// Cooperative give-back while the foreground polls.
    fn yield_now(&self);

    /// Runs `body` with the bridge IRQ masked. See the trait docs.
    fn with_irq_masked<R>(&self, body: impl FnOnce() -> R) -> R;
}

/// HTTP-shaped status code, the currency of every driver operation.
///
/// Codes below 600 follow their HTTP meanings. BGx-native codes surface
/// unchanged in the 500–999 range; service-response values under 100 are
/// rebased onto [`ResultCode::CUSTOM_BASE`]. `0xFFFF` is the in-band
/// "not finished yet" sentinel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ResultCode(pub u16);

impl ResultCode {
    pub const SUCCESS: Self = Self(200);
    pub const BAD_REQUEST: Self = Self(400);
    pub const FORBIDDEN: Self = Self(403);
    pub const NOT_FOUND: Self = Self(404);
    pub const TIMEOUT: Self = Self(408);
    pub const CONFLICT: Self = Self(409);
    pub const GONE: Self = Self(410);
    pub const PRECONDITION_FAILED: Self = Self(412);
    pub const CANCELLED: Self = Self(499);
    pub const ERROR: Self = Self(500);
    pub const UNAVAILABLE: Self = Self(503);
    pub const GATEWAY_TIMEOUT: Self = Self(504);
    /// BGx reports the socket was already open from a previous session.
    pub const PREVIOUSLY_OPEN: Self = Self(563);
    /// Base for BGx service-response values in 1..100.
    pub const CUSTOM_BASE: u16 = 900;
    /// In-band sentinel: the operation has not completed.
    pub const PENDING: Self = Self(0xFFFF);

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_pending(self) -> bool {
        self == Self::PENDING
    }

    pub fn is_error(self) -> bool {
        self.0 >= 400 && !self.is_pending()
    }
}

/// Categories surfaced through the application notification callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Notification {
    /// Informational, including URCs the driver has no handler for.
    Info,
    /// The carrier deactivated a PDP context; network connectivity is gone.
    PdpDeactivated,
    /// A TX enqueue did not fit; the triggering operation was rejected
    /// whole.
    TxOverflow,
    /// Receive traffic arrived with no free primary buffer; bytes were
    /// dropped.
    RxPoolExhausted,
    /// A bulk receive started with no free data buffer; the stream chunk
    /// was dropped.
    DataBufferExhausted,
    /// The BGx never reported APP RDY during start-up.
    StartupTimeout,
}

impl Notification {
    /// Fatal categories mean the driver cannot proceed; everything else is
    /// advisory.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::StartupTimeout)
    }
}

/// Application callback for driver notifications.
pub type NotifyHandler = fn(Notification, &str);

/// Socket identifier; the BGx supports connect IDs 0 through 5.
pub type SocketId = u8;

/// Number of concurrent sockets the modem supports.
pub const SOCKET_COUNT: usize = 6;

/// Transport protocol for a socket.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
    Ssl,
}

/// Application callback receiving a completed socket payload.
pub type SocketReceiver = fn(socket: SocketId, data: &[u8]);

/// Application callback receiving an MQTT message. `props` is the suffix of
/// the received topic beyond the subscribed prefix (empty without a
/// wildcard subscription).
pub type MqttReceiver = fn(topic: &str, props: &str, message: &str);

/// SSL/TLS version selection for `AT+QSSLCFG`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SslVersion {
    None,
    Ssl30,
    Tls10,
    Tls11,
    Tls12,
    Any,
}

impl SslVersion {
    /// The numeric argument the BGx expects.
    pub fn code(self) -> u8 {
        match self {
            Self::Ssl30 => 0,
            Self::Tls10 => 1,
            Self::Tls11 => 2,
            Self::Tls12 => 3,
            Self::Any => 4,
            Self::None => 255,
        }
    }
}

/// MQTT protocol revision for `AT+QMTCFG="version"`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MqttVersion {
    V3,
    V311,
}

/// MQTT quality of service. Azure IoT Hub tolerates at most
/// [`MqttQos::AtLeastOnce`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MqttQos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl MqttQos {
    pub fn code(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// Message handling for the pre-session window (session starts at connect,
/// not open).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MqttSession {
    /// Deliver messages that arrived before the session started.
    Preserve,
    /// Discard anything received before the session started.
    CleanStart,
}

/// Connection state of the MQTT service.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum MqttStatus {
    Closed,
    Open,
    Connected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_ranges() {
        assert!(ResultCode::SUCCESS.is_success());
        assert!(!ResultCode::SUCCESS.is_error());
        assert!(ResultCode::TIMEOUT.is_error());
        assert!(ResultCode(903).is_error());
        assert!(ResultCode::PENDING.is_pending());
        assert!(!ResultCode::PENDING.is_error());
    }

    #[test]
    fn ssl_version_codes_match_bgx() {
        assert_eq!(SslVersion::Tls12.code(), 3);
        assert_eq!(SslVersion::None.code(), 255);
    }
}
