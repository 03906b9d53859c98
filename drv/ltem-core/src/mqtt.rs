// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT over the BGx embedded client.
//!
//! The modem owns the MQTT session; this module drives it with QMT*
//! commands and handles `+QMTRECV` subscription traffic coming back
//! through the IOP's terminator-phrase stream mode. The BGx hides the
//! underlying TCP connection behind a fixed connect id
//! ([`MQTT_CONNECTION_ID`]).

use core::fmt::Write;

use drv_ltem_api::{
    MqttQos, MqttReceiver, MqttSession, MqttStatus, MqttVersion, Platform,
    ResultCode, SslVersion,
};
use heapless::String;
use ringbuf::{ringbuf, ringbuf_entry};

use crate::action::{Parser, ACTION_DEFAULT_RETRIES, ACTION_DEFAULT_TIMEOUT_MS};
use crate::ascii;
use crate::rxpool::{Peer, DATA_BUF_COUNT};
use crate::streams::StreamKind;
use crate::Ltem;

/// BGx socket the MQTT client rides on; fixed, behind the scenes.
pub(crate) const MQTT_CONNECTION_ID: u8 = 5;

/// Subscription slots. Azure-style topics are long; two is what the
/// memory budget buys.
pub(crate) const SUBSCRIPTION_COUNT: usize = 2;

/// Stored topic capacity (name plus property suffix headroom).
const TOPIC_SIZE: usize = 90;

/// Maximum `+QMTRECV` preamble length before the topic's opening quote.
const TOPIC_OFFSET_MAX: usize = 24;

const OPEN_TIMEOUT_MS: u16 = 45_000;
const CONNECT_TIMEOUT_MS: u16 = 60_000;
const SUBSCRIBE_TIMEOUT_MS: u16 = 15_000;
const PUBLISH_TIMEOUT_MS: u16 = 15_000;
const PROMPT_TIMEOUT_MS: u16 = 500;

////////////////////////////////////////////////////////////////////////////////

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    OpenResult(u16),
    ConnectResult(u16),
    Subscribe(u8),
    Unsubscribe(u8),
    PublishResult(u16),
    Recv(u16),
    RecvMalformed,
    RecvUnmatched,
    Close,
}
ringbuf!(Trace, 16, Trace::None);

////////////////////////////////////////////////////////////////////////////////

/// One topic subscription. A slot is free iff its topic is empty.
pub(crate) struct Subscription {
    /// Topic filter without any trailing `#`.
    pub topic: String<TOPIC_SIZE>,
    pub wildcard: bool,
    pub receiver: Option<MqttReceiver>,
}

impl Subscription {
    pub const fn new() -> Self {
        Self {
            topic: String::new(),
            wildcard: false,
            receiver: None,
        }
    }

    pub fn clear(&mut self) {
        self.topic.clear();
        self.wildcard = false;
        self.receiver = None;
    }
}

pub(crate) struct MqttService {
    pub state: MqttStatus,
    /// In-flight message id; monotonically increasing, 16-bit wrap.
    pub msg_id: u16,
    pub subscriptions: [Subscription; SUBSCRIPTION_COUNT],
}

impl MqttService {
    pub const fn new() -> Self {
        const SUB: Subscription = Subscription::new();
        Self {
            state: MqttStatus::Closed,
            msg_id: 0,
            subscriptions: [SUB; SUBSCRIPTION_COUNT],
        }
    }

    pub fn reset(&mut self) {
        self.state = MqttStatus::Closed;
        for s in &mut self.subscriptions {
            s.clear();
        }
    }

    fn next_msg_id(&mut self) -> u16 {
        self.msg_id = self.msg_id.wrapping_add(1);
        if self.msg_id == 0 {
            self.msg_id = 1;
        }
        self.msg_id
    }
}

/// In-place URL-escape removal, limited to the `%20`..`%2F` range the BGx
/// escapes in received topics. Returns the decoded length.
pub(crate) fn url_decode(buf: &mut [u8]) -> usize {
    const TABLE: &[u8; 16] = b" !\"#$%&'()*+,-./";
    let len = buf.len();
    let mut dest = 0;
    let mut i = 0;
    while i < len {
        let b = buf[i];
        if b == 0 {
            break;
        }
        if b == b'%' && i + 2 < len && buf[i + 1] == b'2' {
            let key = match buf[i + 2] {
                d @ b'0'..=b'9' => Some(d - b'0'),
                h @ b'A'..=b'F' => Some(h - b'A' + 10),
                h @ b'a'..=b'f' => Some(h - b'a' + 10),
                _ => None,
            };
            if let Some(key) = key {
                buf[dest] = TABLE[usize::from(key)];
                dest += 1;
                i += 3;
                continue;
            }
        }
        buf[dest] = b;
        dest += 1;
        i += 1;
    }
    dest
}

////////////////////////////////////////////////////////////////////////////////

impl<P: Platform> Ltem<P> {
    /// Reports the MQTT session state. With `force` (or a `host` to match
    /// against) the modem is queried; otherwise the cached state comes
    /// back.
    pub fn mqtt_status(&mut self, host: &str, force: bool) -> MqttStatus {
        if !force && host.is_empty() {
            return self.mqtt.state;
        }

        // Connected probe first, to short-circuit: +QMTCONN? state 3 means
        // in-session, surfaced by the service parser as CUSTOM_BASE + 3.
        let mut connected = false;
        if self.action_try_invoke_adv(
            "AT+QMTCONN?",
            ACTION_DEFAULT_RETRIES,
            ACTION_DEFAULT_TIMEOUT_MS,
            Parser::ServiceResponse {
                preamble: "+QMTCONN: ",
                value_index: 1,
            },
        ) {
            let code = self.action_await_result(true).code;
            connected = code.0 == ResultCode::CUSTOM_BASE + 3;
        }

        if connected && host.is_empty() {
            self.mqtt.state = MqttStatus::Connected;
            return self.mqtt.state;
        }

        // Open probe, with host verification when requested.
        let mut open = false;
        if self.action_try_invoke_adv(
            "AT+QMTOPEN?",
            ACTION_DEFAULT_RETRIES,
            ACTION_DEFAULT_TIMEOUT_MS,
            Parser::Ok,
        ) {
            let result = self.action_await_result(true);
            if result.code.is_success() {
                let has_line =
                    ascii::find(result.response, b"+QMTOPEN: ").is_some();
                let host_matches = host.is_empty()
                    || ascii::find(result.response, host.as_bytes()).is_some();
                open = has_line && host_matches;
            }
        }

        self.mqtt.state = match (connected, open) {
            (true, true) => MqttStatus::Connected,
            (false, true) => MqttStatus::Open,
            _ => MqttStatus::Closed,
        };
        self.mqtt.state
    }

    /// Opens the network connection to an MQTT server, configuring SSL and
    /// the protocol revision first as needed.
    pub fn mqtt_open(
        &mut self,
        host: &str,
        port: u16,
        ssl: SslVersion,
        version: MqttVersion,
    ) -> ResultCode {
        self.mqtt.state = self.mqtt_status(host, false);
        if self.mqtt.state == MqttStatus::Connected {
            return ResultCode::SUCCESS;
        }

        let mut cmd: String<160> = String::new();

        if ssl != SslVersion::None {
            cmd.clear();
            let _ = write!(
                cmd,
                "AT+QSSLCFG=\"sslversion\",{},{}",
                MQTT_CONNECTION_ID,
                ssl.code()
            );
            if self.action_try_invoke(&cmd)
                && !self.action_await_result(true).code.is_success()
            {
                return ResultCode::ERROR;
            }

            cmd.clear();
            let _ = write!(
                cmd,
                "AT+QMTCFG=\"ssl\",{},1,{}",
                MQTT_CONNECTION_ID, MQTT_CONNECTION_ID
            );
            if self.action_try_invoke(&cmd)
                && !self.action_await_result(true).code.is_success()
            {
                return ResultCode::ERROR;
            }
        }

        if version == MqttVersion::V311 {
            cmd.clear();
            let _ =
                write!(cmd, "AT+QMTCFG=\"version\",{},4", MQTT_CONNECTION_ID);
            if self.action_try_invoke(&cmd)
                && !self.action_await_result(true).code.is_success()
            {
                return ResultCode::ERROR;
            }
        }

        cmd.clear();
        let _ = write!(
            cmd,
            "AT+QMTOPEN={},\"{}\",{}",
            MQTT_CONNECTION_ID, host, port
        );
        if !self.action_try_invoke_adv(
            &cmd,
            ACTION_DEFAULT_RETRIES,
            OPEN_TIMEOUT_MS,
            Parser::ServiceResponse {
                preamble: "+QMTOPEN: ",
                value_index: 1,
            },
        ) {
            return ResultCode::CONFLICT;
        }

        let code = self.action_await_result(true).code;
        ringbuf_entry!(Trace::OpenResult(code.0));
        match code.0 {
            200..=299 => {
                self.peer_map.mqtt = MqttStatus::Open;
                self.mqtt.state = MqttStatus::Open;
                self.streams.register(MQTT_CONNECTION_ID, StreamKind::Mqtt);
                ResultCode::SUCCESS
            }
            // BGx open results: -1 failed, 1 bad parameter, 2 identifier
            // occupied, 3 PDP activation failed, 4 DNS failed, 5 network
            // disconnected.
            899 | 903 | 905 => ResultCode::GONE,
            901 => ResultCode::BAD_REQUEST,
            902 => ResultCode::CONFLICT,
            904 => ResultCode::NOT_FOUND,
            _ => ResultCode::ERROR,
        }
    }

    /// Authenticates the session on an open connection.
    pub fn mqtt_connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
        session: MqttSession,
    ) -> ResultCode {
        if self.mqtt.state == MqttStatus::Connected {
            return ResultCode::SUCCESS;
        }

        let mut cfg: String<48> = String::new();
        let _ = write!(
            cfg,
            "AT+QMTCFG=\"session\",{},{}",
            MQTT_CONNECTION_ID,
            if session == MqttSession::CleanStart { 1 } else { 0 }
        );
        if self.action_try_invoke(&cfg)
            && !self.action_await_result(true).code.is_success()
        {
            return ResultCode::ERROR;
        }

        let mut cmd: String<{ crate::action::ACTION_CMD_SIZE }> = String::new();
        let _ = write!(
            cmd,
            "AT+QMTCONN={},\"{}\",\"{}\",\"{}\"",
            MQTT_CONNECTION_ID, client_id, username, password
        );
        if !self.action_try_invoke_adv(
            &cmd,
            ACTION_DEFAULT_RETRIES,
            CONNECT_TIMEOUT_MS,
            Parser::ServiceResponse {
                preamble: "+QMTCONN: ",
                value_index: 2,
            },
        ) {
            return ResultCode::BAD_REQUEST;
        }

        let code = self.action_await_result(true).code;
        ringbuf_entry!(Trace::ConnectResult(code.0));
        match code.0 {
            200..=299 => {
                self.peer_map.mqtt = MqttStatus::Connected;
                self.mqtt.state = MqttStatus::Connected;
                ResultCode::SUCCESS
            }
            // BGx connect results beyond "accepted": 1/2/4 are protocol or
            // identifier rejections, 3 server unavailable, 5 not
            // authorized.
            901 | 902 | 904 => ResultCode::BAD_REQUEST,
            903 => ResultCode::UNAVAILABLE,
            905 => ResultCode::FORBIDDEN,
            _ => ResultCode::ERROR,
        }
    }

    /// Subscribes `receiver` to `topic`. A trailing `#` multi-level
    /// wildcard is stored stripped, flagged, and forwarded to the modem
    /// intact.
    pub fn mqtt_subscribe(
        &mut self,
        topic: &str,
        qos: MqttQos,
        receiver: MqttReceiver,
    ) -> ResultCode {
        if topic.is_empty() || topic.len() > TOPIC_SIZE {
            return ResultCode::BAD_REQUEST;
        }

        let wildcard = topic.ends_with('#');
        let stored = if wildcard {
            &topic[..topic.len() - 1]
        } else {
            topic
        };

        let Some(slot) = self
            .mqtt
            .subscriptions
            .iter()
            .position(|s| s.topic.is_empty())
        else {
            return ResultCode::CONFLICT;
        };
        {
            let sub = &mut self.mqtt.subscriptions[slot];
            let _ = sub.topic.push_str(stored);
            sub.wildcard = wildcard;
            sub.receiver = Some(receiver);
        }
        ringbuf_entry!(Trace::Subscribe(slot as u8));

        let msg_id = self.mqtt.next_msg_id();
        let mut cmd: String<128> = String::new();
        let _ = write!(
            cmd,
            "AT+QMTSUB={},{},\"{}\",{}",
            MQTT_CONNECTION_ID,
            msg_id,
            topic,
            qos.code()
        );

        if !self.action_try_invoke_adv(
            &cmd,
            ACTION_DEFAULT_RETRIES,
            SUBSCRIBE_TIMEOUT_MS,
            Parser::ServiceResponse {
                preamble: "+QMTSUB: ",
                value_index: 2,
            },
        ) {
            self.mqtt.subscriptions[slot].clear();
            return ResultCode::BAD_REQUEST;
        }

        let code = self.action_await_result(true).code;
        if code.is_success() {
            self.peer_map.subscriptions |= 1 << slot;
        } else {
            self.mqtt.subscriptions[slot].clear();
        }
        code
    }

    /// Drops the subscription matching `topic` (trailing `#` ignored for
    /// the comparison, as it was stored stripped).
    pub fn mqtt_unsubscribe(&mut self, topic: &str) -> ResultCode {
        let trimmed = topic.strip_suffix('#').unwrap_or(topic);

        let slot = self
            .mqtt
            .subscriptions
            .iter()
            .position(|s| !s.topic.is_empty() && s.topic.as_str() == trimmed);
        if let Some(slot) = slot {
            self.mqtt.subscriptions[slot].clear();
            ringbuf_entry!(Trace::Unsubscribe(slot as u8));
        }

        let msg_id = self.mqtt.next_msg_id();
        let mut cmd: String<128> = String::new();
        let _ = write!(
            cmd,
            "AT+QMTUNS={},{},\"{}\"",
            MQTT_CONNECTION_ID, msg_id, topic
        );

        if self.action_try_invoke(&cmd) {
            let code = self.action_await_result(true).code;
            if code.is_success() {
                if let Some(slot) = slot {
                    self.peer_map.subscriptions &= !(1 << slot);
                }
            }
            return code;
        }
        ResultCode::BAD_REQUEST
    }

    /// Publishes `message` to `topic`: QMTPUB, wait for the data prompt,
    /// stream the payload terminated by Ctrl-Z, await the publish verdict.
    pub fn mqtt_publish(
        &mut self,
        topic: &str,
        qos: MqttQos,
        message: &str,
    ) -> ResultCode {
        let msg_id = if qos == MqttQos::AtMostOnce {
            0
        } else {
            self.mqtt.next_msg_id()
        };

        let mut cmd: String<128> = String::new();
        let _ = write!(
            cmd,
            "AT+QMTPUB={},{},{},0,\"{}\"",
            MQTT_CONNECTION_ID,
            msg_id,
            qos.code(),
            topic
        );

        if !self.action_try_invoke_adv(
            &cmd,
            ACTION_DEFAULT_RETRIES,
            PROMPT_TIMEOUT_MS,
            Parser::DataPrompt,
        ) {
            return ResultCode::BAD_REQUEST;
        }

        let code = self.action_await_result(false).code;
        if !code.is_success() {
            self.action_close();
            return code;
        }

        self.action_send_raw_with_eot(
            message.as_bytes(),
            ascii::CTRL_Z,
            PUBLISH_TIMEOUT_MS,
            Some(Parser::ServiceResponse {
                preamble: "+QMTPUB: ",
                value_index: 2,
            }),
        );
        let code = self.action_await_result(true).code;
        ringbuf_entry!(Trace::PublishResult(code.0));
        code
    }

    /// Tears the MQTT service down: subscriptions, peer-map bits, any
    /// buffered traffic, and (if a session was up) the modem-side close.
    pub fn mqtt_close(&mut self) {
        ringbuf_entry!(Trace::Close);
        let was = self.mqtt.state;

        self.peer_map.mqtt = MqttStatus::Closed;
        self.peer_map.subscriptions = 0;
        for dx in 0..DATA_BUF_COUNT {
            if self.pool.data[dx].peer == Peer::Mqtt {
                self.pool.release_data(dx as u8);
            }
        }
        self.mqtt.reset();
        self.streams.deregister(MQTT_CONNECTION_ID);

        if was >= MqttStatus::Open {
            let mut cmd: String<24> = String::new();
            let _ = write!(cmd, "AT+QMTCLOSE={}", MQTT_CONNECTION_ID);
            if self.action_try_invoke(&cmd) {
                let _ = self.action_await_result(true);
            }
        }
    }

    /// Background pass: deliver completed `+QMTRECV` buffers to their
    /// subscriptions.
    pub(crate) fn mqtt_do_work(&mut self) {
        for dx in 0..DATA_BUF_COUNT {
            let ready = {
                let b = &self.pool.data[dx];
                b.peer == Peer::Mqtt && b.data_ready
            };
            if ready {
                self.mqtt_dispatch(dx as u8);
                self.pool.release_data(dx as u8);
            }
        }
    }

    /// Parses `+QMTRECV: <ctx>,<msgid>,"<topic>","<payload>"` out of a
    /// completed data buffer and invokes the matching subscription.
    fn mqtt_dispatch(&mut self, dx: u8) {
        let ix = usize::from(dx);

        // Decode escapes in place first; all later offsets are in decoded
        // space, bounded by the buffer's head cursor.
        let decoded_len = {
            let buf = &mut self.pool.data[ix];
            let head = usize::from(buf.head);
            url_decode(&mut buf.data[..head])
        };
        let data = &self.pool.data[ix].data[..decoded_len];

        let Some(q1) = data[..TOPIC_OFFSET_MAX.min(data.len())]
            .iter()
            .position(|&b| b == b'"')
        else {
            ringbuf_entry!(Trace::RecvMalformed);
            return;
        };
        let topic_start = q1 + 1;
        let Some(q2) = data[topic_start..].iter().position(|&b| b == b'"')
        else {
            ringbuf_entry!(Trace::RecvMalformed);
            return;
        };
        let topic_end = topic_start + q2;

        // Payload sits between `,"` after the topic and the closing
        // quote before the final CRLF.
        let msg_start = topic_end + 3;
        if msg_start >= data.len() {
            ringbuf_entry!(Trace::RecvMalformed);
            return;
        }
        let Some(cr) = data[msg_start..].iter().position(|&b| b == ascii::CR)
        else {
            ringbuf_entry!(Trace::RecvMalformed);
            return;
        };
        if cr == 0 {
            ringbuf_entry!(Trace::RecvMalformed);
            return;
        }
        let msg_end = msg_start + cr - 1;

        let (Ok(topic), Ok(message)) = (
            core::str::from_utf8(&data[topic_start..topic_end]),
            core::str::from_utf8(&data[msg_start..msg_end]),
        ) else {
            ringbuf_entry!(Trace::RecvMalformed);
            return;
        };

        ringbuf_entry!(Trace::Recv(message.len() as u16));

        for sub in &self.mqtt.subscriptions {
            if sub.topic.is_empty() || !topic.starts_with(sub.topic.as_str()) {
                continue;
            }
            if let Some(rcv) = sub.receiver {
                let props = &topic[sub.topic.len()..];
                rcv(topic, props, message);
            }
            return;
        }
        ringbuf_entry!(Trace::RecvUnmatched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_decode_substitutes_20_through_2f() {
        let mut buf = *b"devices%2F42%2Fmessages%20x";
        let n = url_decode(&mut buf);
        assert_eq!(&buf[..n], b"devices/42/messages x");
    }

    #[test]
    fn url_decode_is_idempotent_without_escapes() {
        let original = b"dev/42/cmd/ping";
        let mut buf = *original;
        let n = url_decode(&mut buf);
        assert_eq!(&buf[..n], original);
        let n2 = url_decode(&mut buf[..n]);
        assert_eq!(&buf[..n2], original);
    }

    #[test]
    fn url_decode_leaves_out_of_range_escapes() {
        // %41 is outside the %20-%2F window and passes through.
        let mut buf = *b"a%41b";
        let n = url_decode(&mut buf);
        assert_eq!(&buf[..n], b"a%41b");
    }

    #[test]
    fn msg_id_monotonic_and_nonzero() {
        let mut svc = MqttService::new();
        assert_eq!(svc.next_msg_id(), 1);
        assert_eq!(svc.next_msg_id(), 2);
        svc.msg_id = u16::MAX;
        assert_eq!(svc.next_msg_id(), 1);
    }

    #[test]
    fn subscription_slot_free_iff_topic_empty() {
        let mut sub = Subscription::new();
        assert!(sub.topic.is_empty());
        let _ = sub.topic.push_str("dev/42/");
        sub.wildcard = true;
        sub.clear();
        assert!(sub.topic.is_empty());
        assert!(!sub.wildcard);
    }
}
