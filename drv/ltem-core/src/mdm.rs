// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Modem identification and signal-quality queries.
//!
//! Provisioning identity (IMEI, ICCID, firmware, model) is immutable for
//! the life of the part, so each field is queried once and cached.

use drv_ltem_api::Platform;
use heapless::String;

use crate::action::{Parser, ACTION_DEFAULT_RETRIES, ACTION_DEFAULT_TIMEOUT_MS};
use crate::ascii;
use crate::Ltem;

const IMEI_LEN: usize = 15;
const ICCID_LEN: usize = 20;

/// Returned by [`Ltem::mdm_rssi`] when the `AT+CSQ` query itself fails.
pub const RSSI_NO_SIGNAL: i16 = -999;

/// Cached device identity.
pub(crate) struct ModemInfo {
    pub imei: String<16>,
    pub iccid: String<24>,
    pub firmware: String<40>,
    pub model: String<40>,
}

impl ModemInfo {
    pub const fn new() -> Self {
        Self {
            imei: String::new(),
            iccid: String::new(),
            firmware: String::new(),
            model: String::new(),
        }
    }
}

/// First CRLF-delimited line of a response body.
fn first_line(resp: &[u8]) -> &[u8] {
    let body = ascii::after_crlf(resp);
    ascii::lines(body).next().unwrap_or(body)
}

fn push_ascii<const N: usize>(dst: &mut String<N>, src: &[u8]) {
    if let Ok(s) = core::str::from_utf8(src) {
        let _ = dst.push_str(&s[..s.len().min(N)]);
    }
}

impl<P: Platform> Ltem<P> {
    /// The modem's IMEI (15 digits), queried once with `AT+GSN`. Empty if
    /// the query has not succeeded.
    pub fn mdm_imei(&mut self) -> &str {
        if self.info.imei.is_empty() {
            let mut line = [0u8; 24];
            let mut n = 0;
            if self.action_try_invoke("AT+GSN") {
                let result = self.action_await_result(false);
                if result.code.is_success() {
                    let src = first_line(result.response);
                    n = src.len().min(IMEI_LEN);
                    line[..n].copy_from_slice(&src[..n]);
                }
                self.action_close();
            }
            push_ascii(&mut self.info.imei, &line[..n]);
        }
        self.info.imei.as_str()
    }

    /// The SIM's ICCID (20 digits), via the `AT+ICCID` query.
    pub fn mdm_iccid(&mut self) -> &str {
        if self.info.iccid.is_empty() {
            let mut digits = [0u8; 24];
            let mut n = 0;
            if self.action_try_invoke_adv(
                "AT+ICCID",
                ACTION_DEFAULT_RETRIES,
                ACTION_DEFAULT_TIMEOUT_MS,
                Parser::Default {
                    preamble: "+ICCID: ",
                    preamble_reqd: true,
                    min_gap: ICCID_LEN as u8,
                    terminator: Some("OK\r\n"),
                },
            ) {
                let result = self.action_await_result(false);
                if result.code.is_success() {
                    if let Some(at) =
                        ascii::find(result.response, b"+ICCID: ")
                    {
                        let digits_at = at + 8;
                        let avail = result.response.len() - digits_at;
                        n = avail.min(ICCID_LEN);
                        digits[..n].copy_from_slice(
                            &result.response[digits_at..digits_at + n],
                        );
                    }
                }
                self.action_close();
            }
            push_ascii(&mut self.info.iccid, &digits[..n]);
        }
        self.info.iccid.as_str()
    }

    /// BGx firmware revision string, via `AT+QGMR`.
    pub fn mdm_firmware(&mut self) -> &str {
        if self.info.firmware.is_empty() {
            let mut line = [0u8; 40];
            let mut n = 0;
            if self.action_try_invoke("AT+QGMR") {
                let result = self.action_await_result(false);
                if result.code.is_success() {
                    let src = first_line(result.response);
                    n = src.len().min(line.len());
                    line[..n].copy_from_slice(&src[..n]);
                }
                self.action_close();
            }
            push_ascii(&mut self.info.firmware, &line[..n]);
        }
        self.info.firmware.as_str()
    }

    /// Manufacturer and model ("Quectel BG96"), via `ATI`, the first two
    /// response lines joined.
    pub fn mdm_model(&mut self) -> &str {
        if self.info.model.is_empty() {
            let mut joined = [0u8; 40];
            let mut n = 0;
            if self.action_try_invoke("ATI") {
                let result = self.action_await_result(false);
                if result.code.is_success() {
                    let body = ascii::after_crlf(result.response);
                    for line in ascii::lines(body).take(2) {
                        if line.is_empty() || line.starts_with(b"Revision") {
                            break;
                        }
                        if n > 0 && n < joined.len() {
                            joined[n] = b' ';
                            n += 1;
                        }
                        let take = line.len().min(joined.len() - n);
                        joined[n..n + take].copy_from_slice(&line[..take]);
                        n += take;
                    }
                }
                self.action_close();
            }
            push_ascii(&mut self.info.model, &joined[..n]);
        }
        self.info.model.as_str()
    }

    /// Received signal strength in dBm (-113..=-51), from `AT+CSQ`; zero
    /// when the modem reports csq 99 (no measurable signal),
    /// [`RSSI_NO_SIGNAL`] when the query fails.
    pub fn mdm_rssi(&mut self) -> i16 {
        let mut rssi = RSSI_NO_SIGNAL;
        if self.action_try_invoke("AT+CSQ") {
            let result = self.action_await_result(false);
            if result.code.is_success() {
                if let Some(at) = ascii::find(result.response, b"+CSQ: ") {
                    if let Some((csq, _)) =
                        ascii::parse_decimal(result.response, at + 6)
                    {
                        rssi = match csq {
                            99 => 0,
                            0..=98 => -113 + 2 * csq as i16,
                            _ => RSSI_NO_SIGNAL,
                        };
                    }
                }
            }
            self.action_close();
        }
        rssi
    }

    /// Signal strength scaled to `bars` display bars.
    pub fn mdm_rssi_bars(&mut self, bars: u8) -> u8 {
        if bars == 0 {
            return 0;
        }
        let rssi = self.mdm_rssi();
        // Zero is the no-measurable-signal report, not a strong reading.
        if rssi == RSSI_NO_SIGNAL || rssi == 0 {
            return 0;
        }
        let span = (113 - 51) / i16::from(bars);
        ((rssi + 113 + span) / span).clamp(0, i16::from(bars)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_extraction() {
        assert_eq!(
            first_line(b"\r\n861364040012345\r\n\r\nOK\r\n"),
            b"861364040012345"
        );
        assert_eq!(first_line(b"no terminator"), b"no terminator");
    }
}
