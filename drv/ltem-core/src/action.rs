// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AT command invocation: the action lock and its completion parsers.
//!
//! BGx AT traffic is half-duplex at the command level: at most one command
//! may be outstanding, and its completion has to be recognized in the byte
//! stream by a command-specific pattern. The [`ActionSlot`] is that
//! single-command lock; [`Parser`] is the closed family of completion
//! patterns, expressed as data rather than function pointers so call sites
//! don't need wrapper shims.

use drv_ltem_api::{Platform, ResultCode};
use heapless::String;
use ringbuf::{ringbuf, ringbuf_entry};

use crate::ascii;
use crate::Ltem;

/// Default completion window for a command.
pub const ACTION_DEFAULT_TIMEOUT_MS: u16 = 500;
/// Default number of lock-acquisition attempts.
pub const ACTION_DEFAULT_RETRIES: u8 = 10;
/// Spacing between lock-acquisition attempts.
pub(crate) const ACTION_RETRY_INTERVAL_MS: u32 = 50;

/// Room for a composed command; MQTT connect strings with SAS tokens are
/// the long pole.
pub(crate) const ACTION_CMD_SIZE: usize = 448;
const HISTORY_CMD_SIZE: usize = 64;
const HISTORY_RESPONSE_SIZE: usize = 240;

////////////////////////////////////////////////////////////////////////////////

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Invoke,
    LockBusy,
    Complete(u16),
    Timeout,
    Cancelled,
}
ringbuf!(Trace, 16, Trace::None);

////////////////////////////////////////////////////////////////////////////////

/// Completion parser selection, with its parameters.
///
/// Every parser yields an HTTP-shaped [`ResultCode`] once it has seen
/// enough of the response, or signals that more bytes are needed.
#[derive(Copy, Clone, Debug)]
pub enum Parser {
    /// The standard result set: `OK`, `ERROR`, `FAIL`, `NO CARRIER`, or
    /// `+CME ERROR:<n>` (numeric surfaced verbatim).
    Ok,
    /// The `> ` prompt a data-mode command emits when it wants raw bytes.
    DataPrompt,
    /// Landmark + gap + terminator. With no explicit terminator, falls
    /// back to the [`Parser::Ok`] recognition set after the landmark.
    Default {
        preamble: &'static str,
        preamble_reqd: bool,
        min_gap: u8,
        terminator: Option<&'static str>,
    },
    /// Landmark + terminator with a minimum delimited-token count between
    /// them.
    Token {
        preamble: &'static str,
        delimiter: u8,
        min_tokens: u8,
        terminator: &'static str,
    },
    /// Landmark followed by comma-separated fields; the field at
    /// `value_index` is the numeric verdict. `0` maps to success, values
    /// under 100 are rebased onto [`ResultCode::CUSTOM_BASE`], the rest
    /// pass through.
    ServiceResponse {
        preamble: &'static str,
        value_index: u8,
    },
}

/// What a parser pass concluded. `end` is the index one past the consumed
/// region, so trailing bytes can be re-examined for URCs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ParseOutcome {
    Pending,
    Done { code: ResultCode, end: usize },
}

impl Parser {
    pub(crate) fn parse(&self, resp: &[u8]) -> ParseOutcome {
        match *self {
            Parser::Ok => default_parse(resp, "", false, 0, None),
            Parser::DataPrompt => match ascii::find(resp, b"> ") {
                Some(_) => ParseOutcome::Done {
                    code: ResultCode::SUCCESS,
                    end: resp.len(),
                },
                None => ParseOutcome::Pending,
            },
            Parser::Default {
                preamble,
                preamble_reqd,
                min_gap,
                terminator,
            } => default_parse(resp, preamble, preamble_reqd, min_gap, terminator),
            Parser::Token {
                preamble,
                delimiter,
                min_tokens,
                terminator,
            } => token_parse(resp, preamble, delimiter, min_tokens, terminator),
            Parser::ServiceResponse {
                preamble,
                value_index,
            } => service_parse(resp, preamble, value_index),
        }
    }
}

fn default_parse(
    resp: &[u8],
    preamble: &str,
    preamble_reqd: bool,
    min_gap: u8,
    terminator: Option<&'static str>,
) -> ParseOutcome {
    let pre = preamble.as_bytes();
    let search_from = if pre.is_empty() {
        0
    } else {
        match ascii::find(resp, pre) {
            Some(p) => p + pre.len(),
            None if preamble_reqd => return ParseOutcome::Pending,
            None => 0,
        }
    };
    let tail = &resp[search_from..];
    let min_gap = usize::from(min_gap);

    if let Some(term) = terminator {
        // Explicit terminator: nothing else completes this command.
        return match ascii::find(tail, term.as_bytes()) {
            Some(gap) => {
                let end = search_from + gap + term.len();
                let code = if gap >= min_gap {
                    ResultCode::SUCCESS
                } else {
                    ResultCode::ERROR
                };
                ParseOutcome::Done { code, end }
            }
            None => ParseOutcome::Pending,
        };
    }

    // No terminator given: standard AT result set.
    if let Some(gap) = ascii::find(tail, b"OK\r\n") {
        let end = search_from + gap + 4;
        let code = if gap >= min_gap {
            ResultCode::SUCCESS
        } else {
            ResultCode::ERROR
        };
        return ParseOutcome::Done { code, end };
    }
    if let Some(p) = ascii::find(tail, b"+CME ERROR:") {
        let mut at = p + 11;
        while tail.get(at) == Some(&b' ') {
            at += 1;
        }
        // Wait for the numeric to be delimited so a chunk boundary can't
        // truncate it.
        if let Some((value, digits_end)) = ascii::parse_decimal(tail, at) {
            if digits_end < tail.len() {
                return ParseOutcome::Done {
                    code: ResultCode(value as u16),
                    end: search_from + digits_end,
                };
            }
        }
        return ParseOutcome::Pending;
    }
    for (pat, skip) in [
        (&b"ERROR\r\n"[..], 7),
        (&b"FAIL\r\n"[..], 6),
        (&b"NO CARRIER\r\n"[..], 12),
    ] {
        if let Some(p) = ascii::find(tail, pat) {
            return ParseOutcome::Done {
                code: ResultCode::ERROR,
                end: search_from + p + skip,
            };
        }
    }
    ParseOutcome::Pending
}

fn token_parse(
    resp: &[u8],
    preamble: &str,
    delimiter: u8,
    min_tokens: u8,
    terminator: &str,
) -> ParseOutcome {
    let term = terminator.as_bytes();
    let Some(term_at) = ascii::find(resp, term) else {
        // Terminator absent; a CME error still completes the command.
        if let Some(p) = ascii::find(resp, b"+CME ERROR:") {
            if let Some((value, end)) = ascii::parse_decimal(resp, p + 11) {
                if end < resp.len() {
                    return ParseOutcome::Done {
                        code: ResultCode(value as u16),
                        end,
                    };
                }
            }
        }
        return ParseOutcome::Pending;
    };
    let end = term_at + term.len();

    let Some(pre_at) = ascii::find(resp, preamble.as_bytes()) else {
        return ParseOutcome::Done {
            code: ResultCode::NOT_FOUND,
            end,
        };
    };
    let fields_start = pre_at + preamble.len();
    if fields_start >= term_at {
        return ParseOutcome::Done {
            code: ResultCode::NOT_FOUND,
            end,
        };
    }

    let delims = resp[fields_start..term_at]
        .iter()
        .filter(|&&b| b == delimiter)
        .count();
    let code = if delims + 1 >= usize::from(min_tokens) {
        ResultCode::SUCCESS
    } else {
        ResultCode::NOT_FOUND
    };
    ParseOutcome::Done { code, end }
}

fn service_parse(resp: &[u8], preamble: &str, value_index: u8) -> ParseOutcome {
    let Some(pre_at) = ascii::find(resp, preamble.as_bytes()) else {
        return ParseOutcome::Pending;
    };
    let at = pre_at + preamble.len();
    let Some(value_at) =
        ascii::skip_fields(resp, at, b',', usize::from(value_index))
    else {
        return ParseOutcome::Pending;
    };
    let Some((value, end)) = ascii::parse_decimal(resp, value_at) else {
        return ParseOutcome::Pending;
    };
    if end >= resp.len() {
        // The digits run to the end of the buffer; a later chunk could
        // extend them.
        return ParseOutcome::Pending;
    }
    let code = if value == 0 {
        ResultCode::SUCCESS
    } else if value < 100 {
        ResultCode((i32::from(ResultCode::CUSTOM_BASE) + value) as u16)
    } else {
        ResultCode(value as u16)
    };
    ParseOutcome::Done { code, end }
}

////////////////////////////////////////////////////////////////////////////////

/// Who is holding the action lock. The IRD pipeline holds it across an
/// entire socket drain; the watchdog in `sockets_do_work` uses this to
/// recover a drain whose response never came.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ActionOwner {
    App,
    IrdPipeline,
}

/// Diagnostic record of the last failed action.
#[derive(Debug)]
pub struct ActionHistory {
    pub cmd: String<HISTORY_CMD_SIZE>,
    pub response: String<HISTORY_RESPONSE_SIZE>,
    pub duration_ms: u32,
    pub code: ResultCode,
}

/// The singleton outstanding-command slot. `is_open` is the lock.
pub(crate) struct ActionSlot {
    pub is_open: bool,
    pub owner: ActionOwner,
    pub cmd: String<ACTION_CMD_SIZE>,
    pub invoked_at: u32,
    pub timeout_ms: u16,
    pub parser: Parser,
    pub result: ResultCode,
    pub history: Option<ActionHistory>,
}

impl ActionSlot {
    pub const fn new() -> Self {
        Self {
            is_open: false,
            owner: ActionOwner::App,
            cmd: String::new(),
            invoked_at: 0,
            timeout_ms: ACTION_DEFAULT_TIMEOUT_MS,
            parser: Parser::Ok,
            result: ResultCode::PENDING,
            history: None,
        }
    }
}

/// Status and response view returned by [`Ltem::action_await_result`].
pub struct ActionResult<'a> {
    pub code: ResultCode,
    pub response: &'a [u8],
}

pub(crate) fn timer_expired(now: u32, started: u32, timeout_ms: u16) -> bool {
    now.wrapping_sub(started) >= u32::from(timeout_ms)
}

/// Truncating copy into a fixed-capacity string; AT traffic is ASCII so
/// slicing at the capacity is safe.
pub(crate) fn copy_truncated<const N: usize>(dst: &mut String<N>, src: &str) {
    dst.clear();
    let take = src.len().min(N);
    if let Some(s) = src.get(..take) {
        let _ = dst.push_str(s);
    }
}

fn copy_truncated_bytes<const N: usize>(dst: &mut String<N>, src: &[u8]) {
    dst.clear();
    let take = src.len().min(N);
    if let Ok(s) = core::str::from_utf8(&src[..take]) {
        let _ = dst.push_str(s);
    }
}

////////////////////////////////////////////////////////////////////////////////

impl<P: Platform> Ltem<P> {
    /// Invokes `cmd` with default retries, timeout, and the standard OK
    /// parser. Returns false if the lock could not be obtained or the
    /// command did not fit in the TX ring.
    pub fn action_try_invoke(&mut self, cmd: &str) -> bool {
        self.action_try_invoke_adv(
            cmd,
            ACTION_DEFAULT_RETRIES,
            ACTION_DEFAULT_TIMEOUT_MS,
            Parser::Ok,
        )
    }

    /// Invokes `cmd` with caller-specified lock retries, completion
    /// timeout, and parser.
    pub fn action_try_invoke_adv(
        &mut self,
        cmd: &str,
        retries: u8,
        timeout_ms: u16,
        parser: Parser,
    ) -> bool {
        if !self.action_acquire(cmd, retries) {
            ringbuf_entry!(Trace::LockBusy);
            return false;
        }
        self.action.timeout_ms = if timeout_ms == 0 {
            ACTION_DEFAULT_TIMEOUT_MS
        } else {
            timeout_ms
        };
        self.action.parser = parser;
        self.action.invoked_at = self.platform.now_ms();

        ringbuf_entry!(Trace::Invoke);
        if !self.tx_send(cmd.as_bytes(), true) || !self.tx_send(b"\r", false) {
            // Nothing partial went out; tx_send is all-or-nothing per call
            // and the command bytes preceded the CR.
            self.action.is_open = false;
            return false;
        }
        true
    }

    /// Sends raw payload bytes as a sub-action of the open command (after
    /// a data prompt), switching the completion parser and timeout.
    pub fn action_send_raw(
        &mut self,
        data: &[u8],
        timeout_ms: u16,
        parser: Option<Parser>,
    ) {
        if timeout_ms > 0 {
            self.action.timeout_ms = timeout_ms;
        }
        self.action.parser = parser.unwrap_or(Parser::Ok);
        self.action.invoked_at = self.platform.now_ms();
        let _ = self.tx_send(data, false);
    }

    /// As [`Self::action_send_raw`], appending an end-of-transmission
    /// phrase (e.g. Ctrl-Z for MQTT publish payloads).
    pub fn action_send_raw_with_eot(
        &mut self,
        data: &[u8],
        eot: &[u8],
        timeout_ms: u16,
        parser: Option<Parser>,
    ) {
        if timeout_ms > 0 {
            self.action.timeout_ms = timeout_ms;
        }
        self.action.parser = parser.unwrap_or(Parser::Ok);
        self.action.invoked_at = self.platform.now_ms();
        if self.tx_send(data, true) {
            let _ = self.tx_send(eot, false);
        }
    }

    /// Polls for completion, yielding between passes, until the command
    /// resolves, times out, or a cancellation request arrives.
    pub fn action_await_result(&mut self, close: bool) -> ActionResult<'_> {
        let code = loop {
            if self.cancellation_request {
                self.cancellation_request = false;
                self.action.is_open = false;
                self.action.result = ResultCode::CANCELLED;
                ringbuf_entry!(Trace::Cancelled);
                break ResultCode::CANCELLED;
            }
            let code = self.action_get_result(close);
            if !code.is_pending() {
                break code;
            }
            self.yield_now();
        };
        ActionResult {
            code,
            response: self.cmd.response(),
        }
    }

    /// Single completion-check pass: runs the parser over unconsumed
    /// response bytes and applies the deadline.
    pub fn action_get_result(&mut self, close: bool) -> ResultCode {
        self.recv_do_work();

        if !self.action.is_open {
            return self.action.result;
        }

        if !self.cmd.pending().is_empty() {
            let outcome = self.action.parser.parse(self.cmd.pending());
            if let ParseOutcome::Done { code, end } = outcome {
                self.cmd.consume(end);
                if !self.cmd.pending().is_empty() {
                    // URCs rode in behind the command response; don't lose
                    // them.
                    self.scan_trailing_urcs();
                }
                ringbuf_entry!(Trace::Complete(code.0));
                self.action.result = code;
                if !code.is_success() {
                    self.record_history();
                }
                if close {
                    self.action.is_open = false;
                }
                return code;
            }
        }

        if timer_expired(
            self.platform.now_ms(),
            self.action.invoked_at,
            self.action.timeout_ms,
        ) {
            ringbuf_entry!(Trace::Timeout);
            self.action.result = ResultCode::TIMEOUT;
            self.record_history();
            // A timed-out action always releases the lock; partial bytes
            // stay in the buffer for the deferred parser.
            self.action.is_open = false;
            return ResultCode::TIMEOUT;
        }

        ResultCode::PENDING
    }

    /// Releases the action lock.
    pub fn action_close(&mut self) {
        self.action.is_open = false;
    }

    /// The response bytes accumulated for the current (or last) command.
    pub fn action_response(&self) -> &[u8] {
        self.cmd.response()
    }

    /// The last failed action, for post-mortem. Only non-success outcomes
    /// are recorded.
    pub fn last_action_history(&self) -> Option<&ActionHistory> {
        self.action.history.as_ref()
    }

    /// Attempts to take the lock, spinning `retries` times at the retry
    /// interval. On success the slot and the command response buffer are
    /// reset for the new command.
    pub(crate) fn action_acquire(&mut self, cmd: &str, retries: u8) -> bool {
        if self.action.is_open {
            if retries == 0 {
                return false;
            }
            let mut remaining = retries;
            while self.action.is_open {
                remaining -= 1;
                if remaining == 0 {
                    return false;
                }
                self.platform.delay_ms(ACTION_RETRY_INTERVAL_MS);
                self.yield_now();
            }
        }

        self.action.is_open = true;
        self.action.owner = ActionOwner::App;
        copy_truncated(&mut self.action.cmd, cmd);
        self.action.result = ResultCode::PENDING;
        self.action.invoked_at = self.platform.now_ms();
        self.action.timeout_ms = ACTION_DEFAULT_TIMEOUT_MS;
        self.action.parser = Parser::Ok;
        self.cmd.reset();
        true
    }

    fn record_history(&mut self) {
        let mut h = ActionHistory {
            cmd: String::new(),
            response: String::new(),
            duration_ms: self
                .platform
                .now_ms()
                .wrapping_sub(self.action.invoked_at),
            code: self.action.result,
        };
        copy_truncated(&mut h.cmd, self.action.cmd.as_str());
        copy_truncated_bytes(&mut h.response, self.cmd.response());
        self.action.history = Some(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(code: u16, end: usize) -> ParseOutcome {
        ParseOutcome::Done {
            code: ResultCode(code),
            end,
        }
    }

    #[test]
    fn ok_parser_single_pass() {
        // A bare OK with no body completes in one pass.
        assert_eq!(Parser::Ok.parse(b"\r\nOK\r\n"), done(200, 6));
        assert_eq!(Parser::Ok.parse(b"\r\nO"), ParseOutcome::Pending);
    }

    #[test]
    fn ok_parser_error_set() {
        assert_eq!(Parser::Ok.parse(b"\r\nERROR\r\n"), done(500, 9));
        assert_eq!(Parser::Ok.parse(b"\r\nFAIL\r\n"), done(500, 8));
        assert_eq!(Parser::Ok.parse(b"\r\nNO CARRIER\r\n"), done(500, 14));
    }

    #[test]
    fn cme_numeric_passes_through() {
        // BGx CME codes are surfaced verbatim.
        assert_eq!(
            Parser::Ok.parse(b"\r\n+CME ERROR: 923\r\n"),
            done(923, 17)
        );
        // Digits at the buffer edge could still be extended by the next
        // chunk: hold off.
        assert_eq!(
            Parser::Ok.parse(b"\r\n+CME ERROR: 92"),
            ParseOutcome::Pending
        );
    }

    #[test]
    fn default_parser_landmark_and_gap() {
        let p = Parser::Default {
            preamble: "+ICCID: ",
            preamble_reqd: true,
            min_gap: 20,
            terminator: Some("OK\r\n"),
        };
        let full = b"\r\n+ICCID: 89012345678901234567\r\n\r\nOK\r\n";
        assert_eq!(p.parse(full), done(200, full.len()));
        // Without the landmark nothing completes.
        assert_eq!(p.parse(b"\r\nOK\r\n"), ParseOutcome::Pending);
        // Landmark present but gap too small: completes as an error.
        let short = b"\r\n+ICCID: 1\r\nOK\r\n";
        assert_eq!(p.parse(short), done(500, short.len()));
    }

    #[test]
    fn default_parser_consumes_through_terminator_only() {
        let p = Parser::Default {
            preamble: "",
            preamble_reqd: false,
            min_gap: 0,
            terminator: None,
        };
        let resp = b"\r\nOK\r\n\r\n+QIURC: \"recv\",2\r\n";
        assert_eq!(p.parse(resp), done(200, 6));
    }

    #[test]
    fn token_parser_counts_delimiters() {
        let p = Parser::Token {
            preamble: "+QISTATE: ",
            delimiter: b',',
            min_tokens: 5,
            terminator: "OK\r\n",
        };
        let resp =
            b"\r\n+QISTATE: 0,\"TCP\",\"1.2.3.4\",4242,0,2\r\n\r\nOK\r\n";
        assert_eq!(p.parse(resp), done(200, resp.len()));

        let sparse = b"\r\n+QISTATE: 0,2\r\n\r\nOK\r\n";
        assert_eq!(p.parse(sparse), done(404, sparse.len()));
    }

    #[test]
    fn service_response_mapping() {
        let p = Parser::ServiceResponse {
            preamble: "+QMTOPEN: ",
            value_index: 1,
        };
        assert_eq!(p.parse(b"\r\n+QMTOPEN: 5,0\r\n"), done(200, 15));
        // Values under 100 are rebased onto CUSTOM_BASE.
        assert_eq!(p.parse(b"\r\n+QMTOPEN: 5,2\r\n"), done(902, 15));
        // Including the BGx convention of -1 for "failed to open".
        assert_eq!(p.parse(b"\r\n+QMTOPEN: 5,-1\r\n"), done(899, 16));
        // 100+ passes through.
        assert_eq!(p.parse(b"\r\n+QMTOPEN: 5,563\r\n"), done(563, 17));
        // Value field not yet arrived.
        assert_eq!(p.parse(b"\r\n+QMTOPEN: 5,"), ParseOutcome::Pending);
    }

    #[test]
    fn data_prompt() {
        assert_eq!(Parser::DataPrompt.parse(b"\r\n> "), done(200, 4));
        assert_eq!(Parser::DataPrompt.parse(b"\r\n>"), ParseOutcome::Pending);
    }

    #[test]
    fn interval_timer_wraps() {
        assert!(timer_expired(150, 50, 100));
        assert!(!timer_expired(149, 50, 100));
        // Clock wrap across u32::MAX.
        assert!(timer_expired(49, u32::MAX - 50, 100));
    }
}
