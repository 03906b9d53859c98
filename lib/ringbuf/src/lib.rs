// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for instrumenting the modem driver.
//!
//! A ring buffer records the last `N` trace entries deposited by a module,
//! for inspection with a debugger. Entries carry the source line that
//! recorded them and a wrapping generation counter so the most recent entry
//! can be found in a memory dump.
//!
//! Declare one per module with [`ringbuf!`], specifying the entry type, the
//! entry count, and an initializer:
//!
//! ```ignore
//! ringbuf!(Trace, 16, Trace::None);
//! ```
//!
//! and deposit entries with [`ringbuf_entry!`]:
//!
//! ```ignore
//! ringbuf_entry!(Trace::RxChunk(level));
//! ```
//!
//! Entries may be recorded from both the foreground and the interrupt
//! handler. A flag serializes access; if an interrupt lands while the
//! foreground is mid-record, the interrupt's entry is dropped rather than
//! corrupting the buffer. Tracing is best-effort by contract.
//!
//! Building with the `disabled` feature turns every buffer into a no-op
//! while keeping call sites compiling.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// One recorded trace entry.
#[derive(Copy, Clone, Debug)]
pub struct RingbufEntry<T: Copy> {
    pub line: u16,
    pub generation: u16,
    pub payload: T,
}

/// A fixed-capacity trace buffer. Instantiate through [`ringbuf!`], which
/// also provides the required `static` storage.
pub struct Ringbuf<T: Copy, const N: usize> {
    busy: AtomicBool,
    inner: UnsafeCell<Inner<T, N>>,
}

// Safety: all mutation goes through `record`, which claims `busy` first and
// bails out (dropping the entry) if the buffer is already claimed. At most
// one `&mut Inner` exists at a time.
unsafe impl<T: Copy + Send, const N: usize> Sync for Ringbuf<T, N> {}

struct Inner<T: Copy, const N: usize> {
    last: Option<usize>,
    entries: [RingbufEntry<T>; N],
}

impl<T: Copy, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            inner: UnsafeCell::new(Inner {
                last: None,
                entries: [RingbufEntry {
                    line: 0,
                    generation: 0,
                    payload: init,
                }; N],
            }),
        }
    }

    /// Deposits one entry, overwriting the oldest. Called via
    /// [`ringbuf_entry!`], which fills in `line`.
    pub fn record(&self, line: u16, payload: T) {
        if self.busy.swap(true, Ordering::Acquire) {
            // Re-entered from an interrupt mid-record; drop this entry.
            return;
        }
        // Safety: the `busy` claim above makes us the only accessor.
        let inner = unsafe { &mut *self.inner.get() };

        let ndx = match inner.last {
            Some(last) if last + 1 < N => last + 1,
            _ => 0,
        };
        let ent = &mut inner.entries[ndx];
        *ent = RingbufEntry {
            line,
            generation: ent.generation.wrapping_add(1),
            payload,
        };
        inner.last = Some(ndx);

        self.busy.store(false, Ordering::Release);
    }

    /// Copies out the most recent entry, if any have been recorded. Intended
    /// for tests; production access is via debugger.
    pub fn last_entry(&self) -> Option<RingbufEntry<T>> {
        if self.busy.swap(true, Ordering::Acquire) {
            return None;
        }
        // Safety: see `record`.
        let inner = unsafe { &mut *self.inner.get() };
        let e = inner.last.map(|ndx| inner.entries[ndx]);
        self.busy.store(false, Ordering::Release);
        e
    }
}

/// Declares a ring buffer in the current module.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a buffer named `NAME` holding `N`
/// entries of `Type`, initialized to `expr`. Omitting the name uses
/// `__RINGBUF`, the common one-per-module case.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::Ringbuf<$t, $n> = $crate::Ringbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        static $name: () = ();
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Deposits an entry in a ring buffer declared with [`ringbuf!`].
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($name:ident, $payload:expr) => {
        $name.record(line!() as u16, $payload);
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($name:ident, $payload:expr) => {
        let _ = &$payload;
    };
    ($payload:expr) => {
        let _ = &$payload;
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    ringbuf!(TRACE, u32, 4, 0);

    #[test]
    fn empty_buffer_has_no_last() {
        let rb = Ringbuf::<u32, 4>::new(0);
        assert!(rb.last_entry().is_none());
    }

    #[test]
    fn record_and_wrap() {
        let rb = Ringbuf::<u32, 4>::new(0);
        for v in 0..6u32 {
            rb.record(17, v);
        }
        // Six records into four slots: the last write landed in slot 1 on
        // its second generation.
        let last = rb.last_entry().unwrap();
        assert_eq!(last.payload, 5);
        assert_eq!(last.generation, 2);
        assert_eq!(last.line, 17);
    }

    #[test]
    fn macro_forms() {
        ringbuf_entry!(TRACE, 0xdead_beef);
        let last = TRACE.last_entry().unwrap();
        assert_eq!(last.payload, 0xdead_beef);
    }
}
