// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transmit byte ring between the foreground and the bridge ISR.
//!
//! The foreground is the only producer (`push`, inside `tx_send`) and the
//! ISR the only consumer (`pop_into`, from the THR-empty handler). The
//! capacity is a power of two so the free-running cursors can be masked
//! instead of divided. Callers serialize cursor updates by masking the
//! bridge IRQ around foreground access; the ring itself does no locking.

/// Ring capacity. Must be a power of two; sized to hold a maximum QISEND
/// payload plus the command framing around it.
pub const TX_RING_SIZE: usize = 2048;

pub struct TxRing {
    buf: [u8; TX_RING_SIZE],
    head: usize,
    tail: usize,
}

impl TxRing {
    pub const fn new() -> Self {
        Self {
            buf: [0; TX_RING_SIZE],
            head: 0,
            tail: 0,
        }
    }

    /// Bytes queued and not yet popped.
    pub fn available(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }

    /// Bytes that can be pushed without overflowing.
    pub fn free(&self) -> usize {
        TX_RING_SIZE - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Appends as much of `data` as fits, returning the accepted count.
    /// Callers that need all-or-nothing semantics check `free` first.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        for &b in &data[..n] {
            self.buf[self.head & (TX_RING_SIZE - 1)] = b;
            self.head = self.head.wrapping_add(1);
        }
        n
    }

    /// Removes up to `dst.len()` bytes into `dst`, returning the count.
    pub fn pop_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.available());
        for slot in &mut dst[..n] {
            *slot = self.buf[self.tail & (TX_RING_SIZE - 1)];
            self.tail = self.tail.wrapping_add(1);
        }
        n
    }

    pub fn clear(&mut self) {
        self.tail = self.head;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_state() {
        let ring = TxRing::new();
        assert!(ring.is_empty());
        assert_eq!(ring.free(), TX_RING_SIZE);
    }

    #[test]
    fn push_pop_order() {
        let mut ring = TxRing::new();
        assert_eq!(ring.push(b"AT+CSQ\r"), 7);
        assert_eq!(ring.available(), 7);

        let mut out = [0u8; 16];
        let n = ring.pop_into(&mut out);
        assert_eq!(&out[..n], b"AT+CSQ\r");
        assert!(ring.is_empty());
    }

    #[test]
    fn partial_pop_preserves_remainder() {
        let mut ring = TxRing::new();
        ring.push(b"AT+QIOPEN=1,0\r");

        let mut first = [0u8; 4];
        assert_eq!(ring.pop_into(&mut first), 4);
        assert_eq!(&first, b"AT+Q");

        let mut rest = [0u8; 16];
        let n = ring.pop_into(&mut rest);
        assert_eq!(&rest[..n], b"IOPEN=1,0\r");
    }

    #[test]
    fn fill_boundary() {
        let mut ring = TxRing::new();
        let chunk = [0x55u8; TX_RING_SIZE - 1];
        assert_eq!(ring.push(&chunk), TX_RING_SIZE - 1);

        // One byte of room left: accepts exactly one more, then rejects.
        assert_eq!(ring.push(b"x"), 1);
        assert_eq!(ring.push(b"y"), 0);
        assert_eq!(ring.free(), 0);
    }

    #[test]
    fn wraps_across_the_seam() {
        let mut ring = TxRing::new();
        let mut scratch = [0u8; 64];

        // Walk the cursors to eight bytes shy of the end of backing
        // storage, then push a block that straddles the wrap point.
        for _ in 0..(TX_RING_SIZE / 64) - 1 {
            ring.push(&[0; 64]);
            ring.pop_into(&mut scratch);
        }
        ring.push(&[0; 56]);
        ring.pop_into(&mut scratch[..56]);
        ring.push(b"wrap-around-payload");
        let mut out = [0u8; 32];
        let n = ring.pop_into(&mut out);
        assert_eq!(&out[..n], b"wrap-around-payload");
    }
}
