// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry of active data streams.
//!
//! Each stream binds a modem data-context id (a socket connect id, or the
//! fixed MQTT connect id) to the protocol handler that owns its traffic.
//! The do-work dispatcher runs a pipeline pass only for stream kinds that
//! are actually registered, and URC-driven work never touches a protocol
//! that has nothing open.

/// Protocol handler kinds a stream can be bound to. `File` is the
/// integration point for the filesystem wrapper, which lives outside this
/// crate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamKind {
    Sockets,
    Mqtt,
    File,
}

#[derive(Copy, Clone, Debug)]
struct StreamSlot {
    context: u8,
    kind: StreamKind,
}

const STREAM_SLOTS: usize = 6;

pub(crate) struct StreamRegistry {
    slots: [Option<StreamSlot>; STREAM_SLOTS],
}

impl StreamRegistry {
    pub const fn new() -> Self {
        Self {
            slots: [None; STREAM_SLOTS],
        }
    }

    /// Binds `context` to `kind`. A context can be registered once; a
    /// duplicate (or a full table) is refused.
    pub fn register(&mut self, context: u8, kind: StreamKind) -> bool {
        if self.find(context).is_some() {
            return false;
        }
        for slot in &mut self.slots {
            if slot.is_none() {
                *slot = Some(StreamSlot { context, kind });
                return true;
            }
        }
        false
    }

    pub fn deregister(&mut self, context: u8) {
        for slot in &mut self.slots {
            if matches!(slot, Some(s) if s.context == context) {
                *slot = None;
            }
        }
    }

    pub fn find(&self, context: u8) -> Option<StreamKind> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.context == context)
            .map(|s| s.kind)
    }

    pub fn has_kind(&self, kind: StreamKind) -> bool {
        self.slots.iter().flatten().any(|s| s.kind == kind)
    }

    pub fn clear(&mut self) {
        self.slots = [None; STREAM_SLOTS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_find_deregister() {
        let mut reg = StreamRegistry::new();
        assert!(reg.register(0, StreamKind::Sockets));
        assert!(reg.register(5, StreamKind::Mqtt));

        assert_eq!(reg.find(0), Some(StreamKind::Sockets));
        assert_eq!(reg.find(5), Some(StreamKind::Mqtt));
        assert!(reg.has_kind(StreamKind::Mqtt));
        assert!(!reg.has_kind(StreamKind::File));

        reg.deregister(5);
        assert_eq!(reg.find(5), None);
        assert!(!reg.has_kind(StreamKind::Mqtt));
    }

    #[test]
    fn duplicate_context_refused() {
        let mut reg = StreamRegistry::new();
        assert!(reg.register(1, StreamKind::Sockets));
        assert!(!reg.register(1, StreamKind::File));
    }

    #[test]
    fn table_capacity() {
        let mut reg = StreamRegistry::new();
        for ctx in 0..STREAM_SLOTS as u8 {
            assert!(reg.register(ctx, StreamKind::Sockets));
        }
        assert!(!reg.register(9, StreamKind::File));
        reg.deregister(3);
        assert!(reg.register(9, StreamKind::File));
    }
}
