// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Stream state, flow-control accounting, and the per-connection stream
//! registry.
//!
//! # References
//! * [RFC 9113 - Section 5.1. Stream States](https://httpwg.org/specs/rfc9113.html#StreamStates)
//! * [RFC 9113 - Section 5.2. Flow Control](https://httpwg.org/specs/rfc9113.html#FlowControl)

use crate::{
    ConnectionError,
    ErrorCode,
    settings::MAXIMUM_FLOW_CONTROL_WINDOW_SIZE,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

impl StreamId {
    pub const CONTROL: StreamId = StreamId(0);

    /// Client-initiated streams carry odd identifiers.
    pub const fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }
}

/// A stream's position in the dependency tree. The engine records
/// priorities but does not schedule writes by them.
///
/// `weight` is the wire octet; the effective weight is `weight + 1`
/// (1 through 256).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Priority {
    pub depends_on: StreamId,
    pub weight: u8,
    pub exclusive: bool,
}

impl Default for Priority {
    fn default() -> Self {
        // Default dependency: the root, weight 16.
        Self {
            depends_on: StreamId::CONTROL,
            weight: 15,
            exclusive: false,
        }
    }
}

impl Priority {
    pub const fn effective_weight(&self) -> u16 {
        self.weight as u16 + 1
    }
}

/// Defines the state of a stream, as transitioned according to the rules of
/// HTTP/2.
///
/// # References
/// * [RFC 9113 Section 5](https://httpwg.org/specs/rfc9113.html#StreamsLayer)
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    /// The initial state of a stream, before any frames have been sent or
    /// received.
    Idle,

    /// Promised by us via PUSH_PROMISE. Unreachable while push is disabled;
    /// kept so the transition table is total.
    ReservedLocal,

    /// Promised by the peer via PUSH_PROMISE.
    ReservedRemote,

    /// HEADERS have been received and the peer may still send more frames.
    Open,

    /// We sent our END_STREAM; the peer may still send.
    HalfClosedLocal,

    /// The peer sent its END_STREAM; we may still send.
    HalfClosedRemote,

    /// Fully terminated.
    Closed,
}

impl StreamState {
    /// Whether this stream counts against SETTINGS_MAX_CONCURRENT_STREAMS.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal | Self::HalfClosedRemote)
    }

    pub const fn may_receive_data(&self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }

    pub const fn may_send_data(&self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedRemote)
    }
}

/// One stream's protocol bookkeeping. The request/response plumbing lives
/// with the bridge, keyed by the same id, so dropping a stream here never
/// pins application state.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub state: StreamState,
    pub recv_window: i32,
    pub send_window: i32,
    pub priority: Priority,
    pub headers_complete: bool,
}

impl Stream {
    fn new(id: StreamId, recv_window: i32, send_window: i32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            recv_window,
            send_window,
            priority: Priority::default(),
            headers_complete: false,
        }
    }

    /// The peer finished its side of the stream (END_STREAM received).
    pub fn receive_end_of_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// We finished our side of the stream (END_STREAM sent).
    pub fn send_end_of_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }
}

/// The per-connection stream registry, together with the connection-level
/// flow-control windows. Everything here is touched only from the engine
/// task.
pub struct StreamTable {
    streams: hashbrown::HashMap<StreamId, Stream>,
    /// Initial send window for new streams, from the peer's
    /// SETTINGS_INITIAL_WINDOW_SIZE.
    initial_send_window: i32,
    /// Initial receive window for new streams, from our own settings.
    initial_recv_window: i32,
    pub connection_send_window: i32,
    pub connection_recv_window: i32,
    highest_peer_stream_id: StreamId,
}

impl StreamTable {
    pub fn new(initial_recv_window: u32) -> Self {
        Self {
            streams: Default::default(),
            initial_send_window: 65_535,
            initial_recv_window: initial_recv_window as i32,
            connection_send_window: 65_535,
            connection_recv_window: 65_535,
            highest_peer_stream_id: StreamId::CONTROL,
        }
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    pub fn highest_peer_stream_id(&self) -> StreamId {
        self.highest_peer_stream_id
    }

    pub fn active_count(&self) -> usize {
        self.streams.values().filter(|stream| stream.state.is_active()).count()
    }

    /// Open a peer-initiated stream on its first HEADERS frame.
    ///
    /// # References
    /// * [RFC 9113 - Section 5.1.1. Stream Identifiers](https://httpwg.org/specs/rfc9113.html#StreamIdentifiers)
    /// * [RFC 9113 - Section 5.1.2. Stream Concurrency](https://httpwg.org/specs/rfc9113.html#rfc.section.5.1.2)
    pub fn open_peer_stream(&mut self, stream_id: StreamId, max_concurrent: u32)
            -> Result<&mut Stream, ConnectionError> {
        if !stream_id.is_client_initiated() {
            return Err(ConnectionError::connection(
                ErrorCode::ProtocolError,
                "HEADERS on a non-client stream (stream ID is even)",
            ));
        }

        if stream_id.0 <= self.highest_peer_stream_id.0 {
            return Err(ConnectionError::connection(
                ErrorCode::ProtocolError,
                "new stream IDs must be greater than all previously initiated streams",
            ));
        }

        self.highest_peer_stream_id = stream_id;

        if self.active_count() >= max_concurrent as usize {
            // The stream id is consumed but no state changes; the peer may
            // retry it on another connection.
            return Err(ConnectionError::stream(ErrorCode::RefusedStream, stream_id));
        }

        // A priority record may already exist for a stream that has never
        // carried frames; opening it keeps that record.
        let initial_recv = self.initial_recv_window;
        let initial_send = self.initial_send_window;
        let stream = self.streams.entry(stream_id)
            .or_insert_with(|| Stream::new(stream_id, initial_recv, initial_send));
        stream.state = StreamState::Open;
        Ok(stream)
    }

    /// Whether a peer stream id refers to a stream that has never carried
    /// frames, as opposed to one that was opened and has since closed.
    pub fn is_idle(&self, stream_id: StreamId) -> bool {
        match self.streams.get(&stream_id) {
            Some(stream) => stream.state == StreamState::Idle,
            None => stream_id.0 > self.highest_peer_stream_id.0,
        }
    }

    /// Account for received DATA. `len` is the payload after padding has
    /// been stripped.
    pub fn receive_data(&mut self, stream_id: StreamId, len: usize, end_stream: bool)
            -> Result<(), ConnectionError> {
        self.connection_recv_window -= len as i32;
        if self.connection_recv_window < 0 {
            return Err(ConnectionError::connection(
                ErrorCode::FlowControlError,
                "connection flow-control window exceeded",
            ));
        }

        let idle = self.is_idle(stream_id);
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            if idle {
                return Err(ConnectionError::connection(
                    ErrorCode::ProtocolError,
                    "DATA on an idle stream",
                ));
            }
            // Recently closed: the peer may not have seen the reset yet.
            return Err(ConnectionError::stream(ErrorCode::StreamClosed, stream_id));
        };

        if stream.state == StreamState::Idle {
            return Err(ConnectionError::connection(
                ErrorCode::ProtocolError,
                "DATA on an idle stream",
            ));
        }

        if !stream.state.may_receive_data() {
            return Err(ConnectionError::stream(ErrorCode::StreamClosed, stream_id));
        }

        stream.recv_window -= len as i32;
        if stream.recv_window < 0 {
            return Err(ConnectionError::connection(
                ErrorCode::FlowControlError,
                "stream flow-control window exceeded",
            ));
        }

        if end_stream {
            stream.receive_end_of_stream();
        }

        Ok(())
    }

    /// Replenish our receive window after the engine hands credit back to
    /// the peer with a WINDOW_UPDATE.
    pub fn replenish_recv_window(&mut self, stream_id: StreamId, credit: i32) {
        if stream_id == StreamId::CONTROL {
            self.connection_recv_window += credit;
        } else if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.recv_window += credit;
        }
    }

    /// Apply a WINDOW_UPDATE from the peer.
    pub fn receive_window_update(&mut self, stream_id: StreamId, increment: u32)
            -> Result<(), ConnectionError> {
        if stream_id == StreamId::CONTROL {
            let updated = self.connection_send_window as i64 + increment as i64;
            if updated > MAXIMUM_FLOW_CONTROL_WINDOW_SIZE as i64 {
                return Err(ConnectionError::connection(
                    ErrorCode::FlowControlError,
                    "connection send window overflow",
                ));
            }
            self.connection_send_window = updated as i32;
            return Ok(());
        }

        if self.is_idle(stream_id) {
            return Err(ConnectionError::connection(
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE on an idle stream",
            ));
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            // Recently closed and forgotten: ignore.
            return Ok(());
        };

        let updated = stream.send_window as i64 + increment as i64;
        if updated > MAXIMUM_FLOW_CONTROL_WINDOW_SIZE as i64 {
            return Err(ConnectionError::stream(ErrorCode::FlowControlError, stream_id));
        }
        stream.send_window = updated as i32;
        Ok(())
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE changed by `delta`: adjust the send
    /// window of every existing stream, retroactively.
    ///
    /// # References
    /// * [RFC 9113 - Section 6.9.2](https://httpwg.org/specs/rfc9113.html#InitialWindowSize)
    pub fn apply_send_window_delta(&mut self, delta: i32) -> Result<(), ConnectionError> {
        self.initial_send_window = self.initial_send_window.saturating_add(delta);
        for stream in self.streams.values_mut() {
            let updated = stream.send_window as i64 + delta as i64;
            if updated > MAXIMUM_FLOW_CONTROL_WINDOW_SIZE as i64 {
                return Err(ConnectionError::connection(
                    ErrorCode::FlowControlError,
                    "INITIAL_WINDOW_SIZE pushed a stream window past its maximum",
                ));
            }
            stream.send_window = updated as i32;
        }
        Ok(())
    }

    /// The number of DATA payload bytes we may currently send on a stream.
    pub fn send_capacity(&self, stream_id: StreamId) -> usize {
        let Some(stream) = self.streams.get(&stream_id) else {
            return 0;
        };

        if !stream.state.may_send_data() {
            return 0;
        }

        stream.send_window.min(self.connection_send_window).max(0) as usize
    }

    /// Account for DATA we wrote to the peer.
    pub fn consume_send_window(&mut self, stream_id: StreamId, len: usize) {
        self.connection_send_window -= len as i32;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send_window -= len as i32;
        }
    }

    /// Record a PRIORITY update. With the exclusive flag set, every stream
    /// that currently depends on the new parent is reparented onto this
    /// stream first.
    ///
    /// # References
    /// * [RFC 7540 - Section 5.3.1. Stream Dependencies](https://httpwg.org/specs/rfc7540.html#StreamPriority)
    pub fn set_priority(&mut self, stream_id: StreamId, priority: Priority)
            -> Result<(), ConnectionError> {
        if priority.depends_on == stream_id {
            return Err(ConnectionError::stream(ErrorCode::ProtocolError, stream_id));
        }

        if priority.exclusive {
            for stream in self.streams.values_mut() {
                if stream.id != stream_id && stream.priority.depends_on == priority.depends_on {
                    stream.priority.depends_on = stream_id;
                }
            }
        }

        // PRIORITY may arrive for a stream in any state, idle included.
        let initial_recv = self.initial_recv_window;
        let initial_send = self.initial_send_window;
        let stream = self.streams.entry(stream_id)
            .or_insert_with(|| Stream::new(stream_id, initial_recv, initial_send));
        stream.priority = priority;
        Ok(())
    }

    /// Transition a stream to closed, regardless of its current state.
    pub fn close(&mut self, stream_id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = StreamState::Closed;
        }
    }

    pub fn remove(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn open_stream(table: &mut StreamTable, id: u32) {
        table.open_peer_stream(StreamId(id), u32::MAX).unwrap();
    }

    #[test]
    fn test_open_assigns_initial_windows() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 1);

        let stream = table.get(StreamId(1)).unwrap();
        assert_eq!(stream.state, StreamState::Open);
        assert_eq!(stream.recv_window, 65_535);
        assert_eq!(stream.send_window, 65_535);
    }

    #[test]
    fn test_even_stream_id_is_rejected() {
        let mut table = StreamTable::new(65_535);
        assert!(matches!(
            table.open_peer_stream(StreamId(2), u32::MAX),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::ProtocolError, .. }),
        ));
    }

    #[test]
    fn test_stream_ids_must_increase() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 5);
        assert!(matches!(
            table.open_peer_stream(StreamId(3), u32::MAX),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::ProtocolError, .. }),
        ));
    }

    #[test]
    fn test_concurrency_limit_refuses_stream() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 1);
        open_stream(&mut table, 3);

        assert!(matches!(
            table.open_peer_stream(StreamId(5), 2),
            Err(ConnectionError::StreamError { error_code: ErrorCode::RefusedStream, stream_id: StreamId(5) }),
        ));

        // The refused stream changed nothing for its siblings.
        assert_eq!(table.active_count(), 2);
        assert_eq!(table.get(StreamId(1)).unwrap().state, StreamState::Open);
        assert_eq!(table.get(StreamId(3)).unwrap().state, StreamState::Open);
    }

    #[rstest]
    #[case(StreamState::Open, StreamState::HalfClosedRemote)]
    #[case(StreamState::HalfClosedLocal, StreamState::Closed)]
    fn test_receive_end_of_stream(#[case] from: StreamState, #[case] to: StreamState) {
        let mut stream = Stream::new(StreamId(1), 65_535, 65_535);
        stream.state = from;
        stream.receive_end_of_stream();
        assert_eq!(stream.state, to);
    }

    #[rstest]
    #[case(StreamState::Open, StreamState::HalfClosedLocal)]
    #[case(StreamState::HalfClosedRemote, StreamState::Closed)]
    fn test_send_end_of_stream(#[case] from: StreamState, #[case] to: StreamState) {
        let mut stream = Stream::new(StreamId(1), 65_535, 65_535);
        stream.state = from;
        stream.send_end_of_stream();
        assert_eq!(stream.state, to);
    }

    #[test]
    fn test_receive_data_consumes_both_windows() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 1);

        table.receive_data(StreamId(1), 1_000, false).unwrap();
        assert_eq!(table.get(StreamId(1)).unwrap().recv_window, 64_535);
        assert_eq!(table.connection_recv_window, 64_535);
    }

    #[test]
    fn test_receive_data_beyond_window_is_flow_control_error() {
        let mut table = StreamTable::new(16);
        open_stream(&mut table, 1);

        assert!(matches!(
            table.receive_data(StreamId(1), 17, false),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::FlowControlError, .. }),
        ));
    }

    #[test]
    fn test_receive_data_after_end_stream_is_stream_closed() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 1);
        table.receive_data(StreamId(1), 0, true).unwrap();

        assert!(matches!(
            table.receive_data(StreamId(1), 4, false),
            Err(ConnectionError::StreamError { error_code: ErrorCode::StreamClosed, stream_id: StreamId(1) }),
        ));
    }

    #[test]
    fn test_window_update_overflow() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 1);

        assert!(table.receive_window_update(StreamId(1), 0x7FFF_FFFF - 65_535).is_ok());
        assert!(matches!(
            table.receive_window_update(StreamId(1), 1),
            Err(ConnectionError::StreamError { error_code: ErrorCode::FlowControlError, .. }),
        ));

        assert!(matches!(
            table.receive_window_update(StreamId::CONTROL, 0x7FFF_FFFF),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::FlowControlError, .. }),
        ));
    }

    #[test]
    fn test_initial_window_delta_applies_to_existing_streams() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 1);
        table.consume_send_window(StreamId(1), 100);

        table.apply_send_window_delta(-65_531).unwrap();
        assert_eq!(table.get(StreamId(1)).unwrap().send_window, 65_535 - 100 - 65_531);

        table.apply_send_window_delta(65_531).unwrap();
        assert_eq!(table.get(StreamId(1)).unwrap().send_window, 65_435);
    }

    #[test]
    fn test_send_capacity_is_min_of_windows() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 1);
        table.get_mut(StreamId(1)).unwrap().receive_end_of_stream();

        table.connection_send_window = 10;
        assert_eq!(table.send_capacity(StreamId(1)), 10);

        table.get_mut(StreamId(1)).unwrap().send_window = 4;
        assert_eq!(table.send_capacity(StreamId(1)), 4);

        table.get_mut(StreamId(1)).unwrap().send_window = -3;
        assert_eq!(table.send_capacity(StreamId(1)), 0);
    }

    #[test]
    fn test_priority_self_dependency_is_rejected() {
        let mut table = StreamTable::new(65_535);
        assert!(matches!(
            table.set_priority(StreamId(7), Priority { depends_on: StreamId(7), weight: 0, exclusive: false }),
            Err(ConnectionError::StreamError { error_code: ErrorCode::ProtocolError, .. }),
        ));
    }

    #[test]
    fn test_exclusive_priority_reparents_siblings() {
        let mut table = StreamTable::new(65_535);
        open_stream(&mut table, 1);
        open_stream(&mut table, 3);
        open_stream(&mut table, 5);

        // 1 and 3 depend on the root; 5 takes the root exclusively.
        table.set_priority(StreamId(5), Priority {
            depends_on: StreamId::CONTROL,
            weight: 31,
            exclusive: true,
        }).unwrap();

        assert_eq!(table.get(StreamId(1)).unwrap().priority.depends_on, StreamId(5));
        assert_eq!(table.get(StreamId(3)).unwrap().priority.depends_on, StreamId(5));
        assert_eq!(table.get(StreamId(5)).unwrap().priority.depends_on, StreamId::CONTROL);
        assert_eq!(table.get(StreamId(5)).unwrap().priority.effective_weight(), 32);
    }

    #[test]
    fn test_default_priority() {
        let priority = Priority::default();
        assert_eq!(priority.depends_on, StreamId::CONTROL);
        assert_eq!(priority.effective_weight(), 16);
        assert!(!priority.exclusive);
    }
}
