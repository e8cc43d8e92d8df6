// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::time::Duration;

use crate::Settings;

/// Tunables for one connection engine. The transport layer builds this once
/// and shares it across connections behind an `Arc`.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// The settings we announce to the peer.
    pub local_settings: Settings,

    /// Bound on each stream's outbound queue: an application producing
    /// response messages faster than the peer consumes DATA waits here.
    pub outbound_queue_capacity: usize,

    /// Once a stream's inbound queue holds more than this many undelivered
    /// messages, flow-control credit for that stream is withheld until the
    /// application drains it.
    pub inbound_high_water: usize,

    /// Put the HTTP/2 stream id into the ASGI scope. Off by default, since
    /// it is an extension beyond the standard scope shape.
    pub expose_stream_id: bool,

    /// How long the peer gets to send its initial SETTINGS after the
    /// connection preface.
    pub handshake_timeout: Duration,

    /// Idle period after which the engine sends a PING. Three unanswered
    /// pings end the connection.
    pub ping_interval: Duration,

    /// After a fatal error triggers GOAWAY, in-flight streams get this long
    /// to finish writing before the transport is dropped.
    pub goaway_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_settings: Settings {
                max_concurrent_streams: 128,
                ..Default::default()
            },
            outbound_queue_capacity: 16,
            inbound_high_water: 16,
            expose_stream_id: false,
            handshake_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(15),
            goaway_grace: Duration::from_secs(5),
        }
    }
}
