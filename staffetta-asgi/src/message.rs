// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The in-memory representation of ASGI messages. JSON is an external
//! encoding used by some application ecosystems; in-process, every message
//! is one variant of [`AsgiMessage`].
//!
//! # References
//! * [ASGI Specification - HTTP & WebSocket protocol](https://asgi.readthedocs.io/en/latest/specs/www.html)
//! * [ASGI Specification - Lifespan protocol](https://asgi.readthedocs.io/en/latest/specs/lifespan.html)

/// A single message exchanged between the protocol engine and an application
/// worker, in either direction.
///
/// The engine produces `HttpRequest` and `HttpDisconnect` onto a stream's
/// inbound queue; the application produces `HttpResponseStart` and
/// `HttpResponseBody` onto the outbound queue. The lifespan variants travel
/// over a process-wide channel that is distinct from any request stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsgiMessage {
    /// `http.request`: a chunk of the request body. The final chunk carries
    /// `more_body: false`; a request without a body is delivered as a single
    /// empty chunk.
    HttpRequest {
        body: Vec<u8>,
        more_body: bool,
    },

    /// `http.disconnect`: the stream was reset or the connection went away
    /// before the request completed. Terminal; nothing follows it.
    HttpDisconnect,

    /// `http.response.start`: status code and response headers. Exactly one
    /// per request stream, before any body message.
    ///
    /// Headers are raw byte pairs. They must not contain pseudo-headers:
    /// `:status` is synthesized by the protocol engine.
    HttpResponseStart {
        status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },

    /// `http.response.body`: a chunk of the response body. The final chunk
    /// carries `more_body: false`.
    HttpResponseBody {
        body: Vec<u8>,
        more_body: bool,
    },

    /// `lifespan.startup`: the server asks the application to initialize.
    LifespanStartup,

    /// `lifespan.startup.complete`
    LifespanStartupComplete,

    /// `lifespan.startup.failed`
    LifespanStartupFailed {
        message: String,
    },

    /// `lifespan.shutdown`: the server asks the application to clean up.
    LifespanShutdown,

    /// `lifespan.shutdown.complete`
    LifespanShutdownComplete,

    /// `lifespan.shutdown.failed`
    LifespanShutdownFailed {
        message: String,
    },
}

impl AsgiMessage {
    /// The `type` key this message would carry in its dict encoding.
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::HttpRequest { .. } => "http.request",
            Self::HttpDisconnect => "http.disconnect",
            Self::HttpResponseStart { .. } => "http.response.start",
            Self::HttpResponseBody { .. } => "http.response.body",
            Self::LifespanStartup => "lifespan.startup",
            Self::LifespanStartupComplete => "lifespan.startup.complete",
            Self::LifespanStartupFailed { .. } => "lifespan.startup.failed",
            Self::LifespanShutdown => "lifespan.shutdown",
            Self::LifespanShutdownComplete => "lifespan.shutdown.complete",
            Self::LifespanShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }

    /// Whether this message may legally appear on a stream's outbound queue.
    pub const fn is_response_message(&self) -> bool {
        matches!(self, Self::HttpResponseStart { .. } | Self::HttpResponseBody { .. })
    }
}
