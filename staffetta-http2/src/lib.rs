// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The HTTP/2 connection engine of staffetta.
//!
//! One [`Connection`] is created per accepted transport stream. It owns the
//! frame codec, the HPACK compression state, the stream table, and the
//! bridge that turns request streams into ASGI message traffic for an
//! [`staffetta_asgi::ApplicationHost`].
//!
//! The acceptor, TLS, and HTTP/1.1 upgrade paths live outside this crate;
//! the engine starts at the 24-byte connection preface.
//!
//! # References
//! * [RFC 9113 - HTTP/2](https://httpwg.org/specs/rfc9113.html)
//! * [RFC 7541 - HPACK](https://httpwg.org/specs/rfc7541.html)

mod bits;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod hpack;
pub mod settings;
pub mod stream;

pub use bridge::*;
pub use config::*;
pub use connection::*;
pub use error::*;
pub use frame::*;
pub use settings::*;
pub use stream::*;
