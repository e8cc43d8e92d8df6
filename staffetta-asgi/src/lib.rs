// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! This crate contains the application-facing half of staffetta: the ASGI
//! message model, the scope record handed to the application once per
//! request, the bounded message queues that connect the protocol engine to
//! application workers, and the narrow contract by which an application
//! runtime is invoked.
//!
//! The protocol engine (`staffetta-http2`) never calls into the application
//! directly; everything crosses through [`MessageQueue`] pairs and the
//! [`ApplicationHost`] trait.

pub mod host;
pub mod lifespan;
pub mod message;
pub mod queue;
pub mod scope;

pub use host::*;
pub use lifespan::*;
pub use message::*;
pub use queue::*;
pub use scope::*;
