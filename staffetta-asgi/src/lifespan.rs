// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The lifespan protocol: startup and shutdown notifications delivered to
//! the application once per process, on a channel of their own, outside any
//! request stream.
//!
//! The transport layer drives this before the first connection is accepted
//! and after the last one is drained.
//!
//! # References
//! * [ASGI Specification - Lifespan protocol](https://asgi.readthedocs.io/en/latest/specs/lifespan.html)

use log::warn;
use tokio::task::JoinHandle;

use crate::{
    ApplicationHost,
    AsgiMessage,
    message_queue,
    QueueReceiver,
    QueueSender,
    Scope,
    ScopeType,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifespanError {
    /// The application reported `lifespan.startup.failed` or
    /// `lifespan.shutdown.failed`.
    Failed(String),

    /// The application replied with a message that is not part of the
    /// lifespan protocol.
    UnexpectedMessage(&'static str),
}

/// Drives the application's lifespan task.
///
/// An application that does not speak the protocol simply drops the queues;
/// that is not an error, startup proceeds as if it had completed.
pub struct Lifespan {
    sender: QueueSender,
    receiver: QueueReceiver,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Lifespan {
    pub fn start(host: &dyn ApplicationHost) -> Self {
        let (event_tx, event_rx) = message_queue(None);
        let (reply_tx, reply_rx) = message_queue(None);

        let scope = Scope {
            scope_type: ScopeType::Lifespan,
            http_version: "2",
            method: String::new(),
            scheme: String::new(),
            path: String::new(),
            query_string: Vec::new(),
            authority: None,
            headers: Vec::new(),
            client: None,
            server: None,
            stream_id: None,
        };

        let task = host.dispatch(scope, event_rx, reply_tx);

        Self {
            sender: event_tx,
            receiver: reply_rx,
            task,
        }
    }

    /// Deliver `lifespan.startup` and wait for the application's verdict.
    pub async fn startup(&mut self) -> Result<(), LifespanError> {
        self.exchange(
            AsgiMessage::LifespanStartup,
            |reply| match reply {
                AsgiMessage::LifespanStartupComplete => Ok(()),
                AsgiMessage::LifespanStartupFailed { message } => Err(LifespanError::Failed(message)),
                other => Err(LifespanError::UnexpectedMessage(other.message_type())),
            },
        ).await
    }

    /// Deliver `lifespan.shutdown`, wait for the verdict, and release the
    /// lifespan task.
    pub async fn shutdown(mut self) -> Result<(), LifespanError> {
        let result = self.exchange(
            AsgiMessage::LifespanShutdown,
            |reply| match reply {
                AsgiMessage::LifespanShutdownComplete => Ok(()),
                AsgiMessage::LifespanShutdownFailed { message } => Err(LifespanError::Failed(message)),
                other => Err(LifespanError::UnexpectedMessage(other.message_type())),
            },
        ).await;

        self.sender.close();
        self.task.abort();
        result
    }

    async fn exchange(&mut self, event: AsgiMessage,
            verdict: impl FnOnce(AsgiMessage) -> Result<(), LifespanError>) -> Result<(), LifespanError> {
        if self.sender.push(event).await.is_err() {
            // The application dropped the lifespan queues: it does not
            // support the protocol.
            warn!("application does not implement the lifespan protocol");
            return Ok(());
        }

        match self.receiver.pop().await {
            Some(reply) => verdict(reply),
            None => {
                warn!("application closed the lifespan channel without replying");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::HandlerHost;

    use super::*;

    #[tokio::test]
    async fn test_startup_then_shutdown() {
        let host = HandlerHost::new(|scope: Scope, mut receiver: QueueReceiver, sender: QueueSender| async move {
            assert_eq!(scope.scope_type, ScopeType::Lifespan);
            while let Some(event) = receiver.pop().await {
                match event {
                    AsgiMessage::LifespanStartup => {
                        sender.push(AsgiMessage::LifespanStartupComplete).await?;
                    }
                    AsgiMessage::LifespanShutdown => {
                        sender.push(AsgiMessage::LifespanShutdownComplete).await?;
                        break;
                    }
                    _ => anyhow::bail!("unexpected lifespan event"),
                }
            }
            Ok(())
        });
        let mut lifespan = Lifespan::start(&host);
        assert_eq!(lifespan.startup().await, Ok(()));
        assert_eq!(lifespan.shutdown().await, Ok(()));
    }

    #[tokio::test]
    async fn test_startup_failure_is_reported() {
        let host = HandlerHost::new(|_scope, mut receiver: QueueReceiver, sender: QueueSender| async move {
            let _ = receiver.pop().await;
            sender.push(AsgiMessage::LifespanStartupFailed {
                message: "database unreachable".into(),
            }).await?;
            Ok(())
        });

        let mut lifespan = Lifespan::start(&host);
        assert_eq!(
            lifespan.startup().await,
            Err(LifespanError::Failed("database unreachable".into())),
        );
    }

    #[tokio::test]
    async fn test_unsupporting_application_is_tolerated() {
        let host = HandlerHost::new(|_scope, receiver: QueueReceiver, sender: QueueSender| async move {
            // An application that knows nothing of lifespan drops both ends.
            drop(receiver);
            drop(sender);
            Ok(())
        });

        let mut lifespan = Lifespan::start(&host);
        assert_eq!(lifespan.startup().await, Ok(()));
    }
}
