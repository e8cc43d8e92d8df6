// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The contract between the protocol engine and whatever runtime hosts the
//! application. The engine never learns how the application is embedded; it
//! hands over a scope and the two queue ends, and observes the returned task
//! for completion or failure.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::{
    AsgiMessage,
    QueueReceiver,
    QueueSender,
    Scope,
};

/// An application runtime capable of servicing requests.
///
/// `dispatch` must not block: it schedules the application and returns a
/// handle. The engine observes the handle to release the stream when the
/// application finishes, and calls [`JoinHandle::abort`] to cancel it when
/// the stream is reset or the connection is going away. A cancelled host
/// must stop producing outbound messages; the queues are closed by the
/// engine at the same time, so a well-behaved host that only communicates
/// through them cannot outlive the stream.
pub trait ApplicationHost: Send + Sync + 'static {
    fn dispatch(&self, scope: Scope, receiver: QueueReceiver, sender: QueueSender)
        -> JoinHandle<anyhow::Result<()>>;
}

/// Host an `async fn(Scope, QueueReceiver, QueueSender)` directly. This is
/// the embedding used by tests and by transports that keep the application
/// in-process.
pub struct HandlerHost<F> {
    handler: F,
}

impl<F, Fut> HandlerHost<F>
        where F: Fn(Scope, QueueReceiver, QueueSender) -> Fut + Send + Sync + 'static,
              Fut: Future<Output = anyhow::Result<()>> + Send + 'static {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> ApplicationHost for HandlerHost<F>
        where F: Fn(Scope, QueueReceiver, QueueSender) -> Fut + Send + Sync + 'static,
              Fut: Future<Output = anyhow::Result<()>> + Send + 'static {
    fn dispatch(&self, scope: Scope, receiver: QueueReceiver, sender: QueueSender)
            -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn((self.handler)(scope, receiver, sender))
    }
}

/// A stub host that drains the request and echoes its body back with a
/// `200 OK`. Substituted for a real runtime in tests.
#[derive(Debug, Default)]
pub struct EchoHost;

impl ApplicationHost for EchoHost {
    fn dispatch(&self, _scope: Scope, mut receiver: QueueReceiver, sender: QueueSender)
            -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut body = Vec::new();
            while let Some(message) = receiver.pop().await {
                match message {
                    AsgiMessage::HttpRequest { body: chunk, more_body } => {
                        body.extend_from_slice(&chunk);
                        if !more_body {
                            break;
                        }
                    }
                    AsgiMessage::HttpDisconnect => return Ok(()),
                    other => anyhow::bail!("unexpected inbound message: {}", other.message_type()),
                }
            }

            sender.push(AsgiMessage::HttpResponseStart {
                status: 200,
                headers: vec![(b"content-type".to_vec(), b"text/plain".to_vec())],
            }).await?;
            sender.push(AsgiMessage::HttpResponseBody { body, more_body: false }).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::message_queue;

    use super::*;

    #[tokio::test]
    async fn test_echo_host_round_trip() {
        let (inbound_tx, inbound_rx) = message_queue(None);
        let (outbound_tx, mut outbound_rx) = message_queue(None);

        let scope = Scope::http2("POST".into(), "https".into(), "/".into(), Vec::new(), None, Vec::new());
        let task = EchoHost.dispatch(scope, inbound_rx, outbound_tx);

        inbound_tx.push(AsgiMessage::HttpRequest { body: b"ping".to_vec(), more_body: false }).await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(outbound_rx.pop().await, Some(AsgiMessage::HttpResponseStart {
            status: 200,
            headers: vec![(b"content-type".to_vec(), b"text/plain".to_vec())],
        }));
        assert_eq!(outbound_rx.pop().await, Some(AsgiMessage::HttpResponseBody {
            body: b"ping".to_vec(),
            more_body: false,
        }));
    }

    #[tokio::test]
    async fn test_echo_host_stops_on_disconnect() {
        let (inbound_tx, inbound_rx) = message_queue(None);
        let (outbound_tx, mut outbound_rx) = message_queue(None);

        let scope = Scope::http2("GET".into(), "https".into(), "/".into(), Vec::new(), None, Vec::new());
        let task = EchoHost.dispatch(scope, inbound_rx, outbound_tx);

        inbound_tx.push(AsgiMessage::HttpDisconnect).await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(outbound_rx.try_pop(), None);
    }

    #[tokio::test]
    async fn test_handler_host_invokes_closure() {
        let host = HandlerHost::new(|scope: Scope, _receiver, sender: QueueSender| async move {
            sender.push(AsgiMessage::HttpResponseStart {
                status: if scope.path == "/missing" { 404 } else { 200 },
                headers: Vec::new(),
            }).await?;
            sender.push(AsgiMessage::HttpResponseBody { body: Vec::new(), more_body: false }).await?;
            Ok(())
        });

        let (_inbound_tx, inbound_rx) = message_queue(None);
        let (outbound_tx, mut outbound_rx) = message_queue(None);
        let scope = Scope::http2("GET".into(), "https".into(), "/missing".into(), Vec::new(), None, Vec::new());

        host.dispatch(scope, inbound_rx, outbound_tx).await.unwrap().unwrap();
        assert_eq!(outbound_rx.pop().await, Some(AsgiMessage::HttpResponseStart { status: 404, headers: Vec::new() }));
    }
}
