// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The bridge between request streams and the application host: scope
//! construction from a decoded field section, the per-stream queue pair,
//! and the lane bookkeeping the engine consults while frames flow.
//!
//! Workers never touch connection state. Each one talks to its two queues;
//! a small forwarder task funnels every stream's outbound messages into a
//! single channel the engine can `select!` on.

use std::{net::SocketAddr, sync::Arc};

use log::{debug, trace};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};

use staffetta_asgi::{
    ApplicationHost,
    AsgiMessage,
    message_queue,
    QueueSender,
    Scope,
};

use crate::{
    EngineConfig,
    hpack::FieldSection,
    stream::StreamId,
};

/// Check the four request pseudo-headers for presence and non-emptiness:
/// `:method` and `:path` are required, `:scheme` is required except for
/// CONNECT, and `:authority` may be absent but not empty.
///
/// # References
/// * [RFC 9113 - Section 8.3.1](https://httpwg.org/specs/rfc9113.html#HttpRequest)
pub fn is_valid(section: &FieldSection) -> bool {
    let Some(method) = section.method.as_deref() else {
        return false;
    };

    if method.is_empty() {
        return false;
    }

    match section.path.as_deref() {
        Some("") | None => return false,
        Some(_) => (),
    }

    match section.scheme.as_deref() {
        Some("") => return false,
        None if method != "CONNECT" => return false,
        _ => (),
    }

    !matches!(section.authority.as_deref(), Some(""))
}

/// Build the ASGI scope for a request stream. The path is split on the
/// first `?`: the left half becomes `path`, the right half `query_string`.
pub fn build_scope(section: &FieldSection, config: &EngineConfig, stream_id: StreamId,
        client: Option<SocketAddr>, server: Option<SocketAddr>) -> Scope {
    let raw_path = section.path.clone().unwrap_or_default();
    let (path, query_string) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_owned(), query.as_bytes().to_vec()),
        None => (raw_path, Vec::new()),
    };

    let mut scope = Scope::http2(
        section.method.clone().unwrap_or_default(),
        section.scheme.clone().unwrap_or_default(),
        path,
        query_string,
        section.authority.clone(),
        section.fields.clone(),
    );

    scope.client = client;
    scope.server = server;
    if config.expose_stream_id {
        scope.stream_id = Some(stream_id.0);
    }

    scope
}

/// What the response side of a lane has seen so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponsePhase {
    /// No `http.response.start` yet.
    AwaitingStart,

    /// `http.response.start` arrived, but its HEADERS frame is held back
    /// until we know whether the body is empty: an empty body is announced
    /// with END_STREAM on HEADERS itself.
    StartBuffered {
        status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },

    /// HEADERS is on the wire, DATA may still follow.
    Streaming,

    /// The final frame has been sent.
    Finished,
}

/// An event surfaced to the engine from one stream's worker.
#[derive(Debug)]
pub enum LaneEvent {
    Message(AsgiMessage),

    /// The worker's outbound queue closed: it dropped its sender or
    /// finished. [`Bridge::finish_lane`] retrieves the actual verdict.
    Finished,
}

/// Per-stream plumbing, owned by the [`Bridge`] and keyed by stream id so
/// nothing here pins the protocol-side stream entry.
pub struct RequestLane {
    pub inbound: QueueSender,
    task: JoinHandle<anyhow::Result<()>>,
    forwarder: JoinHandle<()>,
    pub phase: ResponsePhase,

    /// Response bytes accepted from the application but not yet written,
    /// because the flow-control window is exhausted.
    pub pending_body: Vec<u8>,
    pub pending_end: bool,

    /// Stream-level WINDOW_UPDATE credit withheld while the inbound queue
    /// sits above the high-water mark.
    pub deferred_credit: u32,

    /// The worker task has completed; the lane only survives to drain
    /// flow-blocked response bytes.
    pub worker_done: bool,
}

impl RequestLane {
    /// Cancel the worker. The inbound queue gets the disconnect sentinel
    /// and is closed, the task and its forwarder are aborted, and whatever
    /// outbound messages were still queued die with them.
    fn cancel(&self) {
        _ = self.inbound.try_push(AsgiMessage::HttpDisconnect);
        self.inbound.close();
        self.task.abort();
        self.forwarder.abort();
    }
}

/// All lanes of one connection, plus the channel their forwarders feed.
pub struct Bridge {
    host: Arc<dyn ApplicationHost>,
    config: Arc<EngineConfig>,
    lanes: hashbrown::HashMap<StreamId, RequestLane>,
    event_tx: mpsc::Sender<(StreamId, LaneEvent)>,
    event_rx: mpsc::Receiver<(StreamId, LaneEvent)>,
    credit: Arc<Notify>,
}

impl Bridge {
    pub fn new(host: Arc<dyn ApplicationHost>, config: Arc<EngineConfig>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);
        Self {
            host,
            config,
            lanes: Default::default(),
            event_tx,
            event_rx,
            credit: Arc::new(Notify::new()),
        }
    }

    /// The notifier pinged whenever any worker drains its inbound queue;
    /// the engine uses it to revisit withheld flow-control credit.
    pub fn credit_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.credit)
    }

    pub fn lane(&self, stream_id: StreamId) -> Option<&RequestLane> {
        self.lanes.get(&stream_id)
    }

    pub fn lane_mut(&mut self, stream_id: StreamId) -> Option<&mut RequestLane> {
        self.lanes.get_mut(&stream_id)
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// The next message or completion from any worker. Cancel-safe, so the
    /// engine can park on it inside `select!`.
    pub async fn next_event(&mut self) -> Option<(StreamId, LaneEvent)> {
        self.event_rx.recv().await
    }

    /// Wire up a new request stream and hand it to the application host.
    pub fn begin_request(&mut self, stream_id: StreamId, scope: Scope) {
        trace!("dispatching stream {} to the application host", stream_id.0);

        let (inbound_tx, inbound_rx) = message_queue(None);
        inbound_tx.set_drain_hook(Arc::clone(&self.credit));

        let (outbound_tx, mut outbound_rx) = message_queue(Some(self.config.outbound_queue_capacity));

        let task = self.host.dispatch(scope, inbound_rx, outbound_tx);

        let event_tx = self.event_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = outbound_rx.pop().await {
                if event_tx.send((stream_id, LaneEvent::Message(message))).await.is_err() {
                    // The engine is gone; nothing left to forward to.
                    return;
                }
            }

            // Queue closed: the worker dropped its sender or the engine cut
            // the lane.
            _ = event_tx.send((stream_id, LaneEvent::Finished)).await;
        });

        self.lanes.insert(stream_id, RequestLane {
            inbound: inbound_tx,
            task,
            forwarder,
            phase: ResponsePhase::AwaitingStart,
            pending_body: Vec::new(),
            pending_end: false,
            deferred_credit: 0,
            worker_done: false,
        });
    }

    /// Await the worker's verdict once its forwarder reported completion.
    pub async fn finish_lane(&mut self, stream_id: StreamId) -> Result<(), String> {
        let Some(lane) = self.lanes.get_mut(&stream_id) else {
            return Ok(());
        };

        let result = match (&mut lane.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(format!("{error:#}")),
            Err(join_error) if join_error.is_cancelled() => Ok(()),
            Err(join_error) => Err(join_error.to_string()),
        };

        if let Err(error) = &result {
            debug!("worker for stream {} failed: {}", stream_id.0, error);
        }

        result
    }

    /// Deliver an inbound message to a stream's worker. A worker that has
    /// already dropped its receiver simply misses it.
    pub fn deliver(&mut self, stream_id: StreamId, message: AsgiMessage) {
        if let Some(lane) = self.lanes.get(&stream_id) {
            if lane.inbound.try_push(message).is_err() {
                trace!("stream {} worker is no longer consuming", stream_id.0);
            }
        }
    }

    /// The stream was reset or refused: cancel the worker and forget the
    /// lane. Pending outbound messages are dropped with it.
    pub fn disconnect(&mut self, stream_id: StreamId) {
        if let Some(lane) = self.lanes.remove(&stream_id) {
            lane.cancel();
        }
    }

    /// Remove a lane whose response completed normally.
    pub fn remove(&mut self, stream_id: StreamId) -> Option<RequestLane> {
        self.lanes.remove(&stream_id)
    }

    /// Connection teardown: every worker gets `http.disconnect` and is
    /// cancelled.
    pub fn disconnect_all(&mut self) {
        for (_, lane) in self.lanes.drain() {
            lane.cancel();
        }
    }

    /// Streams whose withheld flow-control credit can now be released:
    /// their inbound queue has drained to the high-water mark or below.
    pub fn releasable_credit(&mut self) -> Vec<(StreamId, u32)> {
        let high_water = self.config.inbound_high_water;
        let mut released = Vec::new();

        for (stream_id, lane) in self.lanes.iter_mut() {
            if lane.deferred_credit > 0 && lane.inbound.len() <= high_water {
                released.push((*stream_id, lane.deferred_credit));
                lane.deferred_credit = 0;
            }
        }

        released
    }
}
