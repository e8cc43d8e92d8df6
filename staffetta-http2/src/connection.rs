// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The per-connection engine: frame I/O, settings, stream dispatch, and the
//! write side of the ASGI bridge.
//!
//! A dedicated reader task feeds raw frames through a channel; the engine
//! task owns every piece of per-connection state (stream table, HPACK
//! contexts, the writer) and multiplexes frames, worker messages, and
//! timers in one `select!` loop. Workers never touch any of it directly.

use std::{net::SocketAddr, sync::Arc};

use log::{debug, error, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};

use staffetta_asgi::{ApplicationHost, AsgiMessage};

use crate::{
    bridge::{Bridge, build_scope, is_valid, LaneEvent, ResponsePhase},
    ConnectionError,
    EngineConfig,
    ErrorCode,
    Frame,
    frame::{FRAME_HEADER_SIZE, FRAME_TYPE_CONTINUATION},
    FrameHeader,
    hpack::{Decoder, Encoder, HeaderBlock},
    SettingKind,
    Settings,
    SettingValue,
    stream::{Priority, StreamId, StreamState, StreamTable},
};

/// The 24 octets every HTTP/2 connection must begin with.
///
/// # References
/// * [RFC 9113 - Section 3.4. HTTP/2 Connection Preface](https://www.rfc-editor.org/rfc/rfc9113.html#name-http-2-connection-preface)
pub const CONNECTION_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// A header block being assembled across HEADERS/CONTINUATION frames. While
/// one of these is live, no other frame may arrive.
struct ContinuationState {
    stream_id: StreamId,
    block: HeaderBlock,
    end_stream: bool,
    trailer_section: bool,

    /// The stream is already gone (reset before the peer noticed). The
    /// block must still run through the decoder to keep the compression
    /// context synchronized, but its contents are thrown away.
    discard: bool,
}

/// The `Connection` struct manages the state of one HTTP/2 connection.
pub struct Connection<W> {
    writer: W,
    frames: mpsc::Receiver<Result<(FrameHeader, Vec<u8>), std::io::Error>>,
    reader_task: JoinHandle<()>,
    config: Arc<EngineConfig>,
    local_settings: Settings,
    peer_settings: Settings,
    streams: StreamTable,
    encoder: Encoder,
    decoder: Decoder,
    continuation: Option<ContinuationState>,
    goaway_sent: bool,
    pings_unanswered: usize,
    client_addr: Option<SocketAddr>,
    server_addr: Option<SocketAddr>,
}

fn spawn_reader<R>(mut reader: R) -> (mpsc::Receiver<Result<(FrameHeader, Vec<u8>), std::io::Error>>, JoinHandle<()>)
        where R: AsyncRead + Unpin + Send + 'static {
    let (tx, rx) = mpsc::channel(16);

    let task = tokio::spawn(async move {
        loop {
            let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
            if let Err(error) = reader.read_exact(&mut header_bytes).await {
                _ = tx.send(Err(error)).await;
                return;
            }

            let header = FrameHeader::from_bytes(header_bytes);
            let mut payload = vec![0u8; header.payload_length as usize];
            if let Err(error) = reader.read_exact(&mut payload).await {
                _ = tx.send(Err(error)).await;
                return;
            }

            if tx.send(Ok((header, payload))).await.is_err() {
                // Engine is gone.
                return;
            }
        }
    });

    (rx, task)
}

async fn send_frame<W>(writer: &mut W, frame: Frame) -> Result<(), ConnectionError>
        where W: AsyncWrite + Unpin {
    trace!(
        "sending frame: type={:#x} flags={:#04b} stream={}",
        frame.frame_type(), frame.flags(), frame.stream().0,
    );
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

async fn send_frame_with_flush<W>(writer: &mut W, frame: Frame) -> Result<(), ConnectionError>
        where W: AsyncWrite + Unpin {
    send_frame(writer, frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Entrypoint of a client connection, starting at the connection preface.
///
/// Returning from this function means the connection should/has been
/// closed. The transport halves come from the acceptor, which has already
/// dealt with TLS and ALPN.
pub async fn handle_connection<R, W>(reader: R, writer: W, host: Arc<dyn ApplicationHost>,
        config: Arc<EngineConfig>, client_addr: Option<SocketAddr>, server_addr: Option<SocketAddr>)
        where R: AsyncRead + Unpin + Send + 'static,
              W: AsyncWrite + Unpin {
    let mut bridge = Bridge::new(host, Arc::clone(&config));

    let mut connection = match Connection::accept(reader, writer, config, client_addr, server_addr).await {
        Ok(connection) => connection,
        Err(error) => {
            debug!("connection rejected during preface: {error:?}");
            return;
        }
    };

    if let Err(error) = connection.complete_preface().await {
        debug!("failed to complete preface: {error:?}");
        if let ConnectionError::ConnectionError { error_code, additional_debug_data } = error {
            _ = send_frame_with_flush(&mut connection.writer, Frame::GoAway {
                last_stream_id: StreamId::CONTROL,
                error_code,
                additional_debug_data: additional_debug_data.into_bytes(),
            }).await;
        }
        connection.reader_task.abort();
        return;
    }

    loop {
        match serve(&mut connection, &mut bridge).await {
            Ok(()) => continue,
            Err(ConnectionError::ConnectionError { error_code, additional_debug_data }) => {
                connection.send_goaway(&mut bridge, error_code, additional_debug_data).await;
                break;
            }
            Err(ConnectionError::StreamError { error_code, stream_id }) => {
                debug!("resetting stream {}: {:?}", stream_id.0, error_code);
                if connection.reset_stream(&mut bridge, stream_id, error_code).await.is_err() {
                    break;
                }
            }
            Err(ConnectionError::Closed) => break,
            Err(ConnectionError::Io(error)) => {
                trace!("transport error: {error}");
                break;
            }
        }
    }

    bridge.disconnect_all();
    connection.reader_task.abort();
    _ = connection.writer.flush().await;
}

async fn serve<W>(connection: &mut Connection<W>, bridge: &mut Bridge) -> Result<(), ConnectionError>
        where W: AsyncWrite + Unpin {
    let credit = bridge.credit_notify();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(connection.config.ping_interval) => {
                if connection.pings_unanswered > 2 {
                    return Err(ConnectionError::connection(ErrorCode::NoError, "idle timeout"));
                }
                send_frame_with_flush(&mut connection.writer, Frame::Ping {
                    ack: false,
                    payload: *b"staffett",
                }).await?;
                connection.pings_unanswered += 1;
            }

            frame = connection.next_frame() => {
                connection.handle_frame(bridge, frame?).await?;
            }

            Some((stream_id, event)) = bridge.next_event() => {
                connection.handle_lane_event(bridge, stream_id, event).await?;
            }

            _ = credit.notified() => {
                connection.release_credit(bridge).await?;
            }
        }
    }
}

impl<W> Connection<W> where W: AsyncWrite + Unpin {
    /// Read and verify the 24-octet preface. A peer that opens with
    /// anything else never was an HTTP/2 peer, so the transport is dropped
    /// without a GOAWAY.
    async fn accept<R>(mut reader: R, writer: W, config: Arc<EngineConfig>,
            client_addr: Option<SocketAddr>, server_addr: Option<SocketAddr>)
            -> Result<Self, ConnectionError>
            where R: AsyncRead + Unpin + Send + 'static {
        let mut preface = [0u8; CONNECTION_PREFACE.len()];
        reader.read_exact(&mut preface).await?;
        if &preface != CONNECTION_PREFACE {
            return Err(ConnectionError::Closed);
        }

        let local_settings = config.local_settings;
        let peer_settings = Settings::default();
        let (frames, reader_task) = spawn_reader(reader);

        Ok(Self {
            writer,
            frames,
            reader_task,
            config,
            local_settings,
            peer_settings,
            streams: StreamTable::new(local_settings.initial_window_size),
            encoder: Encoder::new(peer_settings.header_table_size as usize),
            decoder: Decoder::new(local_settings.header_table_size as usize),
            continuation: None,
            goaway_sent: false,
            pings_unanswered: 0,
            client_addr,
            server_addr,
        })
    }

    /// Complete the connection preface: announce our settings, then consume
    /// and acknowledge the client's, which must arrive promptly.
    ///
    /// # References
    /// * [RFC 9113 - Section 3.4. HTTP/2 Connection Preface](https://www.rfc-editor.org/rfc/rfc9113.html#name-http-2-connection-preface)
    async fn complete_preface(&mut self) -> Result<(), ConnectionError> {
        send_frame_with_flush(&mut self.writer, Frame::Settings {
            settings: self.local_settings.to_announcement(),
        }).await?;

        let handshake_timeout = self.config.handshake_timeout;
        let frame = match timeout(handshake_timeout, self.next_frame()).await {
            Ok(frame) => frame?,
            Err(_) => {
                return Err(ConnectionError::connection(
                    ErrorCode::SettingsTimeout,
                    "no SETTINGS within the handshake window",
                ));
            }
        };

        let Frame::Settings { settings } = frame else {
            return Err(ConnectionError::connection(
                ErrorCode::ProtocolError,
                "expected a SETTINGS frame to finish the preface",
            ));
        };

        self.apply_peer_settings(&settings)?;
        send_frame_with_flush(&mut self.writer, Frame::SettingsAcknowledgement).await?;
        Ok(())
    }

    /// Install the peer's settings: window deltas propagate to every
    /// stream, and a smaller header table is signalled to our encoder.
    fn apply_peer_settings(&mut self, settings: &[(SettingKind, SettingValue)])
            -> Result<(), ConnectionError> {
        let window_delta = self.peer_settings.apply(settings);
        if window_delta != 0 {
            self.streams.apply_send_window_delta(window_delta)?;
        }
        self.encoder.set_max_size(self.peer_settings.header_table_size as usize);
        Ok(())
    }

    /// The next typed frame from the reader task. Cancellation-safe, so the
    /// engine can park on it inside `select!`.
    async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        let (header, payload) = match self.frames.recv().await {
            Some(Ok(raw)) => raw,
            Some(Err(error)) => return Err(ConnectionError::Io(error)),
            None => return Err(ConnectionError::Closed),
        };

        trace!(
            "received frame: type={:#x} size={} flags={:#04b} stream={}",
            header.frame_type, header.payload_length, header.flags, header.stream_id.0,
        );

        if header.payload_length > self.local_settings.max_frame_size {
            return Err(ConnectionError::connection(
                ErrorCode::FrameSizeError,
                "frame larger than SETTINGS_MAX_FRAME_SIZE",
            ));
        }

        // https://www.rfc-editor.org/rfc/rfc9113.html#section-6.2-6.6.2
        if let Some(continuation) = &self.continuation {
            if header.frame_type != FRAME_TYPE_CONTINUATION || header.stream_id != continuation.stream_id {
                return Err(ConnectionError::connection(
                    ErrorCode::ProtocolError,
                    "CONTINUATION expected",
                ));
            }
        }

        Frame::parse(header, payload)
    }

    async fn handle_frame(&mut self, bridge: &mut Bridge, frame: Frame) -> Result<(), ConnectionError> {
        match frame {
            Frame::Data { end_stream, stream_id, payload } => {
                self.handle_frame_data(bridge, stream_id, payload, end_stream).await?;
            }

            Frame::Headers { end_headers, end_stream, stream_id, priority, fragment } => {
                self.handle_frame_headers(bridge, stream_id, fragment, end_headers, end_stream, priority).await?;
            }

            Frame::Continuation { end_headers, stream_id, fragment } => {
                let Some(continuation) = &mut self.continuation else {
                    return Err(ConnectionError::connection(
                        ErrorCode::ProtocolError,
                        "CONTINUATION frame without corresponding HEADERS",
                    ));
                };
                debug_assert_eq!(continuation.stream_id, stream_id);

                continuation.block.push_fragment(fragment);
                if end_headers {
                    let continuation = self.continuation.take().expect("checked above");
                    self.complete_header_block(bridge, continuation).await?;
                }
            }

            Frame::Priority { stream_id, priority } => {
                self.streams.set_priority(stream_id, priority)?;
            }

            Frame::ResetStream { stream_id, error_code } => {
                if self.streams.is_idle(stream_id) {
                    return Err(ConnectionError::connection(
                        ErrorCode::ProtocolError,
                        "RST_STREAM on an idle stream",
                    ));
                }

                debug!("peer reset stream {}: {:?}", stream_id.0, error_code);
                self.streams.close(stream_id);
                self.streams.remove(stream_id);
                bridge.disconnect(stream_id);
            }

            Frame::Settings { settings } => {
                self.apply_peer_settings(&settings)?;
                send_frame_with_flush(&mut self.writer, Frame::SettingsAcknowledgement).await?;
                // A larger INITIAL_WINDOW_SIZE may unblock suspended sends.
                self.flush_all_streams(bridge).await?;
            }

            Frame::SettingsAcknowledgement => {
                trace!("peer acknowledged our settings");
            }

            // Push promises can't be sent from the client.
            //
            // [RFC 9113 - Section 8.4](https://httpwg.org/specs/rfc9113.html#PushResponses)
            Frame::PushPromise { .. } => {
                return Err(ConnectionError::connection(
                    ErrorCode::ProtocolError,
                    "PUSH_PROMISE from client",
                ));
            }

            Frame::Ping { ack, payload } => {
                if !ack {
                    send_frame_with_flush(&mut self.writer, Frame::Ping { ack: true, payload }).await?;
                } else {
                    self.pings_unanswered = 0;
                }
            }

            Frame::GoAway { error_code, additional_debug_data, .. } => {
                if error_code != ErrorCode::NoError {
                    error!(
                        "peer terminated the connection: {:?} {}",
                        error_code,
                        String::from_utf8_lossy(&additional_debug_data),
                    );
                }
                return Err(ConnectionError::Closed);
            }

            Frame::WindowUpdate { stream_id, window_size_increment } => {
                self.streams.receive_window_update(stream_id, window_size_increment)?;
                if stream_id == StreamId::CONTROL {
                    self.flush_all_streams(bridge).await?;
                } else {
                    self.flush_stream(bridge, stream_id).await?;
                }
            }

            Frame::Unknown => (),
        }

        Ok(())
    }

    async fn handle_frame_data(&mut self, bridge: &mut Bridge, stream_id: StreamId,
            payload: Vec<u8>, end_stream: bool) -> Result<(), ConnectionError> {
        let len = payload.len();
        self.streams.receive_data(stream_id, len, end_stream)?;

        bridge.deliver(stream_id, AsgiMessage::HttpRequest {
            body: payload,
            more_body: !end_stream,
        });

        if len == 0 {
            return Ok(());
        }

        // Connection-level credit goes straight back so other streams keep
        // flowing; stream-level credit is withheld while this stream's
        // worker lags behind.
        let credit = len as u32;
        send_frame_with_flush(&mut self.writer, Frame::WindowUpdate {
            stream_id: StreamId::CONTROL,
            window_size_increment: credit,
        }).await?;
        self.streams.replenish_recv_window(StreamId::CONTROL, credit as i32);

        if end_stream {
            // The peer is done sending; stream credit is moot.
            return Ok(());
        }

        let backlogged = bridge.lane(stream_id)
            .map(|lane| lane.inbound.len() > self.config.inbound_high_water)
            .unwrap_or(false);

        if backlogged {
            if let Some(lane) = bridge.lane_mut(stream_id) {
                lane.deferred_credit += credit;
            }
        } else {
            send_frame_with_flush(&mut self.writer, Frame::WindowUpdate {
                stream_id,
                window_size_increment: credit,
            }).await?;
            self.streams.replenish_recv_window(stream_id, credit as i32);
        }

        Ok(())
    }

    async fn handle_frame_headers(&mut self, bridge: &mut Bridge, stream_id: StreamId,
            fragment: Vec<u8>, end_headers: bool, end_stream: bool,
            priority: Option<Priority>) -> Result<(), ConnectionError> {
        let mut discard = false;
        let trailer_section = match self.streams.get(stream_id) {
            Some(stream) if stream.headers_complete => {
                if !stream.state.may_receive_data() {
                    return Err(ConnectionError::connection(
                        ErrorCode::StreamClosed,
                        "HEADERS on a half-closed or closed stream",
                    ));
                }
                true
            }
            Some(stream) if stream.state != StreamState::Idle => {
                // A second header block while the first is incomplete is
                // impossible here: CONTINUATION atomicity already rejected it.
                return Err(ConnectionError::connection(
                    ErrorCode::ProtocolError,
                    "unexpected HEADERS",
                ));
            }
            _ => {
                if !stream_id.is_client_initiated() {
                    return Err(ConnectionError::connection(
                        ErrorCode::ProtocolError,
                        "HEADERS on a non-client stream (stream ID is even)",
                    ));
                }

                if self.goaway_sent {
                    // We already told the peer this stream will not be
                    // processed; decode for table sync, then drop it.
                    trace!("discarding new stream {} after GOAWAY", stream_id.0);
                    discard = true;
                } else if stream_id.0 <= self.streams.highest_peer_stream_id().0 {
                    // A stream we closed and forgot; the peer may not have
                    // seen the reset yet.
                    discard = true;
                }

                false
            }
        };

        if let Some(priority) = priority {
            if !discard {
                self.streams.set_priority(stream_id, priority)?;
            }
        }

        let continuation = ContinuationState {
            stream_id,
            block: HeaderBlock::new(fragment),
            end_stream,
            trailer_section,
            discard,
        };

        if end_headers {
            self.complete_header_block(bridge, continuation).await?;
        } else {
            self.continuation = Some(continuation);
        }

        Ok(())
    }

    /// A header block is complete: decode it and either start a request or
    /// finish one (trailers).
    async fn complete_header_block(&mut self, bridge: &mut Bridge, state: ContinuationState)
            -> Result<(), ConnectionError> {
        let ContinuationState { stream_id, block, end_stream, trailer_section, discard } = state;

        let section = match self.decoder.decode(block, trailer_section) {
            Ok(section) => section,
            Err(error) if error.is_stream_scoped() => {
                debug!("malformed request on stream {}: {:?}", stream_id.0, error);
                // The block was still consumed, so the compression context
                // survives; only this request dies.
                if !trailer_section && !discard {
                    self.streams.open_peer_stream(stream_id, u32::MAX)?;
                }
                return Err(ConnectionError::stream(ErrorCode::ProtocolError, stream_id));
            }
            Err(error) => {
                return Err(ConnectionError::connection(
                    ErrorCode::CompressionError,
                    format!("stream {} failed to decompress: {:?}", stream_id.0, error),
                ));
            }
        };

        if discard {
            if self.goaway_sent {
                return Ok(());
            }
            return Err(ConnectionError::stream(ErrorCode::StreamClosed, stream_id));
        }

        if trailer_section {
            // Trailers carry no messages of their own; they terminate the
            // request body.
            if !end_stream {
                return Err(ConnectionError::stream(ErrorCode::ProtocolError, stream_id));
            }

            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.receive_end_of_stream();
            }
            bridge.deliver(stream_id, AsgiMessage::HttpRequest {
                body: Vec::new(),
                more_body: false,
            });
            return Ok(());
        }

        let max_concurrent = self.local_settings.max_concurrent_streams;
        let stream = self.streams.open_peer_stream(stream_id, max_concurrent)?;
        stream.headers_complete = true;

        if section.list_size > self.local_settings.max_header_list_size as usize {
            debug!("refusing stream {}: header list of {} octets", stream_id.0, section.list_size);
            return Err(ConnectionError::stream(ErrorCode::RefusedStream, stream_id));
        }

        if !is_valid(&section) {
            return Err(ConnectionError::stream(ErrorCode::ProtocolError, stream_id));
        }

        if end_stream {
            self.streams.get_mut(stream_id).expect("opened above").receive_end_of_stream();
        }

        let scope = build_scope(&section, &self.config, stream_id, self.client_addr, self.server_addr);
        bridge.begin_request(stream_id, scope);

        if end_stream {
            // No body will follow; the request is complete as it stands.
            bridge.deliver(stream_id, AsgiMessage::HttpRequest {
                body: Vec::new(),
                more_body: false,
            });
        }

        Ok(())
    }

    async fn handle_lane_event(&mut self, bridge: &mut Bridge, stream_id: StreamId,
            event: LaneEvent) -> Result<(), ConnectionError> {
        if bridge.lane(stream_id).is_none() {
            // The stream was reset while the event was in flight.
            return Ok(());
        }

        match event {
            LaneEvent::Message(AsgiMessage::HttpResponseStart { status, headers }) => {
                let lane = bridge.lane_mut(stream_id).expect("checked above");
                if lane.phase != ResponsePhase::AwaitingStart {
                    warn!("stream {}: second http.response.start", stream_id.0);
                    return self.fail_lane(bridge, stream_id).await;
                }

                if headers.iter().any(|(name, _)| name.first() == Some(&b':')) {
                    warn!("stream {}: pseudo-header in response headers", stream_id.0);
                    return self.fail_lane(bridge, stream_id).await;
                }

                // Held back until the first body message tells us whether
                // END_STREAM belongs on the HEADERS frame itself.
                lane.phase = ResponsePhase::StartBuffered { status, headers };
            }

            LaneEvent::Message(AsgiMessage::HttpResponseBody { body, more_body }) => {
                match bridge.lane_mut(stream_id).expect("checked above").phase.clone() {
                    ResponsePhase::AwaitingStart => {
                        warn!("stream {}: http.response.body before start", stream_id.0);
                        return self.fail_lane(bridge, stream_id).await;
                    }
                    ResponsePhase::StartBuffered { status, headers } => {
                        let end_on_headers = body.is_empty() && !more_body;
                        self.write_response_headers(stream_id, status, &headers, end_on_headers).await?;

                        let lane = bridge.lane_mut(stream_id).expect("checked above");
                        if end_on_headers {
                            lane.phase = ResponsePhase::Finished;
                            if let Some(stream) = self.streams.get_mut(stream_id) {
                                stream.send_end_of_stream();
                            }
                            self.maybe_finalize(bridge, stream_id);
                        } else {
                            lane.phase = ResponsePhase::Streaming;
                            lane.pending_body = body;
                            lane.pending_end = !more_body;
                            self.flush_stream(bridge, stream_id).await?;
                        }
                    }
                    ResponsePhase::Streaming => {
                        let lane = bridge.lane_mut(stream_id).expect("checked above");
                        if lane.pending_end {
                            warn!("stream {}: body after more_body = false", stream_id.0);
                            return self.fail_lane(bridge, stream_id).await;
                        }
                        lane.pending_body.extend_from_slice(&body);
                        lane.pending_end = !more_body;
                        self.flush_stream(bridge, stream_id).await?;
                    }
                    ResponsePhase::Finished => {
                        warn!("stream {}: body after the response finished", stream_id.0);
                        return self.fail_lane(bridge, stream_id).await;
                    }
                }
            }

            LaneEvent::Message(other) => {
                warn!("stream {}: unexpected outbound message {}", stream_id.0, other.message_type());
                return self.fail_lane(bridge, stream_id).await;
            }

            LaneEvent::Finished => {
                let verdict = bridge.finish_lane(stream_id).await;
                let (phase, pending_end) = {
                    let lane = bridge.lane_mut(stream_id).expect("checked above");
                    lane.worker_done = true;
                    (lane.phase.clone(), lane.pending_end)
                };

                match (phase, verdict) {
                    (ResponsePhase::Finished, _) => {
                        self.maybe_finalize(bridge, stream_id);
                    }
                    (ResponsePhase::Streaming, Ok(())) if pending_end => {
                        // The final body chunk may still be flow-blocked; a
                        // WINDOW_UPDATE will finish the job.
                        self.flush_stream(bridge, stream_id).await?;
                    }
                    (ResponsePhase::StartBuffered { status, headers }, Ok(())) => {
                        // Response with no body messages at all.
                        bridge.lane_mut(stream_id).expect("checked above").phase = ResponsePhase::Finished;
                        self.write_response_headers(stream_id, status, &headers, true).await?;
                        if let Some(stream) = self.streams.get_mut(stream_id) {
                            stream.send_end_of_stream();
                        }
                        self.maybe_finalize(bridge, stream_id);
                    }
                    (ResponsePhase::AwaitingStart, Ok(()))
                    | (ResponsePhase::AwaitingStart | ResponsePhase::StartBuffered { .. }, Err(_)) => {
                        // Nothing is on the wire yet: a bare 500 is still
                        // possible.
                        debug!("stream {}: worker ended without a response", stream_id.0);
                        bridge.lane_mut(stream_id).expect("checked above").phase = ResponsePhase::Finished;
                        self.write_response_headers(stream_id, 500, &[], true).await?;
                        if let Some(stream) = self.streams.get_mut(stream_id) {
                            stream.send_end_of_stream();
                        }
                        self.maybe_finalize(bridge, stream_id);
                    }
                    (ResponsePhase::Streaming, _) => {
                        // HEADERS went out but the body never completed.
                        warn!("stream {}: worker ended mid-response", stream_id.0);
                        return self.fail_lane(bridge, stream_id).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// The application broke the outbound protocol or died mid-response:
    /// RST_STREAM(INTERNAL_ERROR) and surface the failure to the host by
    /// cancelling it.
    async fn fail_lane(&mut self, bridge: &mut Bridge, stream_id: StreamId) -> Result<(), ConnectionError> {
        bridge.disconnect(stream_id);
        self.reset_stream(bridge, stream_id, ErrorCode::InternalError).await
    }

    async fn reset_stream(&mut self, bridge: &mut Bridge, stream_id: StreamId,
            error_code: ErrorCode) -> Result<(), ConnectionError> {
        send_frame_with_flush(&mut self.writer, Frame::ResetStream { stream_id, error_code }).await?;
        self.streams.close(stream_id);
        self.streams.remove(stream_id);
        bridge.disconnect(stream_id);
        Ok(())
    }

    /// Encode and write a response HEADERS frame, splitting into
    /// CONTINUATION frames when the fragment exceeds the peer's
    /// MAX_FRAME_SIZE. The frames are written back to back; nothing can
    /// interleave because this task is the only writer.
    async fn write_response_headers(&mut self, stream_id: StreamId, status: u16,
            headers: &[(Vec<u8>, Vec<u8>)], end_stream: bool) -> Result<(), ConnectionError> {
        let status_value = status.to_string();
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 1);
        fields.push((b":status".to_vec(), status_value.into_bytes()));
        for (name, value) in headers {
            fields.push((name.to_ascii_lowercase(), value.clone()));
        }

        let fragment = self.encoder.encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));

        let max_fragment = self.peer_settings.max_frame_size as usize;
        if fragment.len() <= max_fragment {
            return send_frame_with_flush(&mut self.writer, Frame::Headers {
                end_headers: true,
                end_stream,
                stream_id,
                priority: None,
                fragment,
            }).await;
        }

        let mut chunks = fragment.chunks(max_fragment);
        let first = chunks.next().expect("fragment is non-empty").to_vec();
        send_frame(&mut self.writer, Frame::Headers {
            end_headers: false,
            end_stream,
            stream_id,
            priority: None,
            fragment: first,
        }).await?;

        let mut chunks = chunks.peekable();
        while let Some(chunk) = chunks.next() {
            send_frame(&mut self.writer, Frame::Continuation {
                end_headers: chunks.peek().is_none(),
                stream_id,
                fragment: chunk.to_vec(),
            }).await?;
        }

        self.writer.flush().await?;
        Ok(())
    }

    /// Write as much pending response body as the flow-control windows
    /// allow, in frames no larger than the peer's MAX_FRAME_SIZE.
    async fn flush_stream(&mut self, bridge: &mut Bridge, stream_id: StreamId)
            -> Result<(), ConnectionError> {
        let Some(lane) = bridge.lane_mut(stream_id) else {
            return Ok(());
        };

        if lane.phase != ResponsePhase::Streaming {
            return Ok(());
        }

        let mut wrote = false;
        loop {
            if lane.pending_body.is_empty() {
                if lane.pending_end {
                    // All body bytes are out, but the end-of-stream marker
                    // still needs a frame of its own.
                    send_frame(&mut self.writer, Frame::Data {
                        end_stream: true,
                        stream_id,
                        payload: Vec::new(),
                    }).await?;
                    wrote = true;
                    lane.phase = ResponsePhase::Finished;
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        stream.send_end_of_stream();
                    }
                }
                break;
            }

            let budget = self.streams.send_capacity(stream_id)
                .min(self.peer_settings.max_frame_size as usize);
            if budget == 0 {
                // Suspended until WINDOW_UPDATE advances a window.
                trace!("stream {} suspended on flow control", stream_id.0);
                break;
            }

            let chunk_len = budget.min(lane.pending_body.len());
            let chunk: Vec<u8> = lane.pending_body.drain(..chunk_len).collect();
            let is_final = lane.pending_end && lane.pending_body.is_empty();

            send_frame(&mut self.writer, Frame::Data {
                end_stream: is_final,
                stream_id,
                payload: chunk,
            }).await?;
            wrote = true;
            self.streams.consume_send_window(stream_id, chunk_len);

            if is_final {
                lane.phase = ResponsePhase::Finished;
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.send_end_of_stream();
                }
                break;
            }
        }

        if wrote {
            self.writer.flush().await?;
        }
        self.maybe_finalize(bridge, stream_id);
        Ok(())
    }

    async fn flush_all_streams(&mut self, bridge: &mut Bridge) -> Result<(), ConnectionError> {
        for stream_id in self.streams.stream_ids() {
            self.flush_stream(bridge, stream_id).await?;
        }
        Ok(())
    }

    /// Release withheld flow-control credit for streams whose workers have
    /// caught up.
    async fn release_credit(&mut self, bridge: &mut Bridge) -> Result<(), ConnectionError> {
        for (stream_id, credit) in bridge.releasable_credit() {
            send_frame_with_flush(&mut self.writer, Frame::WindowUpdate {
                stream_id,
                window_size_increment: credit,
            }).await?;
            self.streams.replenish_recv_window(stream_id, credit as i32);
        }
        Ok(())
    }

    /// Drop the bookkeeping of a stream whose response is fully written and
    /// whose worker has finished.
    fn maybe_finalize(&mut self, bridge: &mut Bridge, stream_id: StreamId) {
        let done = bridge.lane(stream_id)
            .map(|lane| lane.phase == ResponsePhase::Finished && lane.worker_done)
            .unwrap_or(false);

        if !done {
            return;
        }

        bridge.remove(stream_id);
        if self.streams.get(stream_id).map(|stream| stream.state == StreamState::Closed).unwrap_or(false) {
            self.streams.remove(stream_id);
        }
    }

    /// A fatal connection error: tell the peer which streams were
    /// processed, let in-flight responses drain briefly, stop reading.
    async fn send_goaway(&mut self, bridge: &mut Bridge, error_code: ErrorCode, debug_data: String) {
        if !self.goaway_sent {
            self.goaway_sent = true;
            if error_code != ErrorCode::NoError {
                debug!("fatal connection error: {:?} {}", error_code, debug_data);
            }
            _ = send_frame_with_flush(&mut self.writer, Frame::GoAway {
                last_stream_id: self.streams.highest_peer_stream_id(),
                error_code,
                additional_debug_data: debug_data.into_bytes(),
            }).await;
        }

        let grace = tokio::time::sleep(self.config.goaway_grace);
        tokio::pin!(grace);

        while bridge.lane_count() > 0 {
            tokio::select! {
                _ = &mut grace => {
                    debug!("GOAWAY grace period elapsed with {} streams in flight", bridge.lane_count());
                    break;
                }
                event = bridge.next_event() => {
                    let Some((stream_id, event)) = event else {
                        break;
                    };
                    if self.handle_lane_event(bridge, stream_id, event).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
