// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The frame codec: a total translation between payload bytes and typed
//! frames, with every wire invariant checked here so the connection engine
//! can dispatch on clean values.
//!
//! [IANA: HTTP/2 Frame Types](https://www.iana.org/assignments/http2-parameters/http2-parameters.xhtml#frame-type)

use crate::{
    bits::{convert_be_u24_to_u32, convert_be_u31, convert_u32_to_be_u24},
    ConnectionError,
    ErrorCode,
    settings::{
        MAXIMUM_ALLOWED_FRAME_SIZE,
        MAXIMUM_FLOW_CONTROL_WINDOW_SIZE,
        SETTINGS_ENABLE_PUSH,
        SETTINGS_HEADER_TABLE_SIZE,
        SETTINGS_INITIAL_WINDOW_SIZE,
        SETTINGS_MAX_CONCURRENT_STREAMS,
        SETTINGS_MAX_FRAME_SIZE,
        SETTINGS_MAX_HEADER_LIST_SIZE,
        SettingKind,
        SettingValue,
    },
    stream::{Priority, StreamId},
};

pub(crate) const FRAME_TYPE_DATA: u8 = 0x00;
pub(crate) const FRAME_TYPE_HEADERS: u8 = 0x01;
pub(crate) const FRAME_TYPE_PRIORITY: u8 = 0x02;
pub(crate) const FRAME_TYPE_RST_STREAM: u8 = 0x03;
pub(crate) const FRAME_TYPE_SETTINGS: u8 = 0x04;
pub(crate) const FRAME_TYPE_PUSH_PROMISE: u8 = 0x05;
pub(crate) const FRAME_TYPE_PING: u8 = 0x06;
pub(crate) const FRAME_TYPE_GOAWAY: u8 = 0x07;
pub(crate) const FRAME_TYPE_WINDOW_UPDATE: u8 = 0x08;
pub(crate) const FRAME_TYPE_CONTINUATION: u8 = 0x09;

pub const FRAME_HEADER_SIZE: usize = 9;

pub const FLAG_END_STREAM: u8 = 0x01;
pub const FLAG_ACK: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;
pub const FLAG_PADDED: u8 = 0x08;
pub const FLAG_PRIORITY: u8 = 0x20;

/// The fixed 9-octet prologue of every frame.
///
/// # References
/// * [RFC 9113 - Section 4.1. Frame Format](https://httpwg.org/specs/rfc9113.html#FrameHeader)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: StreamId,
}

impl FrameHeader {
    /// Decode the header, discarding the reserved high bit of the stream id.
    pub const fn from_bytes(bytes: [u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            payload_length: convert_be_u24_to_u32([bytes[0], bytes[1], bytes[2]]),
            frame_type: bytes[3],
            flags: bytes[4],
            stream_id: StreamId(convert_be_u31([bytes[5], bytes[6], bytes[7], bytes[8]])),
        }
    }

    pub const fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let length = convert_u32_to_be_u24(self.payload_length);
        let stream = (self.stream_id.0 & 0x7FFF_FFFF).to_be_bytes();
        [
            length[0], length[1], length[2],
            self.frame_type,
            self.flags,
            stream[0], stream[1], stream[2], stream[3],
        ]
    }
}

/// The unit of communication in an HTTP/2 connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Data {
        end_stream: bool,
        stream_id: StreamId,
        payload: Vec<u8>,
    },
    Headers {
        end_headers: bool,
        end_stream: bool,
        stream_id: StreamId,
        priority: Option<Priority>,
        fragment: Vec<u8>,
    },
    Priority {
        stream_id: StreamId,
        priority: Priority,
    },
    /// https://www.rfc-editor.org/rfc/rfc9113.html#name-rst_stream
    ResetStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    Settings {
        settings: Vec<(SettingKind, SettingValue)>,
    },
    SettingsAcknowledgement,
    PushPromise {
        end_headers: bool,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        fragment: Vec<u8>,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        additional_debug_data: Vec<u8>,
    },
    // https://httpwg.org/specs/rfc9113.html#WINDOW_UPDATE
    WindowUpdate {
        stream_id: StreamId,
        window_size_increment: u32,
    },
    Continuation {
        end_headers: bool,
        stream_id: StreamId,
        fragment: Vec<u8>,
    },

    /// Frames of an unrecognized type MUST be ignored and are discarded.
    Unknown,
}

/// Strip the `Pad Length` prologue and trailing padding from a DATA,
/// HEADERS, or PUSH_PROMISE payload. `field_bytes` is the size of the
/// fixed fields (priority, promised stream id) sitting between the pad
/// length octet and the data.
fn strip_padding(payload: &[u8], padded: bool, field_bytes: usize, stream_id: StreamId)
        -> Result<(usize, usize), ConnectionError> {
    let data_start = if padded { 1 } else { 0 } + field_bytes;
    if payload.len() < data_start {
        return Err(ConnectionError::stream(ErrorCode::FrameSizeError, stream_id));
    }

    let padding_length = if padded { payload[0] as usize } else { 0 };
    if data_start + padding_length > payload.len() {
        return Err(ConnectionError::connection(
            ErrorCode::ProtocolError,
            "padding is greater than the full payload length",
        ));
    }

    Ok((data_start, payload.len() - padding_length))
}

fn parse_priority_fields(bytes: &[u8]) -> Priority {
    Priority {
        exclusive: bytes[0] & 0x80 == 0x80,
        depends_on: StreamId(convert_be_u31([bytes[0], bytes[1], bytes[2], bytes[3]])),
        weight: bytes[4],
    }
}

impl Frame {
    /// Turn a raw payload into a typed frame, enforcing every per-type wire
    /// rule. Length-versus-MAX_FRAME_SIZE is the caller's concern, since
    /// only the connection knows its current settings.
    pub fn parse(header: FrameHeader, payload: Vec<u8>) -> Result<Frame, ConnectionError> {
        let FrameHeader { payload_length, frame_type, flags, stream_id } = header;
        debug_assert_eq!(payload_length as usize, payload.len());

        match frame_type {
            FRAME_TYPE_DATA => {
                // https://www.rfc-editor.org/rfc/rfc9113.html#section-6.1
                if stream_id == StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "DATA on the control stream"));
                }

                let is_padded = flags & FLAG_PADDED == FLAG_PADDED;
                let end_stream = flags & FLAG_END_STREAM == FLAG_END_STREAM;

                let (data_start, data_end) = strip_padding(&payload, is_padded, 0, stream_id)?;

                Ok(Frame::Data {
                    end_stream,
                    stream_id,
                    payload: payload[data_start..data_end].to_vec(),
                })
            }

            // https://www.rfc-editor.org/rfc/rfc9113.html#name-headers
            FRAME_TYPE_HEADERS => {
                if stream_id == StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "HEADERS on the control stream"));
                }

                let is_padded = flags & FLAG_PADDED == FLAG_PADDED;
                let has_priority = flags & FLAG_PRIORITY == FLAG_PRIORITY;
                let end_headers = flags & FLAG_END_HEADERS == FLAG_END_HEADERS;
                let end_stream = flags & FLAG_END_STREAM == FLAG_END_STREAM;

                let field_bytes = if has_priority { 5 } else { 0 };
                let (data_start, data_end) = strip_padding(&payload, is_padded, field_bytes, stream_id)?;

                let priority = has_priority.then(|| {
                    let fields_at = data_start - 5;
                    parse_priority_fields(&payload[fields_at..fields_at + 5])
                });

                Ok(Frame::Headers {
                    end_headers,
                    end_stream,
                    stream_id,
                    priority,
                    fragment: payload[data_start..data_end].to_vec(),
                })
            }

            FRAME_TYPE_PRIORITY => {
                if stream_id == StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "PRIORITY on the control stream"));
                }

                if payload.len() != 5 {
                    return Err(ConnectionError::stream(ErrorCode::FrameSizeError, stream_id));
                }

                Ok(Frame::Priority {
                    stream_id,
                    priority: parse_priority_fields(&payload),
                })
            }

            FRAME_TYPE_RST_STREAM => {
                if stream_id == StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "RST_STREAM on the control stream"));
                }

                if payload.len() != 4 {
                    return Err(ConnectionError::connection(ErrorCode::FrameSizeError, "RST_STREAM with payload length != 4"));
                }

                Ok(Frame::ResetStream {
                    stream_id,
                    error_code: ErrorCode::from(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])),
                })
            }

            FRAME_TYPE_SETTINGS => {
                if stream_id != StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "SETTINGS should be sent on stream 0"));
                }

                if flags & FLAG_ACK == FLAG_ACK {
                    if !payload.is_empty() {
                        return Err(ConnectionError::connection(ErrorCode::FrameSizeError, "ACK'd SETTINGS should be 0 length"));
                    }
                    return Ok(Frame::SettingsAcknowledgement);
                }

                if payload.len() % 6 != 0 {
                    return Err(ConnectionError::connection(ErrorCode::FrameSizeError, "SETTINGS frame length should be a multiple of 6"));
                }

                let mut settings = Vec::with_capacity(payload.len() / 6);
                for data in payload.chunks_exact(6) {
                    let kind = u16::from_be_bytes([data[0], data[1]]);
                    let value = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
                    settings.push(match kind {
                        SETTINGS_HEADER_TABLE_SIZE => (SettingKind::HeaderTableSize, SettingValue(value)),
                        SETTINGS_ENABLE_PUSH => {
                            if value != 0 && value != 1 {
                                return Err(ConnectionError::connection(ErrorCode::ProtocolError, "ENABLE_PUSH invalid value: neither 0 nor 1"));
                            }
                            (SettingKind::EnablePush, SettingValue(value))
                        }
                        SETTINGS_MAX_CONCURRENT_STREAMS => (SettingKind::MaxConcurrentStreams, SettingValue(value)),
                        SETTINGS_INITIAL_WINDOW_SIZE => {
                            if value > MAXIMUM_FLOW_CONTROL_WINDOW_SIZE {
                                return Err(ConnectionError::connection(ErrorCode::FlowControlError, "maximum flow-control window size exceeded"));
                            }
                            (SettingKind::InitialWindowSize, SettingValue(value))
                        }
                        SETTINGS_MAX_FRAME_SIZE => {
                            if value < SettingKind::MaxFrameSize.default_value().0 || value > MAXIMUM_ALLOWED_FRAME_SIZE {
                                return Err(ConnectionError::connection(ErrorCode::ProtocolError, "MAX_FRAME_SIZE outside the permitted range"));
                            }
                            (SettingKind::MaxFrameSize, SettingValue(value))
                        }
                        SETTINGS_MAX_HEADER_LIST_SIZE => (SettingKind::MaxHeaderListSize, SettingValue(value)),
                        _ => {
                            // Unknown settings MUST be ignored.
                            continue;
                        }
                    })
                }
                Ok(Frame::Settings { settings })
            }

            FRAME_TYPE_PUSH_PROMISE => {
                if stream_id == StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "PUSH_PROMISE on the control stream"));
                }

                let is_padded = flags & FLAG_PADDED == FLAG_PADDED;
                let end_headers = flags & FLAG_END_HEADERS == FLAG_END_HEADERS;

                let (data_start, data_end) = strip_padding(&payload, is_padded, 4, stream_id)?;
                let id_at = data_start - 4;
                let promised_stream_id = StreamId(convert_be_u31([
                    payload[id_at], payload[id_at + 1], payload[id_at + 2], payload[id_at + 3],
                ]));

                Ok(Frame::PushPromise {
                    end_headers,
                    stream_id,
                    promised_stream_id,
                    fragment: payload[data_start..data_end].to_vec(),
                })
            }

            // [RFC 9113 - Section 6.7](https://httpwg.org/specs/rfc9113.html#PING)
            FRAME_TYPE_PING => {
                if stream_id != StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "PING on non-control stream"));
                }
                if payload.len() != 8 {
                    return Err(ConnectionError::connection(ErrorCode::FrameSizeError, "PING payload length != 8"));
                }
                Ok(Frame::Ping {
                    ack: flags & FLAG_ACK == FLAG_ACK,
                    payload: payload.try_into().expect("length checked above"),
                })
            }

            FRAME_TYPE_GOAWAY => {
                if stream_id != StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "GOAWAY on non-control stream"));
                }
                if payload.len() < 8 {
                    return Err(ConnectionError::connection(ErrorCode::FrameSizeError, "illegal GOAWAY size"));
                }
                Ok(Frame::GoAway {
                    last_stream_id: StreamId(convert_be_u31([payload[0], payload[1], payload[2], payload[3]])),
                    error_code: ErrorCode::from(u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]])),
                    additional_debug_data: payload[8..].to_vec(),
                })
            }

            // https://www.rfc-editor.org/rfc/rfc9113.html#name-window_update
            FRAME_TYPE_WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(ConnectionError::connection(ErrorCode::FrameSizeError, "WINDOW_UPDATE length != 4"));
                }

                let window_size_increment = convert_be_u31([payload[0], payload[1], payload[2], payload[3]]);
                if window_size_increment == 0 {
                    if stream_id == StreamId::CONTROL {
                        return Err(ConnectionError::connection(ErrorCode::ProtocolError, "WINDOW_UPDATE with 0 increment on the control stream"));
                    }
                    return Err(ConnectionError::stream(ErrorCode::ProtocolError, stream_id));
                }

                Ok(Frame::WindowUpdate { stream_id, window_size_increment })
            }

            FRAME_TYPE_CONTINUATION => {
                if stream_id == StreamId::CONTROL {
                    return Err(ConnectionError::connection(ErrorCode::ProtocolError, "CONTINUATION on the control stream"));
                }

                Ok(Frame::Continuation {
                    end_headers: flags & FLAG_END_HEADERS == FLAG_END_HEADERS,
                    stream_id,
                    fragment: payload,
                })
            }

            _ => Ok(Frame::Unknown),
        }
    }

    /// Generate the FLAGS for this frame.
    pub fn flags(&self) -> u8 {
        match self {
            Frame::Data { end_stream, .. } if *end_stream => FLAG_END_STREAM,
            Frame::Data { .. } => 0,
            Frame::Headers { end_headers, end_stream, priority, .. } => {
                end_headers.then_some(FLAG_END_HEADERS).unwrap_or(0)
                    | end_stream.then_some(FLAG_END_STREAM).unwrap_or(0)
                    | priority.is_some().then_some(FLAG_PRIORITY).unwrap_or(0)
            }
            Frame::Priority { .. } => 0,
            Frame::ResetStream { .. } => 0,
            Frame::Settings { .. } => 0,
            Frame::SettingsAcknowledgement => FLAG_ACK,
            Frame::PushPromise { end_headers, .. } if *end_headers => FLAG_END_HEADERS,
            Frame::PushPromise { .. } => 0,
            Frame::Ping { ack, .. } if *ack => FLAG_ACK,
            Frame::Ping { .. } => 0,
            Frame::GoAway { .. } => 0,
            Frame::WindowUpdate { .. } => 0,
            Frame::Continuation { end_headers, .. } if *end_headers => FLAG_END_HEADERS,
            Frame::Continuation { .. } => 0,
            Frame::Unknown => unreachable!(),
        }
    }

    pub const fn frame_type(&self) -> u8 {
        match self {
            Frame::Data { .. } => FRAME_TYPE_DATA,
            Frame::Headers { .. } => FRAME_TYPE_HEADERS,
            Frame::Priority { .. } => FRAME_TYPE_PRIORITY,
            Frame::ResetStream { .. } => FRAME_TYPE_RST_STREAM,
            Frame::Settings { .. } => FRAME_TYPE_SETTINGS,
            Frame::SettingsAcknowledgement => FRAME_TYPE_SETTINGS,
            Frame::PushPromise { .. } => FRAME_TYPE_PUSH_PROMISE,
            Frame::Ping { .. } => FRAME_TYPE_PING,
            Frame::GoAway { .. } => FRAME_TYPE_GOAWAY,
            Frame::WindowUpdate { .. } => FRAME_TYPE_WINDOW_UPDATE,
            Frame::Continuation { .. } => FRAME_TYPE_CONTINUATION,
            Frame::Unknown => unreachable!(),
        }
    }

    pub const fn stream(&self) -> StreamId {
        match self {
            Frame::Data { stream_id, .. } => *stream_id,
            Frame::Headers { stream_id, .. } => *stream_id,
            Frame::Priority { stream_id, .. } => *stream_id,
            Frame::ResetStream { stream_id, .. } => *stream_id,
            Frame::Settings { .. } => StreamId::CONTROL,
            Frame::SettingsAcknowledgement => StreamId::CONTROL,
            Frame::PushPromise { stream_id, .. } => *stream_id,
            Frame::Ping { .. } => StreamId::CONTROL,
            Frame::GoAway { .. } => StreamId::CONTROL,
            Frame::WindowUpdate { stream_id, .. } => *stream_id,
            Frame::Continuation { stream_id, .. } => *stream_id,
            Frame::Unknown => unreachable!(),
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Frame::Data { payload, .. } => payload,
            Frame::Headers { priority, fragment, .. } => match priority {
                Some(priority) => {
                    let mut payload = Vec::with_capacity(5 + fragment.len());
                    payload.extend_from_slice(&priority_field_bytes(&priority));
                    payload.extend_from_slice(&fragment);
                    payload
                }
                None => fragment,
            },
            Frame::Priority { priority, .. } => priority_field_bytes(&priority).to_vec(),
            Frame::ResetStream { error_code, .. } => {
                Vec::from((error_code as u32).to_be_bytes())
            }
            Frame::Settings { settings } => {
                let mut payload = Vec::with_capacity(settings.len() * 6);
                for (kind, value) in settings {
                    payload.extend((kind as u16).to_be_bytes());
                    payload.extend(value.0.to_be_bytes());
                }
                payload
            }
            Frame::SettingsAcknowledgement => Vec::new(),
            Frame::PushPromise { promised_stream_id, fragment, .. } => {
                let mut payload = Vec::with_capacity(4 + fragment.len());
                payload.extend_from_slice(&(promised_stream_id.0 & 0x7FFF_FFFF).to_be_bytes());
                payload.extend_from_slice(&fragment);
                payload
            }
            Frame::Ping { payload, .. } => Vec::from(payload),
            Frame::GoAway { last_stream_id, error_code, additional_debug_data } => {
                let mut payload = Vec::with_capacity(4 + 4 + additional_debug_data.len());
                payload.extend_from_slice(&(last_stream_id.0 & 0x7FFF_FFFF).to_be_bytes());
                payload.extend_from_slice(&(error_code as u32).to_be_bytes());
                payload.extend_from_slice(&additional_debug_data);
                payload
            }
            Frame::WindowUpdate { window_size_increment, .. } => {
                (window_size_increment & 0x7FFF_FFFF).to_be_bytes().to_vec()
            }
            Frame::Continuation { fragment, .. } => fragment,
            Frame::Unknown => unreachable!(),
        }
    }

    /// Serialize the frame, header included.
    pub fn encode(self) -> Vec<u8> {
        let header = FrameHeader {
            payload_length: 0, // patched below
            frame_type: self.frame_type(),
            flags: self.flags(),
            stream_id: self.stream(),
        };

        let payload = self.into_payload();
        let header = FrameHeader {
            payload_length: payload.len() as u32,
            ..header
        };

        let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&payload);
        bytes
    }
}

fn priority_field_bytes(priority: &Priority) -> [u8; 5] {
    let mut dependency = (priority.depends_on.0 & 0x7FFF_FFFF).to_be_bytes();
    if priority.exclusive {
        dependency[0] |= 0x80;
    }
    [dependency[0], dependency[1], dependency[2], dependency[3], priority.weight]
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn parse_bytes(bytes: &[u8]) -> Result<Frame, ConnectionError> {
        let header = FrameHeader::from_bytes(bytes[..FRAME_HEADER_SIZE].try_into().unwrap());
        Frame::parse(header, bytes[FRAME_HEADER_SIZE..].to_vec())
    }

    #[test]
    fn test_frame_header_round_trip() {
        let header = FrameHeader {
            payload_length: 0xAABBCC,
            frame_type: FRAME_TYPE_HEADERS,
            flags: FLAG_END_HEADERS | FLAG_END_STREAM,
            stream_id: StreamId(1),
        };
        assert_eq!(FrameHeader::from_bytes(header.to_bytes()), header);
    }

    #[test]
    fn test_frame_header_clears_reserved_bit() {
        let header = FrameHeader::from_bytes([0, 0, 0, 0, 0, 0x80, 0, 0, 0x03]);
        assert_eq!(header.stream_id, StreamId(3));
    }

    #[test]
    fn test_encoded_headers_frame_layout() {
        let frame = Frame::Headers {
            end_headers: true,
            end_stream: true,
            stream_id: StreamId(1),
            priority: None,
            fragment: vec![0xDE],
        };
        let buf = frame.encode();
        assert_eq!(buf.len(), 10);
        assert_eq!(buf[0..3], [0x00, 0x00, 0x01], "length incorrect");
        assert_eq!(buf[3], 0x01, "type incorrect");
        assert_eq!(buf[4], 0b0000_0101, "flags incorrect");
        assert_eq!(buf[5..9], [0x00, 0x00, 0x00, 0x01], "stream ID incorrect");
        assert_eq!(buf[9], 0xDE, "incorrect payload");
    }

    #[rstest]
    #[case(Frame::Data { end_stream: true, stream_id: StreamId(1), payload: b"ok".to_vec() })]
    #[case(Frame::Data { end_stream: false, stream_id: StreamId(3), payload: Vec::new() })]
    #[case(Frame::Headers { end_headers: true, end_stream: false, stream_id: StreamId(5), priority: None, fragment: vec![0x82, 0x84] })]
    #[case(Frame::Headers {
        end_headers: false,
        end_stream: true,
        stream_id: StreamId(7),
        priority: Some(Priority { depends_on: StreamId(3), weight: 42, exclusive: true }),
        fragment: vec![0x88],
    })]
    #[case(Frame::Priority { stream_id: StreamId(9), priority: Priority { depends_on: StreamId(1), weight: 0, exclusive: false } })]
    #[case(Frame::ResetStream { stream_id: StreamId(1), error_code: ErrorCode::Cancel })]
    #[case(Frame::Settings { settings: vec![
        (SettingKind::MaxConcurrentStreams, SettingValue(100)),
        (SettingKind::InitialWindowSize, SettingValue(4)),
    ] })]
    #[case(Frame::SettingsAcknowledgement)]
    #[case(Frame::PushPromise { end_headers: true, stream_id: StreamId(1), promised_stream_id: StreamId(2), fragment: vec![0x82] })]
    #[case(Frame::Ping { ack: false, payload: *b"stafetta" })]
    #[case(Frame::Ping { ack: true, payload: [0; 8] })]
    #[case(Frame::GoAway { last_stream_id: StreamId(7), error_code: ErrorCode::ProtocolError, additional_debug_data: b"bye".to_vec() })]
    #[case(Frame::WindowUpdate { stream_id: StreamId::CONTROL, window_size_increment: 0x7FFF_FFFF })]
    #[case(Frame::WindowUpdate { stream_id: StreamId(3), window_size_increment: 1 })]
    #[case(Frame::Continuation { end_headers: true, stream_id: StreamId(9), fragment: vec![0xBE, 0xA0] })]
    fn test_parse_inverts_encode(#[case] frame: Frame) {
        let encoded = frame.clone().encode();
        assert_eq!(parse_bytes(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_data_padding_is_stripped() {
        // Pad Length 2, "hi", two zero octets of padding.
        let mut bytes = FrameHeader {
            payload_length: 5,
            frame_type: FRAME_TYPE_DATA,
            flags: FLAG_PADDED,
            stream_id: StreamId(1),
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[2, b'h', b'i', 0, 0]);

        assert_eq!(parse_bytes(&bytes).unwrap(), Frame::Data {
            end_stream: false,
            stream_id: StreamId(1),
            payload: b"hi".to_vec(),
        });
    }

    #[test]
    fn test_data_padding_may_leave_empty_payload() {
        let mut bytes = FrameHeader {
            payload_length: 4,
            frame_type: FRAME_TYPE_DATA,
            flags: FLAG_PADDED,
            stream_id: StreamId(1),
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[3, 0, 0, 0]);

        assert_eq!(parse_bytes(&bytes).unwrap(), Frame::Data {
            end_stream: false,
            stream_id: StreamId(1),
            payload: Vec::new(),
        });
    }

    #[test]
    fn test_data_padding_covering_whole_payload_is_protocol_error() {
        let mut bytes = FrameHeader {
            payload_length: 4,
            frame_type: FRAME_TYPE_DATA,
            flags: FLAG_PADDED,
            stream_id: StreamId(1),
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[4, 0, 0, 0]);

        assert!(matches!(
            parse_bytes(&bytes),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::ProtocolError, .. }),
        ));
    }

    #[test]
    fn test_headers_with_priority_and_padding() {
        // Pad Length 1, exclusive dependency on 3, weight octet 15,
        // fragment 0x82, one padding octet.
        let mut bytes = FrameHeader {
            payload_length: 8,
            frame_type: FRAME_TYPE_HEADERS,
            flags: FLAG_PADDED | FLAG_PRIORITY | FLAG_END_HEADERS,
            stream_id: StreamId(5),
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[1, 0x80, 0, 0, 3, 15, 0x82, 0]);

        assert_eq!(parse_bytes(&bytes).unwrap(), Frame::Headers {
            end_headers: true,
            end_stream: false,
            stream_id: StreamId(5),
            priority: Some(Priority { depends_on: StreamId(3), weight: 15, exclusive: true }),
            fragment: vec![0x82],
        });
    }

    #[rstest]
    #[case(FRAME_TYPE_DATA)]
    #[case(FRAME_TYPE_HEADERS)]
    fn test_data_and_headers_on_control_stream(#[case] frame_type: u8) {
        let bytes = FrameHeader {
            payload_length: 0,
            frame_type,
            flags: 0,
            stream_id: StreamId::CONTROL,
        }.to_bytes();

        assert!(matches!(
            parse_bytes(&bytes),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::ProtocolError, .. }),
        ));
    }

    #[test]
    fn test_settings_on_nonzero_stream() {
        let bytes = FrameHeader {
            payload_length: 0,
            frame_type: FRAME_TYPE_SETTINGS,
            flags: 0,
            stream_id: StreamId(1),
        }.to_bytes();

        assert!(matches!(
            parse_bytes(&bytes),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::ProtocolError, .. }),
        ));
    }

    #[test]
    fn test_settings_length_must_be_multiple_of_six() {
        let mut bytes = FrameHeader {
            payload_length: 5,
            frame_type: FRAME_TYPE_SETTINGS,
            flags: 0,
            stream_id: StreamId::CONTROL,
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[0, 3, 0, 0, 0]);

        assert!(matches!(
            parse_bytes(&bytes),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::FrameSizeError, .. }),
        ));
    }

    #[rstest]
    #[case(16_383)]
    #[case(16_777_216)]
    fn test_settings_max_frame_size_out_of_range(#[case] value: u32) {
        let mut bytes = FrameHeader {
            payload_length: 6,
            frame_type: FRAME_TYPE_SETTINGS,
            flags: 0,
            stream_id: StreamId::CONTROL,
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&SETTINGS_MAX_FRAME_SIZE.to_be_bytes());
        bytes.extend_from_slice(&value.to_be_bytes());

        assert!(matches!(
            parse_bytes(&bytes),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::ProtocolError, .. }),
        ));
    }

    #[test]
    fn test_settings_unknown_parameter_is_skipped() {
        let mut bytes = FrameHeader {
            payload_length: 6,
            frame_type: FRAME_TYPE_SETTINGS,
            flags: 0,
            stream_id: StreamId::CONTROL,
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[0xAB, 0xCD, 0, 0, 0, 1]);

        assert_eq!(parse_bytes(&bytes).unwrap(), Frame::Settings { settings: Vec::new() });
    }

    #[rstest]
    #[case(StreamId::CONTROL)]
    #[case(StreamId(1))]
    fn test_window_update_zero_increment(#[case] stream_id: StreamId) {
        let mut bytes = FrameHeader {
            payload_length: 4,
            frame_type: FRAME_TYPE_WINDOW_UPDATE,
            flags: 0,
            stream_id,
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0]);

        let result = parse_bytes(&bytes);
        if stream_id == StreamId::CONTROL {
            assert!(matches!(result, Err(ConnectionError::ConnectionError { error_code: ErrorCode::ProtocolError, .. })));
        } else {
            assert!(matches!(result, Err(ConnectionError::StreamError { error_code: ErrorCode::ProtocolError, .. })));
        }
    }

    #[rstest]
    #[case(3)]
    #[case(5)]
    fn test_window_update_length_must_be_four(#[case] length: u32) {
        let mut bytes = FrameHeader {
            payload_length: length,
            frame_type: FRAME_TYPE_WINDOW_UPDATE,
            flags: 0,
            stream_id: StreamId(1),
        }.to_bytes().to_vec();
        bytes.extend(std::iter::repeat(0x01u8).take(length as usize));

        assert!(matches!(
            parse_bytes(&bytes),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::FrameSizeError, .. }),
        ));
    }

    #[test]
    fn test_goaway_too_short() {
        let mut bytes = FrameHeader {
            payload_length: 7,
            frame_type: FRAME_TYPE_GOAWAY,
            flags: 0,
            stream_id: StreamId::CONTROL,
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[0; 7]);

        assert!(matches!(
            parse_bytes(&bytes),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::FrameSizeError, .. }),
        ));
    }

    #[test]
    fn test_unknown_frame_type_is_ignored() {
        let mut bytes = FrameHeader {
            payload_length: 3,
            frame_type: 0x2A,
            flags: 0xFF,
            stream_id: StreamId(11),
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);

        assert_eq!(parse_bytes(&bytes).unwrap(), Frame::Unknown);
    }

    #[test]
    fn test_rst_stream_wrong_length() {
        let mut bytes = FrameHeader {
            payload_length: 3,
            frame_type: FRAME_TYPE_RST_STREAM,
            flags: 0,
            stream_id: StreamId(1),
        }.to_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 8]);

        assert!(matches!(
            parse_bytes(&bytes),
            Err(ConnectionError::ConnectionError { error_code: ErrorCode::FrameSizeError, .. }),
        ));
    }
}
