// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use crate::stream::StreamId;

/// The error codes carried by RST_STREAM and GOAWAY frames.
///
/// # References
/// * [RFC 9113 - Section 7. Error Codes](https://httpwg.org/specs/rfc9113.html#ErrorCodes)
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0,
    ProtocolError = 1,
    InternalError = 2,
    FlowControlError = 3,
    SettingsTimeout = 4,
    StreamClosed = 5,
    FrameSizeError = 6,
    RefusedStream = 7,
    Cancel = 8,
    CompressionError = 9,
    ConnectError = 10,
    EnhanceYourCalm = 11,
    InadequateSecurity = 12,
    Http11Required = 13,
}

impl From<u32> for ErrorCode {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::ProtocolError,
            2 => Self::InternalError,
            3 => Self::FlowControlError,
            4 => Self::SettingsTimeout,
            5 => Self::StreamClosed,
            6 => Self::FrameSizeError,
            7 => Self::RefusedStream,
            8 => Self::Cancel,
            9 => Self::CompressionError,
            10 => Self::ConnectError,
            11 => Self::EnhanceYourCalm,
            12 => Self::InadequateSecurity,
            13 => Self::Http11Required,
            _ => {
                // [RFC 9113, section 7](https://httpwg.org/specs/rfc9113.html#rfc.section.7.p.5):
                // > Unknown or unsupported error codes MUST NOT trigger any
                // > special behavior. These MAY be treated by an implementation
                // > as being equivalent to INTERNAL_ERROR.
                Self::InternalError
            }
        }
    }
}

/// Everything that can go wrong while servicing a connection.
///
/// Stream-scoped failures reset one stream and leave the rest of the
/// connection intact; connection-scoped failures end in a GOAWAY.
#[derive(Debug)]
pub enum ConnectionError {
    /// The connection is closed.
    Closed,
    Io(std::io::Error),
    ConnectionError {
        error_code: ErrorCode,
        additional_debug_data: String,
    },
    StreamError {
        error_code: ErrorCode,
        stream_id: StreamId,
    },
}

impl ConnectionError {
    pub fn connection(error_code: ErrorCode, additional_debug_data: impl Into<String>) -> Self {
        Self::ConnectionError {
            error_code,
            additional_debug_data: additional_debug_data.into(),
        }
    }

    pub const fn stream(error_code: ErrorCode, stream_id: StreamId) -> Self {
        Self::StreamError { error_code, stream_id }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, ErrorCode::NoError)]
    #[case(1, ErrorCode::ProtocolError)]
    #[case(5, ErrorCode::StreamClosed)]
    #[case(9, ErrorCode::CompressionError)]
    #[case(13, ErrorCode::Http11Required)]
    #[case(14, ErrorCode::InternalError)]
    #[case(0xDEAD_BEEF, ErrorCode::InternalError)]
    fn test_error_code_from_wire(#[case] wire: u32, #[case] expected: ErrorCode) {
        assert_eq!(ErrorCode::from(wire), expected);
    }

    #[test]
    fn test_wire_values_round_trip() {
        for code in [
            ErrorCode::NoError, ErrorCode::ProtocolError, ErrorCode::InternalError,
            ErrorCode::FlowControlError, ErrorCode::SettingsTimeout, ErrorCode::StreamClosed,
            ErrorCode::FrameSizeError, ErrorCode::RefusedStream, ErrorCode::Cancel,
            ErrorCode::CompressionError, ErrorCode::ConnectError, ErrorCode::EnhanceYourCalm,
            ErrorCode::InadequateSecurity, ErrorCode::Http11Required,
        ] {
            assert_eq!(ErrorCode::from(code as u32), code);
        }
    }
}
