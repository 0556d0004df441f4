use std::io;

use openssl::error::ErrorStack;
use snafu::Snafu;
use tokio::sync::oneshot::error::RecvError;

use crate::msg::{ChannelOpenFailureReson, DisconnectReson};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)), context(suffix(false)), module(builder))]
pub enum Error {
    #[snafu(context(false), display("Openssl error: {source}"))]
    Openssl { source: ErrorStack },

    #[snafu(context(false), display("Standard io error: {source}"))]
    Io { source: io::Error },

    #[snafu(display("UndefinedBehavior: {tip}"))]
    UndefinedBehavior { tip: String },

    #[snafu(display("Banner exchange failed: {tip}"))]
    Banner { tip: String },

    #[snafu(display("Protocol error: {tip}"))]
    Protocol { tip: String },

    #[snafu(display("Algorithm negotiation failed: no matching {what}"))]
    Negotiation { what: String },

    #[snafu(display("Message mac verification failed"))]
    MacVerificationFailed,

    #[snafu(display("Uncompress or Compress Error"))]
    Compress,

    #[snafu(display("Failed to verify hostkey"))]
    HostKeyVerifyFailed,

    #[snafu(display("Host key for server doesn't match the known key"))]
    HostKeyMismatch,

    #[snafu(display("Bad authentication type; allowed types: {allowed:?}"))]
    BadAuthMethod { allowed: Vec<String> },

    #[snafu(display("Authentication failed"))]
    AuthDenied,

    #[snafu(display("Partial authentication; remaining types: {remaining:?}"))]
    PartialAuth { remaining: Vec<String> },

    #[snafu(display("Password expired: {prompt}"))]
    PasswordExpired { prompt: String },

    #[snafu(display("Channel open failed: {reason:?} {desc}"))]
    ChannelOpenDenied {
        reason: ChannelOpenFailureReson,
        desc: String,
    },

    #[snafu(display("Channel was closed"))]
    ChannelClosed,

    #[snafu(display("Channel end of file"))]
    ChannelEof,

    #[snafu(display("Channel request failed"))]
    ChannelFailure,

    #[snafu(display("Failed to Request: {tip}"))]
    RequestFailure { tip: String },

    #[snafu(display("SFtp: {tip}"))]
    NoSuchFile { tip: String },

    #[snafu(display("SFtp: {tip}"))]
    PermissionDenied { tip: String },

    #[snafu(display("SFtp: {tip}"))]
    SFtpFailure { tip: String },

    #[snafu(display("SFtp: {tip}"))]
    BadMessage { tip: String },

    #[snafu(display("SFtp: {tip}"))]
    NoConnection { tip: String },

    #[snafu(display("SFtp: {tip}"))]
    ConnectionLost { tip: String },

    #[snafu(display("SFtp: {tip}"))]
    OpUnsupported { tip: String },

    #[snafu(display("Operation timed out"))]
    Timeout,

    #[snafu(display("Private key file is encrypted"))]
    PasswordRequired,

    #[snafu(display("Invalid key: {tip}"))]
    MalformedKey { tip: String },

    #[snafu(display("Server connection lost"))]
    Disconnected,

    #[snafu(display("Disconnected by peer: {reason:?} {desc}"))]
    Disconnect { reason: DisconnectReson, desc: String },

    #[snafu(display("The packet with sequence number {sequence} was rejected by the peer"))]
    Unimplemented { sequence: u32 },

    #[snafu(display("Invalid Argument: {tip}"))]
    InvalidArgument { tip: String },
}

impl Error {
    pub(crate) fn ub(tip: impl Into<String>) -> Self {
        Self::UndefinedBehavior { tip: tip.into() }
    }

    pub(crate) fn protocol(tip: impl Into<String>) -> Self {
        Self::Protocol { tip: tip.into() }
    }

    pub(crate) fn invalid_argument(tip: impl Into<String>) -> Self {
        Self::InvalidArgument { tip: tip.into() }
    }

    pub(crate) fn malformed_key(tip: impl Into<String>) -> Self {
        Self::MalformedKey { tip: tip.into() }
    }

    /// The disconnect code sent to the peer when this error terminates a session.
    pub(crate) fn disconnect_reason(&self) -> DisconnectReson {
        match self {
            Self::MacVerificationFailed => DisconnectReson::MAC_ERROR,
            Self::Negotiation { .. } | Self::HostKeyVerifyFailed => {
                DisconnectReson::KEY_EXCHANGE_FAILED
            }
            Self::HostKeyMismatch => DisconnectReson::HOST_KEY_NOT_VERIFIABLE,
            Self::Compress => DisconnectReson::COMPRESSION_ERROR,
            Self::Io { .. } | Self::Disconnected => DisconnectReson::CONNECTION_LOST,
            Self::Protocol { .. } | Self::Openssl { .. } | Self::UndefinedBehavior { .. } => {
                DisconnectReson::PROTOCOL_ERROR
            }
            _ => DisconnectReson::BY_APPLICATION,
        }
    }
}

// io::Error can't be cloned, keep its kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Openssl { source } => Self::Openssl {
                source: source.clone(),
            },
            Self::Io { source } => Self::Io {
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Self::UndefinedBehavior { tip } => Self::UndefinedBehavior { tip: tip.clone() },
            Self::Banner { tip } => Self::Banner { tip: tip.clone() },
            Self::Protocol { tip } => Self::Protocol { tip: tip.clone() },
            Self::Negotiation { what } => Self::Negotiation { what: what.clone() },
            Self::MacVerificationFailed => Self::MacVerificationFailed,
            Self::Compress => Self::Compress,
            Self::HostKeyVerifyFailed => Self::HostKeyVerifyFailed,
            Self::HostKeyMismatch => Self::HostKeyMismatch,
            Self::BadAuthMethod { allowed } => Self::BadAuthMethod {
                allowed: allowed.clone(),
            },
            Self::AuthDenied => Self::AuthDenied,
            Self::PartialAuth { remaining } => Self::PartialAuth {
                remaining: remaining.clone(),
            },
            Self::PasswordExpired { prompt } => Self::PasswordExpired {
                prompt: prompt.clone(),
            },
            Self::ChannelOpenDenied { reason, desc } => Self::ChannelOpenDenied {
                reason: *reason,
                desc: desc.clone(),
            },
            Self::ChannelClosed => Self::ChannelClosed,
            Self::ChannelEof => Self::ChannelEof,
            Self::ChannelFailure => Self::ChannelFailure,
            Self::RequestFailure { tip } => Self::RequestFailure { tip: tip.clone() },
            Self::NoSuchFile { tip } => Self::NoSuchFile { tip: tip.clone() },
            Self::PermissionDenied { tip } => Self::PermissionDenied { tip: tip.clone() },
            Self::SFtpFailure { tip } => Self::SFtpFailure { tip: tip.clone() },
            Self::BadMessage { tip } => Self::BadMessage { tip: tip.clone() },
            Self::NoConnection { tip } => Self::NoConnection { tip: tip.clone() },
            Self::ConnectionLost { tip } => Self::ConnectionLost { tip: tip.clone() },
            Self::OpUnsupported { tip } => Self::OpUnsupported { tip: tip.clone() },
            Self::Timeout => Self::Timeout,
            Self::PasswordRequired => Self::PasswordRequired,
            Self::MalformedKey { tip } => Self::MalformedKey { tip: tip.clone() },
            Self::Disconnected => Self::Disconnected,
            Self::Disconnect { reason, desc } => Self::Disconnect {
                reason: *reason,
                desc: desc.clone(),
            },
            Self::Unimplemented { sequence } => Self::Unimplemented {
                sequence: *sequence,
            },
            Self::InvalidArgument { tip } => Self::InvalidArgument { tip: tip.clone() },
        }
    }
}

impl From<RecvError> for Error {
    fn from(_: RecvError) -> Self {
        Self::Disconnected
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io { source } => source.kind(),
            Error::NoSuchFile { .. } => io::ErrorKind::NotFound,
            Error::PermissionDenied { .. } => io::ErrorKind::PermissionDenied,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Disconnected | Error::Disconnect { .. } | Error::ConnectionLost { .. } => {
                io::ErrorKind::ConnectionAborted
            }
            Error::NoConnection { .. } => io::ErrorKind::NotConnected,
            Error::OpUnsupported { .. } => io::ErrorKind::Unsupported,
            Error::InvalidArgument { .. } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sftp_status_maps_to_io_kind() {
        let err: io::Error = Error::NoSuchFile {
            tip: "no such file".to_string(),
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("no such file"));

        let err: io::Error = Error::PermissionDenied {
            tip: "denied".to_string(),
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        let err: io::Error = Error::SFtpFailure {
            tip: "failure".to_string(),
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn disconnect_codes() {
        assert_eq!(
            Error::MacVerificationFailed.disconnect_reason(),
            DisconnectReson::MAC_ERROR
        );
        assert_eq!(
            Error::protocol("bad").disconnect_reason(),
            DisconnectReson::PROTOCOL_ERROR
        );
        assert_eq!(
            Error::Negotiation {
                what: "cipher".to_string()
            }
            .disconnect_reason(),
            DisconnectReson::KEY_EXCHANGE_FAILED
        );
    }

    #[test]
    fn clone_keeps_io_kind() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        match err.clone() {
            Error::Io { source } => assert_eq!(source.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {other:?}"),
        }
    }
}
