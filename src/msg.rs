use std::time::Duration;

use derive_new::new;

use crate::{
    auth::InteractiveHandler,
    channel::Channel,
    error::Result,
    ssh::{buffer::Buffer, common::code::*},
    OSender,
};

/// Work handed from a `Session` or `Channel` handle to the session task.
pub(crate) enum Request {
    Disconnect {
        reason: DisconnectReson,
        desc: String,
    },
    Userauth {
        username: String,
        method: String,
        payload: Vec<u8>,
        handler: Option<InteractiveHandler>,
        sender: OSender<Result<Vec<String>>>,
    },
    Renegotiate {
        sender: OSender<Result<()>>,
    },
    Ignore {
        data: Vec<u8>,
    },
    SetKeepalive(Option<Duration>),
    GlobalRequest {
        name: String,
        data: Vec<u8>,
        sender: Option<OSender<Result<Option<Vec<u8>>>>>,
    },
    PortForward {
        address: String,
        port: u32,
        sender: OSender<Result<u32>>,
    },
    CancelPortForward {
        address: String,
        port: u32,
        sender: OSender<Result<()>>,
    },
    ChannelOpen {
        kind: String,
        extra: Vec<u8>,
        sender: OSender<Result<Channel>>,
    },
    ChannelData {
        id: u32,
        ext: Option<u32>,
        data: Vec<u8>,
        sender: OSender<Result<usize>>,
    },
    ChannelRequest {
        id: u32,
        name: String,
        data: Vec<u8>,
        sender: Option<OSender<Result<()>>>,
    },
    ChannelWindowAdjust {
        id: u32,
        count: u32,
    },
    ChannelEof {
        id: u32,
        sender: OSender<Result<()>>,
    },
    ChannelClose {
        id: u32,
        sender: Option<OSender<Result<()>>>,
    },
}

#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChannelOpenFailureReson(pub u32);

impl ChannelOpenFailureReson {
    pub const ADMINISTRATIVELY_PROHIBITED: Self = Self(SSH_OPEN_ADMINISTRATIVELY_PROHIBITED);
    pub const CONNECT_FAILED: Self = Self(SSH_OPEN_CONNECT_FAILED);
    pub const UNKNOWN_CHANNELTYPE: Self = Self(SSH_OPEN_UNKNOWN_CHANNELTYPE);
    pub const RESOURCE_SHORTAGE: Self = Self(SSH_OPEN_RESOURCE_SHORTAGE);
}

#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DisconnectReson(pub u32);

impl DisconnectReson {
    pub const HOST_NOT_ALLOWED_TO_CONNECT: Self = Self(SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT);
    pub const PROTOCOL_ERROR: Self = Self(SSH_DISCONNECT_PROTOCOL_ERROR);
    pub const KEY_EXCHANGE_FAILED: Self = Self(SSH_DISCONNECT_KEY_EXCHANGE_FAILED);
    pub const RESERVED: Self = Self(SSH_DISCONNECT_RESERVED);
    pub const MAC_ERROR: Self = Self(SSH_DISCONNECT_MAC_ERROR);
    pub const COMPRESSION_ERROR: Self = Self(SSH_DISCONNECT_COMPRESSION_ERROR);
    pub const SERVICE_NOT_AVAILABLE: Self = Self(SSH_DISCONNECT_SERVICE_NOT_AVAILABLE);
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: Self =
        Self(SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED);
    pub const HOST_KEY_NOT_VERIFIABLE: Self = Self(SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE);
    pub const CONNECTION_LOST: Self = Self(SSH_DISCONNECT_CONNECTION_LOST);
    pub const BY_APPLICATION: Self = Self(SSH_DISCONNECT_BY_APPLICATION);
    pub const TOO_MANY_CONNECTIONS: Self = Self(SSH_DISCONNECT_TOO_MANY_CONNECTIONS);
    pub const AUTH_CANCELLED_BY_USER: Self = Self(SSH_DISCONNECT_AUTH_CANCELLED_BY_USER);
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: Self =
        Self(SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE);
    pub const ILLEGAL_USER_NAME: Self = Self(SSH_DISCONNECT_ILLEGAL_USER_NAME);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal(pub String);

impl PartialEq<&str> for Signal {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl From<&str> for Signal {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Signal {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Signal {
    pub const ABRT: &'static str = "ABRT";
    pub const FPE: &'static str = "FPE";
    pub const HUP: &'static str = "HUP";
    pub const ILL: &'static str = "ILL";
    pub const INT: &'static str = "INT";
    pub const KILL: &'static str = "KILL";
    pub const PIPE: &'static str = "PIPE";
    pub const QUIT: &'static str = "QUIT";
    pub const SEGV: &'static str = "SEGV";
    pub const TERM: &'static str = "TERM";
    pub const USR1: &'static str = "USR1";
    pub const USR2: &'static str = "USR2";
}

#[derive(Debug, Clone, PartialEq, Eq, new)]
pub enum ExitStatus {
    Normal(u32),
    Interrupt {
        signal: Signal,
        core_dumped: bool,
        error_msg: String,
    },
}

/// A decoded inbound message. Key exchange and userauth method specific
/// messages stay raw, their layout depends on negotiated state.
#[derive(Debug)]
pub(crate) enum Message {
    Disconnect {
        reason: DisconnectReson,
        description: String,
    },
    Ignore,
    Unimplemented(u32),
    Debug {
        always_display: bool,
        msg: String,
    },
    ServiceRequest(String),
    ServiceAccept(String),
    KexInit,
    NewKeys,
    Kex,
    UserauthRequest {
        username: String,
        service: String,
        method: String,
        rest: Vec<u8>,
    },
    UserauthFailure {
        methods: Vec<String>,
        partial: bool,
    },
    UserauthSuccess,
    UserauthBanner(String),
    /// Message numbers 60 to 79.
    UserauthMethod,
    GlobalRequest {
        name: String,
        want_reply: bool,
        data: Vec<u8>,
    },
    RequestSuccess(Vec<u8>),
    RequestFailure,
    ChannelOpen {
        kind: String,
        sender: u32,
        window: u32,
        maximum: u32,
        extra: Vec<u8>,
    },
    ChannelOpenConfirmation {
        recipient: u32,
        sender: u32,
        window: u32,
        maximum: u32,
    },
    ChannelOpenFailure {
        recipient: u32,
        reason: ChannelOpenFailureReson,
        desc: String,
    },
    ChannelWindowAdjust {
        recipient: u32,
        count: u32,
    },
    ChannelData {
        recipient: u32,
        data: Vec<u8>,
    },
    ChannelExtendedData {
        recipient: u32,
        code: u32,
        data: Vec<u8>,
    },
    ChannelEof(u32),
    ChannelClose(u32),
    ChannelRequest {
        recipient: u32,
        name: String,
        want_reply: bool,
        data: Vec<u8>,
    },
    ChannelSuccess(u32),
    ChannelFailure(u32),
    Unknown(u8),
}

impl Message {
    pub fn parse(payload: &[u8]) -> std::result::Result<Self, String> {
        let buffer = Buffer::from_slice(payload);
        let mut detail = "unable to parse a message".to_string();

        let mut func = || {
            let code = buffer.take_u8()?;
            detail = format!("malformed message {code}");

            let msg = match code {
                SSH_MSG_DISCONNECT => Self::Disconnect {
                    reason: DisconnectReson(buffer.take_u32()?),
                    description: buffer.take_string()?,
                },
                SSH_MSG_IGNORE => Self::Ignore,
                SSH_MSG_UNIMPLEMENTED => Self::Unimplemented(buffer.take_u32()?),
                SSH_MSG_DEBUG => Self::Debug {
                    always_display: buffer.take_bool()?,
                    msg: buffer.take_string()?,
                },
                SSH_MSG_SERVICE_REQUEST => Self::ServiceRequest(buffer.take_string()?),
                SSH_MSG_SERVICE_ACCEPT => Self::ServiceAccept(buffer.take_string()?),
                SSH_MSG_KEXINIT => Self::KexInit,
                SSH_MSG_NEWKEYS => Self::NewKeys,
                30..=49 => Self::Kex,
                SSH_MSG_USERAUTH_REQUEST => Self::UserauthRequest {
                    username: buffer.take_string()?,
                    service: buffer.take_string()?,
                    method: buffer.take_string()?,
                    rest: buffer.remaining().to_vec(),
                },
                SSH_MSG_USERAUTH_FAILURE => Self::UserauthFailure {
                    methods: buffer.take_name_list()?,
                    partial: buffer.take_bool()?,
                },
                SSH_MSG_USERAUTH_SUCCESS => Self::UserauthSuccess,
                SSH_MSG_USERAUTH_BANNER => Self::UserauthBanner(buffer.take_string()?),
                60..=79 => Self::UserauthMethod,
                SSH_MSG_GLOBAL_REQUEST => Self::GlobalRequest {
                    name: buffer.take_string()?,
                    want_reply: buffer.take_bool()?,
                    data: buffer.remaining().to_vec(),
                },
                SSH_MSG_REQUEST_SUCCESS => Self::RequestSuccess(buffer.remaining().to_vec()),
                SSH_MSG_REQUEST_FAILURE => Self::RequestFailure,
                SSH_MSG_CHANNEL_OPEN => Self::ChannelOpen {
                    kind: buffer.take_string()?,
                    sender: buffer.take_u32()?,
                    window: buffer.take_u32()?,
                    maximum: buffer.take_u32()?,
                    extra: buffer.remaining().to_vec(),
                },
                SSH_MSG_CHANNEL_OPEN_CONFIRMATION => Self::ChannelOpenConfirmation {
                    recipient: buffer.take_u32()?,
                    sender: buffer.take_u32()?,
                    window: buffer.take_u32()?,
                    maximum: buffer.take_u32()?,
                },
                SSH_MSG_CHANNEL_OPEN_FAILURE => Self::ChannelOpenFailure {
                    recipient: buffer.take_u32()?,
                    reason: ChannelOpenFailureReson(buffer.take_u32()?),
                    desc: buffer.take_string().unwrap_or_default(),
                },
                SSH_MSG_CHANNEL_WINDOW_ADJUST => Self::ChannelWindowAdjust {
                    recipient: buffer.take_u32()?,
                    count: buffer.take_u32()?,
                },
                SSH_MSG_CHANNEL_DATA => Self::ChannelData {
                    recipient: buffer.take_u32()?,
                    data: buffer.take_one()?.1.to_vec(),
                },
                SSH_MSG_CHANNEL_EXTENDED_DATA => Self::ChannelExtendedData {
                    recipient: buffer.take_u32()?,
                    code: buffer.take_u32()?,
                    data: buffer.take_one()?.1.to_vec(),
                },
                SSH_MSG_CHANNEL_EOF => Self::ChannelEof(buffer.take_u32()?),
                SSH_MSG_CHANNEL_CLOSE => Self::ChannelClose(buffer.take_u32()?),
                SSH_MSG_CHANNEL_REQUEST => Self::ChannelRequest {
                    recipient: buffer.take_u32()?,
                    name: buffer.take_string()?,
                    want_reply: buffer.take_bool()?,
                    data: buffer.remaining().to_vec(),
                },
                SSH_MSG_CHANNEL_SUCCESS => Self::ChannelSuccess(buffer.take_u32()?),
                SSH_MSG_CHANNEL_FAILURE => Self::ChannelFailure(buffer.take_u32()?),
                _ => Self::Unknown(code),
            };
            Some(msg)
        };

        func().ok_or(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_channel_messages() {
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_CHANNEL_EXTENDED_DATA);
        buffer.put_u32(3);
        buffer.put_u32(SSH_EXTENDED_DATA_STDERR);
        buffer.put_one(b"oops");
        match Message::parse(buffer.as_ref()).unwrap() {
            Message::ChannelExtendedData {
                recipient,
                code,
                data,
            } => {
                assert_eq!((recipient, code), (3, 1));
                assert_eq!(data, b"oops");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_CHANNEL_REQUEST);
        buffer.put_u32(0);
        buffer.put_one("exit-status");
        buffer.put_bool(false);
        buffer.put_u32(7);
        match Message::parse(buffer.as_ref()).unwrap() {
            Message::ChannelRequest {
                name,
                want_reply,
                data,
                ..
            } => {
                assert_eq!(name, "exit-status");
                assert!(!want_reply);
                assert_eq!(data, 7u32.to_be_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_and_unknown() {
        assert!(Message::parse(&[SSH_MSG_CHANNEL_DATA, 0, 0]).is_err());
        assert!(Message::parse(&[]).is_err());
        assert!(matches!(
            Message::parse(&[200]).unwrap(),
            Message::Unknown(200)
        ));
        assert!(matches!(
            Message::parse(&[SSH_MSG_USERAUTH_INFO_REQUEST]).unwrap(),
            Message::UserauthMethod
        ));
    }

    #[test]
    fn failure_name_list() {
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_USERAUTH_FAILURE);
        buffer.put_name_list(&["publickey", "password"]);
        buffer.put_bool(true);
        match Message::parse(buffer.as_ref()).unwrap() {
            Message::UserauthFailure { methods, partial } => {
                assert_eq!(methods, vec!["publickey", "password"]);
                assert!(partial);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
