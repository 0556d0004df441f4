pub mod auth;
pub mod channel;
pub mod cipher;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod msg;
pub mod pipe;
pub mod server;
pub mod session;
pub mod sftp;
mod ssh;

#[cfg(test)]
mod test;

pub use cipher::{
    compress::{Decode, Encode},
    crypt::{Decrypt, Encrypt},
    hash::Hash,
    kex::{KeyExchange, ModulusPool},
    mac::Mac,
    sign::{PrivateKey, PublicKey},
    Boxtory, Factory,
};
pub use channel::{Channel, TerminalMode};
pub use error::{Error, Result};
pub use handshake::{Config, Role};
pub use msg::{ChannelOpenFailureReson, DisconnectReson, ExitStatus, Signal};
pub use openssl;
pub use server::{AuthResult, InteractiveAuth, InteractiveQuery, ServerInterface, SubsystemHandler};
pub use session::Session;

pub(crate) type MSender<T> = tokio::sync::mpsc::UnboundedSender<T>;
pub(crate) type MReceiver<T> = tokio::sync::mpsc::UnboundedReceiver<T>;
pub(crate) type OSender<T> = tokio::sync::oneshot::Sender<T>;
pub(crate) type OReceiver<T> = tokio::sync::oneshot::Receiver<T>;

pub(crate) fn m_channel<T>() -> (MSender<T>, MReceiver<T>) {
    tokio::sync::mpsc::unbounded_channel()
}

pub(crate) fn o_channel<T>() -> (OSender<T>, OReceiver<T>) {
    tokio::sync::oneshot::channel()
}
