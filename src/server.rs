use async_trait::async_trait;

use crate::{
    channel::{Channel, PtyRequest},
    keys::PublicKey,
    msg::ChannelOpenFailureReson,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Successful,
    /// This method passed but the user must authenticate further.
    PartiallySuccessful,
    Failed,
}

/// Questions put to the client during keyboard-interactive authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractiveQuery {
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<(String, bool)>,
}

impl InteractiveQuery {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            prompts: vec![],
        }
    }

    pub fn add_prompt(mut self, prompt: impl Into<String>, echo: bool) -> Self {
        self.prompts.push((prompt.into(), echo));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveAuth {
    /// Ask another round of questions.
    Query(InteractiveQuery),
    Finished(AuthResult),
}

/// Server side policy, consulted by the session task.
///
/// Every callback is awaited on the session task itself, the task that
/// moves channel data. A callback that awaits I/O on a channel of the same
/// session (`write_all`, `read`, `close`, a channel request) therefore
/// deadlocks. Spawn a task for that work and return right away:
///
/// ```ignore
/// async fn check_channel_exec_request(&self, channel: &Channel, _command: &[u8]) -> bool {
///     let channel = channel.clone();
///     tokio::spawn(async move {
///         channel.write_all(b"done\n").await?;
///         channel.close().await
///     });
///     true
/// }
/// ```
#[async_trait]
pub trait ServerInterface: Send + Sync {
    /// Methods listed in USERAUTH_FAILURE.
    fn allowed_auths(&self, _username: &str) -> Vec<String> {
        vec!["password".to_string()]
    }

    /// Sent once, before the first authentication reply.
    fn banner(&self) -> Option<String> {
        None
    }

    async fn check_auth_none(&self, _username: &str) -> AuthResult {
        AuthResult::Failed
    }

    async fn check_auth_password(&self, _username: &str, _password: &str) -> AuthResult {
        AuthResult::Failed
    }

    /// Called for key queries (no signature yet) and for signed requests
    /// whose signature already verified.
    async fn check_auth_publickey(&self, _username: &str, _key: &dyn PublicKey) -> AuthResult {
        AuthResult::Failed
    }

    async fn check_auth_interactive(&self, _username: &str, _submethods: &str) -> InteractiveAuth {
        InteractiveAuth::Finished(AuthResult::Failed)
    }

    async fn check_auth_interactive_response(&self, _responses: &[String]) -> InteractiveAuth {
        InteractiveAuth::Finished(AuthResult::Failed)
    }

    /// Decides on a channel the client opens. `extra` is the type specific
    /// tail of CHANNEL_OPEN.
    async fn check_channel_request(
        &self,
        _kind: &str,
        _id: u32,
        _extra: &[u8],
    ) -> Result<(), ChannelOpenFailureReson> {
        Err(ChannelOpenFailureReson::ADMINISTRATIVELY_PROHIBITED)
    }

    async fn check_channel_pty_request(&self, _channel: &Channel, _pty: &PtyRequest) -> bool {
        false
    }

    async fn check_channel_shell_request(&self, _channel: &Channel) -> bool {
        false
    }

    async fn check_channel_exec_request(&self, _channel: &Channel, _command: &[u8]) -> bool {
        false
    }

    /// Subsystems registered in the session config are started without
    /// asking; this sees the others.
    async fn check_channel_subsystem_request(&self, _channel: &Channel, _name: &str) -> bool {
        false
    }

    async fn check_channel_window_change_request(
        &self,
        _channel: &Channel,
        _columns: u32,
        _rows: u32,
        _width: u32,
        _height: u32,
    ) -> bool {
        false
    }

    async fn check_channel_x11_request(
        &self,
        _channel: &Channel,
        _single_connection: bool,
        _protocol: &str,
        _cookie: &str,
        _screen: u32,
    ) -> bool {
        false
    }

    async fn check_channel_forward_agent_request(&self, _channel: &Channel) -> bool {
        false
    }

    async fn check_channel_env_request(&self, _channel: &Channel, _name: &str, _value: &[u8]) -> bool {
        false
    }

    async fn check_channel_signal_request(&self, _channel: &Channel, _signal: &str) -> bool {
        false
    }

    /// Returns the port actually bound, `None` refuses.
    async fn check_port_forward_request(&self, _address: &str, _port: u32) -> Option<u32> {
        None
    }

    async fn cancel_port_forward_request(&self, _address: &str, _port: u32) {}

    /// Unknown global requests. `Some` answers REQUEST_SUCCESS with that
    /// payload.
    async fn check_global_request(&self, _name: &str, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// A named service started on a channel, such as `sftp`.
#[async_trait]
pub trait SubsystemHandler: Send + Sync {
    /// Owns the channel until it returns. Runs on its own task.
    async fn start(&self, name: &str, channel: Channel);
}
