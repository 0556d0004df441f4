use crate::{
    error::{Error, Result},
    keys::{decode_public_key, PrivateKey},
    msg::DisconnectReson,
    server::{AuthResult, InteractiveAuth, InteractiveQuery, ServerInterface},
    ssh::{buffer::Buffer, common::code::*},
};

/// Answers keyboard-interactive prompts: `(title, instructions, prompts)`
/// where each prompt carries its echo flag. One response per prompt.
pub type InteractiveHandler =
    Box<dyn FnMut(&str, &str, &[(String, bool)]) -> Vec<String> + Send>;

const SERVICE: &str = "ssh-connection";
const MAX_FAILURES: u32 = 10;

fn request_header(username: &str, method: &str) -> Buffer {
    let mut buffer = Buffer::new();
    buffer.put_u8(SSH_MSG_USERAUTH_REQUEST);
    buffer.put_one(username);
    buffer.put_one(SERVICE);
    buffer.put_one(method);
    buffer
}

pub(crate) fn none_request(username: &str) -> Vec<u8> {
    request_header(username, "none").into_vec()
}

pub(crate) fn password_request(username: &str, password: &str) -> Vec<u8> {
    let mut buffer = request_header(username, "password");
    buffer.put_bool(false);
    buffer.put_one(password);
    buffer.into_vec()
}

/// The data a publickey signature covers.
pub(crate) fn publickey_blob(
    session_id: &[u8],
    username: &str,
    algorithm: &str,
    key: &[u8],
) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.put_one(session_id);
    buffer.put_u8(SSH_MSG_USERAUTH_REQUEST);
    buffer.put_one(username);
    buffer.put_one(SERVICE);
    buffer.put_one("publickey");
    buffer.put_bool(true);
    buffer.put_one(algorithm);
    buffer.put_one(key);
    buffer.into_vec()
}

pub(crate) fn publickey_request(
    session_id: &[u8],
    username: &str,
    key: &dyn PrivateKey,
) -> Result<Vec<u8>> {
    let blob = key.encode_public();
    let signature = key.sign(&publickey_blob(session_id, username, key.name(), &blob))?;

    let mut buffer = request_header(username, "publickey");
    buffer.put_bool(true);
    buffer.put_one(key.name());
    buffer.put_one(blob);
    buffer.put_one(signature);
    Ok(buffer.into_vec())
}

pub(crate) fn interactive_request(username: &str, submethods: &str) -> Vec<u8> {
    let mut buffer = request_header(username, "keyboard-interactive");
    buffer.put_one("");
    buffer.put_one(submethods);
    buffer.into_vec()
}

pub(crate) fn info_request(query: &InteractiveQuery) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.put_u8(SSH_MSG_USERAUTH_INFO_REQUEST);
    buffer.put_one(&query.name);
    buffer.put_one(&query.instructions);
    buffer.put_one("");
    buffer.put_u32(query.prompts.len() as u32);
    for (prompt, echo) in &query.prompts {
        buffer.put_one(prompt);
        buffer.put_bool(*echo);
    }
    buffer.into_vec()
}

pub(crate) fn parse_info_request(payload: &[u8]) -> Result<InteractiveQuery> {
    let buffer = Buffer::from_slice(payload);
    let func = || {
        buffer.take_u8()?;
        let mut query = InteractiveQuery::new(buffer.take_string()?, buffer.take_string()?);
        buffer.take_one()?;
        let count = buffer.take_u32()?;
        for _ in 0..count {
            query.prompts.push((buffer.take_string()?, buffer.take_bool()?));
        }
        Some(query)
    };
    func().ok_or_else(|| Error::protocol("malformed USERAUTH_INFO_REQUEST"))
}

pub(crate) fn info_response(responses: &[String]) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.put_u8(SSH_MSG_USERAUTH_INFO_RESPONSE);
    buffer.put_u32(responses.len() as u32);
    for response in responses {
        buffer.put_one(response);
    }
    buffer.into_vec()
}

fn parse_info_response(payload: &[u8]) -> Result<Vec<String>> {
    let buffer = Buffer::from_slice(payload);
    let func = || {
        buffer.take_u8()?;
        let count = buffer.take_u32()?;
        (0..count)
            .map(|_| buffer.take_string())
            .collect::<Option<Vec<_>>>()
    };
    func().ok_or_else(|| Error::protocol("malformed USERAUTH_INFO_RESPONSE"))
}

pub(crate) fn parse_passwd_changereq(payload: &[u8]) -> String {
    let buffer = Buffer::from_slice(payload);
    buffer.take_u8();
    buffer.take_string().unwrap_or_default()
}

/// What the session task does with an inbound authentication message.
#[derive(Debug)]
pub(crate) enum ServerAuthStep {
    Reply(Vec<Vec<u8>>),
    Success(Vec<Vec<u8>>),
    /// Send the replies, then drop the client.
    Disconnect {
        send: Vec<Vec<u8>>,
        reason: DisconnectReson,
        desc: String,
    },
}

/// Server side of `ssh-userauth`.
#[derive(Default)]
pub(crate) struct ServerAuth {
    pub(crate) username: Option<String>,
    pub(crate) authenticated: bool,
    failures: u32,
    banner_sent: bool,
    interactive: bool,
}

impl ServerAuth {
    fn take_banner(&mut self, server: &dyn ServerInterface, send: &mut Vec<Vec<u8>>) {
        if std::mem::replace(&mut self.banner_sent, true) {
            return;
        }
        if let Some(banner) = server.banner() {
            let mut buffer = Buffer::new();
            buffer.put_u8(SSH_MSG_USERAUTH_BANNER);
            buffer.put_one(banner);
            buffer.put_one("");
            send.push(buffer.into_vec());
        }
    }

    fn finish(
        &mut self,
        server: &dyn ServerInterface,
        method: &str,
        result: AuthResult,
        mut send: Vec<Vec<u8>>,
    ) -> ServerAuthStep {
        let username = self.username.clone().unwrap_or_default();
        if result == AuthResult::Successful {
            tracing::info!("auth granted ({method}) for {username:?}");
            self.authenticated = true;
            send.push(vec![SSH_MSG_USERAUTH_SUCCESS]);
            return ServerAuthStep::Success(send);
        }

        let partial = result == AuthResult::PartiallySuccessful;
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_USERAUTH_FAILURE);
        buffer.put_name_list(&server.allowed_auths(&username));
        buffer.put_bool(partial);
        send.push(buffer.into_vec());

        if partial {
            tracing::info!("auth partially succeeded ({method}) for {username:?}");
            return ServerAuthStep::Reply(send);
        }

        self.failures += 1;
        tracing::info!("auth rejected ({method}) for {username:?}");
        if self.failures >= MAX_FAILURES {
            return ServerAuthStep::Disconnect {
                send,
                reason: DisconnectReson::NO_MORE_AUTH_METHODS_AVAILABLE,
                desc: "no more auth methods".to_string(),
            };
        }
        ServerAuthStep::Reply(send)
    }

    fn interactive_step(
        &mut self,
        server: &dyn ServerInterface,
        outcome: InteractiveAuth,
        send: Vec<Vec<u8>>,
    ) -> ServerAuthStep {
        match outcome {
            InteractiveAuth::Query(query) => {
                self.interactive = true;
                let mut send = send;
                send.push(info_request(&query));
                ServerAuthStep::Reply(send)
            }
            InteractiveAuth::Finished(result) => {
                self.interactive = false;
                self.finish(server, "keyboard-interactive", result, send)
            }
        }
    }

    pub(crate) async fn on_request(
        &mut self,
        server: &dyn ServerInterface,
        session_id: &[u8],
        username: String,
        service: String,
        method: String,
        rest: &[u8],
    ) -> Result<Option<ServerAuthStep>> {
        if self.authenticated {
            tracing::debug!("ignoring USERAUTH_REQUEST after success");
            return Ok(None);
        }
        if service != SERVICE {
            return Ok(Some(ServerAuthStep::Disconnect {
                send: vec![],
                reason: DisconnectReson::SERVICE_NOT_AVAILABLE,
                desc: format!("service {service} not available"),
            }));
        }
        match &self.username {
            Some(prev) if *prev != username => {
                tracing::warn!("auth rejected: user changed from {prev:?} to {username:?}");
                return Ok(Some(ServerAuthStep::Disconnect {
                    send: vec![],
                    reason: DisconnectReson::NO_MORE_AUTH_METHODS_AVAILABLE,
                    desc: "no more auth methods".to_string(),
                }));
            }
            _ => self.username = Some(username.clone()),
        }
        self.interactive = false;

        let mut send = vec![];
        self.take_banner(server, &mut send);

        let malformed = || Error::protocol(format!("malformed {method} request"));
        let buffer = Buffer::from_slice(rest);

        let result = match method.as_str() {
            "none" => server.check_auth_none(&username).await,
            "password" => {
                let _change = buffer.take_bool().ok_or_else(malformed)?;
                let password = buffer.take_string().ok_or_else(malformed)?;
                server.check_auth_password(&username, &password).await
            }
            "publickey" => {
                let signed = buffer.take_bool().ok_or_else(malformed)?;
                let algorithm = buffer.take_string().ok_or_else(malformed)?;
                let blob = buffer.take_one().ok_or_else(malformed)?.1.to_vec();
                let signature = match signed {
                    true => Some(buffer.take_one().ok_or_else(malformed)?.1.to_vec()),
                    false => None,
                };
                match decode_public_key(&blob) {
                    Ok(key) if key.name() == algorithm => {
                        if let Some(signature) = signature {
                            let data = publickey_blob(session_id, &username, &algorithm, &blob);
                            if key.verify(&data, &signature) {
                                server.check_auth_publickey(&username, key.as_ref()).await
                            } else {
                                tracing::info!("auth rejected: invalid signature");
                                AuthResult::Failed
                            }
                        } else {
                            if server.check_auth_publickey(&username, key.as_ref()).await
                                != AuthResult::Failed
                            {
                                let mut buffer = Buffer::new();
                                buffer.put_u8(SSH_MSG_USERAUTH_PK_OK);
                                buffer.put_one(&algorithm);
                                buffer.put_one(&blob);
                                send.push(buffer.into_vec());
                                return Ok(Some(ServerAuthStep::Reply(send)));
                            }
                            AuthResult::Failed
                        }
                    }
                    _ => {
                        tracing::info!("auth rejected: unusable {algorithm} key");
                        AuthResult::Failed
                    }
                }
            }
            "keyboard-interactive" => {
                buffer.take_one().ok_or_else(malformed)?;
                let submethods = buffer.take_string().ok_or_else(malformed)?;
                let outcome = server.check_auth_interactive(&username, &submethods).await;
                return Ok(Some(self.interactive_step(server, outcome, send)));
            }
            other => {
                tracing::debug!("unsupported auth method {other}");
                AuthResult::Failed
            }
        };
        Ok(Some(self.finish(server, &method, result, send)))
    }

    /// Userauth messages 60..=79 from the client.
    pub(crate) async fn on_method_message(
        &mut self,
        server: &dyn ServerInterface,
        payload: &[u8],
    ) -> Result<Option<ServerAuthStep>> {
        let code = payload.first().copied().unwrap_or_default();
        if code != SSH_MSG_USERAUTH_INFO_RESPONSE || !self.interactive {
            return Err(Error::protocol(format!("unexpected userauth message {code}")));
        }
        let responses = parse_info_response(payload)?;
        let outcome = server.check_auth_interactive_response(&responses).await;
        Ok(Some(self.interactive_step(server, outcome, vec![])))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{keys::PublicKey, msg::Message};

    struct Server;

    #[async_trait]
    impl ServerInterface for Server {
        fn allowed_auths(&self, _username: &str) -> Vec<String> {
            vec!["password".to_string(), "keyboard-interactive".to_string()]
        }

        fn banner(&self) -> Option<String> {
            Some("welcome".to_string())
        }

        async fn check_auth_password(&self, username: &str, password: &str) -> AuthResult {
            match (username, password) {
                ("slowdive", "pygmalion") => AuthResult::Successful,
                ("slowdive", "paranoid") => AuthResult::PartiallySuccessful,
                _ => AuthResult::Failed,
            }
        }

        async fn check_auth_publickey(&self, _username: &str, _key: &dyn PublicKey) -> AuthResult {
            AuthResult::Successful
        }

        async fn check_auth_interactive(&self, _username: &str, _submethods: &str) -> InteractiveAuth {
            InteractiveAuth::Query(
                InteractiveQuery::new("password", "").add_prompt("Password", false),
            )
        }

        async fn check_auth_interactive_response(&self, responses: &[String]) -> InteractiveAuth {
            match responses {
                [first] if first == "cat" => InteractiveAuth::Query(
                    InteractiveQuery::new("again", "").add_prompt("Really?", true),
                ),
                [second] if second == "yes" => InteractiveAuth::Finished(AuthResult::Successful),
                _ => InteractiveAuth::Finished(AuthResult::Failed),
            }
        }
    }

    async fn request(auth: &mut ServerAuth, payload: Vec<u8>) -> Option<ServerAuthStep> {
        match Message::parse(&payload).unwrap() {
            Message::UserauthRequest {
                username,
                service,
                method,
                rest,
            } => auth
                .on_request(&Server, b"session", username, service, method, &rest)
                .await
                .unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn password_with_banner() {
        let mut auth = ServerAuth::default();
        match request(&mut auth, password_request("slowdive", "wrong")).await {
            Some(ServerAuthStep::Reply(send)) => {
                assert_eq!(send.len(), 2);
                assert_eq!(send[0][0], SSH_MSG_USERAUTH_BANNER);
                assert!(matches!(
                    Message::parse(&send[1]).unwrap(),
                    Message::UserauthFailure { partial: false, .. }
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        match request(&mut auth, password_request("slowdive", "pygmalion")).await {
            Some(ServerAuthStep::Success(send)) => assert_eq!(send, vec![vec![SSH_MSG_USERAUTH_SUCCESS]]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(request(&mut auth, none_request("slowdive")).await.is_none());
    }

    #[tokio::test]
    async fn partial_success() {
        let mut auth = ServerAuth::default();
        match request(&mut auth, password_request("slowdive", "paranoid")).await {
            Some(ServerAuthStep::Reply(send)) => match Message::parse(send.last().unwrap()).unwrap() {
                Message::UserauthFailure { methods, partial } => {
                    assert!(partial);
                    assert_eq!(methods, vec!["password", "keyboard-interactive"]);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(!auth.authenticated);
    }

    #[tokio::test]
    async fn ten_failures_disconnect() {
        let mut auth = ServerAuth::default();
        for _ in 0..9 {
            assert!(matches!(
                request(&mut auth, none_request("slowdive")).await,
                Some(ServerAuthStep::Reply(_))
            ));
        }
        match request(&mut auth, none_request("slowdive")).await {
            Some(ServerAuthStep::Disconnect { reason, send, .. }) => {
                assert_eq!(reason, DisconnectReson::NO_MORE_AUTH_METHODS_AVAILABLE);
                assert_eq!(send.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn username_change_and_service() {
        let mut auth = ServerAuth::default();
        request(&mut auth, none_request("slowdive")).await;
        assert!(matches!(
            request(&mut auth, none_request("robey")).await,
            Some(ServerAuthStep::Disconnect { .. })
        ));

        let mut auth = ServerAuth::default();
        let mut buffer = Buffer::new();
        buffer.put_u8(SSH_MSG_USERAUTH_REQUEST);
        buffer.put_one("slowdive");
        buffer.put_one("ssh-nope");
        buffer.put_one("none");
        match request(&mut auth, buffer.into_vec()).await {
            Some(ServerAuthStep::Disconnect { reason, .. }) => {
                assert_eq!(reason, DisconnectReson::SERVICE_NOT_AVAILABLE)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn chained_interactive_queries() {
        let mut auth = ServerAuth::default();
        let send = match request(&mut auth, interactive_request("slowdive", "")).await {
            Some(ServerAuthStep::Reply(send)) => send,
            other => panic!("unexpected {other:?}"),
        };
        let query = parse_info_request(send.last().unwrap()).unwrap();
        assert_eq!(query.name, "password");
        assert_eq!(query.prompts, vec![("Password".to_string(), false)]);

        let step = auth
            .on_method_message(&Server, &info_response(&["cat".to_string()]))
            .await
            .unwrap();
        let send = match step {
            Some(ServerAuthStep::Reply(send)) => send,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(parse_info_request(&send[0]).unwrap().name, "again");

        let step = auth
            .on_method_message(&Server, &info_response(&["yes".to_string()]))
            .await
            .unwrap();
        assert!(matches!(step, Some(ServerAuthStep::Success(_))));

        assert!(auth
            .on_method_message(&Server, &info_response(&[]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn publickey_query_and_signature() {
        let key = crate::keys::load_private_key(
            include_bytes!("../tests/data/test_dss.key"),
            None,
        )
        .unwrap();

        let mut query = request_header("slowdive", "publickey");
        query.put_bool(false);
        query.put_one(key.name());
        query.put_one(key.encode_public());

        let mut auth = ServerAuth::default();
        match request(&mut auth, query.into_vec()).await {
            Some(ServerAuthStep::Reply(send)) => {
                assert_eq!(send.last().unwrap()[0], SSH_MSG_USERAUTH_PK_OK)
            }
            other => panic!("unexpected {other:?}"),
        }

        let signed = publickey_request(b"other session", "slowdive", key.as_ref()).unwrap();
        assert!(matches!(
            request(&mut auth, signed).await,
            Some(ServerAuthStep::Reply(_))
        ));

        let signed = publickey_request(b"session", "slowdive", key.as_ref()).unwrap();
        assert!(matches!(
            request(&mut auth, signed).await,
            Some(ServerAuthStep::Success(_))
        ));
    }
}
