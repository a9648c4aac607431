// auth-broker/src/dispatcher.rs
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use common::config::{BrokerConfig, ValidatedSecrets};
use common::crypto::aes_encrypt;
use common::error::{BrokerError, ConfigError};
use common::messages::{
    AuthResultPayload, BrokerReply, ChallengePayload, ClientCommand, InitPayload,
};

use crate::challenge::ChallengeService;
use crate::chain::RecordRegistry;
use crate::hooks::{AuthHooks, SuccessContext};
use crate::registry::{SessionRegistry, SessionSink};

/// What happens to the connection after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Close,
}

/// Result of one dispatched frame, applied by the connection actor.
pub struct Outcome {
    pub reply: Option<BrokerReply>,
    pub disposition: Disposition,
}

impl Outcome {
    fn keep(reply: BrokerReply) -> Self {
        Self {
            reply: Some(reply),
            disposition: Disposition::Keep,
        }
    }

    fn close(reply: BrokerReply) -> Self {
        Self {
            reply: Some(reply),
            disposition: Disposition::Close,
        }
    }

    fn silent() -> Self {
        Self {
            reply: None,
            disposition: Disposition::Keep,
        }
    }
}

/// Shared broker state: configuration, the session registry, the challenge
/// service, and the relying-party hooks. One instance serves every
/// connection.
pub struct BrokerCore {
    pub config: BrokerConfig,
    pub registry: Arc<SessionRegistry>,
    secrets: ValidatedSecrets,
    challenges: ChallengeService,
    hooks: Arc<dyn AuthHooks>,
}

impl BrokerCore {
    pub fn new(
        config: BrokerConfig,
        records: Arc<dyn RecordRegistry>,
        hooks: Arc<dyn AuthHooks>,
    ) -> Result<Self, ConfigError> {
        let secrets = config.validate()?;
        let registry = SessionRegistry::new(config.auth_window());

        Ok(Self {
            registry,
            secrets,
            challenges: ChallengeService::new(records),
            hooks,
            config,
        })
    }

    /// Register a freshly accepted connection.
    pub fn accept(&self, client_id: Uuid, sink: Arc<dyn SessionSink>) -> Uuid {
        self.registry.create(client_id, sink)
    }

    /// Transport-level close reported by the connection actor.
    pub fn connection_closed(&self, client_id: Uuid) {
        self.registry.connection_closed(client_id);
    }

    /// Handle one inbound text frame for `client_id`. Always returns an
    /// outcome; protocol failures are folded into a terminal ERROR reply
    /// with the session(s) already torn down.
    pub async fn dispatch(&self, client_id: Uuid, raw: &str) -> Outcome {
        let command = match ClientCommand::parse(raw) {
            Ok(command) => command,
            Err(err) => {
                tracing::debug!("unparseable frame from {}: {}", client_id, err);
                return self.fail(client_id, BrokerError::BadInput("unrecognized command".into()));
            }
        };

        let result = match command {
            ClientCommand::AuthInit => self.handle_auth_init(client_id),
            ClientCommand::CurrentUserToken { payload } => {
                self.handle_current_user_token(client_id, payload)
            }
            ClientCommand::Check { session_id, alias } => {
                self.handle_check(client_id, &session_id, &alias).await
            }
            ClientCommand::Hello { session_id, alias } => {
                self.handle_hello(client_id, &session_id, &alias).await
            }
            ClientCommand::Auth {
                alias,
                challenge_signed,
                fields,
            } => {
                self.handle_auth(client_id, &alias, &challenge_signed, fields)
                    .await
            }
            ClientCommand::AuthDeclined => self.handle_auth_declined(client_id),
        };

        match result {
            Ok(outcome) => outcome,
            Err(err) => self.fail(client_id, err),
        }
    }

    /// Terminal failure fanout. Pair-level failures take both sides down;
    /// everything else terminates the sender alone and leaves a pending peer
    /// to its own authorization-window reaper.
    fn fail(&self, client_id: Uuid, err: BrokerError) -> Outcome {
        tracing::warn!("session {} failed: {}", client_id, err);
        let reply = BrokerReply::error(err.to_string());

        if err.affects_peer() {
            self.registry.close_pair(client_id, &reply);
        } else {
            self.registry.remove(client_id);
        }
        Outcome::close(reply)
    }

    /// AUTH_INIT: wrap this session's id with the project AES key and hand
    /// it out. The widget's backend decrypts the token out of band and uses
    /// the id in CHECK.
    fn handle_auth_init(&self, client_id: Uuid) -> Result<Outcome, BrokerError> {
        let session_id = self.registry.begin_init(client_id)?;
        let token = aes_encrypt(session_id.to_string().as_bytes(), &self.secrets.cipher_key);

        tracing::info!("issued init token for session {}", session_id);

        Ok(Outcome::keep(BrokerReply::AuthInit {
            payload: InitPayload {
                id: self.secrets.project_id,
                token,
            },
        }))
    }

    /// CURRENT_USER_TOKEN: kept on the session it arrived on and read back
    /// during AUTH. No reply.
    fn handle_current_user_token(
        &self,
        client_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<Outcome, BrokerError> {
        self.registry.store_user_token(client_id, payload)?;
        Ok(Outcome::silent())
    }

    /// CHECK: the widget claims an inited session by its decrypted id. On
    /// success both records are cross-linked under the alias, the widget
    /// gets READY and the authenticator the ACTIVATED push.
    async fn handle_check(
        &self,
        client_id: Uuid,
        session_id: &str,
        alias: &str,
    ) -> Result<Outcome, BrokerError> {
        let session_id = parse_uuid(session_id)?;
        self.registry.peek_activation(client_id, session_id)?;

        let user_data = json!({ "alias": alias });
        let user_id = self
            .hooks
            .on_user_validate(&user_data)
            .await
            .map_err(|err| BrokerError::Upstream(err.to_string()))?;

        // The callback suspended us; the commit revalidates every guard.
        let activation = self
            .registry
            .activate(client_id, session_id, alias, user_id)?;
        activation
            .authenticator
            .deliver(BrokerReply::Activated.to_frame());

        Ok(Outcome::keep(BrokerReply::Ready {
            client_session_id: activation.client_session_id,
        }))
    }

    /// HELLO: the authenticator names the widget by its client session id
    /// and gets the challenge back. An unknown alias terminates only this
    /// connection; the widget falls to its reaper.
    async fn handle_hello(
        &self,
        client_id: Uuid,
        session_id: &str,
        alias: &str,
    ) -> Result<Outcome, BrokerError> {
        let client_session_id = parse_uuid(session_id)?;
        self.registry
            .peek_hello(client_id, client_session_id, alias)?;

        let challenge = self.challenges.create_challenge(alias).await?;

        self.registry.arm_challenge(
            client_id,
            client_session_id,
            alias,
            challenge.secret,
            challenge.public_key_sign,
        )?;

        Ok(Outcome::keep(BrokerReply::Challenge {
            message: "sign to continue".into(),
            payload: ChallengePayload {
                challenge: challenge.challenge,
                fields: self.config.fields.clone(),
            },
        }))
    }

    /// AUTH: verify the challenge reply, run `on_success`, and deliver the
    /// terminal result to both sides. Admission marks the session Done, so a
    /// given pairing completes at most once.
    async fn handle_auth(
        &self,
        client_id: Uuid,
        alias: &str,
        challenge_signed: &str,
        fields: Option<serde_json::Value>,
    ) -> Result<Outcome, BrokerError> {
        let attempt = self.registry.begin_auth(client_id, alias)?;

        if !ChallengeService::check_challenge(
            &attempt.secret,
            &attempt.public_key_sign,
            challenge_signed,
        ) {
            return Err(BrokerError::AccessDenied);
        }

        let context = SuccessContext {
            alias: alias.to_string(),
            fields,
            current_user_token: attempt.current_user_token,
            user_id: attempt.user_id,
        };
        let grant = self
            .hooks
            .on_success(context)
            .await
            .map_err(|err| BrokerError::Upstream(err.to_string()))?;

        if let Some(message) = grant.error {
            tracing::warn!("application refused session {}: {}", client_id, message);
            let reply = BrokerReply::error(message);
            self.registry.remove(client_id);
            self.registry.remove(attempt.peer_id);
            attempt.peer_sink.hangup(Some(reply.to_frame()));
            return Ok(Outcome::close(reply));
        }

        tracing::info!("pairing completed for alias {}", alias);

        let result = BrokerReply::AuthResult {
            message: "welcome".into(),
            payload: AuthResultPayload {
                token: grant.token,
                linked_id: grant.linked_id.unwrap_or_default(),
            },
        };

        // Both removals run off the gathered ids: the records may already be
        // half gone if a connection dropped during the callback, and the
        // widget sink tolerates delivery to a closed connection.
        self.registry.remove(client_id);
        self.registry.remove(attempt.peer_id);
        attempt.peer_sink.hangup(Some(result.to_frame()));

        Ok(Outcome::close(result))
    }

    /// AUTH_DECLINED: the user refused on the authenticator; both sides
    /// learn about it and close.
    fn handle_auth_declined(&self, client_id: Uuid) -> Result<Outcome, BrokerError> {
        tracing::info!("authentication declined by {}", client_id);
        self.registry
            .close_pair(client_id, &BrokerReply::AuthDeclined);
        Ok(Outcome::close(BrokerReply::AuthDeclined))
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, BrokerError> {
    Uuid::parse_str(value)
        .map_err(|_| BrokerError::BadInput("session_id is not a valid UUID".into()))
}
