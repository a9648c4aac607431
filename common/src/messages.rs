// common/src/messages.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wire values of the `_` discriminator. The authenticator and widget SDKs
/// match on these, so they are part of the public API.
pub const COMMAND_AUTH_INIT: &str = "AUTH_INIT";
pub const COMMAND_CHECK: &str = "CHECK";
pub const COMMAND_HELLO: &str = "HELLO";
pub const COMMAND_AUTH: &str = "AUTH";
pub const COMMAND_AUTH_DECLINED: &str = "AUTH_DECLINED";
pub const COMMAND_CURRENT_USER_TOKEN: &str = "CURRENT_USER_TOKEN";
pub const COMMAND_READY: &str = "READY";
pub const COMMAND_ACTIVATED: &str = "ACTIVATED";
pub const COMMAND_CHALLENGE: &str = "CHALLENGE";
pub const COMMAND_AUTH_RESULT: &str = "AUTH_RESULT";
pub const COMMAND_CONNECTION_FAILED: &str = "CONNECTION_FAILED";
pub const COMMAND_ERROR: &str = "ERROR";

/// Commands arriving from either client, tagged by the `_` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_")]
pub enum ClientCommand {
    /// Authenticator opener; answered with the encrypted session token.
    #[serde(rename = "AUTH_INIT")]
    AuthInit,
    /// Widget activation carrying the decrypted session id and the alias.
    #[serde(rename = "CHECK")]
    Check { session_id: String, alias: String },
    /// Authenticator rendezvous carrying the widget's client session id.
    #[serde(rename = "HELLO")]
    Hello { session_id: String, alias: String },
    /// Signed challenge reply, `decryptedHex|signatureHex`.
    #[serde(rename = "AUTH")]
    Auth {
        alias: String,
        challenge_signed: String,
        #[serde(default)]
        fields: Option<Value>,
    },
    /// User refused the authentication request on the authenticator.
    #[serde(rename = "AUTH_DECLINED")]
    AuthDeclined,
    /// Opaque token forwarded to `on_success`, kept on the session it
    /// arrived on.
    #[serde(rename = "CURRENT_USER_TOKEN")]
    CurrentUserToken { payload: Value },
}

/// Envelopes the broker sends back, tagged by the `_` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_")]
pub enum BrokerReply {
    #[serde(rename = "AUTH_INIT")]
    AuthInit { payload: InitPayload },
    #[serde(rename = "READY")]
    Ready { client_session_id: Uuid },
    #[serde(rename = "ACTIVATED")]
    Activated,
    #[serde(rename = "CHALLENGE")]
    Challenge {
        message: String,
        payload: ChallengePayload,
    },
    #[serde(rename = "AUTH_RESULT")]
    AuthResult {
        message: String,
        payload: AuthResultPayload,
    },
    #[serde(rename = "AUTH_DECLINED")]
    AuthDeclined,
    #[serde(rename = "CONNECTION_FAILED")]
    ConnectionFailed,
    #[serde(rename = "ERROR")]
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitPayload {
    pub id: Uuid,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub challenge: String,
    pub fields: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResultPayload {
    pub token: String,
    pub linked_id: String,
}

impl ClientCommand {
    /// Parse one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl BrokerReply {
    pub fn error(message: impl Into<String>) -> Self {
        BrokerReply::Error {
            message: message.into(),
        }
    }

    /// Serialize for the wire. Our own envelopes always serialize; if one
    /// ever does not, log it and degrade to a generic error frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            tracing::error!("failed to serialize broker reply: {}", err);
            format!(
                "{{\"_\":\"{}\",\"message\":\"internal error\"}}",
                COMMAND_ERROR
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn check_command_parses() {
        let id = Uuid::new_v4();
        let raw = json!({"_": COMMAND_CHECK, "session_id": id.to_string(), "alias": "alice"});

        match ClientCommand::parse(&raw.to_string()).unwrap() {
            ClientCommand::Check { session_id, alias } => {
                assert_eq!(session_id, id.to_string());
                assert_eq!(alias, "alice");
            }
            other => panic!("parsed into {:?}", other),
        }
    }

    #[test]
    fn auth_fields_are_optional() {
        let raw = json!({"_": COMMAND_AUTH, "alias": "alice", "challenge_signed": "aa|bb"});
        match ClientCommand::parse(&raw.to_string()).unwrap() {
            ClientCommand::Auth { fields, .. } => assert!(fields.is_none()),
            other => panic!("parsed into {:?}", other),
        }
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        assert!(ClientCommand::parse(r#"{"_":"SHRUG"}"#).is_err());
        assert!(ClientCommand::parse("not json at all").is_err());
    }

    #[test]
    fn replies_carry_the_expected_tags() {
        let frame = BrokerReply::Activated.to_frame();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["_"], COMMAND_ACTIVATED);

        let frame = BrokerReply::error("user not found").to_frame();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["_"], COMMAND_ERROR);
        assert_eq!(value["message"], "user not found");
    }
}
