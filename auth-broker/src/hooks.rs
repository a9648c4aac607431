// auth-broker/src/hooks.rs
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure surfaced by a relying-party callback.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// Everything `on_success` gets to mint the widget's token: the verified
/// alias, the profile fields the authenticator attached to AUTH, the token
/// stored by `CURRENT_USER_TOKEN` on this session, and the id minted by
/// `on_user_validate` during activation.
#[derive(Debug, Clone)]
pub struct SuccessContext {
    pub alias: String,
    pub fields: Option<Value>,
    pub current_user_token: Option<Value>,
    pub user_id: Option<String>,
}

/// What the relying party minted for an authenticated user.
#[derive(Debug, Clone)]
pub struct SuccessGrant {
    pub token: String,
    pub linked_id: Option<String>,
    /// An application-level refusal; terminates both sides with this text.
    pub error: Option<String>,
}

/// Relying-party callbacks invoked by the pairing flow.
#[async_trait]
pub trait AuthHooks: Send + Sync {
    /// Ties a user to the widget session during activation; the returned id
    /// rides along into [`SuccessContext`].
    async fn on_user_validate(&self, _user_data: &Value) -> Result<Option<String>, HookError> {
        Ok(None)
    }

    /// Activation hook. Accepted for forward compatibility; the current
    /// flow never calls it.
    async fn on_activate(&self, _alias: &str) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once the challenge reply is verified; authorises the user and
    /// mints the widget's final token.
    async fn on_success(&self, context: SuccessContext) -> Result<SuccessGrant, HookError>;
}
