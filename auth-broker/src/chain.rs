// auth-broker/src/chain.rs
use async_trait::async_trait;
use rsa::RsaPublicKey;
use thiserror::Error;

use common::crypto::{rsa_public_from_modulus, sha256hex, RSA_MODULUS_LEN};
use common::error::BrokerError;

/// Record-name suffixes under which an alias keeps its two public keys.
pub const RECORD_PUBLIC_ENC: &str = ":publicEnc";
pub const RECORD_PUBLIC_SIGN: &str = ":publicSign";

/// What the contract returns for an unknown alias.
const EMPTY_RECORD: &str = "0x";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry transport failure: {0}")]
    Transport(String),
    #[error("registry returned malformed data: {0}")]
    Malformed(String),
}

/// Read-only view of the blockchain record registry. The JSON-RPC transport
/// and the contract ABI decoding live with the embedder; the broker consumes
/// a single contract method through this trait.
#[async_trait]
pub trait RecordRegistry: Send + Sync {
    /// `alias_hash` and `names` are `sha256hex` strings. Returns the
    /// contract's `mixedResult` hex blob, `"0x"` when the alias is unknown.
    async fn get_record_hashed(
        &self,
        alias_hash: &str,
        names: &[String],
    ) -> Result<String, RegistryError>;
}

/// The two RSA-2048 public keys stored for one alias.
#[derive(Debug, Clone)]
pub struct UserKeys {
    pub encryption: RsaPublicKey,
    pub signing: RsaPublicKey,
}

/// Resolve both public keys for an alias. Record names go out hashed so the
/// on-chain storage stays opaque, and both moduli come back packed into one
/// blob: first half the encryption key, second half the signing key.
pub async fn user_public_keys(
    registry: &dyn RecordRegistry,
    alias: &str,
) -> Result<UserKeys, BrokerError> {
    let alias_hash = sha256hex(alias.as_bytes());
    let names = vec![
        sha256hex(format!("{alias}{RECORD_PUBLIC_ENC}").as_bytes()),
        sha256hex(format!("{alias}{RECORD_PUBLIC_SIGN}").as_bytes()),
    ];

    let mixed = registry
        .get_record_hashed(&alias_hash, &names)
        .await
        .map_err(|err| BrokerError::Upstream(err.to_string()))?;

    if mixed == EMPTY_RECORD {
        tracing::debug!("no registry record for alias {}", alias);
        return Err(BrokerError::UserNotFound);
    }

    let raw = hex::decode(mixed.trim_start_matches("0x"))
        .map_err(|_| BrokerError::Upstream("mixed record is not valid hex".into()))?;
    if raw.len() != RSA_MODULUS_LEN * 2 {
        return Err(BrokerError::Upstream(format!(
            "mixed record holds {} bytes, expected {}",
            raw.len(),
            RSA_MODULUS_LEN * 2
        )));
    }

    let (enc_modulus, sign_modulus) = raw.split_at(RSA_MODULUS_LEN);
    let encryption = rsa_public_from_modulus(enc_modulus)
        .map_err(|err| BrokerError::Upstream(err.to_string()))?;
    let signing = rsa_public_from_modulus(sign_modulus)
        .map_err(|err| BrokerError::Upstream(err.to_string()))?;

    Ok(UserKeys {
        encryption,
        signing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;
    use std::sync::Mutex;

    struct FixedRegistry {
        mixed: String,
        seen: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl RecordRegistry for FixedRegistry {
        async fn get_record_hashed(
            &self,
            alias_hash: &str,
            names: &[String],
        ) -> Result<String, RegistryError> {
            self.seen
                .lock()
                .unwrap()
                .push((alias_hash.to_string(), names.to_vec()));
            Ok(self.mixed.clone())
        }
    }

    fn registry_with(mixed: String) -> FixedRegistry {
        FixedRegistry {
            mixed,
            seen: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn unknown_alias_maps_to_user_not_found() {
        let registry = registry_with("0x".into());
        let err = user_public_keys(&registry, "ghost").await.unwrap_err();
        assert!(matches!(err, BrokerError::UserNotFound));
    }

    #[tokio::test]
    async fn truncated_record_is_an_upstream_failure() {
        let registry = registry_with(format!("0x{}", "ab".repeat(100)));
        let err = user_public_keys(&registry, "alice").await.unwrap_err();
        assert!(matches!(err, BrokerError::Upstream(_)));
    }

    #[tokio::test]
    async fn mixed_record_splits_into_both_keys() {
        let private =
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("keygen failed");
        let modulus = private.n().to_bytes_be();

        // Same modulus in both halves keeps the fixture cheap.
        let registry = registry_with(format!(
            "0x{}{}",
            hex::encode(&modulus),
            hex::encode(&modulus)
        ));

        let keys = user_public_keys(&registry, "alice").await.unwrap();
        assert_eq!(keys.encryption.n(), private.n());
        assert_eq!(keys.signing.n(), private.n());

        // The contract call carries hashed inputs, never the alias itself.
        let seen = registry.seen.lock().unwrap();
        let (alias_hash, names) = &seen[0];
        assert_eq!(*alias_hash, sha256hex(b"alice"));
        assert_eq!(names[0], sha256hex(b"alice:publicEnc"));
        assert_eq!(names[1], sha256hex(b"alice:publicSign"));
    }
}
