// auth-broker/src/challenge.rs
use std::sync::Arc;

use rsa::RsaPublicKey;

use common::crypto::{random_bytes, rsa_encrypt, rsa_verify};
use common::error::BrokerError;

use crate::chain::{user_public_keys, RecordRegistry};

/// Length of the random secret wrapped into each challenge, in bytes.
pub const SECRET_LEN: usize = 128;

/// A freshly built challenge. The plaintext secret stays broker-side, bound
/// to the authenticator session until AUTH settles it.
pub struct Challenge {
    pub secret: Vec<u8>,
    /// RSA encryption of the secret under the alias's encryption key, hex.
    pub challenge: String,
    pub public_key_sign: RsaPublicKey,
}

/// Builds and verifies the proof-of-keys exchange.
pub struct ChallengeService {
    registry: Arc<dyn RecordRegistry>,
}

impl ChallengeService {
    pub fn new(registry: Arc<dyn RecordRegistry>) -> Self {
        Self { registry }
    }

    /// Fetch the alias's keys and wrap a fresh 128-byte secret.
    pub async fn create_challenge(&self, alias: &str) -> Result<Challenge, BrokerError> {
        let keys = user_public_keys(self.registry.as_ref(), alias).await?;

        let secret = random_bytes(SECRET_LEN);
        let wrapped = rsa_encrypt(&keys.encryption, &secret)
            .map_err(|err| BrokerError::Upstream(err.to_string()))?;

        tracing::debug!("challenge built for alias {}", alias);

        Ok(Challenge {
            secret,
            challenge: hex::encode(wrapped),
            public_key_sign: keys.signing,
        })
    }

    /// Verify a `decryptedHex|signatureHex` reply. Both halves must hold:
    /// the decryption must reproduce the secret and the signature must
    /// verify over it. Malformed input is a plain `false`, so the caller can
    /// answer with a uniform denial.
    pub fn check_challenge(
        secret: &[u8],
        public_key_sign: &RsaPublicKey,
        challenge_signed: &str,
    ) -> bool {
        let Some((decrypted_hex, signature_hex)) = challenge_signed.split_once('|') else {
            return false;
        };
        let Ok(decrypted) = hex::decode(decrypted_hex) else {
            return false;
        };
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };

        decrypted == secret && rsa_verify(public_key_sign, secret, &signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rsa::traits::PublicKeyParts;
    use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey};
    use sha2::{Digest, Sha256};
    use std::sync::OnceLock;

    use crate::chain::RegistryError;

    struct KeyPair {
        enc: RsaPrivateKey,
        sign: RsaPrivateKey,
    }

    fn keys() -> &'static KeyPair {
        static KEYS: OnceLock<KeyPair> = OnceLock::new();
        KEYS.get_or_init(|| {
            let mut rng = rand::thread_rng();
            KeyPair {
                enc: RsaPrivateKey::new(&mut rng, 2048).expect("keygen failed"),
                sign: RsaPrivateKey::new(&mut rng, 2048).expect("keygen failed"),
            }
        })
    }

    struct MixedRegistry;

    #[async_trait]
    impl RecordRegistry for MixedRegistry {
        async fn get_record_hashed(
            &self,
            _alias_hash: &str,
            _names: &[String],
        ) -> Result<String, RegistryError> {
            let pair = keys();
            Ok(format!(
                "0x{}{}",
                hex::encode(pair.enc.n().to_bytes_be()),
                hex::encode(pair.sign.n().to_bytes_be())
            ))
        }
    }

    fn sign_secret(secret: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(secret);
        keys()
            .sign
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap()
    }

    #[tokio::test]
    async fn authenticator_reply_passes_the_check() {
        let service = ChallengeService::new(Arc::new(MixedRegistry));
        let challenge = service.create_challenge("alice").await.unwrap();
        assert_eq!(challenge.secret.len(), SECRET_LEN);

        // Authenticator side: unwrap the secret, sign it, reply.
        let wrapped = hex::decode(&challenge.challenge).unwrap();
        let decrypted = keys().enc.decrypt(Oaep::new::<Sha256>(), &wrapped).unwrap();
        assert_eq!(decrypted, challenge.secret);

        let reply = format!(
            "{}|{}",
            hex::encode(&decrypted),
            hex::encode(sign_secret(&decrypted))
        );
        assert!(ChallengeService::check_challenge(
            &challenge.secret,
            &challenge.public_key_sign,
            &reply
        ));
    }

    #[tokio::test]
    async fn wrong_secret_or_signature_fails_closed() {
        let service = ChallengeService::new(Arc::new(MixedRegistry));
        let challenge = service.create_challenge("alice").await.unwrap();

        let good_sig = sign_secret(&challenge.secret);

        // Decrypted half tampered.
        let mut wrong_secret = challenge.secret.clone();
        wrong_secret[0] ^= 0x01;
        let reply = format!(
            "{}|{}",
            hex::encode(&wrong_secret),
            hex::encode(&good_sig)
        );
        assert!(!ChallengeService::check_challenge(
            &challenge.secret,
            &challenge.public_key_sign,
            &reply
        ));

        // Signature half tampered.
        let mut bad_sig = good_sig.clone();
        bad_sig[0] ^= 0x01;
        let reply = format!(
            "{}|{}",
            hex::encode(&challenge.secret),
            hex::encode(&bad_sig)
        );
        assert!(!ChallengeService::check_challenge(
            &challenge.secret,
            &challenge.public_key_sign,
            &reply
        ));

        // Malformed replies never panic.
        for junk in ["", "|", "zz|zz", "deadbeef"] {
            assert!(!ChallengeService::check_challenge(
                &challenge.secret,
                &challenge.public_key_sign,
                junk
            ));
        }
    }
}
