// common/src/crypto.rs
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rsa::{BigUint, Oaep, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Modulus length of the on-chain RSA-2048 keys, in bytes.
pub const RSA_MODULUS_LEN: usize = 256;
/// AES-256 key length, in bytes.
pub const AES_KEY_LEN: usize = 32;
/// CBC initialization vector length, in bytes.
pub const AES_IV_LEN: usize = 16;

const RSA_EXPONENT: u32 = 65537;

/// SHA-256 with the `0x` hex framing used by the record registry.
pub fn sha256hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("0x{}", hex::encode(digest))
}

/// Rebuild an RSA-2048 public key from a raw big-endian modulus.
pub fn rsa_public_from_modulus(modulus: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    if modulus.len() != RSA_MODULUS_LEN {
        return Err(CryptoError::BadKeyMaterial(format!(
            "expected a {}-byte modulus, got {} bytes",
            RSA_MODULUS_LEN,
            modulus.len()
        )));
    }

    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from(RSA_EXPONENT);
    RsaPublicKey::new(n, e).map_err(|err| CryptoError::BadKeyMaterial(err.to_string()))
}

/// Public-key encryption with OAEP-SHA256. The mode is fixed; the
/// authenticator must decrypt with the same one.
pub fn rsa_encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::thread_rng();
    key.encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|err| CryptoError::Cipher(err.to_string()))
}

/// PKCS#1 v1.5 signature verification over the SHA-256 digest of `message`.
pub fn rsa_verify(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}

/// AES-256-CBC with PKCS7 padding and a random 16-byte IV. Output is
/// `hex(iv) || hex(ciphertext)`, so repeated calls on the same input differ.
pub fn aes_encrypt(plaintext: &[u8], key: &[u8; AES_KEY_LEN]) -> String {
    let mut iv = [0u8; AES_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(key.into(), (&iv).into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    format!("{}{}", hex::encode(iv), hex::encode(ciphertext))
}

/// Inverse of [`aes_encrypt`]. Relying parties use this to unwrap the token
/// carried in the `AUTH_INIT` reply.
pub fn aes_decrypt(encoded: &str, key: &[u8; AES_KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    if encoded.len() <= AES_IV_LEN * 2 {
        return Err(CryptoError::MalformedCiphertext);
    }

    let (iv_hex, ciphertext_hex) = encoded.split_at(AES_IV_LEN * 2);
    let iv: [u8; AES_IV_LEN] = hex::decode(iv_hex)
        .map_err(|_| CryptoError::MalformedCiphertext)?
        .try_into()
        .map_err(|_| CryptoError::MalformedCiphertext)?;
    let ciphertext = hex::decode(ciphertext_hex).map_err(|_| CryptoError::MalformedCiphertext)?;

    Aes256CbcDec::new(key.into(), (&iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::MalformedCiphertext)
}

/// Draw `len` cryptographically random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}
