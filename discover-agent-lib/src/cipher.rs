//! Decryption of per-connection secrets.
//!
//! Secrets stored by the connection manager are
//! `base64(iv[16] || AES-256-CBC(PKCS#7(plaintext)))`, keyed with the
//! SHA-256 digest of the platform cipher key.

use crate::auth::ApiAuth;
use crate::error::describe_request_error;
use crate::{Error, Result};
use aes::Aes256;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use url::Url;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

/// Errors from encrypting or decrypting a secret.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext too short ({0} bytes)")]
    TooShort(usize),
    #[error("invalid key or IV length")]
    InvalidLength,
    #[error("bad padding or wrong key")]
    Unpad,
    #[error("plaintext is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Symmetric key material shared by every connector.
#[derive(Clone)]
pub struct CipherKey([u8; 32]);

impl CipherKey {
    /// Derive the AES-256 key from the platform key string.
    pub fn derive(raw: &str) -> Self {
        Self(Sha256::digest(raw.as_bytes()).into())
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct CredentialCipher {
    key: CipherKey,
}

impl CredentialCipher {
    pub fn new(key: CipherKey) -> Self {
        Self { key }
    }

    pub fn from_key_str(raw: &str) -> Self {
        Self::new(CipherKey::derive(raw))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let bytes = BASE64.decode(ciphertext.trim())?;
        if bytes.len() <= IV_LEN {
            return Err(CipherError::TooShort(bytes.len()));
        }
        let (iv, body) = bytes.split_at(IV_LEN);

        let plain = Aes256CbcDec::new_from_slices(&self.key.0, iv)
            .map_err(|_| CipherError::InvalidLength)?
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| CipherError::Unpad)?;
        Ok(String::from_utf8(plain)?)
    }

    /// Encrypt with a fresh random IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill(&mut iv);

        let body = Aes256CbcEnc::new_from_slices(&self.key.0, &iv)
            .map_err(|_| CipherError::InvalidLength)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut out = Vec::with_capacity(IV_LEN + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        Ok(BASE64.encode(out))
    }
}

#[derive(Deserialize)]
struct CipherKeyResponse {
    cipher_key: Option<String>,
}

/// Resolve the process-wide cipher.
///
/// A configured key wins without any network call. Otherwise the key is
/// fetched from the platform; a non-OK answer leaves the cipher unconfigured.
pub async fn resolve_cipher(
    client: &Client,
    cipher_key_url: &Url,
    auth: &ApiAuth,
    configured_key: Option<&str>,
) -> Result<Option<CredentialCipher>> {
    if let Some(key) = configured_key.filter(|k| !k.is_empty()) {
        info!("Using configured cipher key");
        return Ok(Some(CredentialCipher::from_key_str(key)));
    }

    let request = client.get(cipher_key_url.clone());
    let response = auth
        .apply(request)
        .send()
        .await
        .map_err(|e| Error::transport(describe_request_error(&e)))?;

    if !response.status().is_success() {
        warn!(
            "Cipher key was not available ({}). This may affect cos and scale connections",
            response.status()
        );
        return Ok(None);
    }

    let body: CipherKeyResponse = response
        .json()
        .await
        .map_err(|e| Error::transport(describe_request_error(&e)))?;

    match body.cipher_key.filter(|k| !k.is_empty()) {
        Some(key) => Ok(Some(CredentialCipher::from_key_str(&key))),
        None => {
            warn!("Cipher key response carried no key. This may affect cos and scale connections");
            Ok(None)
        }
    }
}
