//! Symmetric encryption for `encrypt` / `decrypt` jobs.
//!
//! Tokens are `base64(nonce || ciphertext)` under AES-256-GCM with the key
//! derived as `sha256(secret)`. The sealed value is the JSON encoding of the
//! caller's value so structured data round-trips.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use frostline_protocol::{JobError, JobErrorTag};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Debug, Deserialize)]
pub struct Encrypt {
    pub secret: String,
    pub plaintext: Value,
}

#[derive(Debug, Deserialize)]
pub struct Decrypt {
    pub secrets: Vec<String>,
    pub token: String,
}

fn cipher(secret: &str) -> Aes256Gcm {
    let digest = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(digest.as_slice()))
}

pub fn encrypt(job: &Encrypt) -> Result<Value, JobError> {
    let plaintext = serde_json::to_vec(&job.plaintext).map_err(|err| {
        JobError::new(JobErrorTag::BadPayload, format!("unencodable value: {err}"))
    })?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher(&job.secret)
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| JobError::new(JobErrorTag::Io, "encryption failed"))?;

    let mut token = Vec::with_capacity(NONCE_LEN + sealed.len());
    token.extend_from_slice(&nonce);
    token.extend_from_slice(&sealed);
    Ok(Value::String(BASE64.encode(token)))
}

/// Try each secret in order; the first that authenticates wins.
pub fn decrypt(job: &Decrypt) -> Result<Value, JobError> {
    let raw = BASE64.decode(job.token.trim()).map_err(|err| {
        JobError::new(
            JobErrorTag::DecryptFailed,
            format!("token is not valid base64: {err}"),
        )
    })?;
    if raw.len() <= NONCE_LEN {
        return Err(JobError::new(JobErrorTag::DecryptFailed, "token is too short"));
    }
    let (nonce, sealed) = raw.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce);

    for secret in &job.secrets {
        if let Ok(plaintext) = cipher(secret).decrypt(nonce, sealed) {
            return serde_json::from_slice(&plaintext).map_err(|err| {
                JobError::new(
                    JobErrorTag::DecryptFailed,
                    format!("decrypted value is not valid JSON: {err}"),
                )
            });
        }
    }

    Err(JobError::new(
        JobErrorTag::DecryptFailed,
        format!("none of the {} secrets could decrypt the token", job.secrets.len()),
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decrypts_with_rotated_secret_list() {
        let token = encrypt(&Encrypt {
            secret: "current".into(),
            plaintext: json!({"user": 7}),
        })
        .expect("encrypt");
        let token = token.as_str().expect("string token").to_string();

        let value = decrypt(&Decrypt {
            secrets: vec!["old".into(), "current".into()],
            token,
        })
        .expect("decrypt");
        assert_eq!(value, json!({"user": 7}));
    }

    #[test]
    fn wrong_secrets_fail_with_tag() {
        let token = encrypt(&Encrypt {
            secret: "a".into(),
            plaintext: json!("hello"),
        })
        .expect("encrypt");
        let err = decrypt(&Decrypt {
            secrets: vec!["b".into()],
            token: token.as_str().expect("string").to_string(),
        })
        .expect_err("wrong secret");
        assert_eq!(err.tag, JobErrorTag::DecryptFailed);
    }

    #[test]
    fn garbage_tokens_fail_with_tag() {
        let err = decrypt(&Decrypt {
            secrets: vec!["a".into()],
            token: "%%%".into(),
        })
        .expect_err("garbage");
        assert_eq!(err.tag, JobErrorTag::DecryptFailed);
    }
}
