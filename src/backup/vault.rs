//! Credential vault for the backup role password.
//!
//! The password is kept at rest as AES-256-GCM ciphertext with the key
//! derived from an operator secret. When no secret is configured a
//! deterministic fallback is derived from the target database name, the
//! host name, and the session cookie name, and the status surface flags
//! that the fallback is in use.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backup::{BackupError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypted password fields as persisted in the settings row.
/// All three fields empty means "no password stored".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub cipher: String,
    pub iv: String,
    pub tag: String,
}

impl EncryptedSecret {
    pub fn is_empty(&self) -> bool {
        self.cipher.is_empty() || self.iv.is_empty() || self.tag.is_empty()
    }
}

/// Derives the symmetric key once and encrypts/decrypts backup credentials
pub struct CredentialVault {
    key: [u8; 32],
    using_fallback: bool,
}

impl CredentialVault {
    /// Create a vault from the operator secret, or the deterministic
    /// fallback when no secret is configured.
    pub fn new(secret: Option<&str>, database_name: &str, session_cookie_name: &str) -> Self {
        match secret.filter(|s| !s.is_empty()) {
            Some(secret) => Self {
                key: derive_key(secret),
                using_fallback: false,
            },
            None => {
                let host = hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| String::from("unknown-host"));
                let fallback = format!("{}|{}|{}", database_name, host, session_cookie_name);
                Self {
                    key: derive_key(&fallback),
                    using_fallback: true,
                }
            }
        }
    }

    /// Whether the key came from the derived fallback rather than an
    /// operator-supplied secret. Surfaced on the status endpoint.
    pub fn using_fallback(&self) -> bool {
        self.using_fallback
    }

    /// Encrypt a plaintext password with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| BackupError::Crypto(String::from("invalid key length")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| BackupError::Crypto(String::from("password encryption failed")))?;

        // aes-gcm appends the auth tag to the ciphertext; the settings row
        // stores the two parts separately.
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(EncryptedSecret {
            cipher: BASE64.encode(body),
            iv: BASE64.encode(nonce_bytes),
            tag: BASE64.encode(tag),
        })
    }

    /// Decrypt a stored password. Returns an empty string on any failure
    /// (missing fields, bad base64, failed authentication) so a corrupted
    /// credential reads as "not configured" instead of an error.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> String {
        self.try_decrypt(secret).unwrap_or_default()
    }

    fn try_decrypt(&self, secret: &EncryptedSecret) -> Option<String> {
        if secret.is_empty() {
            return None;
        }

        let body = BASE64.decode(&secret.cipher).ok()?;
        let iv = BASE64.decode(&secret.iv).ok()?;
        let tag = BASE64.decode(&secret.tag).ok()?;

        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return None;
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;

        let mut sealed = body;
        sealed.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .ok()?;

        String::from_utf8(plaintext).ok()
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::new(Some("test-secret"), "app", "session")
    }

    #[test]
    fn test_round_trip() {
        let vault = vault();
        for plaintext in ["hunter2", "", "päss wörd / with symbols!"] {
            let secret = vault.encrypt(plaintext).unwrap();
            assert_eq!(vault.decrypt(&secret), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let vault = vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.cipher, b.cipher);
    }

    #[test]
    fn test_tampered_cipher_decrypts_to_empty() {
        let vault = vault();
        let mut secret = vault.encrypt("hunter2").unwrap();
        let mut body = BASE64.decode(&secret.cipher).unwrap();
        body[0] ^= 0xff;
        secret.cipher = BASE64.encode(body);
        assert_eq!(vault.decrypt(&secret), "");
    }

    #[test]
    fn test_tampered_tag_decrypts_to_empty() {
        let vault = vault();
        let mut secret = vault.encrypt("hunter2").unwrap();
        let mut tag = BASE64.decode(&secret.tag).unwrap();
        tag[0] ^= 0xff;
        secret.tag = BASE64.encode(tag);
        assert_eq!(vault.decrypt(&secret), "");
    }

    #[test]
    fn test_missing_fields_decrypt_to_empty() {
        let vault = vault();
        let secret = vault.encrypt("hunter2").unwrap();

        for blank in ["cipher", "iv", "tag"] {
            let mut partial = secret.clone();
            match blank {
                "cipher" => partial.cipher = String::new(),
                "iv" => partial.iv = String::new(),
                _ => partial.tag = String::new(),
            }
            assert_eq!(vault.decrypt(&partial), "");
        }

        let mut garbage = secret;
        garbage.iv = String::from("not base64 !!!");
        assert_eq!(vault.decrypt(&garbage), "");
    }

    #[test]
    fn test_wrong_key_decrypts_to_empty() {
        let secret = vault().encrypt("hunter2").unwrap();
        let other = CredentialVault::new(Some("another-secret"), "app", "session");
        assert_eq!(other.decrypt(&secret), "");
    }

    #[test]
    fn test_fallback_flag() {
        assert!(!vault().using_fallback());
        assert!(CredentialVault::new(None, "app", "session").using_fallback());
        assert!(CredentialVault::new(Some(""), "app", "session").using_fallback());
    }

    #[test]
    fn test_fallback_key_is_deterministic() {
        let a = CredentialVault::new(None, "app", "session");
        let b = CredentialVault::new(None, "app", "session");
        let secret = a.encrypt("hunter2").unwrap();
        assert_eq!(b.decrypt(&secret), "hunter2");
    }
}
