//! AES-256-GCM encryption of individual secret values.
//!
//! Encrypted values are stored as `enc:<iv>:<tag>:<ciphertext>` (hex), which
//! makes them recognisable so that encrypting twice or decrypting plaintext
//! is a no-op.

use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use tracing::info;
use zeroize::Zeroizing;

use crate::config::SecurityConfig;

const PREFIX: &str = "enc:";
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct Cipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Parse a 64-hex-char key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = Zeroizing::new(hex::decode(hex_key.trim()).context("key is not valid hex")?);
        if bytes.len() != 32 {
            anyhow::bail!("encryption key must be 32 bytes, got {}", bytes.len());
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&bytes);
        Ok(Self::from_key(&key))
    }

    /// Load the key from `security.key_env`, else from `security.key_file`,
    /// generating the file on first use.
    pub fn load(security: &SecurityConfig) -> Result<Self> {
        if let Ok(env_key) = std::env::var(&security.key_env) {
            let env_key = Zeroizing::new(env_key);
            info!(env = %security.key_env, "using encryption key from environment");
            return Self::from_hex(&env_key)
                .with_context(|| format!("invalid key in {}", security.key_env));
        }
        Self::load_or_generate(&security.key_file)
    }

    fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let hex_key = Zeroizing::new(
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read key file {}", path.display()))?,
            );
            info!(path = %path.display(), "loaded encryption key");
            return Self::from_hex(&hex_key)
                .with_context(|| format!("invalid key file {}", path.display()));
        }

        let key = Aes256Gcm::generate_key(OsRng);
        let encoded = Zeroizing::new(hex::encode(key.as_slice()));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(path, encoded.as_bytes())
            .with_context(|| format!("failed to write key file {}", path.display()))?;
        info!(path = %path.display(), "generated new encryption key");
        Ok(Self {
            aead: Aes256Gcm::new(&key),
        })
    }

    /// Whether `value` has the shape of a value produced by [`Cipher::encrypt`].
    pub fn is_encrypted(value: &str) -> bool {
        let Some(rest) = value.strip_prefix(PREFIX) else {
            return false;
        };
        let parts: Vec<&str> = rest.split(':').collect();
        parts.len() == 3
            && parts[0].len() == IV_LEN * 2
            && parts[1].len() == TAG_LEN * 2
            && parts
                .iter()
                .all(|p| p.chars().all(|c| c.is_ascii_hexdigit()))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        // The tag is appended to the ciphertext; store it separately.
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{PREFIX}{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(ct)
        ))
    }

    pub fn decrypt(&self, value: &str) -> Result<String> {
        if !Self::is_encrypted(value) {
            anyhow::bail!("value is not in encrypted form");
        }
        let rest = &value[PREFIX.len()..];
        let mut parts = rest.splitn(3, ':');
        let iv = hex::decode(parts.next().unwrap_or_default())?;
        let tag = hex::decode(parts.next().unwrap_or_default())?;
        let mut sealed = hex::decode(parts.next().unwrap_or_default())?;
        sealed.extend_from_slice(&tag);

        let plain = self
            .aead
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;
        Ok(String::from_utf8(plain)?)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::from_key(&[7u8; 32])
    }

    #[test]
    fn test_round_trip() {
        let c = cipher();
        let enc = c.encrypt("s3cr3t:with@symbols").unwrap();
        assert!(Cipher::is_encrypted(&enc));
        assert_ne!(enc, "s3cr3t:with@symbols");
        assert_eq!(c.decrypt(&enc).unwrap(), "s3cr3t:with@symbols");
    }

    #[test]
    fn test_nonce_differs_per_encryption() {
        let c = cipher();
        assert_ne!(c.encrypt("x").unwrap(), c.encrypt("x").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let enc = cipher().encrypt("pw").unwrap();
        let other = Cipher::from_key(&[9u8; 32]);
        assert!(other.decrypt(&enc).is_err());
    }

    #[test]
    fn test_plaintext_is_not_mistaken_for_ciphertext() {
        assert!(!Cipher::is_encrypted("hunter2"));
        assert!(!Cipher::is_encrypted("enc:notreally"));
        assert!(!Cipher::is_encrypted("********"));
    }

    #[test]
    fn test_key_file_is_generated_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let security = SecurityConfig {
            key_env: "STASHD_TEST_KEY_THAT_IS_NEVER_SET".into(),
            key_file: dir.path().join("keys").join("secret.key"),
        };
        let first = Cipher::load(&security).unwrap();
        let enc = first.encrypt("pw").unwrap();

        let second = Cipher::load(&security).unwrap();
        assert_eq!(second.decrypt(&enc).unwrap(), "pw");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&security.key_file).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_from_hex_rejects_short_keys() {
        assert!(Cipher::from_hex("abcd").is_err());
        assert!(Cipher::from_hex(&"00".repeat(32)).is_ok());
    }
}
