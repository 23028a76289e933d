//! Credential vault.
//!
//! Provider credentials are sealed with AES-256-GCM under a process-wide key
//! before they reach storage. Ciphertexts are stored as `<hex-ct>:<hex-tag>`
//! next to a hex-encoded 16-byte IV. No plaintext credentials are stored in
//! configuration or logs.

use crate::error::VaultError;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use classync_core::ScheduleId;
use classync_store::CredentialRecord;
use rand::RngCore;
use rootcause::prelude::Report;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::error::Category;
use std::fmt;

/// AES-256-GCM with a 16-byte nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Required key length in bytes.
pub const KEY_LEN: usize = 32;
/// IV length in bytes.
pub const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const DELIMITER: char = ':';

/// A sealed payload as it is persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSecret {
    /// `<hex-ciphertext>:<hex-tag>`.
    pub ciphertext: String,
    /// Hex-encoded IV.
    pub iv: String,
}

impl SealedSecret {
    /// Attaches the secret to a schedule.
    #[must_use]
    pub fn into_record(self, schedule_id: ScheduleId) -> CredentialRecord {
        CredentialRecord {
            schedule_id,
            ciphertext: self.ciphertext,
            iv: self.iv,
        }
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedSecret")
            .field("ciphertext", &"<sealed>")
            .field("iv", &self.iv)
            .finish()
    }
}

/// Authenticated symmetric encryption of credential payloads.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm16,
}

impl CredentialVault {
    /// Creates a vault from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKeyLength`] unless `key` is exactly 32 bytes.
    pub fn from_key(key: &[u8]) -> Result<Self, Report<VaultError>> {
        if key.len() != KEY_LEN {
            return Err(VaultError::InvalidKeyLength { actual: key.len() }.into());
        }
        let cipher = Aes256Gcm16::new_from_slice(key)
            .map_err(|_| VaultError::InvalidKeyLength { actual: key.len() })?;
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext` under a freshly generated IV.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::EncryptionFailed`] if the cipher rejects the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<SealedSecret, VaultError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), b"", &mut buffer)
            .map_err(|e| VaultError::EncryptionFailed {
                reason: e.to_string(),
            })?;

        Ok(SealedSecret {
            ciphertext: format!("{}{DELIMITER}{}", hex::encode(&buffer), hex::encode(tag)),
            iv: hex::encode(iv),
        })
    }

    /// Decrypts a sealed payload.
    ///
    /// Never returns partial output: either the tag verifies and the whole
    /// plaintext is returned, or an error is.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::MalformedCiphertext`] when the delimiter is
    /// missing or a component has the wrong encoding or length, and
    /// [`VaultError::AuthenticationFailed`] when the tag does not verify.
    pub fn decrypt(&self, ciphertext: &str, iv: &str) -> Result<Vec<u8>, VaultError> {
        let (body, tag) =
            ciphertext
                .split_once(DELIMITER)
                .ok_or_else(|| VaultError::MalformedCiphertext {
                    reason: "missing tag delimiter".to_string(),
                })?;

        let mut buffer = decode_hex("ciphertext", body)?;
        let tag = decode_hex("tag", tag)?;
        let iv = decode_hex("iv", iv)?;

        if tag.len() != TAG_LEN {
            return Err(VaultError::MalformedCiphertext {
                reason: format!("tag must be {TAG_LEN} bytes, got {}", tag.len()),
            });
        }
        if iv.len() != IV_LEN {
            return Err(VaultError::MalformedCiphertext {
                reason: format!("iv must be {IV_LEN} bytes, got {}", iv.len()),
            });
        }

        self.cipher
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(&iv),
                b"",
                &mut buffer,
                Tag::<U16>::from_slice(&tag),
            )
            .map_err(|_| VaultError::AuthenticationFailed)?;

        Ok(buffer)
    }

    /// Serializes `payload` as JSON and encrypts it.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::MalformedPayload`] if serialization fails.
    pub fn seal<T: Serialize>(&self, payload: &T) -> Result<SealedSecret, VaultError> {
        let plaintext = serde_json::to_vec(payload).map_err(|e| payload_error(&e))?;
        self.encrypt(&plaintext)
    }

    /// Decrypts and deserializes a payload sealed with [`CredentialVault::seal`].
    ///
    /// # Errors
    ///
    /// Returns the [`CredentialVault::decrypt`] errors, or
    /// [`VaultError::MalformedPayload`] if the plaintext is not valid JSON for `T`.
    pub fn open<T: DeserializeOwned>(&self, ciphertext: &str, iv: &str) -> Result<T, VaultError> {
        let plaintext = self.decrypt(ciphertext, iv)?;
        serde_json::from_slice(&plaintext).map_err(|e| payload_error(&e))
    }

    /// Opens the credentials stored for a schedule.
    ///
    /// # Errors
    ///
    /// See [`CredentialVault::open`].
    pub fn open_record<T: DeserializeOwned>(
        &self,
        record: &CredentialRecord,
    ) -> Result<T, VaultError> {
        self.open(&record.ciphertext, &record.iv)
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Describes a JSON failure by category and position only. The error's own
/// message can quote values from the decrypted payload.
fn payload_error(e: &serde_json::Error) -> VaultError {
    let category = match e.classify() {
        Category::Io => "i/o failure",
        Category::Syntax => "invalid JSON",
        Category::Data => "unexpected JSON shape",
        Category::Eof => "truncated JSON",
    };
    VaultError::MalformedPayload {
        reason: format!("{category} at line {} column {}", e.line(), e.column()),
    }
}

fn decode_hex(part: &str, value: &str) -> Result<Vec<u8>, VaultError> {
    hex::decode(value).map_err(|e| VaultError::MalformedCiphertext {
        reason: format!("{part} is not valid hex: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

    fn vault() -> CredentialVault {
        CredentialVault::from_key(KEY).expect("valid key")
    }

    fn flip_bit(hex_str: &str, byte: usize) -> String {
        let mut bytes = hex::decode(hex_str).expect("hex");
        bytes[byte] ^= 0x01;
        hex::encode(bytes)
    }

    #[test]
    fn round_trip() {
        let vault = vault();
        for plaintext in [&b""[..], b"a", b"{\"username\":\"jdoe\",\"password\":\"s3cret\"}"] {
            let sealed = vault.encrypt(plaintext).expect("encrypt");
            let opened = vault.decrypt(&sealed.ciphertext, &sealed.iv).expect("decrypt");
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn ciphertext_format() {
        let sealed = vault().encrypt(b"hello").expect("encrypt");
        let (body, tag) = sealed.ciphertext.split_once(':').expect("delimiter");
        assert_eq!(body.len(), 10);
        assert_eq!(tag.len(), TAG_LEN * 2);
        assert_eq!(sealed.iv.len(), IV_LEN * 2);
    }

    #[test]
    fn fresh_iv_per_call() {
        let vault = vault();
        let a = vault.encrypt(b"same").expect("encrypt");
        let b = vault.encrypt(b"same").expect("encrypt");
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn flipped_ciphertext_bit_fails_authentication() {
        let vault = vault();
        let sealed = vault.encrypt(b"credentials").expect("encrypt");
        let (body, tag) = sealed.ciphertext.split_once(':').expect("delimiter");

        for byte in 0..body.len() / 2 {
            let tampered = format!("{}:{tag}", flip_bit(body, byte));
            assert_eq!(
                vault.decrypt(&tampered, &sealed.iv),
                Err(VaultError::AuthenticationFailed)
            );
        }
    }

    #[test]
    fn flipped_tag_bit_fails_authentication() {
        let vault = vault();
        let sealed = vault.encrypt(b"credentials").expect("encrypt");
        let (body, tag) = sealed.ciphertext.split_once(':').expect("delimiter");

        for byte in 0..TAG_LEN {
            let tampered = format!("{body}:{}", flip_bit(tag, byte));
            assert_eq!(
                vault.decrypt(&tampered, &sealed.iv),
                Err(VaultError::AuthenticationFailed)
            );
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = vault().encrypt(b"credentials").expect("encrypt");
        let other = CredentialVault::from_key(b"fedcba9876543210fedcba9876543210").expect("key");
        assert_eq!(
            other.decrypt(&sealed.ciphertext, &sealed.iv),
            Err(VaultError::AuthenticationFailed)
        );
    }

    #[test]
    fn missing_delimiter_is_malformed() {
        let vault = vault();
        let sealed = vault.encrypt(b"credentials").expect("encrypt");
        let joined = sealed.ciphertext.replace(':', "");
        assert!(matches!(
            vault.decrypt(&joined, &sealed.iv),
            Err(VaultError::MalformedCiphertext { .. })
        ));
    }

    #[test]
    fn bad_hex_and_lengths_are_malformed() {
        let vault = vault();
        let sealed = vault.encrypt(b"credentials").expect("encrypt");
        let (body, tag) = sealed.ciphertext.split_once(':').expect("delimiter");

        let cases = [
            (format!("zz:{tag}"), sealed.iv.clone()),
            (format!("{body}:{}", &tag[..20]), sealed.iv.clone()),
            (sealed.ciphertext.clone(), "00ff".to_string()),
            (sealed.ciphertext.clone(), "not-hex".to_string()),
        ];
        for (ciphertext, iv) in cases {
            assert!(matches!(
                vault.decrypt(&ciphertext, &iv),
                Err(VaultError::MalformedCiphertext { .. })
            ));
        }
    }

    #[test]
    fn key_must_be_32_bytes() {
        assert!(CredentialVault::from_key(b"short").is_err());
        assert!(CredentialVault::from_key(&[7u8; 33]).is_err());
        assert!(CredentialVault::from_key(&[7u8; 32]).is_ok());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Login {
        username: String,
        password: String,
    }

    #[test]
    fn seal_and_open_typed_payload() {
        let vault = vault();
        let login = Login {
            username: "jdoe".to_string(),
            password: "s3cret".to_string(),
        };
        let record = vault
            .seal(&login)
            .expect("seal")
            .into_record(ScheduleId::new());

        let opened: Login = vault.open_record(&record).expect("open");
        assert_eq!(opened, login);
    }

    #[test]
    fn open_rejects_non_json_plaintext() {
        let vault = vault();
        let sealed = vault.encrypt(b"not json").expect("encrypt");
        let result: Result<Login, _> = vault.open(&sealed.ciphertext, &sealed.iv);
        assert!(matches!(result, Err(VaultError::MalformedPayload { .. })));
    }

    #[test]
    fn malformed_payload_reason_does_not_echo_values() {
        let vault = vault();
        let sealed = vault
            .encrypt(br#"{"username":"jdoe","password":987654321}"#)
            .expect("encrypt");
        let result: Result<Login, _> = vault.open(&sealed.ciphertext, &sealed.iv);

        let Err(VaultError::MalformedPayload { reason }) = result else {
            panic!("expected a malformed payload error");
        };
        assert!(reason.starts_with("unexpected JSON shape at line 1"));
        assert!(!reason.contains("987654321"));
        assert!(!reason.contains("jdoe"));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let vault = vault();
        let sealed = vault.encrypt(b"credentials").expect("encrypt");

        assert!(!format!("{vault:?}").contains("0123456789abcdef"));
        assert!(!format!("{sealed:?}").contains(&sealed.ciphertext));
    }
}
