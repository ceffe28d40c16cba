// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Encryption
//!
//! Symmetric encryption of message payloads. The publisher replaces the payload with
//! ciphertext, forces the octet-stream content type and records the profile name, the
//! algorithm, the hex encoded IV and the original content type under the reserved header
//! namespace. The consumer reverses this using the profile of the same name.

use crate::{
    errors::AmqpError,
    message::{
        as_string, long_string, namespace_field, set_namespace_field, Message,
        BINARY_CONTENT_TYPE, HEADER_ENCRYPTION,
    },
};
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use rand::RngCore;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, error};

/// The only algorithm currently supported
pub const AES_256_CBC: &str = "aes-256-cbc";

const FIELD_NAME: &str = "name";
const FIELD_ALGORITHM: &str = "algorithm";
const FIELD_IV: &str = "iv";
const FIELD_ORIGINAL_CONTENT_TYPE: &str = "originalContentType";

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// A named encryption profile. `key` is hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EncryptionSpec {
    pub name: String,
    pub algorithm: String,
    pub key: String,
    pub iv_length: usize,
}

impl EncryptionSpec {
    pub fn new(name: &str, key: &str) -> EncryptionSpec {
        EncryptionSpec {
            name: name.to_owned(),
            algorithm: AES_256_CBC.to_owned(),
            key: key.to_owned(),
            iv_length: 16,
        }
    }

    fn key_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        if self.algorithm != AES_256_CBC {
            return Err(AmqpError::EncryptionError(format!(
                "Unsupported algorithm: {}",
                self.algorithm
            )));
        }

        hex::decode(&self.key)
            .map_err(|_| AmqpError::EncryptionError("Invalid key".to_owned()))
    }
}

/// Encrypts `plaintext` with a fresh random IV, returning the ciphertext and the hex IV.
pub fn encrypt(spec: &EncryptionSpec, plaintext: &[u8]) -> Result<(Vec<u8>, String), AmqpError> {
    let key = spec.key_bytes()?;

    let mut iv = vec![0u8; spec.iv_length];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv).map_err(|_| {
        if key.len() != 32 {
            AmqpError::EncryptionError("Invalid key length".to_owned())
        } else {
            AmqpError::EncryptionError("Invalid initialization vector length".to_owned())
        }
    })?;

    Ok((
        cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        hex::encode(iv),
    ))
}

/// Decrypts `ciphertext` produced by [`encrypt`].
pub fn decrypt(spec: &EncryptionSpec, iv: &str, ciphertext: &[u8]) -> Result<Vec<u8>, AmqpError> {
    let key = spec.key_bytes()?;
    let iv = hex::decode(iv).map_err(|_| AmqpError::DecryptionError(spec.name.clone()))?;

    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|_| AmqpError::DecryptionError(spec.name.clone()))?;

    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| AmqpError::DecryptionError(spec.name.clone()))
}

/// Encrypts an outgoing payload in place of the plaintext and records the metadata
/// needed to reverse it. Returns the ciphertext and the content type to publish with.
pub(crate) fn encrypt_payload(
    spec: &EncryptionSpec,
    plaintext: &[u8],
    content_type: &str,
    headers: &mut FieldTable,
) -> Result<(Vec<u8>, &'static str), AmqpError> {
    let (ciphertext, iv) = encrypt(spec, plaintext).inspect_err(|err| {
        error!(error = err.to_string(), profile = %spec.name, "failure to encrypt payload");
    })?;

    let mut table = FieldTable::default();
    table.insert(ShortString::from(FIELD_NAME), long_string(&spec.name));
    table.insert(ShortString::from(FIELD_ALGORITHM), long_string(&spec.algorithm));
    table.insert(ShortString::from(FIELD_IV), long_string(&iv));
    table.insert(
        ShortString::from(FIELD_ORIGINAL_CONTENT_TYPE),
        long_string(content_type),
    );
    set_namespace_field(headers, HEADER_ENCRYPTION, AMQPValue::FieldTable(table));

    Ok((ciphertext, BINARY_CONTENT_TYPE))
}

/// Decrypted payload and the content type it had before encryption.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Decrypted {
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
}

/// Decrypts a received message if its headers say it is encrypted.
///
/// Returns `Ok(None)` for plaintext messages.
pub(crate) fn decrypt_message(
    message: &Message,
    profiles: &HashMap<String, EncryptionSpec>,
) -> Result<Option<Decrypted>, AmqpError> {
    let Some(table) = message
        .namespace_field(HEADER_ENCRYPTION)
        .and_then(|value| value.as_field_table())
    else {
        return Ok(None);
    };

    let field = |key: &str| table.inner().get(key).and_then(as_string);

    let name = field(FIELD_NAME).unwrap_or_default();
    let Some(spec) = profiles.get(&name) else {
        error!(profile = %name, "unknown encryption profile");
        return Err(AmqpError::DecryptionError(name));
    };

    let iv = field(FIELD_IV).ok_or_else(|| AmqpError::DecryptionError(name.clone()))?;

    debug!(profile = %name, "decrypting message: {}", message.id);
    let payload = decrypt(spec, &iv, &message.payload)?;

    Ok(Some(Decrypted {
        payload,
        content_type: field(FIELD_ORIGINAL_CONTENT_TYPE),
    }))
}

/// Reads the encryption metadata of an outgoing or received header table.
pub(crate) fn encryption_field(headers: &FieldTable, key: &str) -> Option<String> {
    namespace_field(headers, HEADER_ENCRYPTION)
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(key))
        .and_then(as_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "f81db52a3b2c717fe65d9a3b7dd04d2a08793e1a28e3083db3ea08db56e7c315";

    fn spec() -> EncryptionSpec {
        EncryptionSpec::new("well-known", KEY)
    }

    #[test]
    fn round_trips_plaintext() {
        let (ciphertext, iv) = encrypt(&spec(), b"test message").unwrap();
        assert_ne!(ciphertext, b"test message");
        assert_eq!(decrypt(&spec(), &iv, &ciphertext).unwrap(), b"test message");
    }

    #[test]
    fn iv_hex_is_twice_the_iv_length() {
        let (_, iv) = encrypt(&spec(), b"x").unwrap();
        assert_eq!(iv.len(), 32);
    }

    #[test]
    fn rejects_short_keys() {
        let spec = EncryptionSpec::new("well-known", "aa");
        assert_eq!(
            encrypt(&spec, b"test message"),
            Err(AmqpError::EncryptionError("Invalid key length".to_owned()))
        );
    }

    #[test]
    fn rejects_unknown_algorithms() {
        let spec = EncryptionSpec {
            algorithm: "rot13".to_owned(),
            ..spec()
        };
        assert!(matches!(
            encrypt(&spec, b"test message"),
            Err(AmqpError::EncryptionError(_))
        ));
    }

    #[test]
    fn records_metadata_in_headers() {
        let mut headers = FieldTable::default();
        let (_, content_type) =
            encrypt_payload(&spec(), b"test message", "text/plain", &mut headers).unwrap();

        assert_eq!(content_type, BINARY_CONTENT_TYPE);
        assert_eq!(
            encryption_field(&headers, FIELD_NAME),
            Some("well-known".to_owned())
        );
        assert_eq!(
            encryption_field(&headers, FIELD_ORIGINAL_CONTENT_TYPE),
            Some("text/plain".to_owned())
        );
        assert_eq!(encryption_field(&headers, FIELD_IV).map(|iv| iv.len()), Some(32));
    }

    #[test]
    fn decrypts_received_messages() {
        let mut headers = FieldTable::default();
        let (payload, content_type) =
            encrypt_payload(&spec(), b"test message", "text/plain", &mut headers).unwrap();

        let message = Message {
            content_type: Some(content_type.to_owned()),
            headers,
            payload,
            ..Message::default()
        };
        let profiles = HashMap::from([("well-known".to_owned(), spec())]);

        let decrypted = decrypt_message(&message, &profiles).unwrap().unwrap();
        assert_eq!(decrypted.payload, b"test message");
        assert_eq!(decrypted.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn plaintext_messages_pass_through() {
        let message = Message {
            payload: b"plain".to_vec(),
            ..Message::default()
        };
        assert_eq!(decrypt_message(&message, &HashMap::new()), Ok(None));
    }

    #[test]
    fn unknown_profile_is_a_decryption_error() {
        let mut headers = FieldTable::default();
        let (payload, _) =
            encrypt_payload(&spec(), b"test message", "text/plain", &mut headers).unwrap();
        let message = Message {
            headers,
            payload,
            ..Message::default()
        };

        assert_eq!(
            decrypt_message(&message, &HashMap::new()),
            Err(AmqpError::DecryptionError("well-known".to_owned()))
        );
    }
}
