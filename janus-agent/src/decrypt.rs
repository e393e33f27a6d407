//! age decrypt extension.
//!
//! A client sends a complete age file through the `decrypt@age-tool.com`
//! extension.  Recipient stanzas addressed to SSH keys carry the key's
//! 4-byte tag as their first argument; the tag is looked up in the
//! [`KeyStore`], every held key carrying it is turned into an age identity,
//! and the file is decrypted with each in turn.  The first stanza that yields plaintext
//! wins.

use std::collections::HashSet;
use std::io::Read as _;
use std::sync::Arc;

use ssh_key::private::KeypairData;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::{debug, warn};

use crate::age_header::Header;
use crate::error::{Error, Result};
use crate::keystore::KeyStore;

pub const EXTENSION_NAME: &str = "decrypt@age-tool.com";

/// Stanza types whose first argument is an SSH key tag.
const SSH_STANZA_TYPES: &[&str] = &["ssh-ed25519", "ssh-rsa"];

/// Private key kinds, as far as decryption is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgeKeyKind {
    Ed25519,
    Rsa,
    Unsupported(Algorithm),
}

impl AgeKeyKind {
    pub fn of(key: &PrivateKey) -> Self {
        match key.key_data() {
            KeypairData::Ed25519(_) => Self::Ed25519,
            KeypairData::Rsa(_) => Self::Rsa,
            _ => Self::Unsupported(key.algorithm()),
        }
    }
}

/// Turn a held private key into an age identity.
fn adapt(key: &PrivateKey) -> Result<age::ssh::Identity> {
    match AgeKeyKind::of(key) {
        AgeKeyKind::Ed25519 | AgeKeyKind::Rsa => identity_from_openssh(key),
        AgeKeyKind::Unsupported(algorithm) => {
            Err(Error::UnsupportedKeyType(algorithm.to_string()))
        }
    }
}

fn identity_from_openssh(key: &PrivateKey) -> Result<age::ssh::Identity> {
    // Zeroized when it goes out of scope.
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::Internal(format!("cannot serialise private key: {e}")))?;
    let identity = age::ssh::Identity::from_buffer(pem.as_bytes(), None)
        .map_err(|e| Error::UnsupportedKeyType(format!("{}: {e}", key.algorithm())))?;

    if matches!(identity, age::ssh::Identity::Unencrypted(_)) {
        Ok(identity)
    } else {
        Err(Error::UnsupportedKeyType(format!(
            "{} key not usable by age",
            key.algorithm()
        )))
    }
}

/// Handle a decrypt extension call.
pub async fn decrypt(store: &KeyStore, extension: &str, blob: Vec<u8>) -> Result<Vec<u8>> {
    if extension != EXTENSION_NAME {
        return Err(Error::UnsupportedExtension(extension.to_string()));
    }
    if store.is_locked() {
        return Err(Error::Locked);
    }

    let header = Header::parse(&blob)?;
    debug!(
        stanzas = header.recipients.len(),
        payload_offset = header.payload_offset(),
        "decrypt: parsed header"
    );

    let held: HashSet<String> = store
        .signers()?
        .into_iter()
        .map(|identity| identity.fingerprint)
        .collect();
    let candidates: Vec<&str> = header
        .recipients
        .iter()
        .filter(|stanza| SSH_STANZA_TYPES.contains(&stanza.tag.as_str()))
        .filter_map(|stanza| stanza.args.first().map(String::as_str))
        .filter(|tag| held.contains(*tag))
        .collect();
    debug!(candidates = ?candidates, "decrypt: stanzas addressed to held keys");

    let blob: Arc<[u8]> = blob.into();
    for tag in candidates {
        // A 32-bit tag may be shared by several held keys.
        for identity in store.with_private_keys(tag, adapt)? {
            let identity = match identity {
                Ok(identity) => identity,
                Err(Error::UnsupportedKeyType(kind)) => {
                    warn!(tag = %tag, kind = %kind, "decrypt: held key cannot decrypt, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match decrypt_with(Arc::clone(&blob), identity).await {
                Ok(plaintext) => {
                    debug!(tag = %tag, len = plaintext.len(), "decrypt: success");
                    return Ok(plaintext);
                }
                Err(Error::NoMatchingRecipient) => {
                    debug!(tag = %tag, "decrypt: identity did not unwrap the file key");
                }
                Err(e) => return Err(e),
            }
        }
    }

    Err(Error::NotFound)
}

/// Run the age decryption on the blocking pool.
async fn decrypt_with(blob: Arc<[u8]>, identity: age::ssh::Identity) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || decrypt_blocking(&blob, &identity))
        .await
        .map_err(|e| Error::Internal(format!("decrypt task failed: {e}")))?
}

fn decrypt_blocking(blob: &[u8], identity: &age::ssh::Identity) -> Result<Vec<u8>> {
    let decryptor = age::Decryptor::new(blob).map_err(decrypt_error)?;
    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(decrypt_error)?;

    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| Error::AuthenticationFailed(format!("payload: {e}")))?;
    Ok(plaintext)
}

fn decrypt_error(err: age::DecryptError) -> Error {
    use age::DecryptError as E;
    match err {
        E::NoMatchingKeys => Error::NoMatchingRecipient,
        E::InvalidMac | E::DecryptionFailed | E::KeyDecryptionFailed => {
            Error::AuthenticationFailed(err.to_string())
        }
        E::InvalidHeader | E::UnknownFormat => Error::MalformedHeader(err.to_string()),
        other => Error::Internal(other.to_string()),
    }
}
