//! In-memory key store.
//!
//! The [`KeyStore`] holds every identity added by clients together with the
//! agent's lock state.  It is shared by all sessions as `Arc<KeyStore>`:
//! reads (`list`, `sign`, `signers`, decrypt lookups) take the shared guard,
//! mutations (`add`, `remove`, `remove_all`, `lock`, `unlock`) take the
//! exclusive one.  Every operation is applied under a single guard, so a
//! completed `lock` is observed by all later requests from every session.
//!
//! Identities are stored under the SSH wire encoding of their public key and
//! carry a [`fingerprint`], the same 4-byte SHA-256 tag that age writes into
//! `ssh-ed25519` and `ssh-rsa` recipient stanzas.  The tag is only 32 bits,
//! so several held keys may share one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rsa::BigUint;
use sha2::{Digest as _, Sha256, Sha512};
use signature::{SignatureEncoding as _, Signer as _, Verifier as _};
use ssh_encoding::Encode as _;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::public::{KeyData, RsaPublicKey};
use ssh_key::{Algorithm, HashAlg, Mpint, PrivateKey, Signature};
use subtle::ConstantTimeEq as _;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// `SSH_AGENT_RSA_SHA2_256` sign request flag.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
/// `SSH_AGENT_RSA_SHA2_512` sign request flag.
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

const SELF_TEST_MESSAGE: &[u8] = b"janus-agent key self-test";

fn wire_encoding(public_key: &KeyData) -> Result<Vec<u8>> {
    let mut wire = Vec::new();
    public_key
        .encode(&mut wire)
        .map_err(|e| Error::InvalidKey(format!("cannot encode public key: {e}")))?;
    Ok(wire)
}

fn tag_of(wire: &[u8]) -> String {
    let digest = Sha256::digest(wire);
    STANDARD_NO_PAD.encode(&digest[..4])
}

/// Compute the lookup tag for a public key.
///
/// First four bytes of SHA-256 over the SSH wire encoding of the key,
/// unpadded standard base64.
pub fn fingerprint(public_key: &KeyData) -> Result<String> {
    Ok(tag_of(&wire_encoding(public_key)?))
}

/// A held identity.
struct KeyEntry {
    fingerprint: String,
    public_key: KeyData,
    /// Zeroized on drop by `ssh_key`.
    private_key: PrivateKey,
    comment: String,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("fingerprint", &self.fingerprint)
            .field("algorithm", &self.public_key.algorithm())
            .field("comment", &self.comment)
            .finish_non_exhaustive()
    }
}

impl KeyEntry {
    /// Validate `keypair` and derive its public half and fingerprint.
    fn build(keypair: KeypairData, comment: String) -> Result<Self> {
        let private_key = PrivateKey::new(keypair, comment.clone())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let public_key = private_key.public_key().key_data().clone();
        let entry = Self {
            fingerprint: fingerprint(&public_key)?,
            public_key,
            private_key,
            comment,
        };

        let signature = entry
            .sign(SELF_TEST_MESSAGE, SSH_AGENT_RSA_SHA2_256)
            .map_err(|e| Error::InvalidKey(format!("cannot sign: {e}")))?;
        verify(&entry.public_key, SELF_TEST_MESSAGE, &signature)
            .map_err(|_| Error::InvalidKey("private key does not match public key".into()))?;

        Ok(entry)
    }

    fn sign(&self, data: &[u8], flags: u32) -> Result<Signature> {
        match self.private_key.key_data() {
            KeypairData::Rsa(rsa) => sign_rsa(rsa, data, rsa_hash(flags)),
            _ => self
                .private_key
                .try_sign(data)
                .map_err(|e| Error::Internal(format!("signing failed: {e}"))),
        }
    }
}

/// RSA hash selected by the sign request flags.
///
/// Without a flag this is SHA-512, as for ssh-key's own RSA signer: a
/// SHA-1 `ssh-rsa` signature cannot be expressed as a [`Signature`].
fn rsa_hash(flags: u32) -> HashAlg {
    if flags & SSH_AGENT_RSA_SHA2_256 != 0 && flags & SSH_AGENT_RSA_SHA2_512 == 0 {
        HashAlg::Sha256
    } else {
        HashAlg::Sha512
    }
}

fn biguint(value: &Mpint, what: &str) -> Result<BigUint> {
    value
        .as_positive_bytes()
        .map(BigUint::from_bytes_be)
        .ok_or_else(|| Error::InvalidKey(format!("RSA {what} is not a positive integer")))
}

fn rsa_private_key(keypair: &RsaKeypair) -> Result<rsa::RsaPrivateKey> {
    rsa::RsaPrivateKey::from_components(
        biguint(&keypair.public.n, "modulus")?,
        biguint(&keypair.public.e, "exponent")?,
        biguint(&keypair.private.d, "private exponent")?,
        vec![
            biguint(&keypair.private.p, "prime p")?,
            biguint(&keypair.private.q, "prime q")?,
        ],
    )
    .map_err(|e| Error::InvalidKey(format!("RSA key rejected: {e}")))
}

fn rsa_public_key(public: &RsaPublicKey) -> Result<rsa::RsaPublicKey> {
    rsa::RsaPublicKey::new(biguint(&public.n, "modulus")?, biguint(&public.e, "exponent")?)
        .map_err(|e| Error::InvalidKey(format!("RSA public key rejected: {e}")))
}

/// PKCS#1 v1.5 signature with the given hash.
fn sign_rsa(keypair: &RsaKeypair, data: &[u8], hash: HashAlg) -> Result<Signature> {
    let private_key = rsa_private_key(keypair)?;
    let bytes = match hash {
        HashAlg::Sha256 => rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key)
            .try_sign(data)
            .map(|sig| sig.to_vec()),
        HashAlg::Sha512 => rsa::pkcs1v15::SigningKey::<Sha512>::new(private_key)
            .try_sign(data)
            .map(|sig| sig.to_vec()),
        other => return Err(Error::Internal(format!("no RSA signer for {other}"))),
    }
    .map_err(|e| Error::Internal(format!("signing failed: {e}")))?;

    Signature::new(Algorithm::Rsa { hash: Some(hash) }, bytes)
        .map_err(|e| Error::Internal(format!("signature encoding failed: {e}")))
}

/// Check `signature` over `data` against `public_key`.
pub(crate) fn verify(public_key: &KeyData, data: &[u8], signature: &Signature) -> Result<()> {
    let KeyData::Rsa(public) = public_key else {
        return public_key
            .verify(data, signature)
            .map_err(|e| Error::AuthenticationFailed(e.to_string()));
    };

    let key = rsa_public_key(public)?;
    let sig = rsa::pkcs1v15::Signature::try_from(signature.as_bytes())
        .map_err(|e| Error::AuthenticationFailed(e.to_string()))?;
    let result = match signature.algorithm() {
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha256),
        } => rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key).verify(data, &sig),
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha512),
        } => rsa::pkcs1v15::VerifyingKey::<Sha512>::new(key).verify(data, &sig),
        other => {
            return Err(Error::AuthenticationFailed(format!(
                "{other} signature for an RSA key"
            )));
        }
    };
    result.map_err(|e| Error::AuthenticationFailed(e.to_string()))
}

/// Public view of a held identity; never carries private material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityView {
    pub fingerprint: String,
    pub public_key: KeyData,
    pub comment: String,
}

enum LockState {
    Unlocked,
    /// Passphrase kept only to validate the next unlock.
    Locked(Zeroizing<Vec<u8>>),
}

impl LockState {
    fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

struct StoreState {
    /// Keyed by the wire encoding of the public key.
    entries: HashMap<Vec<u8>, KeyEntry>,
    lock: LockState,
}

impl StoreState {
    fn find(&self, public_key: &KeyData) -> Option<&KeyEntry> {
        self.entries.get(&wire_encoding(public_key).ok()?)
    }
}

/// Shared, thread-safe key store.
///
/// Create with [`KeyStore::new`] and share via [`Arc::clone`].
pub struct KeyStore {
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("KeyStore");
        if let Ok(state) = self.state.read() {
            s.field("keys", &state.entries.len())
                .field("locked", &state.lock.is_locked());
        }
        s.finish_non_exhaustive()
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(StoreState {
                entries: HashMap::new(),
                lock: LockState::Unlocked,
            }),
        }
    }
}

impl KeyStore {
    /// Create an empty, unlocked key store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| Error::Internal("key store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| Error::Internal("key store lock poisoned".into()))
    }

    fn unlocked_read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        let state = self.read()?;
        if state.lock.is_locked() {
            return Err(Error::Locked);
        }
        Ok(state)
    }

    fn unlocked_write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        let state = self.write()?;
        if state.lock.is_locked() {
            return Err(Error::Locked);
        }
        Ok(state)
    }

    /// Public keys and comments of every held identity.
    ///
    /// Empty while locked.
    pub fn list(&self) -> Result<Vec<(KeyData, String)>> {
        let state = self.read()?;
        if state.lock.is_locked() {
            debug!("keystore: list while locked");
            return Ok(Vec::new());
        }
        Ok(state
            .entries
            .values()
            .map(|entry| (entry.public_key.clone(), entry.comment.clone()))
            .collect())
    }

    /// Sign `data` with the identity holding `public_key`.
    pub fn sign(&self, public_key: &KeyData, data: &[u8], flags: u32) -> Result<Signature> {
        let state = self.unlocked_read()?;
        let entry = state.find(public_key).ok_or(Error::NotFound)?;

        debug!(
            fingerprint = %entry.fingerprint,
            data_len = data.len(),
            flags,
            "keystore: sign"
        );
        entry.sign(data, flags)
    }

    /// Add an identity, replacing a held identity with the same public key.
    ///
    /// Returns the fingerprint of the stored identity.
    pub fn add(&self, keypair: KeypairData, comment: String) -> Result<String> {
        if self.read()?.lock.is_locked() {
            return Err(Error::Locked);
        }
        // Validation signs a test message; keep it outside the write guard.
        let entry = KeyEntry::build(keypair, comment)?;
        let wire = wire_encoding(&entry.public_key)?;

        let mut state = self.unlocked_write()?;
        let fingerprint = entry.fingerprint.clone();
        if state
            .entries
            .values()
            .any(|held| held.fingerprint == fingerprint && held.public_key != entry.public_key)
        {
            warn!(
                fingerprint = %fingerprint,
                "keystore: fingerprint shared with another held key"
            );
        }
        debug!(
            fingerprint = %fingerprint,
            algorithm = %entry.public_key.algorithm(),
            comment = %entry.comment,
            "keystore: adding key"
        );
        if state.entries.insert(wire, entry).is_some() {
            debug!(fingerprint = %fingerprint, "keystore: replaced existing identity");
        }
        Ok(fingerprint)
    }

    /// Remove the identity holding `public_key`.  Absence is not an error.
    pub fn remove(&self, public_key: &KeyData) -> Result<()> {
        let wire = wire_encoding(public_key)?;
        let mut state = self.unlocked_write()?;
        match state.entries.remove(&wire) {
            Some(entry) => debug!(fingerprint = %entry.fingerprint, "keystore: removed key"),
            None => debug!("keystore: remove of absent key"),
        }
        Ok(())
    }

    /// Remove all identities.
    pub fn remove_all(&self) -> Result<()> {
        let mut state = self.unlocked_write()?;
        let removed = state.entries.len();
        state.entries.clear();
        debug!(removed, "keystore: removed all keys");
        Ok(())
    }

    /// Lock the store with `passphrase`.
    pub fn lock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.write()?;
        if state.lock.is_locked() {
            return Err(Error::AlreadyLocked);
        }
        state.lock = LockState::Locked(Zeroizing::new(passphrase.to_vec()));
        debug!("keystore: locked");
        Ok(())
    }

    /// Unlock the store.  The passphrase must match the one given to
    /// [`lock`](Self::lock) exactly.
    pub fn unlock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.write()?;
        let matches = match &state.lock {
            LockState::Locked(stored) => bool::from(stored.as_slice().ct_eq(passphrase)),
            LockState::Unlocked => false,
        };
        if !matches {
            debug!("keystore: unlock rejected");
            return Err(Error::Locked);
        }
        state.lock = LockState::Unlocked;
        debug!("keystore: unlocked");
        Ok(())
    }

    /// Public views of every held identity.  Empty while locked.
    pub fn signers(&self) -> Result<Vec<IdentityView>> {
        let state = self.read()?;
        if state.lock.is_locked() {
            return Ok(Vec::new());
        }
        Ok(state
            .entries
            .values()
            .map(|entry| IdentityView {
                fingerprint: entry.fingerprint.clone(),
                public_key: entry.public_key.clone(),
                comment: entry.comment.clone(),
            })
            .collect())
    }

    /// Run `f` against every private key whose fingerprint is
    /// `fingerprint`.
    ///
    /// Keys are only borrowed for the duration of `f`, under the shared
    /// guard.  Empty when no identity carries that fingerprint.
    pub(crate) fn with_private_keys<R>(
        &self,
        fingerprint: &str,
        mut f: impl FnMut(&PrivateKey) -> R,
    ) -> Result<Vec<R>> {
        let state = self.unlocked_read()?;
        Ok(state
            .entries
            .values()
            .filter(|entry| entry.fingerprint == fingerprint)
            .map(|entry| f(&entry.private_key))
            .collect())
    }

    pub fn is_locked(&self) -> bool {
        self.state
            .read()
            .map(|state| state.lock.is_locked())
            .unwrap_or(true)
    }

    /// Number of held identities, regardless of lock state.
    pub fn len(&self) -> usize {
        self.state.read().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
