//! Per-connection agent session.
//!
//! An [`AgentSession`] answers one client's requests strictly in order: read
//! a frame, decode it, route it to the [`KeyStore`] or the decrypt extension,
//! write the response.  All sessions share one store.

use std::sync::Arc;

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Credential, Extension, Identity, RemoveIdentity,
    Request, Response, SignRequest,
};
use ssh_key::Signature;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::decrypt;
use crate::error::{Error, Result};
use crate::frame::{self, Incoming};
use crate::keystore::KeyStore;

/// Agent side of one client connection.
#[derive(Clone, Debug)]
pub struct AgentSession {
    store: Arc<KeyStore>,
}

impl AgentSession {
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    /// Answer one decoded request.
    ///
    /// Failures never escape: they become `SSH_AGENT_FAILURE` or, for
    /// extension calls nothing here can serve, `SSH_AGENT_EXTENSION_FAILURE`.
    pub async fn dispatch(&mut self, request: Request) -> Response {
        let result = match request {
            Request::RequestIdentities => self
                .request_identities()
                .await
                .map(Response::IdentitiesAnswer),
            Request::SignRequest(request) => self.sign(request).await.map(Response::SignResponse),
            Request::AddIdentity(identity) => self
                .add_identity(identity)
                .await
                .map(|()| Response::Success),
            Request::AddIdConstrained(identity) => self
                .add_identity_constrained(identity)
                .await
                .map(|()| Response::Success),
            Request::RemoveIdentity(identity) => self
                .remove_identity(identity)
                .await
                .map(|()| Response::Success),
            Request::RemoveAllIdentities => self
                .remove_all_identities()
                .await
                .map(|()| Response::Success),
            Request::Lock(passphrase) => self.lock(passphrase).await.map(|()| Response::Success),
            Request::Unlock(passphrase) => {
                self.unlock(passphrase).await.map(|()| Response::Success)
            }
            Request::Extension(extension) => {
                self.extension(extension).await.map(|reply| match reply {
                    Some(reply) => Response::ExtensionResponse(reply),
                    None => Response::Success,
                })
            }
            // Smartcard requests; their payloads may carry PINs, so only
            // the fact is logged.
            _ => {
                debug!("session: unsupported request");
                Err(AgentError::Failure)
            }
        };

        match result {
            Ok(response) => response,
            Err(AgentError::ExtensionFailure) => Response::ExtensionFailure,
            Err(_) => Response::Failure,
        }
    }

    /// Serve requests from `stream` until the peer closes it.
    ///
    /// Returns `Ok(())` on a clean close between messages.  Framing, decode
    /// and transport errors end the session with `Err`.
    pub async fn serve<S>(mut self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let Some(body) = frame::read_frame(&mut stream).await? else {
                return Ok(());
            };
            let body = Zeroizing::new(body);

            let response = match frame::decode_request(&body) {
                Ok(Incoming::Request(request)) => self.dispatch(request).await,
                Ok(Incoming::Lock(passphrase)) => {
                    success_or_failure(self.lock_bytes(&passphrase))
                }
                Ok(Incoming::Unlock(passphrase)) => {
                    success_or_failure(self.unlock_bytes(&passphrase))
                }
                Err(Error::UnsupportedRequest(kind)) => {
                    debug!(kind, "session: unknown request type");
                    Response::Failure
                }
                Err(e) => return Err(e),
            };

            frame::write_frame(&mut stream, &frame::encode(&response)?).await?;
        }
    }

    fn lock_bytes(&self, passphrase: &[u8]) -> Result<()> {
        self.store.lock(passphrase).map_err(|e| reject("lock", e))
    }

    fn unlock_bytes(&self, passphrase: &[u8]) -> Result<()> {
        self.store.unlock(passphrase).map_err(|e| reject("unlock", e))
    }
}

fn success_or_failure(result: Result<()>) -> Response {
    match result {
        Ok(()) => Response::Success,
        Err(_) => Response::Failure,
    }
}

/// Log a refused request.  Expected refusals stay at debug.
fn reject(op: &'static str, err: Error) -> Error {
    match err {
        Error::Locked | Error::NotFound | Error::AlreadyLocked => {
            debug!(op, kind = err.kind(), "session: request refused");
        }
        _ => warn!(op, kind = err.kind(), error = %err, "session: request failed"),
    }
    err
}

#[ssh_agent_lib::async_trait]
impl Session for AgentSession {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let identities: Vec<Identity> = self
            .store
            .list()
            .map_err(|e| reject("request_identities", e))?
            .into_iter()
            .map(|(pubkey, comment)| Identity { pubkey, comment })
            .collect();

        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        self.store
            .sign(&request.pubkey, &request.data, request.flags)
            .map_err(|e| reject("sign", e).into())
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        let Credential::Key { privkey, comment } = identity.credential else {
            return Err(reject(
                "add_identity",
                Error::InvalidKey("certificates are not supported".into()),
            )
            .into());
        };

        let fingerprint = self
            .store
            .add(privkey, comment)
            .map_err(|e| reject("add_identity", e))?;
        debug!(fingerprint = %fingerprint, "add_identity");
        Ok(())
    }

    async fn add_identity_constrained(
        &mut self,
        identity: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        if !identity.constraints.is_empty() {
            return Err(reject(
                "add_identity_constrained",
                Error::UnsupportedRequest(frame::SSH_AGENTC_ADD_ID_CONSTRAINED),
            )
            .into());
        }
        self.add_identity(identity.identity).await
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        self.store
            .remove(&identity.pubkey)
            .map_err(|e| reject("remove_identity", e).into())
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        self.store
            .remove_all()
            .map_err(|e| reject("remove_all_identities", e).into())
    }

    async fn lock(&mut self, passphrase: String) -> Result<(), AgentError> {
        let passphrase = Zeroizing::new(passphrase);
        Ok(self.lock_bytes(passphrase.as_bytes())?)
    }

    async fn unlock(&mut self, passphrase: String) -> Result<(), AgentError> {
        let passphrase = Zeroizing::new(passphrase);
        Ok(self.unlock_bytes(passphrase.as_bytes())?)
    }

    async fn extension(&mut self, extension: Extension) -> Result<Option<Extension>, AgentError> {
        let payload = frame::encode(&extension.details)?;
        debug!(
            extension = %extension.name,
            payload_len = payload.len(),
            "extension"
        );

        match decrypt::decrypt(&self.store, &extension.name, payload).await {
            Ok(plaintext) => Ok(Some(Extension {
                name: extension.name,
                details: plaintext.into(),
            })),
            Err(e) => Err(reject("extension", e).into_extension_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use signature::Verifier as _;
    use ssh_agent_lib::proto::KeyConstraint;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::client::AgentClient;
    use crate::decrypt::EXTENSION_NAME;
    use crate::decrypt::tests::encrypt_to;
    use crate::keystore::tests::{ed25519, rsa};

    fn connect(store: &Arc<KeyStore>) -> AgentClient<DuplexStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(AgentSession::new(Arc::clone(store)).serve(server));
        AgentClient::new(client)
    }

    #[tokio::test]
    async fn full_protocol_over_one_session() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        let (kp, public) = ed25519(1);

        client.add_identity(kp, "work".into()).await.expect("add");
        let ids = client.request_identities().await.expect("list");
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].pubkey, public);
        assert_eq!(ids[0].comment, "work");

        let sig = client.sign(&public, b"hello", 0).await.expect("sign");
        public.verify(b"hello", &sig).expect("verify");

        client.remove_identity(&public).await.expect("remove");
        assert!(client.request_identities().await.expect("list").is_empty());
        client.remove_all_identities().await.expect("remove all");
    }

    #[tokio::test]
    async fn failed_requests_get_failure_responses() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        let (_, public) = ed25519(9);

        assert!(matches!(
            client.sign(&public, b"data", 0).await,
            Err(Error::AgentFailure)
        ));
        client.lock("secret").await.expect("lock");
        assert!(matches!(client.lock("again").await, Err(Error::AgentFailure)));
        assert!(matches!(client.unlock("wrong").await, Err(Error::AgentFailure)));
        client.unlock("secret").await.expect("unlock");

        // The session keeps serving after every failure.
        assert!(client.request_identities().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn unknown_request_type_gets_failure_and_session_continues() {
        let store = KeyStore::new();
        let (mut raw, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(AgentSession::new(Arc::clone(&store)).serve(server));

        frame::write_frame(&mut raw, &[99, 1, 2, 3]).await.expect("write");
        let reply = frame::read_frame(&mut raw).await.expect("read");
        assert_eq!(reply, Some(vec![frame::SSH_AGENT_FAILURE]));

        let mut client = AgentClient::new(raw);
        assert!(client.request_identities().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn smartcard_requests_are_refused() {
        let store = KeyStore::new();
        let (mut raw, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(AgentSession::new(Arc::clone(&store)).serve(server));

        // SSH_AGENTC_ADD_SMARTCARD_KEY and SSH_AGENTC_REMOVE_SMARTCARD_KEY
        for kind in [20u8, 21] {
            frame::write_frame(&mut raw, &[kind, 0, 0, 0, 0]).await.expect("write");
            let reply = frame::read_frame(&mut raw).await.expect("read");
            assert_eq!(reply, Some(vec![frame::SSH_AGENT_FAILURE]));
        }
    }

    #[tokio::test]
    async fn constrained_add_only_without_constraints() {
        let store = KeyStore::new();
        let mut client = connect(&store);

        let (kp, _) = ed25519(1);
        let constrained = Request::AddIdConstrained(AddIdentityConstrained {
            identity: AddIdentity {
                credential: Credential::Key {
                    privkey: kp,
                    comment: "timed".into(),
                },
            },
            constraints: vec![KeyConstraint::Lifetime(60)],
        });
        assert!(matches!(client.call(&constrained).await, Ok(Response::Failure)));
        assert!(store.is_empty());

        let (kp, _) = ed25519(2);
        let plain = Request::AddIdConstrained(AddIdentityConstrained {
            identity: AddIdentity {
                credential: Credential::Key {
                    privkey: kp,
                    comment: "plain".into(),
                },
            },
            constraints: Vec::new(),
        });
        assert!(matches!(client.call(&plain).await, Ok(Response::Success)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn decrypt_through_extension() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        let (kp, public) = ed25519(3);
        client.add_identity(kp, "age".into()).await.expect("add");

        let blob = encrypt_to(&public, b"attack at dawn");
        let plaintext = client.decrypt(blob).await.expect("decrypt");
        assert_eq!(plaintext, b"attack at dawn");
    }

    #[tokio::test]
    async fn unknown_extension_is_extension_failure() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        assert!(matches!(
            client.extension("session-bind@openssh.com", b"x".to_vec()).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn decrypt_for_absent_key_is_extension_failure() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        let (_, public) = ed25519(4);
        let blob = encrypt_to(&public, b"nobody home");
        assert!(matches!(client.decrypt(blob).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn decrypt_while_locked_is_plain_failure() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        let (kp, public) = ed25519(5);
        client.add_identity(kp, "age".into()).await.expect("add");
        client.lock("secret").await.expect("lock");

        let blob = encrypt_to(&public, b"later");
        assert!(matches!(client.decrypt(blob.clone()).await, Err(Error::AgentFailure)));

        client.unlock("secret").await.expect("unlock");
        assert_eq!(client.decrypt(blob).await.expect("decrypt"), b"later");
    }

    #[tokio::test]
    async fn malformed_decrypt_payload_is_plain_failure() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        assert!(matches!(
            client.extension(EXTENSION_NAME, b"not an age file\n".to_vec()).await,
            Err(Error::AgentFailure)
        ));
    }

    #[tokio::test]
    async fn non_utf8_passphrase_locks_and_unlocks() {
        let store = KeyStore::new();
        let (mut raw, server) = tokio::io::duplex(1024);
        tokio::spawn(AgentSession::new(Arc::clone(&store)).serve(server));

        // SSH_AGENT_SUCCESS
        let success = Some(vec![6]);
        frame::write_frame(&mut raw, &[frame::SSH_AGENTC_LOCK, 0, 0, 0, 2, 0xff, 0xfe])
            .await
            .expect("write");
        assert_eq!(frame::read_frame(&mut raw).await.expect("read"), success);
        assert!(store.is_locked());

        frame::write_frame(&mut raw, &[frame::SSH_AGENTC_UNLOCK, 0, 0, 0, 1, 0xff])
            .await
            .expect("write");
        assert_eq!(
            frame::read_frame(&mut raw).await.expect("read"),
            Some(vec![frame::SSH_AGENT_FAILURE])
        );
        assert!(store.is_locked());

        frame::write_frame(&mut raw, &[frame::SSH_AGENTC_UNLOCK, 0, 0, 0, 2, 0xff, 0xfe])
            .await
            .expect("write");
        assert_eq!(frame::read_frame(&mut raw).await.expect("read"), success);
        assert!(!store.is_locked());
    }

    #[tokio::test]
    async fn large_file_decrypts_through_extension() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        let (kp, public) = ed25519(7);
        client.add_identity(kp, "age".into()).await.expect("add");

        let plaintext: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
        let blob = encrypt_to(&public, &plaintext);
        assert!(blob.len() > 256 * 1024);
        assert_eq!(client.decrypt(blob).await.expect("decrypt"), plaintext);
    }

    #[tokio::test]
    async fn rsa_identity_over_session() {
        let store = KeyStore::new();
        let mut client = connect(&store);
        let (kp, public) = rsa();
        client.add_identity(kp, "rsa".into()).await.expect("add rsa");

        let sig = client
            .sign(&public, b"hello", crate::keystore::SSH_AGENT_RSA_SHA2_512)
            .await
            .expect("sign");
        crate::keystore::verify(&public, b"hello", &sig).expect("verify");

        let blob = encrypt_to(&public, b"via rsa");
        assert_eq!(client.decrypt(blob).await.expect("decrypt"), b"via rsa");
    }

    #[tokio::test]
    async fn oversized_frame_ends_session() {
        let store = KeyStore::new();
        let (mut raw, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(AgentSession::new(store).serve(server));

        let len = (frame::MAX_MESSAGE_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut raw, &len)
            .await
            .expect("write");

        let result = session.await.expect("join");
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn clean_close_ends_session_ok() {
        let store = KeyStore::new();
        let (raw, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(AgentSession::new(store).serve(server));
        drop(raw);
        assert!(session.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn concurrent_signs_across_sessions_verify() {
        let store = KeyStore::new();
        let (kp, public) = ed25519(6);
        store.add(kp, "shared".into()).expect("add");

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let mut client = connect(&store);
            let public = public.clone();
            tasks.push(tokio::spawn(async move {
                let data = vec![i; 32];
                let sig = client.sign(&public, &data, 0).await.expect("sign");
                public.verify(&data, &sig).expect("verify");
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }
    }
}
