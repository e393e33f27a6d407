//! Minimal agent client.
//!
//! Used by `janusd decrypt` and by the tests.  Speaks the same framing as
//! [`AgentSession::serve`](crate::session::AgentSession::serve).

use std::io;
use std::path::Path;

use ssh_agent_lib::proto::{
    AddIdentity, Credential, Extension, Identity, RemoveIdentity, Request, Response, SignRequest,
};
use ssh_key::Signature;
use ssh_key::private::KeypairData;
use ssh_key::public::KeyData;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

use crate::decrypt::EXTENSION_NAME;
use crate::error::{Error, Result};
use crate::frame;

/// Client end of an agent connection.
#[derive(Debug)]
pub struct AgentClient<S = UnixStream> {
    stream: S,
}

impl AgentClient<UnixStream> {
    /// Connect to the agent listening at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self::new(stream))
    }
}

impl<S> AgentClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        frame::write_frame(&mut self.stream, &frame::encode(request)?).await?;
        let body = frame::read_frame(&mut self.stream).await?.ok_or_else(|| {
            Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "agent closed the connection",
            ))
        })?;
        frame::decode(&body)
    }

    async fn call_for_success(&mut self, request: &Request, op: &str) -> Result<()> {
        match self.call(request).await? {
            Response::Success => Ok(()),
            Response::Failure => Err(Error::AgentFailure),
            _ => Err(unexpected(op)),
        }
    }

    pub async fn request_identities(&mut self) -> Result<Vec<Identity>> {
        match self.call(&Request::RequestIdentities).await? {
            Response::IdentitiesAnswer(identities) => Ok(identities),
            Response::Failure => Err(Error::AgentFailure),
            _ => Err(unexpected("request_identities")),
        }
    }

    pub async fn sign(&mut self, public_key: &KeyData, data: &[u8], flags: u32) -> Result<Signature> {
        let request = Request::SignRequest(SignRequest {
            pubkey: public_key.clone(),
            data: data.to_vec(),
            flags,
        });
        match self.call(&request).await? {
            Response::SignResponse(signature) => Ok(signature),
            Response::Failure => Err(Error::AgentFailure),
            _ => Err(unexpected("sign")),
        }
    }

    pub async fn add_identity(&mut self, keypair: KeypairData, comment: String) -> Result<()> {
        let request = Request::AddIdentity(AddIdentity {
            credential: Credential::Key {
                privkey: keypair,
                comment,
            },
        });
        self.call_for_success(&request, "add_identity").await
    }

    pub async fn remove_identity(&mut self, public_key: &KeyData) -> Result<()> {
        let request = Request::RemoveIdentity(RemoveIdentity {
            pubkey: public_key.clone(),
        });
        self.call_for_success(&request, "remove_identity").await
    }

    pub async fn remove_all_identities(&mut self) -> Result<()> {
        self.call_for_success(&Request::RemoveAllIdentities, "remove_all_identities")
            .await
    }

    pub async fn lock(&mut self, passphrase: &str) -> Result<()> {
        self.call_for_success(&Request::Lock(passphrase.to_string()), "lock")
            .await
    }

    pub async fn unlock(&mut self, passphrase: &str) -> Result<()> {
        self.call_for_success(&Request::Unlock(passphrase.to_string()), "unlock")
            .await
    }

    /// Call a named extension.  `Ok(None)` when the agent answered with a
    /// bare success.
    ///
    /// `SSH_AGENT_EXTENSION_FAILURE` is [`Error::NotFound`],
    /// `SSH_AGENT_FAILURE` is [`Error::AgentFailure`].
    pub async fn extension(&mut self, name: &str, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let request = Request::Extension(Extension {
            name: name.to_string(),
            details: payload.into(),
        });
        match self.call(&request).await? {
            Response::ExtensionResponse(reply) => Ok(Some(frame::encode(&reply.details)?)),
            Response::Success => Ok(None),
            Response::ExtensionFailure => Err(Error::NotFound),
            Response::Failure => Err(Error::AgentFailure),
            _ => Err(unexpected("extension")),
        }
    }

    /// Decrypt a complete age file with a key held by the agent.
    pub async fn decrypt(&mut self, blob: Vec<u8>) -> Result<Vec<u8>> {
        self.extension(EXTENSION_NAME, blob)
            .await?
            .ok_or_else(|| Error::Decode("decrypt response carried no plaintext".into()))
    }
}

fn unexpected(op: &str) -> Error {
    Error::Decode(format!("unexpected response to {op}"))
}
