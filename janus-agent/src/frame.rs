//! Length-prefixed message framing for the agent socket.
//!
//! Every message is a big-endian `u32` length followed by that many bytes;
//! the first body byte is the message type.  Bodies are encoded and decoded
//! by `ssh-agent-lib`, except lock and unlock: their passphrase is an SSH
//! string of arbitrary bytes, which the library would insist on reading as
//! UTF-8.

use std::fmt::Display;

use ssh_agent_lib::proto::Request;
use ssh_encoding::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Largest accepted message body.  Decrypt requests carry a whole age
/// file, so this follows the Go agent's 16 MiB rather than OpenSSH's 256 KiB.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENTC_LOCK: u8 = 22;
pub const SSH_AGENTC_UNLOCK: u8 = 23;
pub const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;

/// Request message types this agent decodes.
const REQUEST_TYPES: &[u8] = &[
    11, // SSH_AGENTC_REQUEST_IDENTITIES
    13, // SSH_AGENTC_SIGN_REQUEST
    17, // SSH_AGENTC_ADD_IDENTITY
    18, // SSH_AGENTC_REMOVE_IDENTITY
    19, // SSH_AGENTC_REMOVE_ALL_IDENTITIES
    SSH_AGENTC_LOCK,
    SSH_AGENTC_UNLOCK,
    SSH_AGENTC_ADD_ID_CONSTRAINED,
    27, // SSH_AGENTC_EXTENSION
];

/// Read one message body.  `Ok(None)` on a clean end of stream between
/// messages.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Decode("connection closed inside a length prefix".into()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Decode(format!(
            "message of {len} bytes exceeds the {MAX_MESSAGE_LEN} byte limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Decode("connection closed inside a message".into())
        } else {
            Error::Transport(e)
        }
    })?;
    Ok(Some(body))
}

/// Write one message body with its length prefix.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| Error::Internal("message too large to frame".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub fn encode(message: &impl Encode) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    message
        .encode(&mut body)
        .map_err(|e| Error::Internal(format!("cannot encode message: {e}")))?;
    Ok(body)
}

pub fn decode<T>(body: &[u8]) -> Result<T>
where
    T: Decode,
    T::Error: Display,
{
    let mut reader = body;
    T::decode(&mut reader).map_err(|e| Error::Decode(e.to_string()))
}

/// A decoded client message.
#[derive(Debug)]
pub enum Incoming {
    Request(Request),
    Lock(Zeroizing<Vec<u8>>),
    Unlock(Zeroizing<Vec<u8>>),
}

/// Decode a client request, rejecting unknown message types before the
/// codec sees them.
pub fn decode_request(body: &[u8]) -> Result<Incoming> {
    let Some(&kind) = body.first() else {
        return Err(Error::Decode("empty message".into()));
    };
    match kind {
        SSH_AGENTC_LOCK => Ok(Incoming::Lock(passphrase(&body[1..])?)),
        SSH_AGENTC_UNLOCK => Ok(Incoming::Unlock(passphrase(&body[1..])?)),
        _ if REQUEST_TYPES.contains(&kind) => decode(body).map(Incoming::Request),
        _ => Err(Error::UnsupportedRequest(kind)),
    }
}

fn passphrase(mut reader: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let passphrase = Zeroizing::new(
        Vec::<u8>::decode(&mut reader).map_err(|e| Error::Decode(e.to_string()))?,
    );
    if !reader.is_empty() {
        return Err(Error::Decode("trailing bytes after passphrase".into()));
    }
    Ok(passphrase)
}
