//! SSH agent with an age decrypt extension.
//!
//! Holds private keys added by clients in memory and answers the OpenSSH
//! agent protocol on a Unix socket.  Besides listing, signing and key
//! management, the agent implements the `decrypt@age-tool.com` extension:
//! a client sends a whole age file and gets back the plaintext, decrypted
//! with whichever held key the file was encrypted to.
//!
//! # Architecture
//!
//! ```text
//! janusd ── AgentServer::bind ──► UnixListener ── accept ──► AgentSession (per client)
//!                │                                                │
//!          ShutdownHandle                             KeyStore (Arc, RwLock)
//!                                                                 │
//!                                              decrypt ── age_header ── age
//! ```
//!
//! # Fingerprints
//!
//! Every identity carries the 4-byte SHA-256 tag age writes into its
//! `ssh-ed25519` and `ssh-rsa` recipient stanzas, so a stanza names the keys
//! that can open it.

pub mod age_header;
pub mod client;
pub mod decrypt;
pub mod error;
pub mod frame;
pub mod keystore;
pub mod server;
pub mod session;

pub use client::AgentClient;
pub use decrypt::EXTENSION_NAME;
pub use error::{Error, Result};
pub use keystore::{IdentityView, KeyStore, fingerprint};
pub use server::{AgentServer, ServerConfig, ShutdownHandle};
pub use session::AgentSession;
