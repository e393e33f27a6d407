//! End-to-end tests over a real Unix socket.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use janus_agent::{AgentClient, AgentServer, Error, KeyStore, ServerConfig, fingerprint};
use signature::Verifier as _;
use ssh_key::private::{Ed25519Keypair, KeypairData};
use ssh_key::public::KeyData;

fn ed25519(seed: u8) -> (KeypairData, KeyData) {
    let keypair = Ed25519Keypair::from_seed(&[seed; 32]);
    let public = KeyData::Ed25519(keypair.public);
    (KeypairData::Ed25519(keypair), public)
}

fn encrypt_to(public: &KeyData, plaintext: &[u8]) -> Vec<u8> {
    let line = ssh_key::PublicKey::new(public.clone(), "")
        .to_openssh()
        .expect("openssh public key");
    let recipient: age::ssh::Recipient = match line.parse() {
        Ok(r) => r,
        Err(_) => panic!("age rejected recipient {line}"),
    };
    let encryptor =
        age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient))
            .expect("encryptor");
    let mut out = Vec::new();
    let mut writer = encryptor.wrap_output(&mut out).expect("wrap output");
    writer.write_all(plaintext).expect("write plaintext");
    writer.finish().expect("finish");
    out
}

struct Running {
    _dir: tempfile::TempDir,
    path: PathBuf,
    shutdown: janus_agent::ShutdownHandle,
    task: tokio::task::JoinHandle<janus_agent::Result<()>>,
}

fn start() -> Running {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("agent.sock");
    let server = AgentServer::bind(&ServerConfig::new(&path), KeyStore::new()).expect("bind");
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());
    Running {
        _dir: dir,
        path,
        shutdown,
        task,
    }
}

#[tokio::test]
async fn add_list_sign_decrypt_over_socket() {
    let agent = start();
    let mut client = AgentClient::connect(&agent.path).await.expect("connect");
    let (kp, public) = ed25519(1);

    client.add_identity(kp, "work".into()).await.expect("add");

    let ids = client.request_identities().await.expect("list");
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0].pubkey, public);
    assert_eq!(ids[0].comment, "work");

    let sig = client.sign(&public, b"challenge", 0).await.expect("sign");
    public.verify(b"challenge", &sig).expect("verify");

    let blob = encrypt_to(&public, b"the plaintext");
    assert_eq!(client.decrypt(blob).await.expect("decrypt"), b"the plaintext");

    agent.shutdown.shutdown();
    agent.task.await.expect("join").expect("run");
}

#[tokio::test]
async fn lock_is_shared_by_every_session() {
    let agent = start();
    let mut alice = AgentClient::connect(&agent.path).await.expect("connect");
    let mut bob = AgentClient::connect(&agent.path).await.expect("connect");
    let (kp, public) = ed25519(2);

    alice.add_identity(kp, "work".into()).await.expect("add");
    alice.lock("secret").await.expect("lock");

    assert!(bob.request_identities().await.expect("list").is_empty());
    assert!(matches!(bob.sign(&public, b"x", 0).await, Err(Error::AgentFailure)));
    assert!(matches!(bob.unlock("guess").await, Err(Error::AgentFailure)));

    bob.unlock("secret").await.expect("unlock");
    let ids = alice.request_identities().await.expect("list");
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0].comment, "work");
}

#[tokio::test]
async fn keys_are_discoverable_by_stanza_tag() {
    let agent = start();
    let mut client = AgentClient::connect(&agent.path).await.expect("connect");
    let (kp, public) = ed25519(3);
    client.add_identity(kp, String::new()).await.expect("add");

    let tag = fingerprint(&public).expect("fingerprint");
    let blob = encrypt_to(&public, b"tagged");
    let header = String::from_utf8_lossy(&blob);
    assert!(header.contains(&format!("-> ssh-ed25519 {tag} ")));
}

#[tokio::test]
async fn shutdown_removes_socket_and_keeps_open_sessions() {
    let agent = start();
    let mut client = AgentClient::connect(&agent.path).await.expect("connect");
    client.request_identities().await.expect("list");

    agent.shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), agent.task)
        .await
        .expect("server stopped")
        .expect("join")
        .expect("run");
    assert!(!agent.path.exists());

    // The accepted session is still served.
    let (kp, _) = ed25519(4);
    client.add_identity(kp, "late".into()).await.expect("add after shutdown");
    assert_eq!(client.request_identities().await.expect("list").len(), 1);

    assert!(AgentClient::connect(&agent.path).await.is_err());
}
