mod bootstrap;
mod cli;
mod config;

use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow};
use janus_agent::{AgentClient, AgentServer, KeyStore, ServerConfig};
use tracing_subscriber::EnvFilter;

use crate::cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse(std::env::args().skip(1))?;
    if cli.command == Command::Help {
        print!("{}", cli::USAGE);
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let loaded = config::load(&config_path)?;
    let mut config = loaded.config;
    config.apply_env(env_var)?;
    config.apply_cli(&cli);

    init_logging(config.debug, config.no_timestamp);
    for warning in &loaded.warnings {
        tracing::warn!("{warning}");
    }
    tracing::debug!(path = %config_path.display(), "debug mode enabled");

    let socket_path = config.socket_path(env_var)?;

    match cli.command {
        Command::Decrypt { file } => decrypt(&socket_path, &file).await,
        Command::Serve => serve(socket_path, config.max_sessions).await,
        Command::Help => Ok(()),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// `RUST_LOG`, when set, overrides the level chosen by `debug`.
fn init_logging(debug: bool, no_timestamp: bool) {
    let filter = match env_var("RUST_LOG") {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(if debug { "debug" } else { "info" }),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if no_timestamp {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

async fn serve(socket_path: PathBuf, max_sessions: usize) -> Result<()> {
    let hardening = bootstrap::harden_process();
    tracing::info!(
        not_dumpable = hardening.not_dumpable,
        memory_locked = hardening.memory_locked,
        "process hardening: {hardening}"
    );

    let server_config = ServerConfig {
        socket_path,
        max_sessions,
    };
    let server = AgentServer::bind(&server_config, KeyStore::new()).with_context(|| {
        format!(
            "bind agent socket {}",
            server_config.socket_path.display()
        )
    })?;
    let shutdown = server.shutdown_handle();
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        () = shutdown_signal() => {
            tracing::info!("received shutdown signal, stopping agent");
            shutdown.shutdown();
        }
        result = &mut server_task => {
            return result.context("agent server task")?.context("agent server");
        }
    }

    server_task
        .await
        .context("agent server task")?
        .context("agent server")?;
    tracing::info!("janusd exiting");
    Ok(())
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
            ctrl_c.await.ok();
        }
    }
}

/// Decrypt `file` (or stdin for `-`) through the running agent.
async fn decrypt(socket_path: &Path, file: &Path) -> Result<()> {
    let blob = if file == Path::new("-") {
        let mut blob = Vec::new();
        std::io::stdin()
            .read_to_end(&mut blob)
            .context("read age file from stdin")?;
        blob
    } else {
        std::fs::read(file).with_context(|| format!("read age file {}", file.display()))?
    };

    let mut client = AgentClient::connect(socket_path)
        .await
        .with_context(|| format!("connect to agent at {}", socket_path.display()))?;

    let plaintext = match client.decrypt(blob).await {
        Ok(plaintext) => plaintext,
        Err(janus_agent::Error::NotFound) => {
            return Err(anyhow!(
                "no key held by the agent can decrypt {}",
                file.display()
            ));
        }
        Err(janus_agent::Error::AgentFailure) => {
            return Err(anyhow!(
                "agent refused to decrypt {} (locked, or not a valid age file)",
                file.display()
            ));
        }
        Err(e) => return Err(e).context("decrypt request"),
    };
    tracing::debug!(len = plaintext.len(), "decrypted");

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&plaintext).context("write plaintext")?;
    stdout.flush().context("write plaintext")?;
    Ok(())
}
