//! Daemon configuration.
//!
//! Sources, highest precedence first: command-line flags, `JANUS_*`
//! environment variables, the TOML file, built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use serde::Deserialize;

use crate::cli::Cli;

pub const ENV_PREFIX: &str = "JANUS";
const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub debug: bool,
    pub no_timestamp: bool,
    /// Defaults to `$SSH_AUTH_SOCK`.
    pub socket_path: Option<PathBuf>,
    /// 0 = unbounded.
    pub max_sessions: usize,
}

/// A parsed config file plus anything worth warning about once logging is
/// up.
#[derive(Debug, Default)]
pub struct Loaded {
    pub config: Config,
    pub warnings: Vec<String>,
}

pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("janus").join("config.toml")
}

/// Read the config file at `path`.  A missing file yields the defaults.
pub fn load(path: &Path) -> Result<Loaded> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Loaded::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("read config file {}", path.display()));
        }
    };

    let mut warnings = Vec::new();
    {
        use std::os::unix::fs::MetadataExt as _;
        match std::fs::metadata(path) {
            Ok(meta) if meta.mode() & 0o077 != 0 => warnings.push(format!(
                "config file {} has mode {:o}, readable by group or others; recommend chmod 600",
                path.display(),
                meta.mode() & 0o777
            )),
            Ok(_) => {}
            Err(e) => warnings.push(format!("could not check config file permissions: {e}")),
        }
    }

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("parse config file {}", path.display()))?;
    Ok(Loaded { config, warnings })
}

impl Config {
    /// Apply `JANUS_*` overrides.  `lookup` reads one variable.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}_{name}"));

        if let Some(v) = var("DEBUG") {
            self.debug = parse_bool("JANUS_DEBUG", &v)?;
        }
        if let Some(v) = var("NO_TIMESTAMP") {
            self.no_timestamp = parse_bool("JANUS_NO_TIMESTAMP", &v)?;
        }
        if let Some(v) = var("SOCKET_PATH") {
            self.socket_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MAX_SESSIONS") {
            self.max_sessions = v
                .trim()
                .parse()
                .with_context(|| format!("JANUS_MAX_SESSIONS: invalid count {v:?}"))?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        self.debug |= cli.debug;
        self.no_timestamp |= cli.no_timestamp;
        if let Some(socket) = &cli.socket {
            self.socket_path = Some(socket.clone());
        }
    }

    /// The agent socket: the configured path, else `$SSH_AUTH_SOCK`.
    pub fn socket_path(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(path) = &self.socket_path {
            return Ok(path.clone());
        }
        match lookup(SSH_AUTH_SOCK) {
            Some(path) => Ok(PathBuf::from(path)),
            None => bail!("no agent socket configured: set SSH_AUTH_SOCK or pass --socket"),
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{name}: expected a boolean, got {value:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;
    use crate::cli::{self, Command};

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn write_config(dir: &tempfile::TempDir, content: &str, mode: u32) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).expect("write config");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).expect("chmod");
        path
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(loaded.config, Config::default());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn parses_every_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            "debug = true\nno_timestamp = true\nsocket_path = \"/run/janus.sock\"\nmax_sessions = 4\n",
            0o600,
        );
        let loaded = load(&path).expect("load");
        assert_eq!(
            loaded.config,
            Config {
                debug: true,
                no_timestamp: true,
                socket_path: Some(PathBuf::from("/run/janus.sock")),
                max_sessions: 4,
            }
        );
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn rejects_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(&dir, "verbose = true\n", 0o600);
        assert!(load(&path).is_err());
    }

    #[test]
    fn warns_about_open_permissions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(&dir, "debug = false\n", 0o644);
        let loaded = load(&path).expect("load");
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].contains("644"));
    }

    #[test]
    fn precedence_cli_over_env_over_file() {
        let mut config = Config {
            socket_path: Some(PathBuf::from("/file.sock")),
            max_sessions: 2,
            ..Config::default()
        };

        config
            .apply_env(env(&[
                ("JANUS_SOCKET_PATH", "/env.sock"),
                ("JANUS_DEBUG", "true"),
                ("JANUS_MAX_SESSIONS", "8"),
            ]))
            .expect("env");
        assert_eq!(config.socket_path, Some(PathBuf::from("/env.sock")));
        assert!(config.debug);
        assert_eq!(config.max_sessions, 8);

        let cli = cli::parse(["--socket".to_string(), "/cli.sock".to_string()]).expect("parse");
        assert_eq!(cli.command, Command::Serve);
        config.apply_cli(&cli);
        assert_eq!(config.socket_path, Some(PathBuf::from("/cli.sock")));
        assert!(config.debug);
    }

    #[test]
    fn env_booleans_are_validated() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("JANUS_NO_TIMESTAMP", "1")]))
            .expect("env");
        assert!(config.no_timestamp);
        assert!(config.apply_env(env(&[("JANUS_DEBUG", "maybe")])).is_err());
        assert!(config.apply_env(env(&[("JANUS_MAX_SESSIONS", "-1")])).is_err());
    }

    #[test]
    fn socket_falls_back_to_ssh_auth_sock() {
        let config = Config::default();
        assert_eq!(
            config
                .socket_path(env(&[("SSH_AUTH_SOCK", "/tmp/agent.sock")]))
                .expect("socket"),
            PathBuf::from("/tmp/agent.sock")
        );
        assert!(config.socket_path(env(&[])).is_err());

        let configured = Config {
            socket_path: Some(PathBuf::from("/run/janus.sock")),
            ..Config::default()
        };
        assert_eq!(
            configured
                .socket_path(env(&[("SSH_AUTH_SOCK", "/tmp/agent.sock")]))
                .expect("socket"),
            PathBuf::from("/run/janus.sock")
        );
    }
}
