//! Command-line parsing.

use std::path::PathBuf;

use anyhow::{Result, bail};

pub const USAGE: &str = "\
Usage: janusd [options] [serve]
       janusd [options] decrypt <file>

SSH agent with an age decrypt extension.

Commands:
  serve            Run the agent (default)
  decrypt <file>   Decrypt an age file with a key held by the running agent
                   and write the plaintext to stdout (`-` reads stdin)

Options:
  -c, --config <path>   Config file (default: $XDG_CONFIG_HOME/janus/config.toml)
  -s, --socket <path>   Agent socket (default: $SSH_AUTH_SOCK)
  -d, --debug           Enable debug logs
      --no-timestamp    Omit timestamps from logs
  -h, --help            Show this help message
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    Decrypt { file: PathBuf },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub command: Command,
    pub config: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    pub debug: bool,
    pub no_timestamp: bool,
}

/// Parse arguments, program name excluded.
pub fn parse<I>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = Cli {
        command: Command::Serve,
        config: None,
        socket: None,
        debug: false,
        no_timestamp: false,
    };
    let mut positional = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                cli.command = Command::Help;
                return Ok(cli);
            }
            "-d" | "--debug" => cli.debug = true,
            "--no-timestamp" => cli.no_timestamp = true,
            "-c" | "--config" => cli.config = Some(value_for(&arg, args.next())?),
            "-s" | "--socket" => cli.socket = Some(value_for(&arg, args.next())?),
            _ => {
                if let Some(path) = arg.strip_prefix("--config=") {
                    cli.config = Some(PathBuf::from(path));
                } else if let Some(path) = arg.strip_prefix("--socket=") {
                    cli.socket = Some(PathBuf::from(path));
                } else if arg.starts_with('-') && arg != "-" {
                    bail!("unknown option {arg:?}\n\n{USAGE}");
                } else {
                    positional.push(arg);
                }
            }
        }
    }

    let mut positional = positional.into_iter();
    cli.command = match positional.next().as_deref() {
        None | Some("serve") => Command::Serve,
        Some("decrypt") => {
            let Some(file) = positional.next() else {
                bail!("decrypt requires a file argument\n\n{USAGE}");
            };
            Command::Decrypt {
                file: PathBuf::from(file),
            }
        }
        Some(other) => bail!("unknown command {other:?}\n\n{USAGE}"),
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument {extra:?}\n\n{USAGE}");
    }
    Ok(cli)
}

fn value_for(flag: &str, value: Option<String>) -> Result<PathBuf> {
    match value {
        Some(v) => Ok(PathBuf::from(v)),
        None => bail!("{flag} requires a path argument"),
    }
}
