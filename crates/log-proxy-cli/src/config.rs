// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command line and configuration file handling.
//!
//! Settings are merged from, in increasing priority: built-in defaults, the `log_proxy` section of
//! the YAML file given with `--config`, `LOG_PROXY_*` environment variables and command line flags.

use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:2773";
const CONFIG_SECTION: &str = "log_proxy";
const ENV_PREFIX: &str = "LOG_PROXY_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file {0} doesn't exist")]
    FileNotFound(PathBuf),

    #[error("Configuration file {0} has no 'log_proxy' section")]
    MissingSection(PathBuf),

    #[error("Invalid configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: &'static str },

    #[error("Missing required option '{0}'")]
    Missing(&'static str),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Figment(Box::new(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "log_proxy", about, version)]
pub struct Cli {
    /// YAML file with a `log_proxy` section.
    #[arg(global = true, long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct GlobalArgs {
    /// Log level of the proxy itself.
    #[arg(global = true, long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Receive logs and pass them into a sink.
    #[command(subcommand)]
    Server(SinkCommand),

    /// Ship the logs of this machine to a log server.
    Client(ClientArgs),
}

#[derive(Debug, Subcommand)]
pub enum SinkCommand {
    /// Forward the logs to another log server.
    Socket {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        forward: ForwardArgs,
    },

    /// Store the logs in a PostgreSQL database.
    Postgres {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        database: DatabaseArgs,
    },

    /// Store the logs in a MongoDB collection named by `--db-table`.
    Mongodb {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        database: DatabaseArgs,
    },
}

#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct ServerArgs {
    /// Address to listen on (`host:port`).
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// Server certificate.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,

    /// Private key of the server certificate.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,

    /// CA verifying client certificates. Clients must present one if set.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,

    /// Accept clients without a token.
    #[arg(long, action = ArgAction::SetTrue)]
    #[serde(skip_serializing_if = "is_false")]
    pub no_auth: bool,

    /// JSON file mapping tokens to their metadata.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,

    /// Maximum number of buffered records. 0 means unlimited.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct ForwardArgs {
    /// Log server to forward to (`host:port`).
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward: Option<String>,

    /// CA verifying the log server. Enables TLS.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_ca: Option<PathBuf>,

    /// Client certificate presented to the log server. Enables TLS.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_cert: Option<PathBuf>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_key: Option<PathBuf>,

    /// Token sent to the log server after connecting.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_token: Option<String>,
}

#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct DatabaseArgs {
    /// Name of the database.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_host: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_port: Option<u16>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_user: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_password: Option<String>,

    /// Table to store the logs in.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_table: Option<String>,
}

#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct ClientArgs {
    #[command(flatten)]
    #[serde(flatten)]
    pub forward: ForwardArgs,

    /// Forward every line read from stdin.
    #[arg(long, action = ArgAction::SetTrue)]
    #[serde(skip_serializing_if = "is_false")]
    pub log_stdin: bool,

    /// Directory whose files are tailed and forwarded.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch: Option<PathBuf>,

    /// Glob of files to watch. Can be repeated.
    #[arg(long)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub watch_pattern: Vec<String>,

    /// Glob of files to skip. Can be repeated.
    #[arg(long)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub watch_ignore: Vec<String>,

    #[arg(long, action = ArgAction::SetTrue)]
    #[serde(skip_serializing_if = "is_false")]
    pub watch_case_insensitive: bool,

    /// Maximum number of buffered records. 0 means unlimited.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Effective settings after merging every source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: LogLevel,

    pub listen: String,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub no_auth: bool,
    pub token_file: Option<PathBuf>,
    pub max_size: usize,

    pub forward: Option<String>,
    pub forward_ca: Option<PathBuf>,
    pub forward_cert: Option<PathBuf>,
    pub forward_key: Option<PathBuf>,
    pub forward_token: Option<String>,

    pub db: Option<String>,
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_table: String,

    pub log_stdin: bool,
    pub watch: Option<PathBuf>,
    pub watch_pattern: Vec<String>,
    pub watch_ignore: Vec<String>,
    pub watch_case_insensitive: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            listen: DEFAULT_LISTEN.to_string(),
            cert: None,
            key: None,
            ca: None,
            no_auth: false,
            token_file: None,
            max_size: 0,
            forward: None,
            forward_ca: None,
            forward_cert: None,
            forward_key: None,
            forward_token: None,
            db: None,
            db_host: None,
            db_port: None,
            db_user: None,
            db_password: None,
            db_table: log_proxy::sink::postgres::DEFAULT_TABLE.to_string(),
            log_stdin: false,
            watch: None,
            watch_pattern: Vec::new(),
            watch_ignore: Vec::new(),
            watch_case_insensitive: false,
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        if let Some(path) = &cli.config {
            figment = figment.merge(Serialized::defaults(read_section(path)?));
        }
        figment = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(&cli.global));

        figment = match &cli.command {
            Command::Server(SinkCommand::Socket { server, forward }) => figment
                .merge(Serialized::defaults(server))
                .merge(Serialized::defaults(forward)),
            Command::Server(
                SinkCommand::Postgres { server, database }
                | SinkCommand::Mongodb { server, database },
            ) => figment
                .merge(Serialized::defaults(server))
                .merge(Serialized::defaults(database)),
            Command::Client(client) => figment.merge(Serialized::defaults(client)),
        };

        Ok(figment.extract()?)
    }

    /// Address of the log server to forward to.
    pub fn forward_address(&self) -> Result<(String, u16), ConfigError> {
        let forward = self.forward.as_deref().ok_or(ConfigError::Missing("forward"))?;
        parse_address(forward, None, None)
    }

    pub fn listen_address(&self) -> Result<(String, u16), ConfigError> {
        parse_address(&self.listen, Some("0.0.0.0"), None)
    }

    /// Whether the connection to the forward target uses TLS.
    pub fn forward_tls(&self) -> bool {
        self.forward_ca.is_some() || self.forward_cert.is_some()
    }
}

fn read_section(path: &Path) -> Result<figment::value::Dict, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let file = Figment::from(Yaml::file(path));
    if !file.contains(CONFIG_SECTION) {
        return Err(ConfigError::MissingSection(path.to_path_buf()));
    }
    Ok(file.extract_inner(CONFIG_SECTION)?)
}

/// Splits `host:port`. IPv6 hosts must be enclosed in brackets.
///
/// An empty host falls back to `default_host` and a missing port to `default_port`.
pub fn parse_address(
    address: &str,
    default_host: Option<&str>,
    default_port: Option<u16>,
) -> Result<(String, u16), ConfigError> {
    let invalid = |reason| ConfigError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    if !address
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '[' | ']' | '-' | '_'))
    {
        return Err(invalid("only host and port are supported"));
    }

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(|| invalid("unclosed bracket"))?;
        match rest {
            "" => (host, None),
            _ => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(invalid("unexpected characters after host")),
            },
        }
    } else {
        match address.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (address, None),
        }
    };

    if host.contains(['[', ']']) || (!address.starts_with('[') && host.contains(':')) {
        return Err(invalid("invalid host"));
    }

    let port = match port {
        Some(port) => {
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("invalid port"));
            }
            match port.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(invalid("invalid port")),
            }
        }
        None => default_port.ok_or_else(|| invalid("port required"))?,
    };

    let host = match (host, default_host) {
        ("", Some(default)) => default,
        ("", None) => return Err(invalid("host required")),
        (host, _) => host,
    };

    Ok((host.to_string(), port))
}
