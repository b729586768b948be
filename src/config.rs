// src/config.rs
use clap::{Args, CommandFactory, Parser, Subcommand};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::broad::DEFAULT_NAMESPACE;
use crate::dir::{Dir, PathTest};
use crate::error::AfrError;
use crate::msg::MsgKind;
use crate::remote::{Loc, DEFAULT_HOSTNAME};

pub const DEFAULT_CONFIG_FILE: &str = "afr.toml";

/// Hides dotfiles and `node_modules` anywhere below a served directory.
pub const DEFAULT_HIDE: &str = r"(^|/)([.]|node_modules(/|$))";

/// Command-line arguments for the application.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub, optionally serving and watching directories
    Serve(ServeArgs),
    /// Send one message to a running hub and print the reply
    Send(SendArgs),
    /// Follow a running hub and log what a page would do
    Listen(ListenArgs),
}

/// Flags locating a hub.
///
/// Every value is read as JSON when it parses, otherwise as a literal string,
/// so `--hostname 0.0.0.0` and `--hostname '"0.0.0.0"'` mean the same.
#[derive(Args, Debug, Default, Clone)]
pub struct HubArgs {
    #[clap(long, value_parser = json_port, help = "Hub port")]
    pub port: Option<u16>,

    #[clap(long, value_parser = json_or_literal, help = "Hub hostname (default \"localhost\")")]
    pub hostname: Option<String>,

    #[clap(long, value_parser = json_or_literal, help = "URL namespace of the hub routes (default \"/afr/\")")]
    pub namespace: Option<String>,

    #[clap(
        short,
        long,
        value_parser,
        help = "Path to a configuration file (e.g., afr.toml)"
    )]
    pub config: Option<PathBuf>,

    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,

    #[clap(
        long,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = json_bool,
        help = "Log at debug level"
    )]
    pub verbose: Option<bool>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    #[clap(flatten)]
    pub hub: HubArgs,

    #[clap(long = "dir", value_parser = json_or_literal, help = "Directory to serve and watch; repeat for more, first wins")]
    pub dirs: Vec<String>,

    #[clap(long, value_parser = json_or_literal, help = "Regex of relative paths to hide; empty hides nothing")]
    pub hide: Option<String>,

    #[clap(
        long,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = json_bool,
        help = "Resolve like a static site, with 404.html as the not-found page"
    )]
    pub site: Option<bool>,

    #[clap(long, value_parser = json_or_literal, help = "Key stamped on change messages")]
    pub key: Option<String>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct RemoteArgs {
    #[clap(flatten)]
    pub hub: HubArgs,

    #[clap(long, value_parser = json_or_literal, help = "Hub URL; only the origin is used")]
    pub url: Option<String>,

    #[clap(long, value_parser = json_or_literal, help = "Only messages with this key")]
    pub key: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    #[clap(flatten)]
    pub remote: RemoteArgs,

    #[clap(long = "type", value_parser = json_kind, default_value = "change", help = "Message type: change, rename or deinit")]
    pub kind: MsgKind,

    #[clap(long, value_parser = json_or_literal, help = "Changed path, relative to the served root")]
    pub path: Option<String>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ListenArgs {
    #[clap(flatten)]
    pub remote: RemoteArgs,
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
pub struct FileConfig {
    /// Hub port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Host to bind or connect to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Path prefix of the hub routes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Hub URL; only its origin is used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Debug logging unless a log level is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    /// Directories to serve and watch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirs: Option<Vec<String>>,
    /// Regex of paths to hide; empty hides nothing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hide: Option<String>,
    /// Resolve extensionless paths and `index.html` like a static site
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<bool>,
    /// Key attached to sent messages and required of received ones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Log level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl FileConfig {
    fn defaults() -> Self {
        FileConfig {
            hostname: Some(DEFAULT_HOSTNAME.to_string()),
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            verbose: Some(false),
            dirs: Some(vec![]),
            hide: Some(DEFAULT_HIDE.to_string()),
            site: Some(false),
            ..Default::default()
        }
    }

    fn from_hub(hub: &HubArgs) -> Self {
        FileConfig {
            port: hub.port,
            hostname: hub.hostname.clone(),
            namespace: hub.namespace.clone(),
            verbose: hub.verbose,
            log_level: hub.log_level.clone(),
            ..Default::default()
        }
    }

    /// Defaults, then the `[afr]` table of the TOML file, then `AFR_*`
    /// variables, then `cli`.
    pub fn merge(config_file: &Path, cli: FileConfig) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(FileConfig::defaults()))
            .merge(Toml::file(config_file).nested())
            .merge(Env::prefixed("AFR_").global())
            .merge(Serialized::globals(cli))
            .select("afr")
            .extract()
    }

    fn log_level(&self) -> String {
        match (&self.log_level, self.verbose) {
            (Some(level), _) => level.clone(),
            (None, Some(true)) => "debug".to_string(),
            (None, _) => "info".to_string(),
        }
    }

    fn loc(&self) -> Loc {
        Loc {
            url: self.url.clone(),
            port: self.port,
            hostname: self
                .hostname
                .clone()
                .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            namespace: self
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        }
    }
}

/// Final `serve` configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Port to listen on
    pub port: u16,
    /// Address to bind
    pub hostname: String,
    /// Hub route prefix, normalized by the hub
    pub namespace: String,
    /// Served directories, highest priority first
    pub dirs: Vec<String>,
    /// Hide regex. Empty means nothing is hidden.
    pub hide: String,
    /// Site-style path resolution
    pub site: bool,
    /// Key stamped on watcher messages
    pub key: Option<String>,
    /// Tracing filter directive
    pub log_level: String,
}

impl AppConfig {
    pub fn from_args(args: &ServeArgs) -> Result<Self, AfrError> {
        let cli = FileConfig {
            dirs: (!args.dirs.is_empty()).then(|| args.dirs.clone()),
            hide: args.hide.clone(),
            site: args.site,
            key: args.key.clone(),
            ..FileConfig::from_hub(&args.hub)
        };
        Self::from_file_config(FileConfig::merge(&config_path(&args.hub), cli)?)
    }

    pub fn from_file_config(merged: FileConfig) -> Result<Self, AfrError> {
        let log_level = merged.log_level();
        Ok(AppConfig {
            port: merged.port.ok_or(AfrError::MissingPort)?,
            hostname: merged
                .hostname
                .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            namespace: merged
                .namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            dirs: merged.dirs.unwrap_or_default(),
            hide: merged.hide.unwrap_or_default(),
            site: merged.site.unwrap_or(false),
            key: merged.key,
            log_level,
        })
    }

    /// Configured directories in priority order, each carrying the hide test.
    pub fn served_dirs(&self) -> Result<Vec<Dir>, AfrError> {
        let test = if self.hide.is_empty() {
            None
        } else {
            Some(PathTest::hide(&self.hide)?)
        };
        Ok(self
            .dirs
            .iter()
            .map(|path| {
                let dir = Dir::new(path);
                match &test {
                    Some(test) => dir.with_test(test.clone()),
                    None => dir,
                }
            })
            .collect())
    }
}

/// Merged configuration of the `send` and `listen` commands.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub loc: Loc,
    pub key: Option<String>,
    pub log_level: String,
}

impl RemoteConfig {
    pub fn from_args(args: &RemoteArgs) -> Result<Self, AfrError> {
        let cli = FileConfig {
            url: args.url.clone(),
            key: args.key.clone(),
            ..FileConfig::from_hub(&args.hub)
        };
        let merged = FileConfig::merge(&config_path(&args.hub), cli)?;
        let loc = merged.loc();
        if loc.url.is_none() && loc.port.is_none() {
            return Err(AfrError::MissingPort);
        }
        Ok(RemoteConfig {
            loc,
            key: merged.key.clone(),
            log_level: merged.log_level(),
        })
    }
}

fn config_path(hub: &HubArgs) -> PathBuf {
    hub.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// True when the command line asks for usage: no arguments, `help`,
/// `--help` or `-h`.
pub fn wants_help<S: AsRef<str>>(args: &[S]) -> bool {
    match args.get(1).map(AsRef::as_ref) {
        None => true,
        Some(first) => matches!(first, "help" | "--help" | "-h"),
    }
}

pub fn print_help() -> std::io::Result<()> {
    CliArgs::command().print_help()
}

pub fn json_or_literal(raw: &str) -> Result<String, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(val)) => Ok(val),
        _ => Ok(raw.to_string()),
    }
}

pub fn json_bool(raw: &str) -> Result<bool, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Bool(val)) => Ok(val),
        Ok(Value::String(val)) if val == "true" || val == "false" => Ok(val == "true"),
        _ => Err(format!("expected true or false, got {raw:?}")),
    }
}

pub fn json_port(raw: &str) -> Result<u16, String> {
    json_or_literal(raw)?
        .parse()
        .map_err(|_| format!("expected a port number, got {raw:?}"))
}

pub fn json_kind(raw: &str) -> Result<MsgKind, String> {
    serde_json::from_value(Value::String(json_or_literal(raw)?)).map_err(|err| err.to_string())
}
