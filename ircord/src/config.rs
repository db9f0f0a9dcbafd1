//! Configuration for the ircord relay.
//!
//! The optional config file lives at `~/.config/ircord/ircord.toml`.
//! Command-line flags (and their `IRCORD_*` env fallbacks) override it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ircord_sdk::ClientConfig;
use serde::Deserialize;

/// Default IRC port when neither the CLI nor the file names one.
pub const DEFAULT_PORT: u16 = 6667;
/// Default chunk size for outgoing relay lines, in bytes.
pub const DEFAULT_SPLIT_SIZE: usize = 400;

/// Values read from the TOML file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub nick: Option<String>,
    pub tls: Option<bool>,
    pub tls_insecure: Option<bool>,
    /// Channels to join on every connect.
    pub channels: Option<Vec<String>>,
    /// Where stdin lines go. Defaults to the first joined channel.
    pub relay: Option<String>,
    pub backoff_secs: Option<u64>,
    pub split_size: Option<usize>,
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ircord")
        .join("ircord.toml")
}

impl FileConfig {
    /// Load the config file.
    ///
    /// An explicitly named file must exist. The default file is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = default_path();
                if !path.exists() {
                    tracing::debug!(path = %path.display(), "No config file, using defaults");
                    return Ok(Self::default());
                }
                path
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("can't read {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("bad config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Flags that can override the file. `None`/`false` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub nick: Option<String>,
    pub tls: bool,
    pub tls_insecure: bool,
    pub channels: Option<String>,
    pub relay: Option<String>,
    pub backoff_secs: Option<u64>,
}

/// Effective settings after merging CLI > config file > defaults.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub client: ClientConfig,
    pub channels: Vec<String>,
    pub relay: Option<String>,
    pub split_size: usize,
}

impl Resolved {
    pub fn merge(cli: &Overrides, file: &FileConfig) -> Result<Self> {
        let host = cli
            .host
            .clone()
            .or_else(|| file.host.clone())
            .context("no server host given (use --host or set `host` in the config file)")?;
        let nick = cli
            .nick
            .clone()
            .or_else(|| file.nick.clone())
            .context("no nick given (use --nick or set `nick` in the config file)")?;
        let tls = cli.tls || file.tls.unwrap_or(false);
        // 6697 is the conventional TLS port.
        let port = cli
            .port
            .or(file.port)
            .unwrap_or(if tls { 6697 } else { DEFAULT_PORT });

        let channels: Vec<String> = match &cli.channels {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => file.channels.clone().unwrap_or_default(),
        };
        let relay = cli
            .relay
            .clone()
            .or_else(|| file.relay.clone())
            .or_else(|| channels.first().cloned());

        let mut client = ClientConfig::new(nick, host, port, tls);
        client.tls_insecure = cli.tls_insecure || file.tls_insecure.unwrap_or(false);
        if let Some(secs) = cli.backoff_secs.or(file.backoff_secs) {
            client.backoff = Duration::from_secs(secs);
        }
        client.validate()?;

        Ok(Self {
            client,
            channels,
            relay,
            split_size: file.split_size.unwrap_or(DEFAULT_SPLIT_SIZE),
        })
    }
}
