//! ircord: relay between a terminal and IRC channels.
//!
//! Every `PRIVMSG` the client sees is printed to stdout as `<nick> text`.
//! Each line typed on stdin is sent to the relay channel. The connection
//! heals itself across server restarts; Ctrl-C or end of input quits.
//!
//! Logs go to stderr so stdout stays clean for the relayed chat.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ircord_sdk::irc::split_message;
use ircord_sdk::{Client, ClientHandle, Message};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{FileConfig, Overrides, Resolved};

#[derive(Parser)]
#[command(name = "ircord", about = "Self-healing IRC relay for the terminal")]
struct Args {
    /// Config file (default: ~/.config/ircord/ircord.toml, if present)
    #[arg(long, env = "IRCORD_CONFIG")]
    config: Option<PathBuf>,

    /// IRC server host
    #[arg(long, env = "IRCORD_HOST")]
    host: Option<String>,

    /// IRC server port (default 6667, or 6697 with --tls)
    #[arg(long, env = "IRCORD_PORT")]
    port: Option<u16>,

    /// Nick, also used as username and real name
    #[arg(long, env = "IRCORD_NICK")]
    nick: Option<String>,

    /// Use TLS
    #[arg(long, env = "IRCORD_TLS")]
    tls: bool,

    /// Skip TLS certificate verification (for self-signed certs)
    #[arg(long)]
    tls_insecure: bool,

    /// Channels to join, comma-separated
    #[arg(long, env = "IRCORD_CHANNELS")]
    channels: Option<String>,

    /// Channel that stdin lines are sent to (default: first joined channel)
    #[arg(long, env = "IRCORD_RELAY")]
    relay: Option<String>,

    /// Seconds to wait between reconnect attempts
    #[arg(long, env = "IRCORD_BACKOFF")]
    backoff: Option<u64>,

    /// Reason sent with QUIT on exit
    #[arg(long, default_value = "ircord signing off")]
    quit_message: String,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            nick: self.nick.clone(),
            tls: self.tls,
            tls_insecure: self.tls_insecure,
            channels: self.channels.clone(),
            relay: self.relay.clone(),
            backoff_secs: self.backoff,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ircord=info,ircord_sdk=info".into()),
        )
        .init();

    let args = Args::parse();
    let file = FileConfig::load(args.config.as_deref())?;
    let resolved = Resolved::merge(&args.overrides(), &file)?;

    tracing::info!(
        server = %resolved.client.server_addr(),
        nick = %resolved.client.nick,
        tls = resolved.client.tls,
        channels = ?resolved.channels,
        relay = ?resolved.relay,
        "Starting ircord"
    );

    let client = Client::new(resolved.client.clone());
    client.add_handler(print_privmsg).await?;
    client
        .start()
        .await
        .with_context(|| format!("can't connect to {}", resolved.client.server_addr()))?;

    tokio::spawn(log_state_changes(client.handle()));

    for channel in &resolved.channels {
        client.join(channel).await?;
    }

    let outcome = relay_stdin(&client.handle(), &resolved).await;

    if let Err(e) = client.quit(&args.quit_message).await {
        tracing::debug!(error = %e, "Client already stopped");
    }
    client.close().await?;
    outcome
}

fn print_privmsg(msg: &Message) {
    if msg.command != "PRIVMSG" {
        return;
    }
    let nick = msg.source_nick().unwrap_or("?");
    let text = msg.params.last().map(String::as_str).unwrap_or("");
    println!("<{nick}> {text}");
}

/// Send stdin lines to the relay channel until EOF or Ctrl-C.
async fn relay_stdin(handle: &ClientHandle, resolved: &Resolved) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(());
            }
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            tracing::info!("End of input");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some(target) = resolved.relay.as_deref() else {
            tracing::warn!("No relay channel configured, dropping input line");
            continue;
        };
        for chunk in split_message(&line, resolved.split_size) {
            handle.message(target, &chunk).await?;
        }
    }
}

async fn log_state_changes(handle: ClientHandle) {
    let mut state = handle.subscribe_state();
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        tracing::info!(state = ?current, "Connection state changed");
    }
}
