//! Echo bot example: repeats `!echo <text>` back into the channel.
//!
//! Usage:
//!   cargo run -p ircord-sdk --example echo_bot -- --host irc.libera.chat --port 6697 \
//!     --tls --channel "#ircord-test"
//!
//! Handlers run on the client's event loop and must not block, so the
//! handler only hands replies to a task that owns a `ClientHandle`.

use clap::Parser;
use ircord_sdk::{Client, ClientConfig, Message};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "echo-bot", about = "ircord-sdk echo bot example")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 6667)]
    port: u16,
    #[arg(long, default_value = "echobot")]
    nick: String,
    #[arg(long, default_value = "#bots")]
    channel: String,
    #[arg(long)]
    tls: bool,
}

#[tokio::main]
async fn main() -> ircord_sdk::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let client = Client::new(ClientConfig::new(&args.nick, &args.host, args.port, args.tls));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<(String, String)>();

    client
        .add_handler(move |msg: &Message| {
            if msg.command != "PRIVMSG" || msg.params.len() < 2 {
                return;
            }
            if let Some(text) = msg.params[1].strip_prefix("!echo ") {
                let _ = reply_tx.send((msg.params[0].clone(), text.to_string()));
            }
        })
        .await?;

    client.start().await?;
    client.join(&args.channel).await?;

    let handle = client.handle();
    let replies = tokio::spawn(async move {
        while let Some((target, text)) = reply_rx.recv().await {
            if handle.message(&target, &text).await.is_err() {
                break;
            }
        }
    });

    let _ = tokio::signal::ctrl_c().await;
    client.quit("echo bot shutting down").await?;
    client.close().await?;
    replies.abort();
    Ok(())
}
