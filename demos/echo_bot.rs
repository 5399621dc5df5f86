//! Minimal echo bot example.
//!
//! Demonstrates using the library to build a bot that:
//! - Connects to an IRC server (plaintext or TLS)
//! - Joins a channel on welcome
//! - Responds to "!echo <text>" and "!uptime" in that channel
//!
//! Usage:
//!   cargo run --example echo_bot -- --server irc.example.org --nick echobot --channel "#test"

use std::time::Duration;
use std::time::Instant;

use std::sync::Arc;

use clap::Parser;
use irc_client::{
    connect, connect_tls, start, stdout_logger, EventHandler, EventKind, InstanceConfig,
    IrcState,
};

#[derive(Parser)]
#[command(name = "echo-bot", about = "Minimal IRC echo bot")]
struct Args {
    /// Server host
    #[arg(long, default_value = "localhost")]
    server: String,

    /// Server port
    #[arg(long, default_value_t = 6667)]
    port: u16,

    /// Bot nick
    #[arg(long, default_value = "echobot")]
    nick: String,

    /// Channel to join
    #[arg(long, default_value = "#bots")]
    channel: String,

    /// Use TLS
    #[arg(long)]
    tls: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let started = Instant::now();

    let cooldown = Duration::from_secs(1);
    let cconf = if args.tls {
        connect_tls(args.server.clone(), args.port, cooldown)
    } else {
        connect(args.server.clone(), args.port, cooldown)
    };
    let cconf = cconf.with_log(stdout_logger());

    let mut iconf = InstanceConfig::new(args.nick);
    iconf.channels.push(args.channel);
    iconf.handlers.insert(
        0,
        EventHandler::new(EventKind::Privmsg, move |state: Arc<IrcState<Instant>>, event| async move {
            let Some(text) = event.message.params.get(1) else {
                return Ok(());
            };
            if let Some(echoed) = text.strip_prefix("!echo ") {
                let echoed = echoed.to_string();
                state.reply(&event, &echoed).await?;
            } else if text.trim() == "!uptime" {
                let up = state.user_state().get().elapsed().as_secs();
                state.reply(&event, &format!("up {up}s")).await?;
            }
            Ok(())
        }),
    );

    println!("Connecting to {}:{}...", cconf.host, cconf.port);
    start(IrcState::new(cconf, iconf, started)).await;
    println!("Session ended.");
}
