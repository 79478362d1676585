//! Scopa Bot Example
//!
//! Runs a swarm of card players against a Scopa server. Each connection is
//! one player with its own hand:
//!
//! ```text
//! server                       player
//!   ── {"type":"welcome"} ──▶
//!   ◀── {"type":"options"} ──
//!   ── {"type":"deal","cards":[..]} ──▶   (cards go into the hand)
//!   ── {"type":"your_turn"} ──▶           (waits for a card)
//!   ◀── {"type":"play","card":..} ──
//!   ── {"type":"ping"} ──▶
//!   ◀── {"type":"pong"} ──
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --package scopa-bot -- --endpoint ws://127.0.0.1:8080 --workers 20 --duration 60
//! cargo run --package scopa-bot --features tls -- --endpoint wss://ws.playscopa.online/
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use pulse::prelude::*;
use serde_json::{Value, json};

/// Command-line options. Anything left unset comes from `pulse.toml` and
/// `PULSE_*` variables.
#[derive(Debug, Parser)]
#[command(name = "scopa-bot", about = "Run a swarm of Scopa players against a server")]
struct Cli {
    /// Server URL (ws:// or wss://).
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Number of concurrent players.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Stop after this many seconds.
    #[arg(short, long)]
    duration: Option<u64>,

    /// Configuration file to load instead of searching for `pulse.toml`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Finish each action before reading the next message.
    #[arg(long)]
    serialize: bool,
}

/// One player's view of the game.
#[derive(Debug, Default)]
struct Player {
    hand: Vec<Value>,
    played: usize,
}

// ============================================================================
// Handlers
// ============================================================================

fn handlers() -> Vec<Handler<Player>> {
    vec![
        on(["type"], "ping").name("pong").reply(|_, _| json!({ "type": "pong" })),
        on(["type"], "welcome")
            .name("options")
            .reply(|_, _| json!({ "type": "options" })),
        on(["type"], "deal")
            .name("take_cards")
            .reply(|msg: Message, state: ConnectionState<Player>| {
                let cards = msg["cards"].as_array().cloned().unwrap_or_default();
                debug!(count = cards.len(), "Cards dealt");
                state.with(|player| player.hand.extend(cards));
            }),
        on(["type"], "your_turn")
            .name("play_card")
            .action(|_, state: ConnectionState<Player>| async move {
                // The deal may still be on its way.
                let card = state
                    .wait_until(Duration::from_millis(50), |player| player.hand.pop())
                    .await;
                state.with(|player| player.played += 1);
                json!({ "type": "play", "card": card })
            }),
        on(["type"], "game_over")
            .name("game_over")
            .reply(|msg: Message, state: ConnectionState<Player>| {
                let played = state.with(|player| {
                    player.hand.clear();
                    std::mem::take(&mut player.played)
                });
                info!(played, winner = %msg["winner"], "Game over");
            }),
    ]
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn load_config(cli: &Cli) -> Result<PulseConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.file(path);
    }
    if let Some(endpoint) = &cli.endpoint {
        loader = loader.set("pool.endpoint", endpoint);
    }
    if let Some(workers) = cli.workers {
        loader = loader.set("pool.workers", workers);
    }
    if let Some(duration) = cli.duration {
        loader = loader.set("pool.duration_secs", duration);
    }
    if cli.serialize {
        loader = loader.set("pool.dispatch", DispatchMode::Serialized);
    }
    Ok(loader.load()?)
}

fn print_summary(report: &PoolReport) {
    let replies: u64 = report.outcomes.iter().map(|o| o.stats.replies_sent).sum();
    println!(
        "{} players: {} closed, {} failed, {} replies in {:.1?}",
        report.len(),
        report.succeeded(),
        report.failed(),
        replies,
        report.elapsed
    );
    for outcome in report.outcomes.iter().filter(|o| !o.is_success()) {
        let reason = outcome
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!("  player {}: {}", outcome.id, reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init_from_config(&config.logging);

    info!(
        endpoint = %config.pool.endpoint,
        players = config.pool.workers,
        "Starting Scopa swarm"
    );

    let pool = PoolBuilder::<Player>::default()
        .from_config(&config.pool)
        .handlers(handlers())
        .build()?;

    let report = pool.run_until(shutdown_signal()).await;
    print_summary(&report);

    Ok(())
}
