// feltwatch/src/main.rs
//
// Feltwatch: real-time bot, collusion and multi-account detection
//
// Two operational modes:
//   tail    follow a JSONL game-engine feed (staging, live tables)
//   replay  replay a captured feed at scaled speed (testing/research)
//
// Usage:
//   feltwatch --mode tail --path /var/log/tables/feed.jsonl
//   feltwatch --mode replay --path captured.jsonl --speed 10.0 --config feltwatch.toml
//
// Each feed line is one tagged event:
//   {"kind":"action", ...PlayerAction}
//   {"kind":"hand_result", ...HandResult}
//   {"kind":"login","player_id":..,"device":{..},"ip_address":..,"timestamp":..}
//   {"kind":"session_start", ...PlayerSession}
//   {"kind":"session_end","session_id":..,"timestamp":..,"chips_out":..}
//   {"kind":"transfer", ...ChipTransfer}
//   {"kind":"interaction","a":..,"b":..,"delta":{..}}

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use feltwatch::engine::LogNotifier;
use feltwatch::events::{ChipTransfer, HandResult, PlayerAction, PlayerSession, Severity};
use feltwatch::publisher::InMemoryBroker;
use feltwatch::workers::collusion::graph::EdgeUpdate;
use feltwatch::workers::DeviceAttributes;
use feltwatch::{cancellable, Context, EngineConfig, FraudDetectionResult, FraudService, Stores};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "feltwatch",
    about   = "Real-time bot, collusion and multi-account detection for card-game tables",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "tail")]
    mode: Mode,

    #[arg(long, default_value = "/tmp/feltwatch_feed.jsonl",
          help = "JSONL feed path")]
    path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,

    #[arg(long, help = "TOML engine configuration (defaults when omitted)")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "30", help = "Seconds between stats lines")]
    stats_every: u64,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Tail,    // follow a live JSONL feed
    Replay,  // replay a static JSONL file at scaled speed
}

// ── Feed ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FeedEvent {
    Action(PlayerAction),
    HandResult(HandResult),
    Login {
        player_id: String,
        #[serde(default)]
        device: DeviceAttributes,
        #[serde(default)]
        ip_address: Option<IpAddr>,
        timestamp: DateTime<Utc>,
    },
    SessionStart(PlayerSession),
    SessionEnd {
        session_id: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        chips_out: f64,
    },
    Transfer(ChipTransfer),
    Interaction(EdgeUpdate),
}

impl FeedEvent {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Action(a) => Some(a.timestamp),
            Self::HandResult(r) => Some(r.timestamp),
            Self::Login { timestamp, .. } | Self::SessionEnd { timestamp, .. } => Some(*timestamp),
            Self::SessionStart(s) => Some(s.connected_at),
            Self::Transfer(t) => Some(t.timestamp),
            Self::Interaction(_) => None,
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

struct Pipeline {
    service: Arc<FraudService>,
    ctx: Context,
}

impl Pipeline {
    async fn process(&self, event: FeedEvent) {
        let ctx = &self.ctx;
        let svc = &self.service;
        let res = match event {
            FeedEvent::Action(action) => match svc.process_action(ctx, action).await {
                Ok(result) => {
                    if result.requires_action {
                        print_alert(&result);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            FeedEvent::HandResult(r) => {
                svc.record_hand_result(&r);
                Ok(())
            }
            FeedEvent::Login { player_id, device, ip_address, timestamp } => {
                svc.record_login(ctx, &player_id, &device, ip_address, timestamp).await.map(|_| ())
            }
            FeedEvent::SessionStart(s) => svc.start_session(ctx, s).await,
            FeedEvent::SessionEnd { session_id, timestamp, chips_out } => {
                svc.end_session(ctx, &session_id, timestamp, chips_out).await
            }
            FeedEvent::Transfer(t) => svc.record_transfer(ctx, t).await,
            FeedEvent::Interaction(u) => {
                svc.record_interaction(&u);
                Ok(())
            }
        };
        if let Err(e) = res {
            error!("Event failed: {}", e);
        }
    }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m");
    println!("  ┌─┐┌─┐┬ ┌┬┐┬ ┬┌─┐┌┬┐┌─┐┬ ┬");
    println!("  ├┤ ├┤ │  │ │││├─┤ │ │  ├─┤");
    println!("  └  └─┘┴─┘┴ └┴┘┴ ┴ ┴ └─┘┴ ┴");
    println!("\x1b[0m");
    println!("  \x1b[90mBot, collusion and multi-account detection | Rust\x1b[0m\n");
}

fn print_alert(result: &FraudDetectionResult) {
    let worst = result.alerts.iter().map(|a| a.severity).max().unwrap_or(Severity::Low);
    let (color, icon) = match worst {
        Severity::Critical => ("\x1b[91;1m", "●"),
        Severity::High     => ("\x1b[93;1m", "●"),
        Severity::Medium   => ("\x1b[96m",   "●"),
        Severity::Low      => ("\x1b[92m",   "○"),
    };
    let reset   = "\x1b[0m";
    let actions = result.recommended_actions.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ");
    let ev      = result.alerts.iter().flat_map(|a| a.evidence.iter().cloned()).take(3).collect::<Vec<_>>().join(" | ");

    println!("\n{}{} {} → {}{}", color, icon, worst, actions, reset);
    println!("  Player  : {}{}{} (agent {}, club {})", color, result.player_id, reset, result.agent_id, result.club_id);
    println!("  Table   : {} hand {}", result.table_id, result.hand_id);
    println!(
        "  Score   : {}{:.3}{}  bot={:.2} collusion={:.2} multi={:.2}",
        color, result.overall_score, reset,
        result.risk.bot_score, result.risk.collusion_score, result.risk.multi_account_score
    );
    println!("  Evidence: {}", ev);
    if !result.failures.is_empty() {
        let f = result.failures.iter().map(|f| f.detector.as_str()).collect::<Vec<_>>().join(", ");
        println!("  \x1b[90mDegraded: {}{}", f, reset);
    }
}

async fn print_stats_loop(service: Arc<FraudService>, start: Instant, every: u64) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(every.max(1))).await;
        let elapsed = start.elapsed().as_secs_f64();
        let s = service.stats();
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  actions={}  aps={:.1}  players={}  flagged={}  alerts={}  edges={}  rings={}  queued={} ──\x1b[0m",
            elapsed, s.actions, s.actions as f64 / elapsed, s.players, s.flagged,
            s.alerts_persisted, s.graph_edges, s.rings, service.publisher().queue_depth()
        );
        if s.publish_failures > 0 || s.detector_failures > 0 {
            warn!(
                publish_failures = s.publish_failures,
                detector_failures = s.detector_failures,
                timeouts = s.detector_timeouts,
                "degraded operation"
            );
        }
    }
}

// ── Event sources ─────────────────────────────────────────────────────────────

fn parse_line(line: &str) -> Option<FeedEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<FeedEvent>(line) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!("Parse error: {}", e);
            None
        }
    }
}

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<FeedEvent>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path).await.with_context(|| format!("open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {} // consume existing
    }

    info!("Tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                if let Some(ev) = parse_line(&line) {
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

/// Replays in timestamp order, pacing by the recorded gaps. Event times are
/// left untouched so windowed statistics match the capture.
async fn replay_jsonl(path: PathBuf, tx: mpsc::Sender<FeedEvent>, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await.with_context(|| format!("read {}", path.display()))?;
    let mut events: Vec<(i64, FeedEvent)> = Vec::new();
    let mut last_ts = i64::MIN;
    for ev in content.lines().filter_map(parse_line) {
        // untimed events ride with the last timed line before them (i64::MIN ahead of any); the stable sort keeps file order within a tie
        let ts = ev.timestamp().map(|t| t.timestamp_millis()).unwrap_or(last_ts);
        last_ts = ts;
        events.push((ts, ev));
    }
    if events.is_empty() {
        return Ok(());
    }
    events.sort_by_key(|(ts, _)| *ts);

    let speed = if speed > 0.0 { speed } else { 1.0 };
    let base_ts = events.iter().map(|(ts, _)| *ts).find(|ts| *ts != i64::MIN).unwrap_or(0);
    let base_wall = std::time::Instant::now();
    let total = events.len();

    for (ts, event) in events {
        if ts != i64::MIN {
            let offset = ((ts - base_ts).max(0) as f64 / speed) / 1000.0;
            let target = base_wall + std::time::Duration::from_secs_f64(offset);
            let now = std::time::Instant::now();
            if target > now {
                tokio::time::sleep(target - now).await;
            }
        }
        if tx.send(event).await.is_err() {
            break;
        }
    }
    info!("Replay finished, {} events", total);
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("feltwatch=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let broker  = Arc::new(InMemoryBroker::new());
    let service = FraudService::new(cfg, Stores::in_memory(), broker, Arc::new(LogNotifier))?;
    service.publisher().ensure_topic().await?;

    let (cancel, ctx) = cancellable();
    let background = service.spawn_background(&ctx);
    let pipeline = Arc::new(Pipeline { service: Arc::clone(&service), ctx: ctx.clone() });
    let start = Instant::now();
    let (tx, mut rx) = mpsc::channel::<FeedEvent>(16384);

    print_banner();

    // Stats printer
    tokio::spawn(print_stats_loop(Arc::clone(&service), start, cli.stats_every));

    // Event source
    let tx2 = tx.clone();
    match cli.mode {
        Mode::Tail => {
            println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}\n", cli.path.display());
            let path = cli.path.clone();
            tokio::spawn(async move {
                if let Err(e) = tail_jsonl(path, tx2, true).await {
                    error!("Tail stopped: {:#}", e);
                }
            });
        }

        Mode::Replay => {
            println!("  Mode: \x1b[93mREPLAY\x1b[0m  |  {}  speed={:.1}x\n", cli.path.display(), cli.speed);
            let path  = cli.path.clone();
            let speed = cli.speed;
            tokio::spawn(async move {
                if let Err(e) = replay_jsonl(path, tx2, speed).await {
                    error!("Replay stopped: {:#}", e);
                }
            });
        }
    }
    drop(tx);

    println!("  Press Ctrl+C to stop.\n");

    // Main consumer: one task per event
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(event) => {
                    let p = Arc::clone(&pipeline);
                    tokio::spawn(async move { p.process(event).await; });
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    cancel.cancel();
    for handle in background {
        handle.await.ok();
    }
    let s = service.stats();
    info!(
        actions = s.actions,
        flagged = s.flagged,
        alerts = s.alerts_persisted,
        published = s.publisher.published,
        publish_failures = s.publish_failures,
        "final stats"
    );
    Ok(())
}
