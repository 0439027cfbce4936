//! Lane Engine: recovery-lane trade manager
//!
//! Entry point. Loads configuration, initialises structured logging, opens
//! the lane store and bridges newline-delimited JSON commands on stdin to
//! the lane manager, writing one JSON reply per command on stdout. Logs go
//! to stderr so stdout carries protocol lines only. Money is sent as JSON
//! numbers.
//!
//! Commands:
//!   {"signal":   {"account": "..", "symbol": "..", "direction": "call", "trade_id": ".."}}
//!   {"result":   {"trade_id": "..", "outcome": "loss", "pnl": -1.00}}
//!   {"abandon":  {"trade_id": ".."}}
//!   {"balance":  {"account": "..", "balance": 250.00}}
//!   {"settings": {"account": "..", "max_concurrent_lanes": 2, ...}}
//!   {"close":    {"lane_id": "..", "status": "cancelled", "reason": ".."}}
//!   {"martingale": {"enabled": false}}
//!   {"statistics": {"account": "..", "days": 30}}

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use lane_engine::config::{self, AppConfig};
use lane_engine::dashboard::{self, routes::DashboardState};
use lane_engine::engine::{LaneManager, PendingPlacement, ResultEffect, StatusReporter};
use lane_engine::storage::{LaneStore, MemoryLaneStore, SqliteLaneStore};
use lane_engine::strategy::stake::StakeCalculator;
use lane_engine::types::{
    AccountSettings, Direction, Lane, LaneError, LaneStatistics, LaneStatus, Placement,
    SettingsUpdate, TradeOutcome, TradeRequest,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Command {
    Signal {
        account: String,
        symbol: String,
        direction: String,
        trade_id: Option<String>,
    },
    Result {
        trade_id: String,
        outcome: String,
        pnl: Decimal,
    },
    Abandon {
        trade_id: String,
    },
    Balance {
        account: String,
        balance: Decimal,
    },
    Settings {
        account: String,
        #[serde(flatten)]
        update: SettingsUpdate,
    },
    Close {
        lane_id: String,
        status: String,
        reason: Option<String>,
    },
    Martingale {
        enabled: bool,
    },
    Statistics {
        account: String,
        days: Option<u32>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Placement(Placement),
    Settled {
        trade_id: String,
        #[serde(flatten)]
        effect: ResultEffect,
    },
    Abandoned(PendingPlacement),
    Balance {
        account: String,
        balance: Decimal,
    },
    Settings(AccountSettings),
    Lane(Lane),
    Martingale {
        enabled: bool,
    },
    Statistics {
        account: String,
        #[serde(flatten)]
        statistics: LaneStatistics,
    },
    Error {
        error: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("LANE_ENGINE_CONFIG")
        .unwrap_or_else(|_| config::DEFAULT_CONFIG_PATH.to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    info!(
        config = %config_path,
        base_amount = %cfg.staking.base_amount,
        max_level = cfg.staking.max_level,
        payout_rate = ?cfg.staking.payout_rate,
        "Lane engine starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = open_store(&cfg).await?;
    let manager = Arc::new(LaneManager::new(
        store,
        StakeCalculator::new(cfg.safety.clone()),
        cfg.manager_config(),
    ));

    let maintenance = manager.spawn_maintenance(Duration::from_secs(
        cfg.engine.maintenance_interval_secs.max(1),
    ));

    let dashboard = if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(Arc::clone(&manager)));
        Some(dashboard::spawn_dashboard(state, cfg.dashboard.port).await?)
    } else {
        None
    };

    // -- Main loop -------------------------------------------------------

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Reading commands from stdin. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("stdin closed.");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let reply = handle_line(&manager, line).await;
                let mut out = serde_json::to_string(&reply)?;
                out.push('\n');
                stdout.write_all(out.as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    maintenance.abort();
    if let Some(handle) = dashboard {
        handle.abort();
    }

    let flushed = manager.flush_pending_writes().await;
    let pending = manager.pending_count().await;
    if pending > 0 {
        warn!(pending, "Shutting down with unsettled placements");
    }
    info!(flushed, "Lane engine shut down cleanly.");

    Ok(())
}

async fn open_store(cfg: &AppConfig) -> Result<Arc<dyn LaneStore>> {
    let url = cfg.storage.database_url.trim();
    if url.is_empty() || url == "memory" {
        warn!("No database configured; lanes are kept in memory only");
        return Ok(Arc::new(MemoryLaneStore::new()));
    }
    let store = SqliteLaneStore::connect(url, cfg.storage.max_connections)
        .await
        .context("Failed to open lane store")?;
    Ok(Arc::new(store))
}

/// Parse and run one command line.
async fn handle_line(manager: &LaneManager, line: &str) -> Reply {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "Malformed command");
            return Reply::Error {
                error: format!("Malformed command: {e}"),
            };
        }
    };
    match execute(manager, command).await {
        Ok(reply) => reply,
        Err(e) => Reply::Error {
            error: e.to_string(),
        },
    }
}

async fn execute(manager: &LaneManager, command: Command) -> Result<Reply, LaneError> {
    match command {
        Command::Signal {
            account,
            symbol,
            direction,
            trade_id,
        } => {
            let direction: Direction = direction.parse()?;
            let mut req = TradeRequest::new(&account, &symbol, direction);
            if let Some(id) = trade_id {
                req = req.with_trade_id(&id);
            }
            Ok(Reply::Placement(manager.assign_trade(req).await?))
        }
        Command::Result {
            trade_id,
            outcome,
            pnl,
        } => {
            let outcome: TradeOutcome = outcome.parse()?;
            let effect = manager.handle_result(&trade_id, outcome, pnl).await?;
            Ok(Reply::Settled { trade_id, effect })
        }
        Command::Abandon { trade_id } => {
            Ok(Reply::Abandoned(manager.abandon_placement(&trade_id).await?))
        }
        Command::Balance { account, balance } => {
            manager.update_balance(&account, balance).await;
            Ok(Reply::Balance { account, balance })
        }
        Command::Settings { account, update } => {
            Ok(Reply::Settings(manager.update_settings(&account, update).await?))
        }
        Command::Close {
            lane_id,
            status,
            reason,
        } => {
            let status: LaneStatus = status.parse()?;
            let reason = reason.unwrap_or_else(|| "operator".to_string());
            Ok(Reply::Lane(manager.force_terminal(&lane_id, status, &reason).await?))
        }
        Command::Martingale { enabled } => {
            manager.set_martingale_enabled(enabled);
            Ok(Reply::Martingale { enabled })
        }
        Command::Statistics { account, days } => {
            let statistics = StatusReporter::new(manager.store())
                .lane_statistics(&account, days.unwrap_or(30))
                .await?;
            Ok(Reply::Statistics { account, statistics })
        }
    }
}

/// Initialise the `tracing` subscriber on stderr.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lane_engine=info"));

    let json_logging = std::env::var("LANE_ENGINE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
