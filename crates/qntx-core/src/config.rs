//! Typed configuration (spec §6 "Config").
//!
//! Loaded once from the environment at boot (mirroring
//! `ob-poc-web/src/main.rs`'s `DATABASE_URL`/`SERVER_PORT` reads), then
//! exposed read-mostly through `AppConfig`. Individual keys can be updated
//! at runtime via `/api/config` (validated against [`ConfigKey::validate`]);
//! the config watcher task (spec §4.9 step 7) polls for out-of-band changes
//! to the backing environment/file and is stopped as part of drain.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{QntxError, QntxResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub server_port: u16,
    pub worker_pool_size: usize,
    pub sync_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub worker_stop_timeout_secs: u64,
    pub peers: HashMap<String, String>,
    pub budget_limit: f64,
}

impl AppConfig {
    /// Loads configuration from environment variables, applying the same
    /// defaults the teacher's server binary uses for `SERVER_PORT`.
    pub fn from_env() -> QntxResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///qntx".to_string());
        let server_port = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let worker_pool_size = std::env::var("QNTX_WORKER_POOL_SIZE")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4);
        let sync_interval_secs = std::env::var("QNTX_SYNC_INTERVAL_SECS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(60);
        let shutdown_timeout_secs = std::env::var("QNTX_SHUTDOWN_TIMEOUT_SECS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(60);
        let worker_stop_timeout_secs = std::env::var("QNTX_WORKER_STOP_TIMEOUT_SECS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(20);
        let peers = std::env::var("QNTX_PEERS")
            .ok()
            .map(|raw| parse_peers(&raw))
            .unwrap_or_default();
        let budget_limit = std::env::var("QNTX_BUDGET_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000.0);

        Ok(Self {
            database_url,
            server_port,
            worker_pool_size,
            sync_interval_secs,
            shutdown_timeout_secs,
            worker_stop_timeout_secs,
            peers,
            budget_limit,
        })
    }

    /// Applies a validated single-key update (`PATCH /api/config`).
    pub fn apply(&mut self, key: &str, value: &str) -> QntxResult<()> {
        ConfigKey::parse(key)?.validate(value)?;
        match key {
            "server_port" => self.server_port = value.parse().unwrap(),
            "worker_pool_size" => self.worker_pool_size = value.parse().unwrap(),
            "sync_interval_secs" => self.sync_interval_secs = value.parse().unwrap(),
            "shutdown_timeout_secs" => self.shutdown_timeout_secs = value.parse().unwrap(),
            "worker_stop_timeout_secs" => self.worker_stop_timeout_secs = value.parse().unwrap(),
            "budget_limit" => self.budget_limit = value.parse().unwrap(),
            _ => return Err(QntxError::InvalidRequest(format!("unknown config key {key}"))),
        }
        Ok(())
    }
}

fn parse_peers(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, url)| (name.trim().to_string(), url.trim().to_string()))
        .collect()
}

/// Per-key validation table backing `/api/config` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    ServerPort,
    WorkerPoolSize,
    SyncIntervalSecs,
    ShutdownTimeoutSecs,
    WorkerStopTimeoutSecs,
    BudgetLimit,
}

impl ConfigKey {
    pub fn parse(key: &str) -> QntxResult<Self> {
        match key {
            "server_port" => Ok(Self::ServerPort),
            "worker_pool_size" => Ok(Self::WorkerPoolSize),
            "sync_interval_secs" => Ok(Self::SyncIntervalSecs),
            "shutdown_timeout_secs" => Ok(Self::ShutdownTimeoutSecs),
            "worker_stop_timeout_secs" => Ok(Self::WorkerStopTimeoutSecs),
            "budget_limit" => Ok(Self::BudgetLimit),
            other => Err(QntxError::InvalidRequest(format!("unknown config key {other}"))),
        }
    }

    pub fn validate(self, value: &str) -> QntxResult<()> {
        let err = || QntxError::ValidationError(format!("invalid value {value:?} for config key"));
        match self {
            Self::ServerPort => {
                value.parse::<u16>().map_err(|_| err())?;
            }
            Self::WorkerPoolSize => {
                let n: usize = value.parse().map_err(|_| err())?;
                if n == 0 {
                    return Err(err());
                }
            }
            Self::SyncIntervalSecs | Self::ShutdownTimeoutSecs | Self::WorkerStopTimeoutSecs => {
                let n: u64 = value.parse().map_err(|_| err())?;
                if n == 0 {
                    return Err(err());
                }
            }
            Self::BudgetLimit => {
                let n: f64 = value.parse().map_err(|_| err())?;
                if !n.is_finite() || n < 0.0 {
                    return Err(err());
                }
            }
        }
        Ok(())
    }
}
