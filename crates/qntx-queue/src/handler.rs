//! Handler registry (spec §4.4, C4).
//!
//! A handler exposes a stable name and an `execute(ctx, job) -> Result<()>`
//! contract. `Has(name)` must be checked before a scheduled job is created
//! so operators get early feedback when a plugin is disabled (spec §4.5,
//! §9 "the scheduler never creates a schedule pointing at a missing
//! handler").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use qntx_core::error::{QntxError, QntxResult};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::worker::JobHandle;

/// A named executable unit resolved at dispatch time.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, cancel: CancellationToken, job: &mut JobHandle) -> anyhow::Result<()>;
}

/// Name → handler mapping, read-mostly after boot.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
}

struct RegisteredHandler {
    handler: Arc<dyn Handler>,
    paused: bool,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        self.handlers.write().await.insert(
            name,
            RegisteredHandler {
                handler,
                paused: false,
            },
        );
    }

    /// Availability check mandated before scheduled-job creation.
    pub async fn has(&self, name: &str) -> bool {
        self.handlers
            .read()
            .await
            .get(name)
            .map(|h| !h.paused)
            .unwrap_or(false)
    }

    pub async fn get(&self, name: &str) -> QntxResult<Arc<dyn Handler>> {
        let handlers = self.handlers.read().await;
        match handlers.get(name) {
            Some(h) if !h.paused => Ok(h.handler.clone()),
            Some(_) => Err(QntxError::HandlerUnavailable(format!("{name} is paused"))),
            None => Err(QntxError::HandlerUnavailable(format!("no handler named {name}"))),
        }
    }

    pub async fn set_paused(&self, name: &str, paused: bool) -> QntxResult<()> {
        let mut handlers = self.handlers.write().await;
        let entry = handlers
            .get_mut(name)
            .ok_or_else(|| QntxError::NotFound(format!("handler {name}")))?;
        entry.paused = paused;
        Ok(())
    }

    pub async fn list_names(&self) -> Vec<(String, bool)> {
        self.handlers
            .read()
            .await
            .iter()
            .map(|(name, h)| (name.clone(), h.paused))
            .collect()
    }
}
