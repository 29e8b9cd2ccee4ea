//! Server Supervisor (C6): a keyed collection of listeners exposing a
//! uniform `add`/`delete`/`list`/`close_all` contract.

use crate::core::listener::ManagedListener;
use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;

#[derive(Default)]
pub struct Supervisor {
    listeners: RwLock<HashMap<String, Arc<dyn ManagedListener>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers and starts `listener` under its own address. Fails if
    /// the address is already present.
    pub async fn add(&self, listener: Arc<dyn ManagedListener>) -> Result<()> {
        let addr = listener.addr().to_string();
        let mut map = self.listeners.write().await;
        if map.contains_key(&addr) {
            return Err(ProxyError::Config(format!("listener already registered for {addr}")));
        }
        listener.clone().start().await?;
        map.insert(addr, listener);
        Ok(())
    }

    pub async fn delete(&self, addr: &str) -> Result<()> {
        let listener = self.listeners.write().await.remove(addr);
        match listener {
            Some(listener) => listener.close().await,
            None => Ok(()),
        }
    }

    pub async fn list(&self) -> Vec<(String, &'static str)> {
        self.listeners
            .read()
            .await
            .values()
            .map(|l| (l.addr().to_string(), l.kind()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Best-effort: attempts every listener even if some fail, and
    /// collects the failures rather than stopping early.
    pub async fn close_all(&self) -> Vec<(String, ProxyError)> {
        let snapshot: Vec<(String, Arc<dyn ManagedListener>)> = {
            let map = self.listeners.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut failures = Vec::new();
        for (addr, listener) in snapshot {
            if let Err(err) = listener.close().await {
                error!("[Supervisor] failed to close listener {}: {}", addr, err);
                failures.push((addr, err));
            }
        }

        self.listeners.write().await.clear();
        failures
    }
}
