use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

struct Tenant {
    engine: Arc<Engine>,
    compactor: JoinHandle<()>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(t) = self.tenants.get(tenant) {
            return Ok(t.engine.clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Tenant names become file names.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to open the same tenant; the entry lock
        // makes sure only one engine (and one WAL writer) exists.
        let entry = self.tenants.entry(tenant.to_string()).or_try_insert_with(|| {
            let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
            let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
            let compactor = tokio::spawn(compactor::run_compactor(
                engine.clone(),
                self.compact_threshold,
            ));
            info!("tenant {safe_name} opened");
            Ok::<_, io::Error>(Tenant { engine, compactor })
        })?;
        let engine = entry.engine.clone();
        drop(entry);

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Stop every compactor and close every engine, flushing its WAL.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.tenants.iter().map(|t| t.key().clone()).collect();
        for name in names {
            let Some((_, tenant)) = self.tenants.remove(&name) else {
                continue;
            };
            tenant.compactor.abort();
            if let Err(e) = tenant.engine.shutdown().await {
                warn!("tenant {name}: shutdown failed: {e}");
            }
        }
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(0.0);
        info!("all tenants closed");
    }
}
