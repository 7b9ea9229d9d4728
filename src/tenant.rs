use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reconcile;

/// Manages per-tenant engines. Each tenant gets its own Engine + journal +
/// reconciler + compactor. Tenant = organization key from the caller.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    config: EngineConfig,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            config,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let journal_path = self.data_dir.join(format!("{safe_name}.journal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(
            journal_path,
            self.config.clone(),
            notify,
        )?);

        // Spawn reconciler + compactor for this tenant
        let reconcile_engine = engine.clone();
        tokio::spawn(async move {
            reconcile::run_reconciler(reconcile_engine).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.config.compact_threshold;
        tokio::spawn(async move {
            reconcile::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
