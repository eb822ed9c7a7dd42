//! Shared handles every operation runs against.

use std::sync::Arc;

use anyhow::{Context, Result};
use mailroom_backend_memory::MemoryBackend;
use mailroom_backend_postgres::PostgresBackend;
use mailroom_backend_redis::RedisBackend;
use mailroom_core_backend::CoreBackend;
use mailroom_flows::FlowEngine;
use mailroom_flows::basic::BasicEngine;
use mailroom_kv_backend::KvBackend;
use mailroom_models::OrgID;
use tracing::info;

use crate::assets::{AssetsCache, AssetsResult, OrgAssets};
use crate::config::Config;
use crate::ivr::ServiceRegistry;

/// `MAILROOM_DB` value selecting the in-process store.
pub const MEMORY_DB: &str = "memory";

#[derive(Clone)]
pub struct Runtime {
    pub db: Box<dyn CoreBackend>,
    pub kv: Box<dyn KvBackend>,
    pub engine: Arc<dyn FlowEngine>,
    pub config: Arc<Config>,
    pub assets: AssetsCache,
    pub ivr: ServiceRegistry,
}

impl Runtime {
    pub fn new(
        db: Box<dyn CoreBackend>,
        kv: Box<dyn KvBackend>,
        engine: Arc<dyn FlowEngine>,
        config: Config,
    ) -> Self {
        Self {
            db,
            kv,
            engine,
            assets: AssetsCache::new(config.assets_ttl),
            config: Arc::new(config),
            ivr: ServiceRegistry::standard(),
        }
    }

    pub fn with_ivr(mut self, ivr: ServiceRegistry) -> Self {
        self.ivr = ivr;
        self
    }

    /// Connect the backends named by the configuration.
    pub async fn connect(config: Config) -> Result<Self> {
        mailroom_models::uuids::seed(config.uuid_seed);
        let engine: Arc<dyn FlowEngine> = Arc::new(BasicEngine::new());

        if config.db_url == MEMORY_DB {
            info!("using in-memory store");
            let memory = MemoryBackend::new();
            return Ok(Self::new(
                Box::new(memory.clone()),
                Box::new(memory),
                engine,
                config,
            ));
        }

        let mut db = PostgresBackend::connect(&config.db_url)
            .await
            .context("failed to connect to MAILROOM_DB")?;
        if let Some(readonly) = &config.readonly_db_url {
            db = db
                .connect_readonly(readonly)
                .await
                .context("failed to connect to MAILROOM_READONLY_DB")?;
        }
        let kv = RedisBackend::connect(&config.redis_url)
            .await
            .context("failed to connect to MAILROOM_REDIS")?;
        kv.ping().await.context("MAILROOM_REDIS ping failed")?;
        info!(readonly = config.readonly_db_url.is_some(), "connected to postgres and redis");

        Ok(Self::new(Box::new(db), Box::new(kv), engine, config))
    }

    /// Assets snapshot of an org, loading it on first use.
    pub async fn org_assets(&self, org_id: OrgID) -> AssetsResult<Arc<OrgAssets>> {
        self.assets.get(self.db.as_ref(), org_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory_store() {
        let rt = Runtime::connect(Config::test_config()).await.unwrap();
        assert_eq!(rt.config.domain, "mailroom.test");

        let err = rt.org_assets(OrgID(1)).await.unwrap_err();
        assert!(err.is_not_found());

        rt.kv.set_nx("k", "v", std::time::Duration::from_secs(5)).await.unwrap();
        assert_eq!(rt.kv.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
