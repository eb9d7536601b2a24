use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use crate::{
    api,
    clients::{MbBrokerClient, MbBrokerConfig, VoximplantClient, VoximplantConfig},
    config::Config,
    observability::Telemetry,
    pipeline::FeedbackPipeline,
    scheduler::Scheduler,
    store::dao::{PgStore, StoreHealth},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    scheduler: Scheduler,
    store_health: Arc<dyn StoreHealth>,
    database: Option<Arc<PgStore>>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.registry.scheduler
    }

    pub(crate) fn store_health(&self) -> Arc<dyn StoreHealth> {
        Arc::clone(&self.registry.store_health)
    }
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// プールは遅延接続なので、この時点ではデータベースに接続しない。
    ///
    /// # Errors
    /// Telemetry の初期化、プール設定、HTTP クライアント構築が失敗した場合はエラーを返す。
    pub fn build(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections())
            .min_connections(config.db_min_connections())
            .acquire_timeout(config.db_acquire_timeout())
            .idle_timeout(Some(config.db_idle_timeout()))
            .max_lifetime(Some(config.db_max_lifetime()))
            .test_before_acquire(true)
            .connect_lazy(config.database_dsn())
            .context("failed to configure database connection pool")?;
        let store = Arc::new(PgStore::new(pool));

        let fetcher = Arc::new(
            MbBrokerClient::new(broker_config(&config)).context("failed to build mb-broker client")?,
        );
        let notifier = Arc::new(
            VoximplantClient::new(voximplant_config(&config))
                .context("failed to build voximplant client")?,
        );

        let pipeline = Arc::new(FeedbackPipeline::new(
            fetcher,
            notifier,
            store.clone(),
            store.clone(),
            store.clone(),
            config.notification_window(),
        ));
        let scheduler = Scheduler::new(pipeline, telemetry.metrics_arc(), shutdown);

        let mut registry = Self::from_parts(config, telemetry, scheduler, store.clone());
        registry.database = Some(store);
        Ok(registry)
    }

    /// 組み立て済みの部品からレジストリを作る。
    #[must_use]
    pub fn from_parts(
        config: Arc<Config>,
        telemetry: Telemetry,
        scheduler: Scheduler,
        store_health: Arc<dyn StoreHealth>,
    ) -> Self {
        Self {
            config,
            telemetry,
            scheduler,
            store_health,
            database: None,
        }
    }

    /// `DB_RUN_MIGRATIONS` が有効なら組み込みマイグレーションを適用する。
    ///
    /// # Errors
    /// データベースに接続できない、またはマイグレーションが失敗した場合。
    pub async fn run_migrations(&self) -> Result<()> {
        match &self.database {
            Some(store) if self.config.db_run_migrations() => store.migrate().await,
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }
}

fn broker_config(config: &Config) -> MbBrokerConfig {
    MbBrokerConfig {
        base_url: config.broker_base_url().to_string(),
        token: config.broker_token().to_string(),
        provider_id: config.broker_provider_id().to_string(),
        page_size: config.broker_page_size(),
        max_pages: config.broker_max_pages(),
        connect_timeout: config.broker_connect_timeout(),
        total_timeout: config.broker_total_timeout(),
    }
}

fn voximplant_config(config: &Config) -> VoximplantConfig {
    VoximplantConfig {
        base_url: config.voximplant_base_url().to_string(),
        access_token: config.voximplant_token().to_string(),
        domain: config.voximplant_domain().to_string(),
        message_template_id: config.voximplant_template_id().to_string(),
        channel_id: config.voximplant_channel_id().to_string(),
        connect_timeout: config.voximplant_connect_timeout(),
        total_timeout: config.voximplant_total_timeout(),
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
