//! Three-stage reconciliation pipeline: order ingestion, product-detail backfill
//! and notification dispatch. Each stage is independently triggerable and safe to
//! re-run; the scheduler guarantees a stage never overlaps with itself.

pub mod backfill;
pub mod dispatch;
pub mod ingest;
pub mod phone;

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::clients::{Notifier, OrderFetcher};
use crate::scheduler::JobContext;
use crate::store::dao::{NotificationDao, OrderDao, OrderDetailDao};

pub use backfill::{BackfillReport, DetailBackfillStage};
pub use dispatch::{DispatchReport, NotificationDispatchStage};
pub use ingest::{IngestReport, OrderIngestStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    IngestOrders,
    BackfillDetails,
    DispatchNotifications,
}

impl Stage {
    pub const ALL: [Stage; 3] = [
        Stage::IngestOrders,
        Stage::BackfillDetails,
        Stage::DispatchNotifications,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IngestOrders => "ingest_orders",
            Self::BackfillDetails => "backfill_details",
            Self::DispatchNotifications => "dispatch_notifications",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
            .ok_or_else(|| anyhow::anyhow!("unknown stage: {value}"))
    }
}

/// Outcome summary of one stage run, used for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageReport {
    Ingest(IngestReport),
    Backfill(BackfillReport),
    Dispatch(DispatchReport),
}

/// Runs one stage to completion for a job.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, job: &JobContext) -> Result<StageReport>;
}

/// Wires the three stages over shared capabilities.
pub struct FeedbackPipeline {
    ingest: OrderIngestStage,
    backfill: DetailBackfillStage,
    dispatch: NotificationDispatchStage,
}

impl FeedbackPipeline {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn OrderFetcher>,
        notifier: Arc<dyn Notifier>,
        orders: Arc<dyn OrderDao>,
        details: Arc<dyn OrderDetailDao>,
        notifications: Arc<dyn NotificationDao>,
        notification_window: Duration,
    ) -> Self {
        Self {
            ingest: OrderIngestStage::new(Arc::clone(&fetcher), Arc::clone(&orders)),
            backfill: DetailBackfillStage::new(fetcher, orders, Arc::clone(&details)),
            dispatch: NotificationDispatchStage::new(
                notifier,
                details,
                notifications,
                notification_window,
            ),
        }
    }
}

#[async_trait]
impl StageRunner for FeedbackPipeline {
    async fn run(&self, job: &JobContext) -> Result<StageReport> {
        match job.stage {
            Stage::IngestOrders => self
                .ingest
                .ingest_completed_orders(job)
                .await
                .map(StageReport::Ingest),
            Stage::BackfillDetails => self
                .backfill
                .backfill_product_details(job)
                .await
                .map(StageReport::Backfill),
            Stage::DispatchNotifications => self
                .dispatch
                .dispatch_notifications(job)
                .await
                .map(StageReport::Dispatch),
        }
    }
}
