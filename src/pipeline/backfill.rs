use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::clients::OrderFetcher;
use crate::scheduler::JobContext;
use crate::store::dao::{OrderDao, OrderDetailDao};
use crate::store::models::{Order, OrderDetailEdit};
use crate::store::params::OrderListParams;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub orders_missing: usize,
    pub orders_backfilled: usize,
    pub orders_without_codes: usize,
    pub details_inserted: usize,
}

/// 商品行を持たない注文について商品コードを取得し、商品行を作成する。
///
/// 途中の注文で失敗した場合は残りを処理せずエラーを返す。処理済みの注文は
/// 保存されたまま残り、次回の実行では未処理の注文だけが再選択される。
pub struct DetailBackfillStage {
    fetcher: Arc<dyn OrderFetcher>,
    orders: Arc<dyn OrderDao>,
    details: Arc<dyn OrderDetailDao>,
}

impl DetailBackfillStage {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn OrderFetcher>,
        orders: Arc<dyn OrderDao>,
        details: Arc<dyn OrderDetailDao>,
    ) -> Self {
        Self {
            fetcher,
            orders,
            details,
        }
    }

    /// # Errors
    /// 対象注文の照会、商品コード取得、商品行挿入のいずれかが失敗した場合。
    pub async fn backfill_product_details(&self, job: &JobContext) -> Result<BackfillReport> {
        let missing = self
            .orders
            .list_orders_without_details(&OrderListParams::default())
            .await
            .context("failed to list orders without details")?;

        let mut report = BackfillReport {
            orders_missing: missing.len(),
            ..BackfillReport::default()
        };

        for order in &missing {
            job.ensure_active()?;
            let inserted = self.backfill_order(order).await.with_context(|| {
                format!("failed to process missing order {}", order.external_order_id)
            })?;
            if inserted == 0 {
                debug!(
                    job_id = %job.job_id,
                    external_order_id = %order.external_order_id,
                    "broker returned no product codes; order stays pending"
                );
                report.orders_without_codes += 1;
            } else {
                if let Some(metrics) = job.metrics() {
                    metrics.record_details_inserted(inserted);
                }
                report.orders_backfilled += 1;
                report.details_inserted += inserted;
            }
        }

        info!(
            job_id = %job.job_id,
            orders_missing = report.orders_missing,
            orders_backfilled = report.orders_backfilled,
            details_inserted = report.details_inserted,
            "product details backfilled"
        );
        Ok(report)
    }

    async fn backfill_order(&self, order: &Order) -> Result<usize> {
        let codes = self
            .fetcher
            .fetch_product_codes(&order.external_order_id)
            .await
            .with_context(|| {
                format!(
                    "failed to fetch product codes for order {}",
                    order.external_order_id
                )
            })?;
        if codes.is_empty() {
            return Ok(0);
        }

        let edits: Vec<OrderDetailEdit> = codes
            .into_iter()
            .map(|code| OrderDetailEdit::new(order.id, code))
            .collect();
        let created = self.details.create_batch(&edits).await.with_context(|| {
            format!(
                "failed to create order details for order {}",
                order.external_order_id
            )
        })?;
        Ok(created.len())
    }
}
