use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use super::phone::normalize_phone;
use crate::clients::OrderFetcher;
use crate::error::FeedbackError;
use crate::scheduler::JobContext;
use crate::store::dao::OrderDao;
use crate::store::models::OrderEdit;
use crate::store::params::OrderListParams;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub fetched: usize,
    pub already_known: usize,
    pub skipped_invalid: usize,
    pub inserted: usize,
}

/// 完了済み注文を取り込み、未登録のものだけを一括挿入する。
pub struct OrderIngestStage {
    fetcher: Arc<dyn OrderFetcher>,
    orders: Arc<dyn OrderDao>,
}

impl OrderIngestStage {
    #[must_use]
    pub fn new(fetcher: Arc<dyn OrderFetcher>, orders: Arc<dyn OrderDao>) -> Self {
        Self { fetcher, orders }
    }

    /// # Errors
    /// 取得・既存照会・一括挿入の失敗、または新規注文がすべて電話番号不正で
    /// 落ちた場合（[`FeedbackError::OrdersMissed`]）。
    pub async fn ingest_completed_orders(&self, job: &JobContext) -> Result<IngestReport> {
        job.ensure_active()?;
        let fetched = self
            .fetcher
            .fetch_completed_orders()
            .await
            .context("failed to fetch completed orders")?;

        let mut report = IngestReport {
            fetched: fetched.len(),
            ..IngestReport::default()
        };
        if fetched.is_empty() {
            info!(job_id = %job.job_id, "no completed orders fetched");
            return Ok(report);
        }

        let external_ids: Vec<String> = fetched
            .iter()
            .map(|order| order.external_order_id.clone())
            .collect();
        let (existing, _) = self
            .orders
            .list(&OrderListParams::by_external_ids(external_ids))
            .await
            .context("failed to fetch existing orders from DB")?;

        // First insertable occurrence wins. An ID is only marked once its phone normalises,
        // so a later valid copy still replaces an earlier invalid one.
        let mut seen: HashSet<String> = existing
            .into_iter()
            .map(|order| order.external_order_id)
            .collect();
        let mut to_insert = Vec::new();

        for order in fetched {
            if seen.contains(&order.external_order_id) {
                report.already_known += 1;
                continue;
            }
            match normalize_phone(&order.user_phone) {
                Ok(phone) => {
                    seen.insert(order.external_order_id.clone());
                    to_insert.push(OrderEdit::new(order.external_order_id, phone, order.user_name));
                }
                Err(error) => {
                    info!(
                        job_id = %job.job_id,
                        external_order_id = %order.external_order_id,
                        raw_phone = %order.user_phone,
                        %error,
                        "skipping order with invalid phone number"
                    );
                    report.skipped_invalid += 1;
                }
            }
        }

        if let Some(metrics) = job.metrics() {
            metrics.record_fetch(report.fetched, report.skipped_invalid);
        }

        if to_insert.is_empty() {
            if report.skipped_invalid > 0 {
                return Err(FeedbackError::OrdersMissed {
                    fetched: report.fetched,
                }
                .into());
            }
            debug!(job_id = %job.job_id, fetched = report.fetched, "all fetched orders already stored");
            return Ok(report);
        }

        job.ensure_active()?;
        let created = self
            .orders
            .create_batch(&to_insert)
            .await
            .context("failed to insert orders to DB")?;
        report.inserted = created.len();
        if let Some(metrics) = job.metrics() {
            metrics.record_orders_inserted(report.inserted);
        }

        info!(
            job_id = %job.job_id,
            fetched = report.fetched,
            already_known = report.already_known,
            skipped_invalid = report.skipped_invalid,
            inserted = report.inserted,
            "completed orders ingested"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use prometheus::Registry;
    use tracing_test::traced_test;

    use super::*;
    use crate::clients::FetchedOrder;
    use crate::observability::metrics::Metrics;
    use crate::pipeline::Stage;
    use crate::store::dao::MemoryStore;
    use crate::test_support::RecordingFetcher;

    fn stage(fetcher: &Arc<RecordingFetcher>, store: &Arc<MemoryStore>) -> OrderIngestStage {
        OrderIngestStage::new(
            Arc::clone(fetcher) as Arc<dyn OrderFetcher>,
            Arc::clone(store) as Arc<dyn OrderDao>,
        )
    }

    fn job() -> JobContext {
        JobContext::detached(Stage::IngestOrders)
    }

    async fn stored_orders(store: &MemoryStore) -> Vec<crate::store::models::Order> {
        OrderDao::list(store, &OrderListParams::default())
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn second_run_over_same_fetch_inserts_nothing() {
        let fetcher = Arc::new(RecordingFetcher::with_orders(vec![
            FetchedOrder::new("ORD1", "77011234567", "Anna"),
            FetchedOrder::new("ORD2", "7012345678", "Bek"),
        ]));
        let store = Arc::new(MemoryStore::new());
        let stage = stage(&fetcher, &store);

        let first = stage.ingest_completed_orders(&job()).await.unwrap();
        assert_eq!(first.inserted, 2);

        let second = stage.ingest_completed_orders(&job()).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.already_known, 2);
        assert_eq!(stored_orders(&store).await.len(), 2);
        assert_eq!(store.order_batch_calls(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn bad_phone_is_skipped_and_others_inserted() {
        let fetcher = Arc::new(RecordingFetcher::with_orders(vec![
            FetchedOrder::new("ORD1", "77011234567", "Anna"),
            FetchedOrder::new("ORD2", "12345", "Bek"),
            FetchedOrder::new("ORD3", "7012345678", "Cem"),
        ]));
        let store = Arc::new(MemoryStore::new());

        let report = stage(&fetcher, &store)
            .ingest_completed_orders(&job())
            .await
            .unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped_invalid, 1);
        let phones: Vec<String> = stored_orders(&store)
            .await
            .into_iter()
            .map(|o| o.user_phone)
            .collect();
        assert_eq!(phones, vec!["+77011234567", "+77012345678"]);
        assert!(logs_contain("skipping order with invalid phone number"));
        assert!(logs_contain("ORD2"));
    }

    #[tokio::test]
    async fn all_known_orders_succeed_without_insert_call() {
        let store = Arc::new(MemoryStore::new());
        OrderDao::create(&*store, &OrderEdit::new("ORD1", "+77011234567", "Anna"))
            .await
            .unwrap();
        let calls_before = store.order_batch_calls();
        let fetcher = Arc::new(RecordingFetcher::with_orders(vec![FetchedOrder::new(
            "ORD1",
            "77011234567",
            "Anna",
        )]));

        let report = stage(&fetcher, &store)
            .ingest_completed_orders(&job())
            .await
            .expect("all-known is not an error");

        assert_eq!(report.already_known, 1);
        assert_eq!(store.order_batch_calls(), calls_before);
    }

    #[tokio::test]
    async fn all_new_orders_dropped_is_orders_missed() {
        let fetcher = Arc::new(RecordingFetcher::with_orders(vec![
            FetchedOrder::new("ORD1", "1", "Anna"),
            FetchedOrder::new("ORD2", "2", "Bek"),
        ]));
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).unwrap());
        let job = job().with_metrics(Arc::clone(&metrics));

        let error = stage(&fetcher, &store)
            .ingest_completed_orders(&job)
            .await
            .expect_err("all new orders dropped");

        assert!(matches!(
            error.downcast_ref::<FeedbackError>(),
            Some(FeedbackError::OrdersMissed { fetched: 2 })
        ));
        assert!(stored_orders(&store).await.is_empty());
        assert_eq!(metrics.orders_fetched.get() as u64, 2);
        assert_eq!(metrics.orders_skipped_invalid_phone.get() as u64, 2);
        assert_eq!(metrics.orders_inserted.get() as u64, 0);
    }

    #[tokio::test]
    async fn empty_fetch_is_trivial_success() {
        let fetcher = Arc::new(RecordingFetcher::with_orders(Vec::new()));
        let store = Arc::new(MemoryStore::new());

        let report = stage(&fetcher, &store)
            .ingest_completed_orders(&job())
            .await
            .unwrap();
        assert_eq!(report, IngestReport::default());
        assert_eq!(store.order_batch_calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_external_ids_in_one_fetch_keep_first() {
        let fetcher = Arc::new(RecordingFetcher::with_orders(vec![
            FetchedOrder::new("ORD1", "77011234567", "Anna"),
            FetchedOrder::new("ORD1", "7019999999", "Impostor"),
        ]));
        let store = Arc::new(MemoryStore::new());

        let report = stage(&fetcher, &store)
            .ingest_completed_orders(&job())
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.already_known, 1);
        assert_eq!(stored_orders(&store).await[0].user_name, "Anna");
    }

    #[tokio::test]
    async fn valid_copy_after_invalid_duplicate_is_inserted() {
        let fetcher = Arc::new(RecordingFetcher::with_orders(vec![
            FetchedOrder::new("ORD1", "bad", "Anna"),
            FetchedOrder::new("ORD1", "77011234567", "Anna"),
        ]));
        let store = Arc::new(MemoryStore::new());

        let report = stage(&fetcher, &store)
            .ingest_completed_orders(&job())
            .await
            .expect("valid duplicate is insertable");

        assert_eq!(report.skipped_invalid, 1);
        assert_eq!(report.already_known, 0);
        assert_eq!(report.inserted, 1);
        let stored = stored_orders(&store).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].user_phone, "+77011234567");
    }

    #[tokio::test]
    async fn fetch_failure_propagates() {
        let fetcher = Arc::new(RecordingFetcher::with_orders(Vec::new()));
        fetcher.fail_order_listing();
        let store = Arc::new(MemoryStore::new());

        let error = stage(&fetcher, &store)
            .ingest_completed_orders(&job())
            .await
            .expect_err("fetch failure");
        assert!(format!("{error:#}").contains("failed to fetch completed orders"));
    }
}
