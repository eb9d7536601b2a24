use std::{sync::Arc, time::Duration};

use prometheus::Registry;
use tokio_util::sync::CancellationToken;

use feedback_worker::{
    clients::FetchedOrder,
    observability::metrics::Metrics,
    pipeline::{FeedbackPipeline, Stage, StageReport},
    scheduler::Scheduler,
    store::{
        dao::{MemoryStore, NotificationDao, OrderDao, OrderDetailDao},
        models::NotificationStatus,
        params::{NotificationListParams, OrderDetailListParams, OrderListParams},
    },
    test_support::{RecordingFetcher, RecordingNotifier},
};

const WINDOW: Duration = Duration::from_secs(3600);

struct Harness {
    store: Arc<MemoryStore>,
    fetcher: Arc<RecordingFetcher>,
    notifier: Arc<RecordingNotifier>,
    scheduler: Scheduler,
    metrics: Arc<Metrics>,
}

impl Harness {
    fn new(fetcher: RecordingFetcher) -> Self {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(fetcher);
        let notifier = Arc::new(RecordingNotifier::new());
        let pipeline = Arc::new(FeedbackPipeline::new(
            fetcher.clone(),
            notifier.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            WINDOW,
        ));
        let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).expect("metrics register"));
        let scheduler = Scheduler::new(pipeline, Arc::clone(&metrics), CancellationToken::new());
        Self {
            store,
            fetcher,
            notifier,
            scheduler,
            metrics,
        }
    }

    async fn run(&self, stage: Stage) -> StageReport {
        self.scheduler
            .submit(stage)
            .wait()
            .await
            .unwrap_or_else(|error| panic!("{stage} failed: {error:#}"))
    }

    fn orders(&self) -> &dyn OrderDao {
        &*self.store
    }

    fn details(&self) -> &dyn OrderDetailDao {
        &*self.store
    }

    fn notifications(&self) -> &dyn NotificationDao {
        &*self.store
    }
}

#[tokio::test]
async fn full_cycle_notifies_every_product_once() {
    let harness = Harness::new(
        RecordingFetcher::with_orders(vec![FetchedOrder::new("ORD1", "77011234567", "Anna")])
            .with_product_codes("ORD1", &["P1", "P2"]),
    );

    let StageReport::Ingest(ingest) = harness.run(Stage::IngestOrders).await else {
        panic!("unexpected report");
    };
    assert_eq!(ingest.inserted, 1);

    let (orders, _) = harness
        .orders()
        .list(&OrderListParams::default())
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].external_order_id, "ORD1");
    assert_eq!(orders[0].user_phone, "+77011234567");
    assert_eq!(orders[0].user_name, "Anna");

    let StageReport::Backfill(backfill) = harness.run(Stage::BackfillDetails).await else {
        panic!("unexpected report");
    };
    assert_eq!(backfill.details_inserted, 2);

    let StageReport::Dispatch(dispatch) = harness.run(Stage::DispatchNotifications).await else {
        panic!("unexpected report");
    };
    assert_eq!(dispatch.sent, 2);
    assert_eq!(dispatch.failed, 0);

    let attempts = harness.notifier.attempts();
    let mut products: Vec<&str> = attempts
        .iter()
        .map(|sent| sent.product_code.as_str())
        .collect();
    products.sort_unstable();
    assert_eq!(products, ["P1", "P2"]);
    assert!(attempts.iter().all(|sent| sent.user_phone == "+77011234567"));
    assert!(attempts.iter().all(|sent| sent.order_external_id == "ORD1"));

    let (logs, total) = harness
        .notifications()
        .list(&NotificationListParams::default())
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert!(logs.iter().all(|log| log.status == NotificationStatus::Sent));
    assert!(logs.iter().all(|log| log.sent_at.is_some()));

    assert_eq!(
        harness.metrics.notifications.with_label_values(&["sent"]).get() as u64,
        2
    );
}

#[tokio::test]
async fn rerunning_every_stage_is_a_no_op() {
    let harness = Harness::new(
        RecordingFetcher::with_orders(vec![FetchedOrder::new("ORD1", "7011234567", "Anna")])
            .with_product_codes("ORD1", &["P1"]),
    );

    for stage in Stage::ALL {
        harness.run(stage).await;
    }
    for stage in Stage::ALL {
        harness.run(stage).await;
    }

    let (_, orders) = harness
        .orders()
        .list(&OrderListParams::default())
        .await
        .unwrap();
    let (_, details) = harness
        .details()
        .list(&OrderDetailListParams::default())
        .await
        .unwrap();
    let (_, notifications) = harness
        .notifications()
        .list(&NotificationListParams::default())
        .await
        .unwrap();
    assert_eq!((orders, details, notifications), (1, 1, 1));
    assert_eq!(harness.notifier.attempts().len(), 1);
    assert_eq!(harness.fetcher.code_requests(), ["ORD1"]);
}

#[tokio::test]
async fn failed_delivery_is_recorded_and_not_retried() {
    let harness = Harness::new(
        RecordingFetcher::with_orders(vec![FetchedOrder::new("ORD1", "77011234567", "Anna")])
            .with_product_codes("ORD1", &["P1", "P2"]),
    );
    harness.notifier.fail_for_product("P2");

    harness.run(Stage::IngestOrders).await;
    harness.run(Stage::BackfillDetails).await;
    let StageReport::Dispatch(first) = harness.run(Stage::DispatchNotifications).await else {
        panic!("unexpected report");
    };
    assert_eq!((first.sent, first.failed), (1, 1));

    let StageReport::Dispatch(second) = harness.run(Stage::DispatchNotifications).await else {
        panic!("unexpected report");
    };
    assert_eq!(second.pending, 0);
    assert_eq!(harness.notifier.attempts().len(), 2);

    let failed = NotificationListParams {
        status: Some(NotificationStatus::Failed),
        ..NotificationListParams::default()
    };
    let (logs, _) = harness.notifications().list(&failed).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].phone_number, "+77011234567");
    assert!(logs[0].sent_at.is_some());
}

#[tokio::test]
async fn orders_arriving_later_flow_through_on_next_run() {
    let harness = Harness::new(
        RecordingFetcher::with_orders(vec![FetchedOrder::new("ORD1", "77011234567", "Anna")])
            .with_product_codes("ORD1", &["P1"])
            .with_product_codes("ORD2", &["P9"]),
    );

    for stage in Stage::ALL {
        harness.run(stage).await;
    }

    harness.fetcher.set_orders(vec![
        FetchedOrder::new("ORD1", "77011234567", "Anna"),
        FetchedOrder::new("ORD2", "7051112233", "Timur"),
    ]);
    let StageReport::Ingest(ingest) = harness.run(Stage::IngestOrders).await else {
        panic!("unexpected report");
    };
    assert_eq!((ingest.already_known, ingest.inserted), (1, 1));

    harness.run(Stage::BackfillDetails).await;
    harness.run(Stage::DispatchNotifications).await;

    let attempts = harness.notifier.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].order_external_id, "ORD2");
    assert_eq!(attempts[1].user_phone, "+77051112233");
    assert_eq!(attempts[1].product_code, "P9");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ingestion_triggers_insert_once() {
    let harness = Harness::new(RecordingFetcher::with_orders(vec![
        FetchedOrder::new("ORD1", "77011234567", "Anna"),
        FetchedOrder::new("ORD2", "77021234567", "Dana"),
    ]));

    let handles: Vec<_> = (0..4)
        .map(|_| harness.scheduler.submit(Stage::IngestOrders))
        .collect();
    let mut inserted = 0;
    for handle in handles {
        if let StageReport::Ingest(report) = handle.wait().await.expect("ingestion succeeds") {
            inserted += report.inserted;
        }
    }

    assert_eq!(inserted, 2);
    assert_eq!(harness.store.order_batch_calls(), 1);
    let (_, total) = harness
        .orders()
        .list(&OrderListParams::default())
        .await
        .unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn failed_backfill_keeps_counts_for_finished_orders() {
    let harness = Harness::new(
        RecordingFetcher::with_orders(vec![
            FetchedOrder::new("ORD1", "77011234567", "Anna"),
            FetchedOrder::new("ORD2", "77021234567", "Dana"),
        ])
        .with_product_codes("ORD1", &["P1", "P2"]),
    );
    harness.fetcher.fail_product_codes_for("ORD2");

    harness.run(Stage::IngestOrders).await;
    let error = harness
        .scheduler
        .submit(Stage::BackfillDetails)
        .wait()
        .await
        .expect_err("ORD2 product codes fail");
    assert!(format!("{error:#}").contains("ORD2"));

    assert_eq!(harness.metrics.orders_inserted.get() as u64, 2);
    assert_eq!(harness.metrics.details_inserted.get() as u64, 2);
    assert_eq!(
        harness
            .metrics
            .stage_runs
            .with_label_values(&["backfill_details", "failure"])
            .get() as u64,
        1
    );
}
