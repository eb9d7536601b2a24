//! Prometheusメトリクス定義。
use std::{sync::Arc, time::Duration};

use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry,
};

use crate::pipeline::{Stage, StageReport};
use crate::store::models::NotificationStatus;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub stage_runs: CounterVec,
    pub orders_fetched: Counter,
    pub orders_inserted: Counter,
    pub orders_skipped_invalid_phone: Counter,
    pub details_inserted: Counter,
    pub notifications: CounterVec,

    // ヒストグラム
    pub stage_duration: HistogramVec,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同名のメトリクスが既にレジストリに登録されている場合。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            stage_runs: register_counter_vec_with_registry!(
                Opts::new(
                    "feedback_stage_runs_total",
                    "Total number of stage runs by outcome"
                ),
                &["stage", "outcome"],
                registry
            )?,
            orders_fetched: register_counter_with_registry!(
                "feedback_orders_fetched_total",
                "Total number of completed orders fetched from the broker",
                registry
            )?,
            orders_inserted: register_counter_with_registry!(
                "feedback_orders_inserted_total",
                "Total number of orders inserted",
                registry
            )?,
            orders_skipped_invalid_phone: register_counter_with_registry!(
                "feedback_orders_skipped_invalid_phone_total",
                "Total number of fetched orders skipped for an invalid phone number",
                registry
            )?,
            details_inserted: register_counter_with_registry!(
                "feedback_details_inserted_total",
                "Total number of order details inserted",
                registry
            )?,
            notifications: register_counter_vec_with_registry!(
                Opts::new(
                    "feedback_notifications_total",
                    "Total number of notification attempts by recorded status"
                ),
                &["status"],
                registry
            )?,
            stage_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "feedback_stage_duration_seconds",
                    "Stage run duration in seconds"
                )
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]),
                &["stage"],
                registry
            )?,
        })
    }

    /// ステージ実行 1 回分の所要時間と成否を記録する。
    ///
    /// 件数系のカウンターはステージが項目ごとに更新する。途中で失敗した実行でも
    /// それまでの処理分は計上済み。
    pub fn observe_stage(
        &self,
        stage: Stage,
        elapsed: Duration,
        outcome: &anyhow::Result<StageReport>,
    ) {
        self.stage_duration
            .with_label_values(&[stage.as_str()])
            .observe(elapsed.as_secs_f64());

        let label = if outcome.is_ok() { "success" } else { "failure" };
        self.stage_runs
            .with_label_values(&[stage.as_str(), label])
            .inc();
    }

    pub fn record_fetch(&self, fetched: usize, skipped_invalid: usize) {
        self.orders_fetched.inc_by(count(fetched));
        self.orders_skipped_invalid_phone
            .inc_by(count(skipped_invalid));
    }

    pub fn record_orders_inserted(&self, inserted: usize) {
        self.orders_inserted.inc_by(count(inserted));
    }

    pub fn record_details_inserted(&self, inserted: usize) {
        self.details_inserted.inc_by(count(inserted));
    }

    /// 送信試行 1 件を結果別に数える。
    pub fn record_notification(&self, status: NotificationStatus) {
        self.notifications
            .with_label_values(&[status.as_str()])
            .inc();
    }
}

#[allow(clippy::cast_precision_loss)]
fn count(n: usize) -> f64 {
    n as f64
}
