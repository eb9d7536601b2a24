use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::clients::Notifier;
use crate::scheduler::JobContext;
use crate::store::dao::{NotificationDao, OrderDetailDao};
use crate::store::models::{NotificationEdit, NotificationStatus, OrderDetailWithUserInfo};
use crate::store::params::OrderDetailListParams;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
}

/// 直近の時間窓内に作成され、まだ通知記録のない商品行へ評価依頼を送る。
///
/// 送信の成否に関わらず通知記録を 1 行作成する。記録の書き込みに失敗した
/// 場合は残りを処理せずエラーを返す（送信済みの行は次回再送されうる）。
pub struct NotificationDispatchStage {
    notifier: Arc<dyn Notifier>,
    details: Arc<dyn OrderDetailDao>,
    notifications: Arc<dyn NotificationDao>,
    window: Duration,
}

impl NotificationDispatchStage {
    #[must_use]
    pub fn new(
        notifier: Arc<dyn Notifier>,
        details: Arc<dyn OrderDetailDao>,
        notifications: Arc<dyn NotificationDao>,
        window: Duration,
    ) -> Self {
        Self {
            notifier,
            details,
            notifications,
            window,
        }
    }

    /// # Errors
    /// 対象行の照会、または通知記録の書き込みが失敗した場合。送信失敗そのものはエラーにしない。
    pub async fn dispatch_notifications(&self, job: &JobContext) -> Result<DispatchReport> {
        let window =
            chrono::Duration::from_std(self.window).context("notification window out of range")?;
        let created_after = Utc::now()
            .checked_sub_signed(window)
            .context("notification window out of range")?;

        let pending = self
            .details
            .list_details_without_notification(&OrderDetailListParams::created_since(created_after))
            .await
            .context("failed to list details without notification")?;

        let mut report = DispatchReport {
            pending: pending.len(),
            ..DispatchReport::default()
        };

        for detail in &pending {
            job.ensure_active()?;
            let status = self
                .dispatch_one(job, detail)
                .await
                .with_context(|| format!("failed to process notification for detail ID {}", detail.id))?;
            match status {
                NotificationStatus::Sent => report.sent += 1,
                NotificationStatus::Failed => report.failed += 1,
            }
        }

        info!(
            job_id = %job.job_id,
            pending = report.pending,
            sent = report.sent,
            failed = report.failed,
            "notifications dispatched"
        );
        Ok(report)
    }

    async fn dispatch_one(
        &self,
        job: &JobContext,
        detail: &OrderDetailWithUserInfo,
    ) -> Result<NotificationStatus> {
        let attempted_at = Utc::now();
        let status = match self
            .notifier
            .send_notification(
                &detail.external_order_id,
                &detail.user_phone,
                &detail.user_name,
                &detail.product_code,
            )
            .await
        {
            Ok(()) => NotificationStatus::Sent,
            Err(error) => {
                warn!(
                    job_id = %job.job_id,
                    detail_id = %detail.id,
                    external_order_id = %detail.external_order_id,
                    error = ?error,
                    "notification delivery failed"
                );
                NotificationStatus::Failed
            }
        };
        if let Some(metrics) = job.metrics() {
            metrics.record_notification(status);
        }

        self.notifications
            .create(&NotificationEdit::attempt(
                detail.id,
                detail.user_phone.clone(),
                status,
                attempted_at,
            ))
            .await
            .context("failed to create notification log")?;
        Ok(status)
    }
}
