pub mod mb_broker;
pub mod voximplant;

use anyhow::Result;
use async_trait::async_trait;

pub use mb_broker::{MbBrokerClient, MbBrokerConfig};
pub use voximplant::{VoximplantClient, VoximplantConfig};

/// ブローカーから取得した完了済み注文（電話番号は未正規化）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedOrder {
    pub external_order_id: String,
    pub user_phone: String,
    pub user_name: String,
}

impl FetchedOrder {
    #[must_use]
    pub fn new(
        external_order_id: impl Into<String>,
        user_phone: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            external_order_id: external_order_id.into(),
            user_phone: user_phone.into(),
            user_name: user_name.into(),
        }
    }
}

/// 外部ブローカーからの注文取得。
#[async_trait]
pub trait OrderFetcher: Send + Sync {
    /// 現在完了状態の注文をすべて返す。ページングは実装側で処理する。
    async fn fetch_completed_orders(&self) -> Result<Vec<FetchedOrder>>;

    async fn fetch_product_codes(&self, external_order_id: &str) -> Result<Vec<String>>;
}

/// 評価依頼テンプレートメッセージの送信。
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_notification(
        &self,
        order_external_id: &str,
        user_phone: &str,
        user_name: &str,
        product_code: &str,
    ) -> Result<()>;
}
