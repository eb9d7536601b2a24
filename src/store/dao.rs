//! 注文・商品行・通知のデータアクセス層。
//!
//! エンティティごとにトレイトを分け、PostgreSQL 実装 ([`pg::PgStore`]) と
//! インメモリ実装 ([`memory::MemoryStore`]) が同じ契約を満たす。

pub mod memory;
pub mod pg;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::FeedbackError;

use super::models::{
    Notification, NotificationEdit, Order, OrderDetail, OrderDetailEdit, OrderDetailWithUserInfo,
    OrderEdit,
};
use super::params::{
    NotificationGetParams, NotificationListParams, OrderDetailGetParams, OrderDetailListParams,
    OrderGetParams, OrderListParams,
};

pub use memory::MemoryStore;
pub use pg::PgStore;

/// 接続性の確認（`/health/ready` 用）。
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait OrderDao: Send + Sync {
    async fn get(&self, params: &OrderGetParams) -> Result<Option<Order>>;

    /// フィルタに一致する注文と、ページング前の総件数を返す。
    async fn list(&self, params: &OrderListParams) -> Result<(Vec<Order>, i64)>;

    async fn create(&self, edit: &OrderEdit) -> Result<Order>;

    /// 1 文の複数行 INSERT。空スライスは何もしない。
    async fn create_batch(&self, edits: &[OrderEdit]) -> Result<Vec<Order>>;

    /// 連絡先（電話番号・氏名）のみ更新する。更新行数を返す。
    async fn update(&self, params: &OrderGetParams, edit: &OrderEdit) -> Result<u64>;

    async fn delete(&self, params: &OrderGetParams) -> Result<u64>;

    /// 商品行を 1 件も持たない注文を返す。
    async fn list_orders_without_details(&self, params: &OrderListParams) -> Result<Vec<Order>>;
}

#[async_trait]
pub trait OrderDetailDao: Send + Sync {
    async fn get(&self, params: &OrderDetailGetParams) -> Result<Option<OrderDetail>>;

    async fn list(&self, params: &OrderDetailListParams) -> Result<(Vec<OrderDetail>, i64)>;

    async fn create(&self, edit: &OrderDetailEdit) -> Result<OrderDetail>;

    async fn create_batch(&self, edits: &[OrderDetailEdit]) -> Result<Vec<OrderDetail>>;

    async fn update(&self, params: &OrderDetailGetParams, edit: &OrderDetailEdit) -> Result<u64>;

    async fn delete(&self, params: &OrderDetailGetParams) -> Result<u64>;

    /// 通知記録を持たない商品行を、親注文の連絡先と結合して返す。
    async fn list_details_without_notification(
        &self,
        params: &OrderDetailListParams,
    ) -> Result<Vec<OrderDetailWithUserInfo>>;
}

#[async_trait]
pub trait NotificationDao: Send + Sync {
    async fn get(&self, params: &NotificationGetParams) -> Result<Option<Notification>>;

    async fn list(&self, params: &NotificationListParams) -> Result<(Vec<Notification>, i64)>;

    async fn create(&self, edit: &NotificationEdit) -> Result<Notification>;

    async fn create_batch(&self, edits: &[NotificationEdit]) -> Result<Vec<Notification>>;

    async fn update(&self, params: &NotificationGetParams, edit: &NotificationEdit)
    -> Result<u64>;

    async fn delete(&self, params: &NotificationGetParams) -> Result<u64>;
}

/// 単一行の取得結果を必須扱いにする。見つからなければ [`FeedbackError::ObjectNotFound`]。
///
/// # Errors
/// `found` が `None` の場合。
pub fn require<T>(found: Option<T>) -> Result<T, FeedbackError> {
    found.ok_or(FeedbackError::ObjectNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_maps_missing_row_to_not_found() {
        assert_eq!(require(Some(3)).unwrap(), 3);
        assert!(require::<u8>(None).unwrap_err().is_not_found());
    }
}
