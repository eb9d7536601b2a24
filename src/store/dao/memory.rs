//! インメモリ実装。
//!
//! PostgreSQL 実装と同じ存在判定（アンチジョイン）と一意制約を持つ。
//! ステージのテストとローカル実行で使う。

use std::sync::{
    Mutex, MutexGuard,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{NotificationDao, OrderDao, OrderDetailDao, StoreHealth, require};
use crate::store::models::{
    Notification, NotificationEdit, Order, OrderDetail, OrderDetailEdit, OrderDetailWithUserInfo,
    OrderEdit,
};
use crate::store::params::{
    NotificationGetParams, NotificationListParams, OrderDetailGetParams, OrderDetailListParams,
    OrderGetParams, OrderListParams,
};

#[derive(Debug, Default)]
struct Tables {
    orders: Vec<Order>,
    details: Vec<OrderDetail>,
    notifications: Vec<Notification>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    notification_writes_left: Mutex<Option<usize>>,
    fail_detail_writes: AtomicBool,
    order_batch_calls: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    /// 以降の通知書き込みを失敗させる。
    pub fn set_fail_notification_writes(&self, fail: bool) {
        self.set_notification_writes_left(fail.then_some(0));
    }

    /// 通知書き込みを `writes` 回だけ成功させ、それ以降は失敗させる。
    pub fn fail_notification_writes_after(&self, writes: usize) {
        self.set_notification_writes_left(Some(writes));
    }

    fn set_notification_writes_left(&self, left: Option<usize>) {
        if let Ok(mut slot) = self.notification_writes_left.lock() {
            *slot = left;
        }
    }

    fn take_notification_write(&self) -> Result<()> {
        let mut slot = self
            .notification_writes_left
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))?;
        match slot.as_mut() {
            None => Ok(()),
            Some(0) => bail!("notification table is unavailable"),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
        }
    }

    /// 以降の商品行書き込みを失敗させる。
    pub fn set_fail_detail_writes(&self, fail: bool) {
        self.fail_detail_writes.store(fail, Ordering::SeqCst);
    }

    /// `OrderDao::create_batch` が呼ばれた回数。
    #[must_use]
    pub fn order_batch_calls(&self) -> usize {
        self.order_batch_calls.load(Ordering::SeqCst)
    }

    /// 注文の作成時刻を書き換える。
    ///
    /// # Errors
    /// 該当する注文が存在しない場合。
    pub fn backdate_order(&self, order_id: Uuid, created_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables()?;
        let order = tables
            .orders
            .iter_mut()
            .find(|order| order.id == order_id)
            .ok_or_else(|| anyhow!("order {order_id} not found"))?;
        order.created_at = created_at;
        Ok(())
    }

    /// 商品行の作成時刻を書き換える（時間窓の検証用）。
    ///
    /// # Errors
    /// 該当する商品行が存在しない場合。
    pub fn backdate_detail(&self, detail_id: Uuid, created_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables()?;
        let detail = tables
            .details
            .iter_mut()
            .find(|detail| detail.id == detail_id)
            .ok_or_else(|| anyhow!("order detail {detail_id} not found"))?;
        detail.created_at = created_at;
        Ok(())
    }
}

fn page<T>(items: Vec<T>, limit: Option<i64>, offset: Option<i64>) -> (Vec<T>, i64) {
    let total = i64::try_from(items.len()).unwrap_or(i64::MAX);
    let skip = offset.and_then(|o| usize::try_from(o).ok()).unwrap_or(0);
    let take = limit
        .and_then(|l| usize::try_from(l).ok())
        .unwrap_or(usize::MAX);
    (items.into_iter().skip(skip).take(take).collect(), total)
}

fn count_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.tables().map(|_| ())
    }
}

#[async_trait]
impl OrderDao for MemoryStore {
    async fn get(&self, params: &OrderGetParams) -> Result<Option<Order>> {
        params.validate()?;
        let tables = self.tables()?;
        Ok(tables.orders.iter().find(|o| params.matches(o)).cloned())
    }

    async fn list(&self, params: &OrderListParams) -> Result<(Vec<Order>, i64)> {
        let tables = self.tables()?;
        let matched: Vec<Order> = tables
            .orders
            .iter()
            .filter(|o| params.matches(o))
            .cloned()
            .collect();
        Ok(page(matched, params.limit, params.offset))
    }

    async fn create(&self, edit: &OrderEdit) -> Result<Order> {
        let mut created = OrderDao::create_batch(self, std::slice::from_ref(edit)).await?;
        require(created.pop()).context("order insert returned no row")
    }

    async fn create_batch(&self, edits: &[OrderEdit]) -> Result<Vec<Order>> {
        self.order_batch_calls.fetch_add(1, Ordering::SeqCst);
        if edits.is_empty() {
            return Ok(Vec::new());
        }
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut created = Vec::with_capacity(edits.len());
        for edit in edits {
            let new = edit.to_insert()?;
            let duplicate = tables
                .orders
                .iter()
                .chain(created.iter())
                .any(|o| o.external_order_id == new.external_order_id);
            if duplicate {
                bail!(
                    "duplicate key value violates unique constraint: external_order_id={}",
                    new.external_order_id
                );
            }
            created.push(Order {
                id: Uuid::now_v7(),
                external_order_id: new.external_order_id.to_string(),
                user_phone: new.user_phone.to_string(),
                user_name: new.user_name.to_string(),
                created_at: now,
            });
        }
        tables.orders.extend(created.iter().cloned());
        Ok(created)
    }

    async fn update(&self, params: &OrderGetParams, edit: &OrderEdit) -> Result<u64> {
        params.validate()?;
        if !edit.has_contact_changes() {
            return Ok(0);
        }
        let mut tables = self.tables()?;
        let mut affected = 0;
        for order in tables.orders.iter_mut().filter(|o| params.matches(o)) {
            if let Some(phone) = &edit.user_phone {
                order.user_phone.clone_from(phone);
            }
            if let Some(name) = &edit.user_name {
                order.user_name.clone_from(name);
            }
            affected += 1;
        }
        Ok(count_u64(affected))
    }

    async fn delete(&self, params: &OrderGetParams) -> Result<u64> {
        params.validate()?;
        let mut tables = self.tables()?;
        let removed: Vec<Uuid> = tables
            .orders
            .iter()
            .filter(|o| params.matches(o))
            .map(|o| o.id)
            .collect();
        tables.orders.retain(|o| !removed.contains(&o.id));

        // ON DELETE CASCADE
        let removed_details: Vec<Uuid> = tables
            .details
            .iter()
            .filter(|d| removed.contains(&d.order_id))
            .map(|d| d.id)
            .collect();
        tables.details.retain(|d| !removed_details.contains(&d.id));
        tables
            .notifications
            .retain(|n| !removed_details.contains(&n.order_item_id));
        Ok(count_u64(removed.len()))
    }

    async fn list_orders_without_details(&self, params: &OrderListParams) -> Result<Vec<Order>> {
        let tables = self.tables()?;
        let missing: Vec<Order> = tables
            .orders
            .iter()
            .filter(|o| params.matches(o))
            .filter(|o| !tables.details.iter().any(|d| d.order_id == o.id))
            .cloned()
            .collect();
        Ok(page(missing, params.limit, params.offset).0)
    }
}

#[async_trait]
impl OrderDetailDao for MemoryStore {
    async fn get(&self, params: &OrderDetailGetParams) -> Result<Option<OrderDetail>> {
        params.validate()?;
        let tables = self.tables()?;
        Ok(tables.details.iter().find(|d| params.matches(d)).cloned())
    }

    async fn list(&self, params: &OrderDetailListParams) -> Result<(Vec<OrderDetail>, i64)> {
        let tables = self.tables()?;
        let matched: Vec<OrderDetail> = tables
            .details
            .iter()
            .filter(|d| params.matches(d))
            .cloned()
            .collect();
        Ok(page(matched, params.limit, params.offset))
    }

    async fn create(&self, edit: &OrderDetailEdit) -> Result<OrderDetail> {
        let mut created = OrderDetailDao::create_batch(self, std::slice::from_ref(edit)).await?;
        require(created.pop()).context("order detail insert returned no row")
    }

    async fn create_batch(&self, edits: &[OrderDetailEdit]) -> Result<Vec<OrderDetail>> {
        if self.fail_detail_writes.load(Ordering::SeqCst) {
            bail!("order_detail table is unavailable");
        }
        if edits.is_empty() {
            return Ok(Vec::new());
        }
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut created = Vec::with_capacity(edits.len());
        for edit in edits {
            let (order_id, product_code) = edit.to_insert()?;
            if !tables.orders.iter().any(|o| o.id == order_id) {
                bail!("insert violates foreign key constraint: order_id={order_id}");
            }
            created.push(OrderDetail {
                id: Uuid::now_v7(),
                order_id,
                product_code: product_code.to_string(),
                created_at: now,
            });
        }
        tables.details.extend(created.iter().cloned());
        Ok(created)
    }

    async fn update(&self, params: &OrderDetailGetParams, edit: &OrderDetailEdit) -> Result<u64> {
        params.validate()?;
        if edit.is_empty() {
            return Ok(0);
        }
        let mut tables = self.tables()?;
        let mut affected = 0;
        for detail in tables.details.iter_mut().filter(|d| params.matches(d)) {
            if let Some(order_id) = edit.order_id {
                detail.order_id = order_id;
            }
            if let Some(code) = &edit.product_code {
                detail.product_code.clone_from(code);
            }
            affected += 1;
        }
        Ok(count_u64(affected))
    }

    async fn delete(&self, params: &OrderDetailGetParams) -> Result<u64> {
        params.validate()?;
        let mut tables = self.tables()?;
        let removed: Vec<Uuid> = tables
            .details
            .iter()
            .filter(|d| params.matches(d))
            .map(|d| d.id)
            .collect();
        tables.details.retain(|d| !removed.contains(&d.id));
        tables
            .notifications
            .retain(|n| !removed.contains(&n.order_item_id));
        Ok(count_u64(removed.len()))
    }

    async fn list_details_without_notification(
        &self,
        params: &OrderDetailListParams,
    ) -> Result<Vec<OrderDetailWithUserInfo>> {
        let tables = self.tables()?;
        let mut rows: Vec<(DateTime<Utc>, OrderDetailWithUserInfo)> = tables
            .details
            .iter()
            .filter(|d| params.matches(d))
            .filter(|d| !tables.notifications.iter().any(|n| n.order_item_id == d.id))
            .filter_map(|d| {
                let order = tables.orders.iter().find(|o| o.id == d.order_id)?;
                Some((
                    d.created_at,
                    OrderDetailWithUserInfo {
                        id: d.id,
                        product_code: d.product_code.clone(),
                        external_order_id: order.external_order_id.clone(),
                        user_phone: order.user_phone.clone(),
                        user_name: order.user_name.clone(),
                    },
                ))
            })
            .collect();
        rows.sort_by_key(|(created_at, row)| (*created_at, row.id));
        let rows: Vec<OrderDetailWithUserInfo> = rows.into_iter().map(|(_, row)| row).collect();
        Ok(page(rows, params.limit, params.offset).0)
    }
}

#[async_trait]
impl NotificationDao for MemoryStore {
    async fn get(&self, params: &NotificationGetParams) -> Result<Option<Notification>> {
        params.validate()?;
        let tables = self.tables()?;
        Ok(tables
            .notifications
            .iter()
            .find(|n| params.matches(n))
            .cloned())
    }

    async fn list(&self, params: &NotificationListParams) -> Result<(Vec<Notification>, i64)> {
        let tables = self.tables()?;
        let matched: Vec<Notification> = tables
            .notifications
            .iter()
            .filter(|n| params.matches(n))
            .cloned()
            .collect();
        Ok(page(matched, params.limit, params.offset))
    }

    async fn create(&self, edit: &NotificationEdit) -> Result<Notification> {
        let mut created = NotificationDao::create_batch(self, std::slice::from_ref(edit)).await?;
        require(created.pop()).context("notification insert returned no row")
    }

    async fn create_batch(&self, edits: &[NotificationEdit]) -> Result<Vec<Notification>> {
        self.take_notification_write()?;
        if edits.is_empty() {
            return Ok(Vec::new());
        }
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut created = Vec::with_capacity(edits.len());
        for edit in edits {
            let (order_item_id, phone_number, status) = edit.to_insert()?;
            if !tables.details.iter().any(|d| d.id == order_item_id) {
                bail!("insert violates foreign key constraint: order_item_id={order_item_id}");
            }
            created.push(Notification {
                id: Uuid::now_v7(),
                order_item_id,
                phone_number: phone_number.to_string(),
                status,
                sent_at: edit.sent_at,
                created_at: now,
            });
        }
        tables.notifications.extend(created.iter().cloned());
        Ok(created)
    }

    async fn update(
        &self,
        params: &NotificationGetParams,
        edit: &NotificationEdit,
    ) -> Result<u64> {
        params.validate()?;
        if edit.is_empty() {
            return Ok(0);
        }
        self.take_notification_write()?;
        let mut tables = self.tables()?;
        let mut affected = 0;
        for notification in tables.notifications.iter_mut().filter(|n| params.matches(n)) {
            if let Some(order_item_id) = edit.order_item_id {
                notification.order_item_id = order_item_id;
            }
            if let Some(phone) = &edit.phone_number {
                notification.phone_number.clone_from(phone);
            }
            if let Some(status) = edit.status {
                notification.status = status;
            }
            if let Some(sent_at) = edit.sent_at {
                notification.sent_at = Some(sent_at);
            }
            affected += 1;
        }
        Ok(count_u64(affected))
    }

    async fn delete(&self, params: &NotificationGetParams) -> Result<u64> {
        params.validate()?;
        let mut tables = self.tables()?;
        let before = tables.notifications.len();
        tables.notifications.retain(|n| !params.matches(n));
        Ok(count_u64(before - tables.notifications.len()))
    }
}
