//! PostgreSQL 実装。
//!
//! 動的フィルタは `QueryBuilder` で組み立て、複数値条件は `= ANY($n)`、
//! 一括挿入は `push_values` による 1 文の INSERT で行う。

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};
use tracing::info;
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

const ORDER_COLUMNS: &str = "id, external_order_id, user_phone, user_name, created_at";
const DETAIL_COLUMNS: &str = "id, order_id, product_code, created_at";
const NOTIFICATION_COLUMNS: &str = "id, order_item_id, phone_number, status, sent_at, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `migrations/` を適用する。
    ///
    /// # Errors
    /// 接続またはマイグレーションの実行に失敗した場合。
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run database migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl StoreHealth for PgStore {
    /// 接続確認用に `SELECT 1` を発行する。
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

/// Appends `WHERE`/`AND` between conditions.
struct Conditions<'qb, 'args> {
    builder: &'qb mut QueryBuilder<'args, Postgres>,
    started: bool,
}

impl<'qb, 'args> Conditions<'qb, 'args> {
    fn new(builder: &'qb mut QueryBuilder<'args, Postgres>) -> Self {
        Self {
            builder,
            started: false,
        }
    }

    /// The base query already carries a `WHERE` clause.
    fn continuing(builder: &'qb mut QueryBuilder<'args, Postgres>) -> Self {
        Self {
            builder,
            started: true,
        }
    }

    fn and(&mut self, sql: impl std::fmt::Display) -> &mut QueryBuilder<'args, Postgres> {
        self.builder
            .push(if self.started { " AND " } else { " WHERE " });
        self.started = true;
        self.builder.push(sql)
    }
}

fn push_created_range(
    conditions: &mut Conditions<'_, 'static>,
    column: &str,
    before: Option<chrono::DateTime<chrono::Utc>>,
    after: Option<chrono::DateTime<chrono::Utc>>,
) {
    if let Some(before) = before {
        conditions.and(format!("{column} <= ")).push_bind(before);
    }
    if let Some(after) = after {
        conditions.and(format!("{column} >= ")).push_bind(after);
    }
}

fn push_page(builder: &mut QueryBuilder<'static, Postgres>, limit: Option<i64>, offset: Option<i64>) {
    if let Some(limit) = limit {
        builder.push(" LIMIT ").push_bind(limit);
    }
    if let Some(offset) = offset {
        builder.push(" OFFSET ").push_bind(offset);
    }
}

fn push_order_filters(conditions: &mut Conditions<'_, 'static>, alias: &str, params: &OrderListParams) {
    if let Some(id) = params.id {
        conditions.and(format!("{alias}id = ")).push_bind(id);
    }
    if let Some(ids) = &params.ids {
        conditions
            .and(format!("{alias}id = ANY("))
            .push_bind(ids.clone())
            .push(")");
    }
    if let Some(external_order_id) = &params.external_order_id {
        conditions
            .and(format!("{alias}external_order_id = "))
            .push_bind(external_order_id.clone());
    }
    if let Some(external_order_ids) = &params.external_order_ids {
        conditions
            .and(format!("{alias}external_order_id = ANY("))
            .push_bind(external_order_ids.clone())
            .push(")");
    }
    if let Some(user_phone) = &params.user_phone {
        conditions
            .and(format!("{alias}user_phone = "))
            .push_bind(user_phone.clone());
    }
    if let Some(user_phones) = &params.user_phones {
        conditions
            .and(format!("{alias}user_phone = ANY("))
            .push_bind(user_phones.clone())
            .push(")");
    }
    push_created_range(
        conditions,
        &format!("{alias}created_at"),
        params.created_before,
        params.created_after,
    );
}

fn push_order_selector(conditions: &mut Conditions<'_, 'static>, params: &OrderGetParams) {
    if let Some(id) = params.id {
        conditions.and("id = ").push_bind(id);
    }
    if let Some(external_order_id) = &params.external_order_id {
        conditions
            .and("external_order_id = ")
            .push_bind(external_order_id.clone());
    }
    if let Some(user_phone) = &params.user_phone {
        conditions.and("user_phone = ").push_bind(user_phone.clone());
    }
}

fn push_detail_filters(
    conditions: &mut Conditions<'_, 'static>,
    alias: &str,
    params: &OrderDetailListParams,
) {
    if let Some(id) = params.id {
        conditions.and(format!("{alias}id = ")).push_bind(id);
    }
    if let Some(ids) = &params.ids {
        conditions
            .and(format!("{alias}id = ANY("))
            .push_bind(ids.clone())
            .push(")");
    }
    if let Some(order_id) = params.order_id {
        conditions
            .and(format!("{alias}order_id = "))
            .push_bind(order_id);
    }
    if let Some(order_ids) = &params.order_ids {
        conditions
            .and(format!("{alias}order_id = ANY("))
            .push_bind(order_ids.clone())
            .push(")");
    }
    if let Some(product_code) = &params.product_code {
        conditions
            .and(format!("{alias}product_code = "))
            .push_bind(product_code.clone());
    }
    push_created_range(
        conditions,
        &format!("{alias}created_at"),
        params.created_before,
        params.created_after,
    );
}

fn push_detail_selector(conditions: &mut Conditions<'_, 'static>, params: &OrderDetailGetParams) {
    if let Some(id) = params.id {
        conditions.and("id = ").push_bind(id);
    }
    if let Some(order_id) = params.order_id {
        conditions.and("order_id = ").push_bind(order_id);
    }
    if let Some(product_code) = &params.product_code {
        conditions
            .and("product_code = ")
            .push_bind(product_code.clone());
    }
}

fn push_notification_filters(
    conditions: &mut Conditions<'_, 'static>,
    params: &NotificationListParams,
) {
    if let Some(id) = params.id {
        conditions.and("id = ").push_bind(id);
    }
    if let Some(ids) = &params.ids {
        conditions.and("id = ANY(").push_bind(ids.clone()).push(")");
    }
    if let Some(order_item_id) = params.order_item_id {
        conditions.and("order_item_id = ").push_bind(order_item_id);
    }
    if let Some(order_item_ids) = &params.order_item_ids {
        conditions
            .and("order_item_id = ANY(")
            .push_bind(order_item_ids.clone())
            .push(")");
    }
    if let Some(phone_number) = &params.phone_number {
        conditions
            .and("phone_number = ")
            .push_bind(phone_number.clone());
    }
    if let Some(status) = params.status {
        conditions.and("status = ").push_bind(status.as_str());
    }
    push_created_range(
        conditions,
        "created_at",
        params.created_before,
        params.created_after,
    );
}

fn push_notification_selector(
    conditions: &mut Conditions<'_, 'static>,
    params: &NotificationGetParams,
) {
    if let Some(id) = params.id {
        conditions.and("id = ").push_bind(id);
    }
    if let Some(order_item_id) = params.order_item_id {
        conditions.and("order_item_id = ").push_bind(order_item_id);
    }
}

fn order_list_query(params: &OrderListParams) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {ORDER_COLUMNS}, COUNT(*) OVER () AS total_count FROM ord"
    ));
    push_order_filters(&mut Conditions::new(&mut builder), "", params);
    builder.push(" ORDER BY created_at, id");
    push_page(&mut builder, params.limit, params.offset);
    builder
}

fn orders_without_details_query(params: &OrderListParams) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(
        r"SELECT o.id, o.external_order_id, o.user_phone, o.user_name, o.created_at
        FROM ord o
        LEFT JOIN ord_detail od ON od.order_id = o.id
        WHERE od.order_id IS NULL",
    );
    push_order_filters(&mut Conditions::continuing(&mut builder), "o.", params);
    builder.push(" ORDER BY o.created_at, o.id");
    push_page(&mut builder, params.limit, params.offset);
    builder
}

fn details_without_notification_query(
    params: &OrderDetailListParams,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(
        r"SELECT od.id, od.product_code, o.external_order_id, o.user_phone, o.user_name
        FROM ord_detail od
        JOIN ord o ON o.id = od.order_id
        WHERE NOT EXISTS (SELECT 1 FROM notification n WHERE n.order_item_id = od.id)",
    );
    push_detail_filters(&mut Conditions::continuing(&mut builder), "od.", params);
    builder.push(" ORDER BY od.created_at, od.id");
    push_page(&mut builder, params.limit, params.offset);
    builder
}

fn order_update_query(
    params: &OrderGetParams,
    edit: &OrderEdit,
) -> Option<QueryBuilder<'static, Postgres>> {
    if !edit.has_contact_changes() {
        return None;
    }
    let mut builder = QueryBuilder::new("UPDATE ord SET ");
    {
        let mut assignments = builder.separated(", ");
        if let Some(user_phone) = &edit.user_phone {
            assignments
                .push("user_phone = ")
                .push_bind_unseparated(user_phone.clone());
        }
        if let Some(user_name) = &edit.user_name {
            assignments
                .push("user_name = ")
                .push_bind_unseparated(user_name.clone());
        }
    }
    push_order_selector(&mut Conditions::new(&mut builder), params);
    Some(builder)
}

fn total_count(rows: &[PgRow]) -> Result<i64> {
    rows.first()
        .map(|row| row.try_get::<i64, _>("total_count"))
        .transpose()
        .context("failed to decode total_count")
        .map(Option::unwrap_or_default)
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    Ok(Order {
        id: row.try_get("id")?,
        external_order_id: row.try_get("external_order_id")?,
        user_phone: row.try_get("user_phone")?,
        user_name: row.try_get("user_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn detail_from_row(row: &PgRow) -> Result<OrderDetail> {
    Ok(OrderDetail {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        product_code: row.try_get("product_code")?,
        created_at: row.try_get("created_at")?,
    })
}

fn detail_with_user_from_row(row: &PgRow) -> Result<OrderDetailWithUserInfo> {
    Ok(OrderDetailWithUserInfo {
        id: row.try_get("id")?,
        product_code: row.try_get("product_code")?,
        external_order_id: row.try_get("external_order_id")?,
        user_phone: row.try_get("user_phone")?,
        user_name: row.try_get("user_name")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification> {
    let status: String = row.try_get("status")?;
    Ok(Notification {
        id: row.try_get("id")?,
        order_item_id: row.try_get("order_item_id")?,
        phone_number: row.try_get("phone_number")?,
        status: status.parse()?,
        sent_at: row.try_get("sent_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl OrderDao for PgStore {
    async fn get(&self, params: &OrderGetParams) -> Result<Option<Order>> {
        params.validate()?;
        let mut builder = QueryBuilder::new(format!("SELECT {ORDER_COLUMNS} FROM ord"));
        push_order_selector(&mut Conditions::new(&mut builder), params);
        builder.push(" LIMIT 1");

        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch order")?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn list(&self, params: &OrderListParams) -> Result<(Vec<Order>, i64)> {
        let rows = order_list_query(params)
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list orders")?;
        let total = total_count(&rows)?;
        let orders = rows.iter().map(order_from_row).collect::<Result<Vec<_>>>()?;
        Ok((orders, total))
    }

    async fn create(&self, edit: &OrderEdit) -> Result<Order> {
        let mut created = OrderDao::create_batch(self, std::slice::from_ref(edit)).await?;
        require(created.pop()).context("order insert returned no row")
    }

    async fn create_batch(&self, edits: &[OrderEdit]) -> Result<Vec<Order>> {
        if edits.is_empty() {
            return Ok(Vec::new());
        }
        let rows = edits
            .iter()
            .map(OrderEdit::to_insert)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder =
            QueryBuilder::new("INSERT INTO ord (id, external_order_id, user_phone, user_name) ");
        builder.push_values(rows, |mut values, order| {
            values
                .push_bind(Uuid::now_v7())
                .push_bind(order.external_order_id.to_string())
                .push_bind(order.user_phone.to_string())
                .push_bind(order.user_name.to_string());
        });
        builder.push(format!(" RETURNING {ORDER_COLUMNS}"));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to insert orders")?;
        rows.iter().map(order_from_row).collect()
    }

    async fn update(&self, params: &OrderGetParams, edit: &OrderEdit) -> Result<u64> {
        params.validate()?;
        let Some(mut builder) = order_update_query(params, edit) else {
            return Ok(0);
        };
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("failed to update order")?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, params: &OrderGetParams) -> Result<u64> {
        params.validate()?;
        let mut builder = QueryBuilder::new("DELETE FROM ord");
        push_order_selector(&mut Conditions::new(&mut builder), params);
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("failed to delete order")?;
        Ok(result.rows_affected())
    }

    async fn list_orders_without_details(&self, params: &OrderListParams) -> Result<Vec<Order>> {
        let rows = orders_without_details_query(params)
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list orders without details")?;
        rows.iter().map(order_from_row).collect()
    }
}

#[async_trait]
impl OrderDetailDao for PgStore {
    async fn get(&self, params: &OrderDetailGetParams) -> Result<Option<OrderDetail>> {
        params.validate()?;
        let mut builder = QueryBuilder::new(format!("SELECT {DETAIL_COLUMNS} FROM ord_detail"));
        push_detail_selector(&mut Conditions::new(&mut builder), params);
        builder.push(" LIMIT 1");

        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch order detail")?;
        row.as_ref().map(detail_from_row).transpose()
    }

    async fn list(&self, params: &OrderDetailListParams) -> Result<(Vec<OrderDetail>, i64)> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT {DETAIL_COLUMNS}, COUNT(*) OVER () AS total_count FROM ord_detail"
        ));
        push_detail_filters(&mut Conditions::new(&mut builder), "", params);
        builder.push(" ORDER BY created_at, id");
        push_page(&mut builder, params.limit, params.offset);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list order details")?;
        let total = total_count(&rows)?;
        let details = rows.iter().map(detail_from_row).collect::<Result<Vec<_>>>()?;
        Ok((details, total))
    }

    async fn create(&self, edit: &OrderDetailEdit) -> Result<OrderDetail> {
        let mut created = OrderDetailDao::create_batch(self, std::slice::from_ref(edit)).await?;
        require(created.pop()).context("order detail insert returned no row")
    }

    async fn create_batch(&self, edits: &[OrderDetailEdit]) -> Result<Vec<OrderDetail>> {
        if edits.is_empty() {
            return Ok(Vec::new());
        }
        let rows = edits
            .iter()
            .map(OrderDetailEdit::to_insert)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = QueryBuilder::new("INSERT INTO ord_detail (id, order_id, product_code) ");
        builder.push_values(rows, |mut values, (order_id, product_code)| {
            values
                .push_bind(Uuid::now_v7())
                .push_bind(order_id)
                .push_bind(product_code.to_string());
        });
        builder.push(format!(" RETURNING {DETAIL_COLUMNS}"));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to insert order details")?;
        rows.iter().map(detail_from_row).collect()
    }

    async fn update(&self, params: &OrderDetailGetParams, edit: &OrderDetailEdit) -> Result<u64> {
        params.validate()?;
        if edit.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::new("UPDATE ord_detail SET ");
        {
            let mut assignments = builder.separated(", ");
            if let Some(order_id) = edit.order_id {
                assignments.push("order_id = ").push_bind_unseparated(order_id);
            }
            if let Some(product_code) = &edit.product_code {
                assignments
                    .push("product_code = ")
                    .push_bind_unseparated(product_code.clone());
            }
        }
        push_detail_selector(&mut Conditions::new(&mut builder), params);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("failed to update order detail")?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, params: &OrderDetailGetParams) -> Result<u64> {
        params.validate()?;
        let mut builder = QueryBuilder::new("DELETE FROM ord_detail");
        push_detail_selector(&mut Conditions::new(&mut builder), params);
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("failed to delete order detail")?;
        Ok(result.rows_affected())
    }

    async fn list_details_without_notification(
        &self,
        params: &OrderDetailListParams,
    ) -> Result<Vec<OrderDetailWithUserInfo>> {
        let rows = details_without_notification_query(params)
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list details without notification")?;
        rows.iter().map(detail_with_user_from_row).collect()
    }
}

#[async_trait]
impl NotificationDao for PgStore {
    async fn get(&self, params: &NotificationGetParams) -> Result<Option<Notification>> {
        params.validate()?;
        let mut builder =
            QueryBuilder::new(format!("SELECT {NOTIFICATION_COLUMNS} FROM notification"));
        push_notification_selector(&mut Conditions::new(&mut builder), params);
        builder.push(" LIMIT 1");

        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch notification")?;
        row.as_ref().map(notification_from_row).transpose()
    }

    async fn list(&self, params: &NotificationListParams) -> Result<(Vec<Notification>, i64)> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT {NOTIFICATION_COLUMNS}, COUNT(*) OVER () AS total_count FROM notification"
        ));
        push_notification_filters(&mut Conditions::new(&mut builder), params);
        builder.push(" ORDER BY created_at, id");
        push_page(&mut builder, params.limit, params.offset);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list notifications")?;
        let total = total_count(&rows)?;
        let notifications = rows
            .iter()
            .map(notification_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((notifications, total))
    }

    async fn create(&self, edit: &NotificationEdit) -> Result<Notification> {
        let mut created = NotificationDao::create_batch(self, std::slice::from_ref(edit)).await?;
        require(created.pop()).context("notification insert returned no row")
    }

    async fn create_batch(&self, edits: &[NotificationEdit]) -> Result<Vec<Notification>> {
        if edits.is_empty() {
            return Ok(Vec::new());
        }
        let rows = edits
            .iter()
            .map(|edit| edit.to_insert().map(|row| (row, edit.sent_at)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = QueryBuilder::new(
            "INSERT INTO notification (id, order_item_id, phone_number, status, sent_at) ",
        );
        builder.push_values(
            rows,
            |mut values, ((order_item_id, phone_number, status), sent_at)| {
                values
                    .push_bind(Uuid::now_v7())
                    .push_bind(order_item_id)
                    .push_bind(phone_number.to_string())
                    .push_bind(status.as_str())
                    .push_bind(sent_at);
            },
        );
        builder.push(format!(" RETURNING {NOTIFICATION_COLUMNS}"));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to insert notifications")?;
        rows.iter().map(notification_from_row).collect()
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
        let mut builder = QueryBuilder::new("UPDATE notification SET ");
        {
            let mut assignments = builder.separated(", ");
            if let Some(order_item_id) = edit.order_item_id {
                assignments
                    .push("order_item_id = ")
                    .push_bind_unseparated(order_item_id);
            }
            if let Some(phone_number) = &edit.phone_number {
                assignments
                    .push("phone_number = ")
                    .push_bind_unseparated(phone_number.clone());
            }
            if let Some(status) = edit.status {
                assignments
                    .push("status = ")
                    .push_bind_unseparated(status.as_str());
            }
            if let Some(sent_at) = edit.sent_at {
                assignments.push("sent_at = ").push_bind_unseparated(sent_at);
            }
        }
        push_notification_selector(&mut Conditions::new(&mut builder), params);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("failed to update notification")?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, params: &NotificationGetParams) -> Result<u64> {
        params.validate()?;
        let mut builder = QueryBuilder::new("DELETE FROM notification");
        push_notification_selector(&mut Conditions::new(&mut builder), params);
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("failed to delete notification")?;
        Ok(result.rows_affected())
    }
}
