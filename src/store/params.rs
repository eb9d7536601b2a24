//! Query selectors for the per-entity DAOs.
//!
//! `*GetParams` pick a single row and must carry at least one selector.
//! `*ListParams` are all-optional filters; `created_before`/`created_after` are inclusive.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::FeedbackError;

use super::models::{Notification, NotificationStatus, Order, OrderDetail};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderGetParams {
    pub id: Option<Uuid>,
    pub external_order_id: Option<String>,
    pub user_phone: Option<String>,
}

impl OrderGetParams {
    #[must_use]
    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_external_id(external_order_id: impl Into<String>) -> Self {
        Self {
            external_order_id: Some(external_order_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.id.is_some()
            || self.external_order_id.as_deref().is_some_and(|v| !v.is_empty())
            || self.user_phone.as_deref().is_some_and(|v| !v.is_empty())
    }

    /// # Errors
    /// セレクタが一つも指定されていない場合は [`FeedbackError::InvalidInput`] を返す。
    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(FeedbackError::InvalidInput("order selector is empty"))
        }
    }

    pub(crate) fn matches(&self, order: &Order) -> bool {
        self.id.is_none_or(|id| order.id == id)
            && self
                .external_order_id
                .as_deref()
                .is_none_or(|v| order.external_order_id == v)
            && self
                .user_phone
                .as_deref()
                .is_none_or(|v| order.user_phone == v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderListParams {
    pub id: Option<Uuid>,
    pub ids: Option<Vec<Uuid>>,
    pub external_order_id: Option<String>,
    pub external_order_ids: Option<Vec<String>>,
    pub user_phone: Option<String>,
    pub user_phones: Option<Vec<String>>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl OrderListParams {
    #[must_use]
    pub fn by_external_ids(external_order_ids: Vec<String>) -> Self {
        Self {
            external_order_ids: Some(external_order_ids),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, order: &Order) -> bool {
        self.id.is_none_or(|id| order.id == id)
            && self.ids.as_ref().is_none_or(|ids| ids.contains(&order.id))
            && self
                .external_order_id
                .as_deref()
                .is_none_or(|v| order.external_order_id == v)
            && self
                .external_order_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&order.external_order_id))
            && self
                .user_phone
                .as_deref()
                .is_none_or(|v| order.user_phone == v)
            && self
                .user_phones
                .as_ref()
                .is_none_or(|phones| phones.contains(&order.user_phone))
            && within(order.created_at, self.created_before, self.created_after)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderDetailGetParams {
    pub id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub product_code: Option<String>,
}

impl OrderDetailGetParams {
    #[must_use]
    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.id.is_some()
            || self.order_id.is_some()
            || self.product_code.as_deref().is_some_and(|v| !v.is_empty())
    }

    /// # Errors
    /// セレクタが一つも指定されていない場合は [`FeedbackError::InvalidInput`] を返す。
    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(FeedbackError::InvalidInput("order detail selector is empty"))
        }
    }

    pub(crate) fn matches(&self, detail: &OrderDetail) -> bool {
        self.id.is_none_or(|id| detail.id == id)
            && self.order_id.is_none_or(|id| detail.order_id == id)
            && self
                .product_code
                .as_deref()
                .is_none_or(|v| detail.product_code == v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderDetailListParams {
    pub id: Option<Uuid>,
    pub ids: Option<Vec<Uuid>>,
    pub order_id: Option<Uuid>,
    pub order_ids: Option<Vec<Uuid>>,
    pub product_code: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl OrderDetailListParams {
    #[must_use]
    pub fn created_since(created_after: DateTime<Utc>) -> Self {
        Self {
            created_after: Some(created_after),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, detail: &OrderDetail) -> bool {
        self.id.is_none_or(|id| detail.id == id)
            && self.ids.as_ref().is_none_or(|ids| ids.contains(&detail.id))
            && self.order_id.is_none_or(|id| detail.order_id == id)
            && self
                .order_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&detail.order_id))
            && self
                .product_code
                .as_deref()
                .is_none_or(|v| detail.product_code == v)
            && within(detail.created_at, self.created_before, self.created_after)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationGetParams {
    pub id: Option<Uuid>,
    pub order_item_id: Option<Uuid>,
}

impl NotificationGetParams {
    #[must_use]
    pub fn by_order_item(order_item_id: Uuid) -> Self {
        Self {
            order_item_id: Some(order_item_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.id.is_some() || self.order_item_id.is_some()
    }

    /// # Errors
    /// セレクタが一つも指定されていない場合は [`FeedbackError::InvalidInput`] を返す。
    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(FeedbackError::InvalidInput("notification selector is empty"))
        }
    }

    pub(crate) fn matches(&self, notification: &Notification) -> bool {
        self.id.is_none_or(|id| notification.id == id)
            && self
                .order_item_id
                .is_none_or(|id| notification.order_item_id == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationListParams {
    pub id: Option<Uuid>,
    pub ids: Option<Vec<Uuid>>,
    pub order_item_id: Option<Uuid>,
    pub order_item_ids: Option<Vec<Uuid>>,
    pub phone_number: Option<String>,
    pub status: Option<NotificationStatus>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl NotificationListParams {
    pub(crate) fn matches(&self, notification: &Notification) -> bool {
        self.id.is_none_or(|id| notification.id == id)
            && self
                .ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&notification.id))
            && self
                .order_item_id
                .is_none_or(|id| notification.order_item_id == id)
            && self
                .order_item_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&notification.order_item_id))
            && self
                .phone_number
                .as_deref()
                .is_none_or(|v| notification.phone_number == v)
            && self.status.is_none_or(|s| notification.status == s)
            && within(
                notification.created_at,
                self.created_before,
                self.created_after,
            )
    }
}

fn within(
    created_at: DateTime<Utc>,
    before: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
) -> bool {
    before.is_none_or(|b| created_at <= b) && after.is_none_or(|a| created_at >= a)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(OrderGetParams::default(), false)]
    #[case(OrderGetParams { external_order_id: Some(String::new()), ..Default::default() }, false)]
    #[case(OrderGetParams::by_external_id("ORD1"), true)]
    #[case(OrderGetParams::by_id(Uuid::nil()), true)]
    #[case(OrderGetParams { user_phone: Some("+77011234567".into()), ..Default::default() }, true)]
    fn order_get_params_validity(#[case] params: OrderGetParams, #[case] expected: bool) {
        assert_eq!(params.is_valid(), expected);
        assert_eq!(params.validate().is_ok(), expected);
    }

    #[test]
    fn empty_selectors_are_invalid_input() {
        assert!(matches!(
            OrderDetailGetParams::default().validate(),
            Err(FeedbackError::InvalidInput(_))
        ));
        assert!(matches!(
            NotificationGetParams::default().validate(),
            Err(FeedbackError::InvalidInput(_))
        ));
    }

    #[test]
    fn created_bounds_are_inclusive() {
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            external_order_id: "ORD1".into(),
            user_phone: "+77011234567".into(),
            user_name: "Anna".into(),
            created_at: now,
        };

        let exact = OrderListParams {
            created_before: Some(now),
            created_after: Some(now),
            ..Default::default()
        };
        assert!(exact.matches(&order));

        let later = OrderListParams {
            created_after: Some(now + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!later.matches(&order));
    }

    #[test]
    fn empty_id_set_matches_nothing() {
        let order = Order {
            id: Uuid::new_v4(),
            external_order_id: "ORD1".into(),
            user_phone: "+77011234567".into(),
            user_name: "Anna".into(),
            created_at: Utc::now(),
        };
        assert!(!OrderListParams::by_external_ids(Vec::new()).matches(&order));
        assert!(OrderListParams::default().matches(&order));
    }
}
