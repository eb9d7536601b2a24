use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FeedbackError;

/// ブローカーから取り込んだ完了済み注文。
///
/// `external_order_id` は一意。作成後に変更できるのは連絡先（電話番号・氏名）のみ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub external_order_id: String,
    pub user_phone: String,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
}

/// 注文に紐づく商品行。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetail {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_code: String,
    pub created_at: DateTime<Utc>,
}

/// 通知送信用の結合ビュー（商品行 + 親注文の連絡先）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDetailWithUserInfo {
    pub id: Uuid,
    pub product_code: String,
    pub external_order_id: String,
    pub user_phone: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Sent,
    Failed,
}

impl NotificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown notification status: {other}")),
        }
    }
}

/// 商品行ごとの通知送信記録。送信の成否に関わらず 1 行だけ作成される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub order_item_id: Uuid,
    pub phone_number: String,
    pub status: NotificationStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert/update payload for [`Order`].
///
/// `update` only honours the contact fields; the external ID is fixed once stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderEdit {
    pub external_order_id: Option<String>,
    pub user_phone: Option<String>,
    pub user_name: Option<String>,
}

impl OrderEdit {
    #[must_use]
    pub fn new(
        external_order_id: impl Into<String>,
        user_phone: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            external_order_id: Some(external_order_id.into()),
            user_phone: Some(user_phone.into()),
            user_name: Some(user_name.into()),
        }
    }

    pub(crate) fn to_insert(&self) -> Result<NewOrder<'_>, FeedbackError> {
        Ok(NewOrder {
            external_order_id: self
                .external_order_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .ok_or(FeedbackError::InvalidInput("external_order_id is required"))?,
            user_phone: self
                .user_phone
                .as_deref()
                .ok_or(FeedbackError::InvalidInput("user_phone is required"))?,
            user_name: self.user_name.as_deref().unwrap_or_default(),
        })
    }

    pub(crate) fn has_contact_changes(&self) -> bool {
        self.user_phone.is_some() || self.user_name.is_some()
    }
}

pub(crate) struct NewOrder<'a> {
    pub(crate) external_order_id: &'a str,
    pub(crate) user_phone: &'a str,
    pub(crate) user_name: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderDetailEdit {
    pub order_id: Option<Uuid>,
    pub product_code: Option<String>,
}

impl OrderDetailEdit {
    #[must_use]
    pub fn new(order_id: Uuid, product_code: impl Into<String>) -> Self {
        Self {
            order_id: Some(order_id),
            product_code: Some(product_code.into()),
        }
    }

    pub(crate) fn to_insert(&self) -> Result<(Uuid, &str), FeedbackError> {
        let order_id = self
            .order_id
            .ok_or(FeedbackError::InvalidInput("order_id is required"))?;
        let product_code = self
            .product_code
            .as_deref()
            .ok_or(FeedbackError::InvalidInput("product_code is required"))?;
        Ok((order_id, product_code))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order_id.is_none() && self.product_code.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationEdit {
    pub order_item_id: Option<Uuid>,
    pub phone_number: Option<String>,
    pub status: Option<NotificationStatus>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl NotificationEdit {
    /// 送信試行の結果を記録する行を組み立てる。
    #[must_use]
    pub fn attempt(
        order_item_id: Uuid,
        phone_number: impl Into<String>,
        status: NotificationStatus,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_item_id: Some(order_item_id),
            phone_number: Some(phone_number.into()),
            status: Some(status),
            sent_at: Some(sent_at),
        }
    }

    pub(crate) fn to_insert(&self) -> Result<(Uuid, &str, NotificationStatus), FeedbackError> {
        let order_item_id = self
            .order_item_id
            .ok_or(FeedbackError::InvalidInput("order_item_id is required"))?;
        let phone_number = self
            .phone_number
            .as_deref()
            .ok_or(FeedbackError::InvalidInput("phone_number is required"))?;
        let status = self
            .status
            .ok_or(FeedbackError::InvalidInput("status is required"))?;
        Ok((order_item_id, phone_number, status))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order_item_id.is_none()
            && self.phone_number.is_none()
            && self.status.is_none()
            && self.sent_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_status_parses_its_own_rendering() {
        for status in [NotificationStatus::Sent, NotificationStatus::Failed] {
            assert_eq!(status.as_str().parse::<NotificationStatus>().unwrap(), status);
        }
        assert!("queued".parse::<NotificationStatus>().is_err());
    }

    #[test]
    fn order_insert_requires_external_id_and_phone() {
        let missing_id = OrderEdit {
            user_phone: Some("+77011234567".into()),
            ..OrderEdit::default()
        };
        assert!(matches!(
            missing_id.to_insert(),
            Err(FeedbackError::InvalidInput(_))
        ));

        let complete = OrderEdit::new("ORD1", "+77011234567", "Anna");
        let insert = complete.to_insert().expect("complete edit");
        assert_eq!(insert.external_order_id, "ORD1");
        assert_eq!(insert.user_name, "Anna");
    }

    #[test]
    fn contact_changes_ignore_external_id() {
        let edit = OrderEdit {
            external_order_id: Some("ORD9".into()),
            ..OrderEdit::default()
        };
        assert!(!edit.has_contact_changes());
    }
}
