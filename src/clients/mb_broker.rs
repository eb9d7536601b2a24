//! mb-broker からの完了済み注文・商品コード取得クライアント。
//!
//! `Authorization: Bearer` 認証とページングをサポートします。
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{FetchedOrder, OrderFetcher};
use crate::error::FeedbackError;

const SERVICE: &str = "mb-broker";
const COMPLETED_STATUS: &str = "COMPLETED";

#[derive(Debug, Deserialize)]
struct OrdersPage {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    results: Vec<BrokerOrder>,
}

#[derive(Debug, Deserialize)]
struct BrokerOrder {
    prv_code: String,
    customer: BrokerCustomer,
}

#[derive(Debug, Deserialize)]
struct BrokerCustomer {
    #[serde(default)]
    cell_phone: String,
    #[serde(default)]
    first_name: String,
}

impl From<BrokerOrder> for FetchedOrder {
    fn from(order: BrokerOrder) -> Self {
        Self {
            external_order_id: order.prv_code,
            user_phone: order.customer.cell_phone,
            user_name: order.customer.first_name,
        }
    }
}

#[derive(Debug, Serialize)]
struct ProductCodesRequest<'a> {
    prv_code: &'a str,
}

/// mb-broker クライアントの設定。
#[derive(Debug, Clone)]
pub struct MbBrokerConfig {
    pub base_url: String,
    pub token: String,
    pub provider_id: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MbBrokerClient {
    client: Client,
    base_url: Url,
    token: String,
    provider_id: String,
    page_size: u32,
    max_pages: u32,
}

impl MbBrokerClient {
    /// 新しい mb-broker クライアントを作成する。
    ///
    /// # Errors
    /// URL のパースまたは HTTP クライアントの構築に失敗した場合はエラーを返します。
    pub fn new(config: MbBrokerConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build mb-broker HTTP client")?;

        let base_url = parse_base_url(&config.base_url).context("invalid mb-broker base URL")?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
            provider_id: config.provider_id,
            page_size: config.page_size,
            max_pages: config.max_pages,
        })
    }

    async fn fetch_page(&self, page: u32) -> Result<OrdersPage> {
        let mut url = self
            .base_url
            .join("ord")
            .context("failed to build orders URL")?;
        url.query_pairs_mut()
            .append_pair("prv_id", &self.provider_id)
            .append_pair("page_size", &self.page_size.to_string())
            .append_pair("status", COMPLETED_STATUS)
            .append_pair("page", &page.to_string());

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("mb-broker orders request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, page, body = %body, "mb-broker orders request returned error status");
            return Err(FeedbackError::BadStatusCode {
                service: SERVICE,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        response
            .json()
            .await
            .context("failed to deserialize mb-broker orders page")
    }
}

/// 相対パスの `join` が最終セグメントを置き換えないよう、末尾に `/` を補う。
pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let url = if raw.ends_with('/') {
        Url::parse(raw)?
    } else {
        Url::parse(&format!("{raw}/"))?
    };
    Ok(url)
}

#[async_trait]
impl OrderFetcher for MbBrokerClient {
    async fn fetch_completed_orders(&self) -> Result<Vec<FetchedOrder>> {
        let mut orders = Vec::new();

        for page in 1..=self.max_pages {
            let body = self.fetch_page(page).await?;
            let received = body.results.len();
            orders.extend(body.results.into_iter().map(FetchedOrder::from));

            debug!(
                page,
                received,
                total = orders.len(),
                total_count = body.total_count,
                "fetched mb-broker orders page"
            );

            if received == 0 || orders.len() as u64 >= body.total_count {
                return Ok(orders);
            }
        }

        warn!(
            max_pages = self.max_pages,
            collected = orders.len(),
            "mb-broker pagination stopped at page cap"
        );
        Ok(orders)
    }

    async fn fetch_product_codes(&self, external_order_id: &str) -> Result<Vec<String>> {
        let url = self
            .base_url
            .join("ord/product_codes")
            .context("failed to build product codes URL")?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&ProductCodesRequest {
                prv_code: external_order_id,
            })
            .send()
            .await
            .context("mb-broker product codes request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, external_order_id, body = %body, "mb-broker product codes request returned error status");
            return Err(FeedbackError::BadStatusCode {
                service: SERVICE,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        response
            .json()
            .await
            .context("failed to deserialize mb-broker product codes")
    }
}
