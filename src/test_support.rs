//! Shared test support utilities
//!
//! Recording doubles for the external capabilities, used by the stage unit tests
//! and the integration tests under `tests/`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::clients::{FetchedOrder, Notifier, OrderFetcher};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetcher double serving canned orders and product codes.
#[derive(Debug, Default)]
pub struct RecordingFetcher {
    orders: Mutex<Vec<FetchedOrder>>,
    product_codes: Mutex<HashMap<String, Vec<String>>>,
    failing_codes: Mutex<HashSet<String>>,
    fail_listing: AtomicBool,
    code_requests: Mutex<Vec<String>>,
}

impl RecordingFetcher {
    pub fn with_orders(orders: Vec<FetchedOrder>) -> Self {
        Self {
            orders: Mutex::new(orders),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_product_codes(self, external_order_id: &str, codes: &[&str]) -> Self {
        lock(&self.product_codes).insert(
            external_order_id.to_string(),
            codes.iter().map(|code| (*code).to_string()).collect(),
        );
        self
    }

    pub fn set_orders(&self, orders: Vec<FetchedOrder>) {
        *lock(&self.orders) = orders;
    }

    pub fn fail_product_codes_for(&self, external_order_id: &str) {
        lock(&self.failing_codes).insert(external_order_id.to_string());
    }

    pub fn fail_order_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }

    /// External IDs passed to `fetch_product_codes`, in call order.
    pub fn code_requests(&self) -> Vec<String> {
        lock(&self.code_requests).clone()
    }
}

#[async_trait]
impl OrderFetcher for RecordingFetcher {
    async fn fetch_completed_orders(&self) -> Result<Vec<FetchedOrder>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            bail!("broker unavailable");
        }
        Ok(lock(&self.orders).clone())
    }

    async fn fetch_product_codes(&self, external_order_id: &str) -> Result<Vec<String>> {
        lock(&self.code_requests).push(external_order_id.to_string());
        if lock(&self.failing_codes).contains(external_order_id) {
            bail!("product codes unavailable for {external_order_id}");
        }
        Ok(lock(&self.product_codes)
            .get(external_order_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub order_external_id: String,
    pub user_phone: String,
    pub user_name: String,
    pub product_code: String,
}

/// Notifier double recording every attempt; selected product codes fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    attempts: Mutex<Vec<SentMessage>>,
    failing_products: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for_product(&self, product_code: &str) {
        lock(&self.failing_products).insert(product_code.to_string());
    }

    pub fn attempts(&self) -> Vec<SentMessage> {
        lock(&self.attempts).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_notification(
        &self,
        order_external_id: &str,
        user_phone: &str,
        user_name: &str,
        product_code: &str,
    ) -> Result<()> {
        lock(&self.attempts).push(SentMessage {
            order_external_id: order_external_id.to_string(),
            user_phone: user_phone.to_string(),
            user_name: user_name.to_string(),
            product_code: product_code.to_string(),
        });
        if lock(&self.failing_products).contains(product_code) {
            bail!("template delivery rejected for {product_code}");
        }
        Ok(())
    }
}
