//! Rate-limited origin decorator.
//!
//! Wraps any [`OriginClient`] so every call first acquires a slot from the
//! shared [`RateLimiter`]. One limiter is shared per origin account, so every
//! `Throttled` built for the same account must be handed the same `Arc`.
//!
//! `scan_table` is not wrapped: the provided implementation walks pages
//! through the throttled `scan_page`, so each page takes its own slot.
//!
//! Also records per-operation call outcome and latency metrics.

use super::{
    BoxFuture, ChangePage, Fields, NewSubscription, OriginClient, Record, RecordPage, Subscription,
    SubscriptionFilter, TableRef, TableSchema, WriteReceipt,
};
use crate::error::Result;
use crate::metrics;
use crate::resilience::RateLimiter;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Origin client whose calls pass through a shared sliding-window limiter.
pub struct Throttled<C> {
    inner: C,
    limiter: Arc<RateLimiter>,
}

impl<C: OriginClient> Throttled<C> {
    pub fn new(inner: C, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.limiter.acquire().await;
        let start = Instant::now();
        let result = fut.await;
        metrics::record_origin_call(operation, result.is_ok(), start.elapsed());
        result
    }
}

impl<C: OriginClient> OriginClient for Throttled<C> {
    fn get_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, Option<Record>> {
        Box::pin(self.call("get_record", self.inner.get_record(table, record_id)))
    }

    fn scan_page<'a>(&'a self, table: &'a TableRef, offset: Option<String>) -> BoxFuture<'a, RecordPage> {
        Box::pin(self.call("scan_page", self.inner.scan_page(table, offset)))
    }

    fn list_fields<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<TableSchema>> {
        Box::pin(self.call("list_fields", self.inner.list_fields(base_id)))
    }

    fn list_subscriptions<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<Subscription>> {
        Box::pin(self.call("list_subscriptions", self.inner.list_subscriptions(base_id)))
    }

    fn create_subscription<'a>(
        &'a self,
        base_id: &'a str,
        filter: &'a SubscriptionFilter,
    ) -> BoxFuture<'a, NewSubscription> {
        Box::pin(self.call("create_subscription", self.inner.create_subscription(base_id, filter)))
    }

    fn delete_subscription<'a>(&'a self, base_id: &'a str, subscription_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.call(
            "delete_subscription",
            self.inner.delete_subscription(base_id, subscription_id),
        ))
    }

    fn get_change_page<'a>(
        &'a self,
        base_id: &'a str,
        subscription_id: &'a str,
        cursor: u64,
    ) -> BoxFuture<'a, ChangePage> {
        Box::pin(self.call(
            "get_change_page",
            self.inner.get_change_page(base_id, subscription_id, cursor),
        ))
    }

    fn insert_record<'a>(&'a self, table: &'a TableRef, fields: Fields) -> BoxFuture<'a, WriteReceipt> {
        Box::pin(self.call("insert_record", self.inner.insert_record(table, fields)))
    }

    fn update_record<'a>(
        &'a self,
        table: &'a TableRef,
        record_id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, WriteReceipt> {
        Box::pin(self.call("update_record", self.inner.update_record(table, record_id, fields)))
    }

    fn delete_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.call("delete_record", self.inner.delete_record(table, record_id)))
    }
}
