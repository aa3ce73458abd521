// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Webhook change capture, one instance per origin base.
//!
//! Owns the base's subscription and its payload cursor, and turns change
//! payloads into [`ChangeAction`]s.
//!
//! # State Machine
//!
//! ```text
//!                  ensure_initialized()
//!   Uninitialized ─────────────────────▶ Active ◀──────────┐
//!                  (adopt or create)       │               │
//!                                          │ invalid payload / watched field deleted
//!                                          ▼               │
//!                                      Recreating ─────────┘
//!                               (delete old, strip deleted fields, create)
//! ```
//!
//! Subscriptions are rediscovered on every start; nothing about them is
//! persisted locally. The cursor only moves forward, except that recreation
//! starts a fresh subscription at its own initial cursor.

use crate::alert::{AlertLevel, Alerter};
use crate::config::WebhookConfig;
use crate::error::{MirrorError, Result};
use crate::origin::{ChangePayload, NewSubscription, OriginClient, Subscription, SubscriptionFilter};
use crate::queue::ChangeAction;
use crate::resilience::{retry_with_backoff, RetryPolicy};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a capture instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No subscription adopted yet.
    Uninitialized,
    /// Reading payloads from an adopted subscription.
    Active,
    /// Old subscription discarded; a new one has not been created yet.
    Recreating,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Active => write!(f, "Active"),
            Self::Recreating => write!(f, "Recreating"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveSubscription {
    id: String,
    cursor: u64,
}

/// Change capture for one base.
pub struct WebhookCapture<O> {
    base_id: String,
    origin: Arc<O>,
    alerter: Arc<dyn Alerter>,
    config: WebhookConfig,
    /// Field ids the mappings track on this base.
    desired_fields: BTreeSet<String>,
    /// Fields the origin reported deleted; never watched again.
    known_deleted: BTreeSet<String>,
    subscription: Option<ActiveSubscription>,
    state: CaptureState,
}

impl<O: OriginClient> WebhookCapture<O> {
    pub fn new(
        base_id: impl Into<String>,
        desired_fields: BTreeSet<String>,
        origin: Arc<O>,
        alerter: Arc<dyn Alerter>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            base_id: base_id.into(),
            origin,
            alerter,
            config,
            desired_fields,
            known_deleted: BTreeSet::new(),
            subscription: None,
            state: CaptureState::Uninitialized,
        }
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id.as_str())
    }

    /// Cursor of the next unread payload.
    pub fn cursor(&self) -> Option<u64> {
        self.subscription.as_ref().map(|s| s.cursor)
    }

    /// Field ids currently watched: desired minus known-deleted.
    pub fn watched_fields(&self) -> BTreeSet<String> {
        self.desired_fields.difference(&self.known_deleted).cloned().collect()
    }

    fn desired_filter(&self) -> SubscriptionFilter {
        SubscriptionFilter::for_fields(&self.watched_fields())
    }

    /// Adopt a matching subscription or create one.
    #[instrument(skip(self), fields(base_id = %self.base_id))]
    pub async fn ensure_initialized(&mut self) -> Result<()> {
        if self.state == CaptureState::Active && self.subscription.is_some() {
            return Ok(());
        }

        let desired = self.desired_filter();
        let mut matching: Vec<Subscription> = self
            .origin
            .list_subscriptions(&self.base_id)
            .await?
            .into_iter()
            .filter(|s| s.filter.as_ref().is_some_and(|f| desired.is_satisfied_by(f)))
            .collect();

        if matching.is_empty() {
            info!("No matching subscription, creating one");
            return self.create_subscription().await;
        }
        let existing = matching.remove(0);
        self.release_duplicates(&existing.id, matching).await;

        self.subscription = Some(ActiveSubscription {
            id: existing.id.clone(),
            cursor: existing.cursor,
        });

        match existing.last_error {
            Some(ref err) if err.is_invalid_subscription() => {
                self.known_deleted.extend(existing.deleted_field_ids.iter().cloned());
                let message = format!(
                    "Subscription {} for base {} is invalid ({}), recreating",
                    existing.id, self.base_id, err.code
                );
                warn!(subscription_id = %existing.id, code = %err.code, "{}", message);
                self.alerter.alert(AlertLevel::Warning, &message);
                self.recreate("invalid_subscription").await
            }
            _ => {
                info!(
                    subscription_id = %existing.id,
                    cursor = existing.cursor,
                    "Adopted existing subscription"
                );
                self.state = CaptureState::Active;
                Ok(())
            }
        }
    }

    /// Extra matching subscriptions still count against the per-base limit.
    /// They are deleted only when destructive cleanup is enabled.
    async fn release_duplicates(&self, adopted: &str, duplicates: Vec<Subscription>) {
        if duplicates.is_empty() {
            return;
        }
        let ids: Vec<&str> = duplicates.iter().map(|s| s.id.as_str()).collect();
        if !self.config.allow_destructive_cleanup {
            warn!(adopted, duplicates = ?ids, "Duplicate matching subscriptions left in place");
            return;
        }
        for id in ids {
            match self.origin.delete_subscription(&self.base_id, id).await {
                Ok(()) => info!(subscription_id = id, adopted, "Deleted duplicate subscription"),
                Err(e) => warn!(subscription_id = id, error = %e, "Failed to delete duplicate subscription"),
            }
        }
    }

    /// Read every unread payload and convert it to actions.
    ///
    /// Pages already consumed are kept even if a later page request fails.
    #[instrument(skip(self), fields(base_id = %self.base_id))]
    pub async fn pop_actions(&mut self) -> Result<Vec<ChangeAction>> {
        self.ensure_initialized().await?;
        let Some(ActiveSubscription { id, mut cursor }) = self.subscription.clone() else {
            return Err(MirrorError::Internal(format!(
                "base {} has no subscription after initialization",
                self.base_id
            )));
        };

        let watched = self.watched_fields();
        let mut actions = Vec::new();
        let mut recreate_reason: Option<&'static str> = None;
        let mut pages = 0usize;

        loop {
            let page = match self.origin.get_change_page(&self.base_id, &id, cursor).await {
                Ok(page) => page,
                Err(e) if pages > 0 => {
                    warn!(error = %e, cursor, "Page request failed, keeping actions read so far");
                    break;
                }
                Err(e) => return Err(e),
            };
            pages += 1;
            crate::metrics::record_webhook_payloads(&self.base_id, page.payloads.len());

            for payload in page.payloads {
                match &payload.error {
                    Some(err) if err.is_invalid_subscription() => {
                        crate::metrics::record_webhook_payload_error(&self.base_id, &err.code);
                        let message = format!(
                            "Subscription {} for base {} reported {}, recreating",
                            id, self.base_id, err.code
                        );
                        warn!("{}", message);
                        self.alerter.alert(AlertLevel::Warning, &message);
                        self.known_deleted.extend(destroyed_fields(&payload));
                        actions.extend(self.payload_actions(&payload));
                        recreate_reason = Some("invalid_subscription");
                    }
                    Some(err) => {
                        crate::metrics::record_webhook_payload_error(&self.base_id, &err.code);
                        let message = format!(
                            "Unrecoverable payload error on base {}: {} {}",
                            self.base_id,
                            err.code,
                            err.message.as_deref().unwrap_or("")
                        );
                        error!("{}", message.trim_end());
                        self.alerter.alert(AlertLevel::Error, message.trim_end());
                    }
                    None => {
                        let deleted: Vec<String> = destroyed_fields(&payload)
                            .filter(|f| watched.contains(f))
                            .collect();
                        if !deleted.is_empty() {
                            let message = format!(
                                "Watched fields deleted on base {}: {}; recreating subscription",
                                self.base_id,
                                deleted.join(", ")
                            );
                            warn!("{}", message);
                            self.alerter.alert(AlertLevel::Warning, &message);
                            self.known_deleted.extend(deleted);
                            recreate_reason.get_or_insert("field_deleted");
                        }
                        actions.extend(self.payload_actions(&payload));
                    }
                }
            }

            cursor = page.cursor;
            if let Some(sub) = self.subscription.as_mut() {
                sub.cursor = cursor;
            }

            if recreate_reason.is_some() || !page.might_have_more {
                break;
            }
        }

        debug!(actions = actions.len(), pages, cursor, "Popped actions");
        crate::metrics::record_actions_polled(&self.base_id, actions.len());

        if let Some(reason) = recreate_reason {
            if let Err(e) = self.recreate(reason).await {
                let message = format!("Failed to recreate subscription for base {}: {}", self.base_id, e);
                error!("{}", message);
                self.alerter.alert(AlertLevel::Error, &message);
            }
        }

        Ok(actions)
    }

    /// One action per created, changed and destroyed record.
    fn payload_actions(&self, payload: &ChangePayload) -> Vec<ChangeAction> {
        let mut actions = Vec::new();
        for (table_id, changes) in &payload.tables {
            for record_id in &changes.created {
                actions.push(ChangeAction::upsert(&self.base_id, table_id, record_id));
            }
            for (record_id, fields) in &changes.changed {
                actions.push(ChangeAction::upsert(&self.base_id, table_id, record_id).with_fields(fields.iter().cloned()));
            }
            for record_id in &changes.destroyed {
                actions.push(ChangeAction::delete(&self.base_id, table_id, record_id));
            }
        }
        actions
    }

    /// Discard the current subscription and create a fresh one.
    async fn recreate(&mut self, reason: &str) -> Result<()> {
        self.state = CaptureState::Recreating;
        crate::metrics::record_subscription_recreated(&self.base_id, reason);

        if let Some(old) = self.subscription.take() {
            if let Err(e) = self.origin.delete_subscription(&self.base_id, &old.id).await {
                warn!(subscription_id = %old.id, error = %e, "Failed to delete old subscription");
            }
        }

        info!(reason, stripped = self.known_deleted.len(), "Recreating subscription");
        self.create_subscription().await
    }

    /// Validate watched fields against the live schema, then create.
    async fn create_subscription(&mut self) -> Result<()> {
        let watched = self.watched_fields();
        if !watched.is_empty() {
            let live: BTreeSet<String> = self
                .origin
                .list_fields(&self.base_id)
                .await?
                .into_iter()
                .flat_map(|t| t.fields.into_iter().map(|f| f.id))
                .collect();
            let missing: Vec<String> = watched.difference(&live).cloned().collect();
            if !missing.is_empty() {
                let message = format!(
                    "Dropping {} watched fields missing from base {}: {}",
                    missing.len(),
                    self.base_id,
                    missing.join(", ")
                );
                warn!("{}", message);
                self.alerter.alert(AlertLevel::Warning, &message);
                self.known_deleted.extend(missing);
            }
        }

        let filter = self.desired_filter();
        let created = self.create_with_retry(&filter).await?;
        info!(subscription_id = %created.id, cursor = created.cursor, "Created subscription");
        self.subscription = Some(ActiveSubscription {
            id: created.id,
            cursor: created.cursor,
        });
        self.state = CaptureState::Active;
        Ok(())
    }

    async fn create_with_retry(&self, filter: &SubscriptionFilter) -> Result<NewSubscription> {
        let policy = RetryPolicy::linear(
            self.config.creation_attempts,
            self.config.creation_backoff_step_duration(),
        );
        let allow_cleanup = self.config.allow_destructive_cleanup;

        let result = retry_with_backoff(
            "create_subscription",
            &policy,
            |e: &MirrorError| match e {
                MirrorError::SubscriptionLimit { .. } => allow_cleanup,
                other => other.is_retryable(),
            },
            |_attempt| async move {
                match self.origin.create_subscription(&self.base_id, filter).await {
                    Err(e @ MirrorError::SubscriptionLimit { .. }) if allow_cleanup => {
                        self.cleanup_all().await;
                        Err(e)
                    }
                    other => other,
                }
            },
        )
        .await;

        result.map_err(|failure| {
            if let MirrorError::SubscriptionLimit { .. } = failure.error {
                let message = if allow_cleanup {
                    format!(
                        "Subscription limit still reached for base {} after cleanup ({} attempts)",
                        self.base_id, failure.attempts
                    )
                } else {
                    format!(
                        "Subscription limit reached for base {}; destructive cleanup is disabled",
                        self.base_id
                    )
                };
                error!("{}", message);
                self.alerter.alert(AlertLevel::Error, &message);
            }
            failure.error
        })
    }

    /// Delete every subscription on the base. Failures are logged.
    async fn cleanup_all(&self) -> usize {
        let subscriptions = match self.origin.list_subscriptions(&self.base_id).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(base_id = %self.base_id, error = %e, "Failed to list subscriptions for cleanup");
                return 0;
            }
        };

        let mut deleted = 0;
        for sub in &subscriptions {
            match self.origin.delete_subscription(&self.base_id, &sub.id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(subscription_id = %sub.id, error = %e, "Failed to delete subscription"),
            }
        }

        let message = format!(
            "Subscription limit hit on base {}: deleted {} of {} subscriptions",
            self.base_id,
            deleted,
            subscriptions.len()
        );
        warn!("{}", message);
        self.alerter.alert(AlertLevel::Warning, &message);
        deleted
    }
}

fn destroyed_fields(payload: &ChangePayload) -> impl Iterator<Item = String> + '_ {
    payload
        .tables
        .values()
        .flat_map(|t| t.destroyed_field_ids.iter().cloned())
}

impl<O> std::fmt::Debug for WebhookCapture<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookCapture")
            .field("base_id", &self.base_id)
            .field("state", &self.state)
            .field("subscription", &self.subscription)
            .field("known_deleted", &self.known_deleted)
            .finish()
    }
}
