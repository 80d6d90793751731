//! Subscription repository wrapper that injects concurrent writes and faults

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use critiq_db::{DbError, DbResult, SubscriptionRepository};
use critiq_db::memory::MemorySubscriptionRepository;
use critiq_types::{ExternalSubscriptionId, Subscription, SubscriptionId, UserId};

/// Wraps the in-memory repository.
///
/// `rival` is written just before the next `update`, as if another writer
/// got there first. Updates to `broken` always fail.
#[derive(Default)]
pub struct RacingSubscriptions {
    pub inner: MemorySubscriptionRepository,
    rival: Mutex<Option<Box<dyn FnOnce(&Subscription) -> Subscription + Send>>>,
    broken: Mutex<Option<SubscriptionId>>,
}

#[allow(dead_code)]
impl RacingSubscriptions {
    pub fn new(inner: MemorySubscriptionRepository) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Before the next update, apply `change` to the stored record and
    /// write it back with the stored version
    pub fn race_next_update(
        &self,
        change: impl FnOnce(&Subscription) -> Subscription + Send + 'static,
    ) {
        *self.rival.lock().unwrap() = Some(Box::new(change));
    }

    pub fn break_updates_for(&self, id: SubscriptionId) {
        *self.broken.lock().unwrap() = Some(id);
    }
}

#[async_trait]
impl SubscriptionRepository for RacingSubscriptions {
    async fn find_by_id(&self, id: SubscriptionId) -> DbResult<Option<Subscription>> {
        self.inner.find_by_id(id).await
    }

    async fn find_current_by_user_id(&self, user_id: UserId) -> DbResult<Option<Subscription>> {
        self.inner.find_current_by_user_id(user_id).await
    }

    async fn find_by_external_id(
        &self,
        external_id: &ExternalSubscriptionId,
    ) -> DbResult<Option<Subscription>> {
        self.inner.find_by_external_id(external_id).await
    }

    async fn find_latest_terminal_paid_by_user_id(
        &self,
        user_id: UserId,
    ) -> DbResult<Option<Subscription>> {
        self.inner.find_latest_terminal_paid_by_user_id(user_id).await
    }

    async fn list_by_user_id(&self, user_id: UserId) -> DbResult<Vec<Subscription>> {
        self.inner.list_by_user_id(user_id).await
    }

    async fn insert(&self, sub: &Subscription) -> DbResult<Subscription> {
        self.inner.insert(sub).await
    }

    async fn update(&self, sub: &Subscription) -> DbResult<Subscription> {
        if *self.broken.lock().unwrap() == Some(sub.id) {
            return Err(DbError::Corrupt(format!("injected fault for {}", sub.id)));
        }

        let rival = self.rival.lock().unwrap().take();
        if let Some(change) = rival {
            if let Some(stored) = self.inner.find_by_id(sub.id).await? {
                let raced = change(&stored);
                self.inner.update(&raced).await?;
            }
        }
        self.inner.update(sub).await
    }

    async fn list_current_ending_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        self.inner.list_current_ending_before(cutoff, limit).await
    }

    async fn list_past_due_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Subscription>> {
        self.inner.list_past_due_since(cutoff, limit).await
    }
}
