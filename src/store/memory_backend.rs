//! In-memory notification store using DashMap.
//!
//! Documents live in a `DashMap`; the map entry lock gives per-document
//! atomicity. Secondary indexes are ordered sets keyed by
//! `(created_at, seq, id)` where `seq` is a per-store insertion counter that
//! breaks timestamp ties.
//!
//! Lock order is always document shard, then index. Readers snapshot index
//! keys, release the index, and only then look documents up, so no path
//! acquires a document shard while holding an index lock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::notification::Notification;

use super::{NotificationStore, Pagination, StoreError, StoreStats, UpsertOutcome};

type TimeKey = (DateTime<Utc>, u64, Uuid);

struct Document {
    notification: Notification,
    seq: u64,
}

impl Document {
    fn time_key(&self) -> TimeKey {
        (self.notification.created_at, self.seq, self.notification.id)
    }
}

pub struct MemoryNotificationStore {
    documents: DashMap<Uuid, Document>,
    /// recipient -> unread notifications
    unread: DashMap<Uuid, BTreeSet<TimeKey>>,
    undelivered: Mutex<BTreeSet<TimeKey>>,
    expiry: Mutex<BTreeSet<(DateTime<Utc>, Uuid)>>,
    seq: AtomicU64,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            unread: DashMap::new(),
            undelivered: Mutex::new(BTreeSet::new()),
            expiry: Mutex::new(BTreeSet::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn index(&self, doc: &Document) {
        let n = &doc.notification;
        if !n.is_read {
            self.unread
                .entry(n.recipient_id)
                .or_default()
                .insert(doc.time_key());
        }
        if !n.delivered {
            lock(&self.undelivered).insert(doc.time_key());
        }
        if let Some(at) = n.expires_at {
            lock(&self.expiry).insert((at, n.id));
        }
    }

    fn deindex(&self, notification: &Notification, seq: u64) {
        let key = (notification.created_at, seq, notification.id);
        let recipient = notification.recipient_id;
        let emptied = self
            .unread
            .get_mut(&recipient)
            .map(|mut set| {
                set.remove(&key);
                set.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            self.unread.remove_if(&recipient, |_, set| set.is_empty());
        }
        lock(&self.undelivered).remove(&key);
        if let Some(at) = notification.expires_at {
            lock(&self.expiry).remove(&(at, notification.id));
        }
    }

    /// Apply `f` to one document under its entry lock and re-index it.
    fn modify<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Notification) -> T,
    ) -> Result<T, StoreError> {
        let mut doc = self.documents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let before = doc.notification.clone();
        let result = f(&mut doc.notification);
        if before != doc.notification {
            self.deindex(&before, doc.seq);
            self.index(&doc);
        }
        Ok(result)
    }

    fn live_documents<'a>(
        &'a self,
        keys: impl Iterator<Item = TimeKey> + 'a,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = Notification> + 'a {
        keys.filter_map(move |(_, _, id)| {
            self.documents
                .get(&id)
                .map(|doc| doc.notification.clone())
                .filter(|n| !n.is_expired(now))
        })
    }

    fn unread_keys(&self, recipient_id: Uuid) -> Vec<TimeKey> {
        self.unread
            .get(&recipient_id)
            .map(|set| set.iter().rev().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Poisoning is ignored; a set is valid after any partial update.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, notification: Notification) -> Result<UpsertOutcome, StoreError> {
        match self.documents.entry(notification.id) {
            Entry::Occupied(mut entry) => {
                let doc = entry.get_mut();
                let before = doc.notification.clone();
                doc.notification.merge_from(&notification);
                if before != doc.notification {
                    self.deindex(&before, doc.seq);
                    self.index(doc);
                }
                Ok(UpsertOutcome::Existing)
            }
            Entry::Vacant(entry) => {
                let doc = Document {
                    notification,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                };
                self.index(&doc);
                entry.insert(doc);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        Ok(self.documents.get(&id).map(|doc| doc.notification.clone()))
    }

    async fn list_unread(
        &self,
        recipient_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<Notification>, StoreError> {
        let keys = self.unread_keys(recipient_id);
        Ok(self
            .live_documents(keys.into_iter(), Utc::now())
            .filter(|n| !n.is_read)
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn unread_count(&self, recipient_id: Uuid) -> Result<u64, StoreError> {
        let keys = self.unread_keys(recipient_id);
        Ok(self
            .live_documents(keys.into_iter(), Utc::now())
            .filter(|n| !n.is_read)
            .count() as u64)
    }

    async fn list_undelivered(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let keys: Vec<TimeKey> = lock(&self.undelivered)
            .iter()
            .take_while(|(created_at, _, _)| *created_at <= created_before)
            .copied()
            .collect();

        Ok(self
            .live_documents(keys.into_iter(), Utc::now())
            .filter(|n| !n.delivered && n.delivery_attempts < max_attempts)
            .take(limit)
            .collect())
    }

    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.modify(id, |n| n.apply_delivered(at))
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.modify(id, |n| n.apply_read(at))
    }

    async fn mark_all_read(
        &self,
        recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut updated = 0;
        for (_, _, id) in self.unread_keys(recipient_id) {
            match self.modify(id, |n| !n.is_expired(at) && n.apply_read(at)) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                // Deleted concurrently
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    async fn record_delivery_attempt(&self, id: Uuid) -> Result<u32, StoreError> {
        self.modify(id, |n| {
            n.delivery_attempts = n.delivery_attempts.saturating_add(1);
            n.delivery_attempts
        })
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        match self.documents.remove(&id) {
            Some((_, doc)) => {
                self.deindex(&doc.notification, doc.seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let candidates: Vec<Uuid> = lock(&self.expiry)
            .iter()
            .take_while(|(at, _)| *at < now)
            .map(|(_, id)| *id)
            .collect();

        let mut purged = 0;
        for id in candidates {
            if let Some((_, doc)) = self
                .documents
                .remove_if(&id, |_, doc| doc.notification.is_expired(now))
            {
                self.deindex(&doc.notification, doc.seq);
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let unread = self.unread.iter().map(|set| set.len() as u64).sum();
        Ok(StoreStats {
            backend: "memory",
            total: self.documents.len() as u64,
            unread,
            undelivered: lock(&self.undelivered).len() as u64,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::notification::NotificationKind;
    use chrono::Duration;
    use serde_json::json;

    fn notification(recipient: Uuid, created_at: DateTime<Utc>) -> Notification {
        let envelope = Envelope::builder("user.liked", "test")
            .payload(json!({ "recipientId": recipient.to_string(), "title": "Liked" }))
            .build();
        Notification::from_envelope(&envelope, NotificationKind::UserNotification, created_at)
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryNotificationStore::new();
        let n = notification(Uuid::new_v4(), Utc::now());

        assert_eq!(store.upsert(n.clone()).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(n.clone()).await.unwrap(), UpsertOutcome::Existing);
        assert_eq!(store.len(), 1);
        assert_eq!(store.unread_count(n.recipient_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_envelope_does_not_regress_state() {
        let store = MemoryNotificationStore::new();
        let n = notification(Uuid::new_v4(), Utc::now());
        store.upsert(n.clone()).await.unwrap();
        store.mark_read(n.id, Utc::now()).await.unwrap();

        // Broker redelivery replays the original, unread version
        store.upsert(n.clone()).await.unwrap();

        let stored = store.get(n.id).await.unwrap().unwrap();
        assert!(stored.is_read);
        assert!(stored.delivered);
        assert_eq!(store.unread_count(n.recipient_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_unread_newest_first_with_tie_break() {
        let store = MemoryNotificationStore::new();
        let recipient = Uuid::new_v4();
        let base = Utc::now();

        let oldest = notification(recipient, base - Duration::minutes(5));
        let tie_a = notification(recipient, base);
        let tie_b = notification(recipient, base);
        for n in [&oldest, &tie_a, &tie_b] {
            store.upsert(n.clone()).await.unwrap();
        }

        let ids: Vec<Uuid> = store
            .list_unread(recipient, Pagination::default())
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        // Same timestamp: later insertion first
        assert_eq!(ids, vec![tie_b.id, tie_a.id, oldest.id]);

        let second_page = store
            .list_unread(recipient, Pagination::new(1, 1))
            .await
            .unwrap();
        assert_eq!(second_page[0].id, tie_a.id);
    }

    #[tokio::test]
    async fn test_mark_transitions() {
        let store = MemoryNotificationStore::new();
        let n = notification(Uuid::new_v4(), Utc::now());
        store.upsert(n.clone()).await.unwrap();

        assert!(store.mark_delivered(n.id, Utc::now()).await.unwrap());
        assert!(!store.mark_delivered(n.id, Utc::now()).await.unwrap());
        assert!(store.mark_read(n.id, Utc::now()).await.unwrap());
        assert!(!store.mark_read(n.id, Utc::now()).await.unwrap());

        let missing = Uuid::new_v4();
        assert!(matches!(
            store.mark_read(missing, Utc::now()).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_mark_read_implies_delivered() {
        let store = MemoryNotificationStore::new();
        let n = notification(Uuid::new_v4(), Utc::now());
        store.upsert(n.clone()).await.unwrap();

        let at = Utc::now();
        store.mark_read(n.id, at).await.unwrap();
        let stored = store.get(n.id).await.unwrap().unwrap();
        assert!(stored.delivered);
        assert_eq!(stored.delivered_at, Some(at));
        assert!(store
            .list_undelivered(Utc::now(), u32::MAX, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_mark_all_read() {
        let store = MemoryNotificationStore::new();
        let recipient = Uuid::new_v4();
        for _ in 0..3 {
            store.upsert(notification(recipient, Utc::now())).await.unwrap();
        }
        let other = notification(Uuid::new_v4(), Utc::now());
        store.upsert(other.clone()).await.unwrap();

        assert_eq!(store.mark_all_read(recipient, Utc::now()).await.unwrap(), 3);
        assert_eq!(store.unread_count(recipient).await.unwrap(), 0);
        assert_eq!(store.unread_count(other.recipient_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_undelivered_oldest_first_and_cutoff() {
        let store = MemoryNotificationStore::new();
        let now = Utc::now();
        let old = notification(Uuid::new_v4(), now - Duration::minutes(10));
        let older = notification(Uuid::new_v4(), now - Duration::minutes(20));
        let fresh = notification(Uuid::new_v4(), now);
        for n in [&old, &older, &fresh] {
            store.upsert(n.clone()).await.unwrap();
        }

        let ids: Vec<Uuid> = store
            .list_undelivered(now - Duration::minutes(1), u32::MAX, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![older.id, old.id]);
    }

    #[tokio::test]
    async fn test_list_undelivered_skips_exhausted_before_limit() {
        let store = MemoryNotificationStore::new();
        let now = Utc::now();
        for minutes in 20..25 {
            let mut exhausted = notification(Uuid::new_v4(), now - Duration::minutes(minutes));
            exhausted.delivery_attempts = 3;
            store.upsert(exhausted).await.unwrap();
        }
        let eligible = notification(Uuid::new_v4(), now - Duration::minutes(10));
        store.upsert(eligible.clone()).await.unwrap();

        let found = store.list_undelivered(now, 3, 5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, eligible.id);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryNotificationStore::new();
        let now = Utc::now();
        let mut expired = notification(Uuid::new_v4(), now - Duration::days(10));
        expired.expires_at = Some(now - Duration::seconds(1));
        let live = notification(expired.recipient_id, now);
        store.upsert(expired.clone()).await.unwrap();
        store.upsert(live.clone()).await.unwrap();

        // Expired records are hidden before the sweep runs
        assert_eq!(store.unread_count(expired.recipient_id).await.unwrap(), 1);

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert!(store.get(expired.id).await.unwrap().is_none());
        assert!(store.get(live.id).await.unwrap().is_some());
        assert_eq!(store.purge_expired(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expiry_only_extends() {
        let store = MemoryNotificationStore::new();
        let now = Utc::now();
        let mut n = notification(Uuid::new_v4(), now);
        n.expires_at = Some(now + Duration::days(30));
        store.upsert(n.clone()).await.unwrap();

        let mut shorter = n.clone();
        shorter.expires_at = Some(now + Duration::days(1));
        store.upsert(shorter).await.unwrap();

        // The shorter expiry must not make the sweep remove it early
        assert_eq!(store.purge_expired(now + Duration::days(2)).await.unwrap(), 0);
        assert_eq!(
            store.get(n.id).await.unwrap().unwrap().expires_at,
            Some(now + Duration::days(30))
        );
    }

    #[tokio::test]
    async fn test_delete_and_attempts() {
        let store = MemoryNotificationStore::new();
        let n = notification(Uuid::new_v4(), Utc::now());
        store.upsert(n.clone()).await.unwrap();

        assert_eq!(store.record_delivery_attempt(n.id).await.unwrap(), 1);
        assert_eq!(store.record_delivery_attempt(n.id).await.unwrap(), 2);

        assert!(store.delete(n.id).await.unwrap());
        assert!(!store.delete(n.id).await.unwrap());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.unread, 0);
        assert_eq!(stats.undelivered, 0);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_single_record() {
        let store = std::sync::Arc::new(MemoryNotificationStore::new());
        let n = notification(Uuid::new_v4(), Utc::now());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let n = n.clone();
                tokio::spawn(async move { store.upsert(n).await.unwrap() })
            })
            .collect();
        let outcomes = futures::future::join_all(handles).await;
        let inserted = outcomes
            .into_iter()
            .filter(|o| *o.as_ref().unwrap() == UpsertOutcome::Inserted)
            .count();

        assert_eq!(inserted, 1);
        assert_eq!(store.len(), 1);
    }
}
