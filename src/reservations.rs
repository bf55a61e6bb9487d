// src/reservations.rs
//
// In-memory mirror of the active reservations. Expired entries are pruned
// lazily before reads; an expired reservation that was never matched by an
// occupied spot produces exactly one fine. Side effects the store rejected
// are queued again and resent by a later pruning pass.

use crate::persistence::ReservationStore;
use crate::pipeline::MonitorMetrics;
use crate::types::{Fine, Reservation};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Side effects requested by the cache, executed off the processing loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceCommand {
    DeleteReservations(Vec<String>),
    RecordFine(Fine),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    reservation: Reservation,
    matched: bool,
}

#[derive(Debug, Default, Clone)]
pub struct PruneOutcome {
    pub expired: Vec<String>,
    pub fined: Vec<Fine>,
}

/// Minimum wait before a rejected command is resent.
const RETRY_DELAY_SECS: i64 = 5;

#[derive(Default)]
struct RetryQueue {
    commands: Vec<PersistenceCommand>,
    not_before: Option<DateTime<Utc>>,
}

pub struct ReservationCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    retries: Mutex<RetryQueue>,
    fine_amount: f64,
    commands: Option<UnboundedSender<PersistenceCommand>>,
    metrics: Option<MonitorMetrics>,
}

impl ReservationCache {
    pub fn new(fine_amount: f64, commands: Option<UnboundedSender<PersistenceCommand>>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retries: Mutex::new(RetryQueue::default()),
            fine_amount,
            commands,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MonitorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, spot: &str) -> Option<Reservation> {
        self.get_at(spot, Utc::now())
    }

    pub fn get_at(&self, spot: &str, now: DateTime<Utc>) -> Option<Reservation> {
        self.prune_at(now);
        self.lock().get(spot).map(|e| e.reservation.clone())
    }

    /// Prune, then copy every active reservation keyed by spot.
    pub fn active_snapshot(&self, now: DateTime<Utc>) -> HashMap<String, Reservation> {
        self.prune_at(now);
        self.lock()
            .iter()
            .map(|(spot, e)| (spot.clone(), e.reservation.clone()))
            .collect()
    }

    pub fn list(&self) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .active_snapshot(Utc::now())
            .into_values()
            .collect();
        out.sort_by(|a, b| a.spot.cmp(&b.spot));
        out
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Full reload from the store. On failure the current contents are kept.
    pub async fn refresh(&self, store: &dyn ReservationStore) -> Vec<Reservation> {
        match store.list_active_reservations().await {
            Ok(list) => {
                let now = Utc::now();
                // Anything already expired must be fined before the reload drops it.
                self.prune_at(now);
                self.replace(list, now);
            }
            Err(e) => warn!("Reservation refresh failed, keeping cached copy: {:#}", e),
        }
        self.list()
    }

    /// Swap the whole cache for `list`, keeping `matched` flags of
    /// reservations that survive the reload.
    pub fn replace(&self, list: Vec<Reservation>, now: DateTime<Utc>) {
        let mut entries = self.lock();
        let mut next: HashMap<String, CacheEntry> = HashMap::with_capacity(list.len());

        for reservation in list {
            if reservation.is_expired_at(now) {
                continue;
            }
            let matched = entries
                .get(&reservation.spot)
                .map(|e| e.reservation.id == reservation.id && e.matched)
                .unwrap_or(false);
            if next.contains_key(&reservation.spot) {
                warn!(
                    "More than one active reservation for {}, keeping the latest",
                    reservation.spot
                );
            }
            next.insert(
                reservation.spot.clone(),
                CacheEntry {
                    reservation,
                    matched,
                },
            );
        }

        debug!("Reservation cache reloaded: {} active", next.len());
        *entries = next;
    }

    pub fn insert(&self, reservation: Reservation) {
        self.lock().insert(
            reservation.spot.clone(),
            CacheEntry {
                reservation,
                matched: false,
            },
        );
    }

    /// Record that the spot was seen occupied under its reservation.
    pub fn mark_matched(&self, spot: &str) -> bool {
        match self.lock().get_mut(spot) {
            Some(entry) => {
                if !entry.matched {
                    debug!("Reservation {} on {} matched", entry.reservation.id, spot);
                }
                entry.matched = true;
                true
            }
            None => false,
        }
    }

    /// Drop every entry with expiry <= now. Unmatched ones are fined.
    pub fn prune_at(&self, now: DateTime<Utc>) -> PruneOutcome {
        let removed: Vec<CacheEntry> = {
            let mut entries = self.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.reservation.is_expired_at(now))
                .map(|(spot, _)| spot.clone())
                .collect();
            expired
                .iter()
                .filter_map(|spot| entries.remove(spot))
                .collect()
        };

        let retries = self.take_retries(now);
        if !retries.is_empty() {
            debug!("Resending {} persistence command(s)", retries.len());
            self.send_all(retries);
        }

        if removed.is_empty() {
            return PruneOutcome::default();
        }

        let mut outcome = PruneOutcome::default();
        for entry in removed {
            outcome.expired.push(entry.reservation.spot.clone());
            if !entry.matched {
                outcome.fined.push(Fine {
                    reservation_id: entry.reservation.id,
                    spot: entry.reservation.spot.clone(),
                    plate: entry.reservation.plate.clone(),
                    amount: self.fine_amount,
                    issued_at: now,
                });
            }
        }
        outcome.expired.sort();

        info!(
            "⏰ {} reservation(s) expired, {} unmatched",
            outcome.expired.len(),
            outcome.fined.len()
        );

        if let Some(metrics) = &self.metrics {
            metrics.add(&metrics.reservations_expired, outcome.expired.len() as u64);
            metrics.add(&metrics.fines_scheduled, outcome.fined.len() as u64);
        }

        let mut commands = vec![PersistenceCommand::DeleteReservations(
            outcome.expired.clone(),
        )];
        commands.extend(outcome.fined.iter().cloned().map(PersistenceCommand::RecordFine));
        self.send_all(commands);

        outcome
    }

    fn send_all(&self, commands: Vec<PersistenceCommand>) {
        let Some(tx) = &self.commands else {
            return;
        };
        let mut sent = true;
        for command in commands {
            sent &= tx.send(command).is_ok();
        }
        if !sent {
            warn!("Persistence worker is gone, expiry side effects dropped");
        }
    }

    /// Keep a command the store rejected; the next pruning pass after the
    /// retry delay sends it again.
    pub fn requeue(&self, command: PersistenceCommand) {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        retries.commands.push(command);
        retries.not_before = Some(Utc::now() + Duration::seconds(RETRY_DELAY_SECS));
    }

    fn take_retries(&self, now: DateTime<Utc>) -> Vec<PersistenceCommand> {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        if retries.commands.is_empty() || retries.not_before.is_some_and(|t| now < t) {
            return Vec::new();
        }
        retries.not_before = None;
        std::mem::take(&mut retries.commands)
    }
}

/// Executes cache side effects against the store and reloads the cache after
/// deletions. Runs until every sender is dropped.
pub async fn run_persistence_worker(
    mut rx: UnboundedReceiver<PersistenceCommand>,
    store: Arc<dyn ReservationStore>,
    cache: Arc<ReservationCache>,
) {
    info!("Persistence worker started");
    while let Some(command) = rx.recv().await {
        execute_command(command, store.as_ref(), &cache).await;
    }
    info!("Persistence worker stopped");
}

/// Run one command; a rejected command goes back to the cache for retry.
pub async fn execute_command(
    command: PersistenceCommand,
    store: &dyn ReservationStore,
    cache: &ReservationCache,
) {
    match command {
        PersistenceCommand::DeleteReservations(spots) => {
            if let Err(e) = store.delete_reservations(&spots).await {
                warn!("Failed to delete reservations {:?}, will retry: {:#}", spots, e);
                cache.requeue(PersistenceCommand::DeleteReservations(spots));
            }
            cache.refresh(store).await;
        }
        PersistenceCommand::RecordFine(fine) => {
            if let Err(e) = store.record_fine(&fine).await {
                warn!("Failed to record fine for {}, will retry: {:#}", fine.spot, e);
                cache.requeue(PersistenceCommand::RecordFine(fine));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryReservationStore;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn reservation(spot: &str, expires_at: DateTime<Utc>) -> Reservation {
        Reservation {
            id: Uuid::new_v4(),
            spot: spot.to_string(),
            plate: "ABC-1D23".to_string(),
            plate_norm: Some("ABC1D23".to_string()),
            reserved_by: None,
            created_at: expires_at - Duration::hours(1),
            expires_at,
        }
    }

    #[test]
    fn test_prune_removes_expired_and_fines_unmatched_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = ReservationCache::new(20.0, Some(tx));
        let now = Utc::now();

        cache.insert(reservation("A1", now - Duration::seconds(1)));
        cache.insert(reservation("B2", now));
        cache.insert(reservation("C3", now + Duration::minutes(10)));
        assert!(cache.mark_matched("B2"));

        let outcome = cache.prune_at(now);
        assert_eq!(outcome.expired, vec!["A1".to_string(), "B2".to_string()]);
        assert_eq!(outcome.fined.len(), 1);
        assert_eq!(outcome.fined[0].spot, "A1");
        assert_eq!(outcome.fined[0].amount, 20.0);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_at("C3", now).is_some());

        // second pass finds nothing to fine
        assert!(cache.prune_at(now).fined.is_empty());

        match rx.try_recv().unwrap() {
            PersistenceCommand::DeleteReservations(mut spots) => {
                spots.sort();
                assert_eq!(spots, vec!["A1".to_string(), "B2".to_string()]);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            PersistenceCommand::RecordFine(f) if f.spot == "A1"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_get_prunes_first() {
        let cache = ReservationCache::new(20.0, None);
        let now = Utc::now();
        cache.insert(reservation("A1", now + Duration::seconds(30)));
        assert!(cache.get_at("A1", now).is_some());
        assert!(cache.get_at("A1", now + Duration::seconds(30)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_replace_keeps_matched_flag() {
        let cache = ReservationCache::new(20.0, None);
        let now = Utc::now();
        let r = reservation("A1", now + Duration::minutes(5));
        cache.insert(r.clone());
        cache.mark_matched("A1");

        cache.replace(vec![r], now);
        let outcome = cache.prune_at(now + Duration::minutes(6));
        assert_eq!(outcome.expired.len(), 1);
        assert!(outcome.fined.is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl ReservationStore for BrokenStore {
        async fn list_active_reservations(&self) -> Result<Vec<Reservation>> {
            Err(anyhow!("database unavailable"))
        }
        async fn delete_reservations(&self, _spots: &[String]) -> Result<()> {
            Err(anyhow!("database unavailable"))
        }
        async fn record_fine(&self, _fine: &Fine) -> Result<()> {
            Err(anyhow!("database unavailable"))
        }
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_contents() {
        let cache = ReservationCache::new(20.0, None);
        cache.insert(reservation("A1", Utc::now() + Duration::minutes(5)));
        let listed = cache.refresh(&BrokenStore).await;
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_deletes_and_records() {
        let store = Arc::new(InMemoryReservationStore::new(None));
        let now = Utc::now();
        store.upsert(reservation("A1", now + Duration::minutes(5))).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let cache = Arc::new(ReservationCache::new(20.0, None));
        cache.refresh(store.as_ref()).await;
        assert_eq!(cache.len(), 1);

        let worker = tokio::spawn(run_persistence_worker(
            rx,
            store.clone() as Arc<dyn ReservationStore>,
            cache.clone(),
        ));

        // Simulate what an expiry pass emits
        tx.send(PersistenceCommand::DeleteReservations(vec!["A1".to_string()]))
            .unwrap();
        tx.send(PersistenceCommand::RecordFine(Fine {
            reservation_id: Uuid::new_v4(),
            spot: "A1".to_string(),
            plate: "ABC1D23".to_string(),
            amount: 20.0,
            issued_at: now,
        }))
        .unwrap();
        drop(tx);

        worker.await.unwrap();
        assert_eq!(cache.len(), 0);
        assert!(store.list_active_reservations().await.unwrap().is_empty());
        assert_eq!(store.fines().await.len(), 1);
    }

    /// Rejects the first `fail_deletes` deletes and `fail_fines` fines.
    struct FlakyStore {
        inner: InMemoryReservationStore,
        fail_deletes: AtomicUsize,
        fail_fines: AtomicUsize,
        deletes: AtomicUsize,
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl ReservationStore for FlakyStore {
        async fn list_active_reservations(&self) -> Result<Vec<Reservation>> {
            self.inner.list_active_reservations().await
        }
        async fn delete_reservations(&self, spots: &[String]) -> Result<()> {
            if take_failure(&self.fail_deletes) {
                return Err(anyhow!("connection reset"));
            }
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete_reservations(spots).await
        }
        async fn record_fine(&self, fine: &Fine) -> Result<()> {
            if take_failure(&self.fail_fines) {
                return Err(anyhow!("connection reset"));
            }
            self.inner.record_fine(fine).await
        }
    }

    async fn drain(
        rx: &mut mpsc::UnboundedReceiver<PersistenceCommand>,
        store: &FlakyStore,
        cache: &ReservationCache,
    ) {
        while let Ok(command) = rx.try_recv() {
            execute_command(command, store, cache).await;
        }
    }

    #[tokio::test]
    async fn test_rejected_side_effects_are_retried_once() {
        let store = FlakyStore {
            inner: InMemoryReservationStore::new(None),
            fail_deletes: AtomicUsize::new(1),
            fail_fines: AtomicUsize::new(1),
            deletes: AtomicUsize::new(0),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = ReservationCache::new(20.0, Some(tx));
        let now = Utc::now();

        cache.insert(reservation("A1", now - Duration::seconds(1)));
        assert_eq!(cache.prune_at(now).fined.len(), 1);

        drain(&mut rx, &store, &cache).await;
        assert_eq!(store.inner.fines().await.len(), 0);
        assert_eq!(store.deletes.load(Ordering::SeqCst), 0);

        // nothing is resent before the retry delay
        cache.prune_at(Utc::now());
        assert!(rx.try_recv().is_err());

        for i in 1..=4 {
            cache.prune_at(Utc::now() + Duration::seconds(10 * i));
            drain(&mut rx, &store, &cache).await;
        }

        assert_eq!(store.inner.fines().await.len(), 1);
        assert_eq!(store.inner.fines().await[0].spot, "A1");
        assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
    }
}
