// src/persistence.rs
//
// Reservation storage seam. The monitor only needs to list active
// reservations, delete expired ones and record fines.

use crate::types::{Fine, Reservation};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn list_active_reservations(&self) -> Result<Vec<Reservation>>;
    async fn delete_reservations(&self, spots: &[String]) -> Result<()>;
    async fn record_fine(&self, fine: &Fine) -> Result<()>;
}

#[derive(Default)]
struct StoreInner {
    reservations: Vec<Reservation>,
    fines: Vec<Fine>,
}

/// Process-local store, optionally seeded from a file, with fines appended to
/// a JSON-lines ledger.
pub struct InMemoryReservationStore {
    inner: Mutex<StoreInner>,
    ledger: Option<PathBuf>,
}

impl InMemoryReservationStore {
    pub fn new(ledger: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            ledger,
        }
    }

    /// Seed from a YAML or JSON list of reservations.
    pub fn from_seed_file(path: &Path, ledger: Option<PathBuf>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read reservations {}", path.display()))?;
        let reservations: Vec<Reservation> = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse reservations {}", path.display()))?;

        info!(
            "Seeded {} reservation(s) from {}",
            reservations.len(),
            path.display()
        );

        Ok(Self {
            inner: Mutex::new(StoreInner {
                reservations,
                fines: Vec::new(),
            }),
            ledger,
        })
    }

    /// Insert, replacing any reservation already held on the same spot.
    pub async fn upsert(&self, reservation: Reservation) {
        let mut inner = self.inner.lock().await;
        inner.reservations.retain(|r| r.spot != reservation.spot);
        inner.reservations.push(reservation);
    }

    pub async fn fines(&self) -> Vec<Fine> {
        self.inner.lock().await.fines.clone()
    }

    async fn append_to_ledger(&self, fine: &Fine) -> Result<()> {
        let Some(path) = &self.ledger else {
            return Ok(());
        };
        let mut line = serde_json::to_string(fine)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open fines ledger {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn list_active_reservations(&self) -> Result<Vec<Reservation>> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .reservations
            .iter()
            .filter(|r| !r.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn delete_reservations(&self, spots: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let before = inner.reservations.len();
        inner.reservations.retain(|r| !spots.contains(&r.spot));
        let removed = before - inner.reservations.len();
        if removed > 0 {
            info!("Deleted {} reservation(s) for {:?}", removed, spots);
        }
        Ok(())
    }

    async fn record_fine(&self, fine: &Fine) -> Result<()> {
        self.inner.lock().await.fines.push(fine.clone());
        if let Err(e) = self.append_to_ledger(fine).await {
            warn!("Fine for {} kept in memory only: {:#}", fine.spot, e);
        }
        info!(
            "💸 Fine {:.2} issued to {} on spot {} (reservation {})",
            fine.amount, fine.plate, fine.spot, fine.reservation_id
        );
        Ok(())
    }
}
