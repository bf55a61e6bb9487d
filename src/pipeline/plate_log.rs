// src/pipeline/plate_log.rs
//
// Bounded audit log of recognized plates. Newest first; the oldest entry is
// dropped once capacity is reached. Never read back by the monitor itself.

use crate::types::PlateEvent;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub struct PlateEventLog {
    events: Mutex<VecDeque<PlateEvent>>,
    capacity: usize,
}

impl PlateEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, event: PlateEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            if let Some(dropped) = events.pop_back() {
                debug!("Plate log full, dropping event for {}", dropped.spot);
            }
        }
        events.push_front(event);
    }

    /// Copy of the log, newest first.
    pub fn recent(&self) -> Vec<PlateEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(plate: &str) -> PlateEvent {
        PlateEvent {
            spot: "A1".to_string(),
            plate: plate.to_string(),
            ocr_conf: Some(0.9),
            det_conf: None,
            timestamp: Utc::now(),
            reserved: true,
            violation: false,
            authorized: vec![],
            reservation: None,
        }
    }

    #[test]
    fn test_newest_first_and_bounded() {
        let log = PlateEventLog::new(3);
        for plate in ["P1", "P2", "P3", "P4"] {
            log.push(event(plate));
        }
        let plates: Vec<String> = log.recent().into_iter().map(|e| e.plate).collect();
        assert_eq!(plates, vec!["P4", "P3", "P2"]);
        assert_eq!(log.len(), 3);
    }
}
