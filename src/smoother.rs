// src/smoother.rs

use std::collections::{HashMap, VecDeque};

/// Sliding window of the last K raw occupancy decisions for one spot
pub struct OccupancyHistory {
    history: VecDeque<bool>,
    window_size: usize,
}

impl OccupancyHistory {
    /// Create a new history with specified window size
    ///
    /// # Arguments
    /// * `window_size` - Number of raw classifications kept (K)
    pub fn new(window_size: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    pub fn push(&mut self, raw: bool) {
        self.history.push_back(raw);

        // Maintain window size
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }
    }

    /// Strict majority over the current contents. Ties are "free".
    pub fn is_occupied(&self) -> bool {
        let occupied = self.history.iter().filter(|&&v| v).count();
        occupied * 2 > self.history.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.history.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    BecameOccupied,
    BecameFree,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebounceOutcome {
    pub occupied: bool,
    pub transition: Transition,
    /// Occupancy generation after this update.
    pub generation: u64,
}

/// Per-spot majority-of-K debouncer with transition detection.
///
/// Each spot also carries a generation that advances every time it becomes
/// free, so work started during one occupancy can be told apart from the
/// next one.
pub struct OccupancyDebouncer {
    threshold: f32,
    window_size: usize,
    histories: HashMap<String, OccupancyHistory>,
    last: HashMap<String, bool>,
    generations: HashMap<String, u64>,
}

impl OccupancyDebouncer {
    pub fn new(threshold: f32, window_size: usize) -> Self {
        Self {
            threshold,
            window_size,
            histories: HashMap::new(),
            last: HashMap::new(),
            generations: HashMap::new(),
        }
    }

    /// Feed one occupied probability for `spot`. Spots never seen before
    /// start out free.
    pub fn update(&mut self, spot: &str, occupied_prob: f32) -> DebounceOutcome {
        let raw = occupied_prob >= self.threshold;

        let history = self
            .histories
            .entry(spot.to_string())
            .or_insert_with(|| OccupancyHistory::new(self.window_size));
        history.push(raw);
        let occupied = history.is_occupied();

        let previous = self.last.insert(spot.to_string(), occupied).unwrap_or(false);
        let transition = match (previous, occupied) {
            (false, true) => Transition::BecameOccupied,
            (true, false) => Transition::BecameFree,
            _ => Transition::Unchanged,
        };

        let generation = self.generations.entry(spot.to_string()).or_insert(0);
        if transition == Transition::BecameFree {
            *generation += 1;
        }

        DebounceOutcome {
            occupied,
            transition,
            generation: *generation,
        }
    }

    /// Last debounced value, false for unknown spots.
    pub fn is_occupied(&self, spot: &str) -> bool {
        self.last.get(spot).copied().unwrap_or(false)
    }

    pub fn generation(&self, spot: &str) -> u64 {
        self.generations.get(spot).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(raws: &[bool], k: usize) -> bool {
        let tail = &raws[raws.len().saturating_sub(k)..];
        let trues = tail.iter().filter(|&&v| v).count();
        trues as f32 > tail.len() as f32 / 2.0
    }

    #[test]
    fn test_matches_majority_over_last_k() {
        // Deterministic pseudo-random sequences across a few window sizes
        for k in 1..=6 {
            let mut seed: u32 = 0x9e37_79b9 ^ k as u32;
            let mut history = OccupancyHistory::new(k);
            let mut raws = Vec::new();
            for _ in 0..200 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                let raw = seed % 3 != 0;
                raws.push(raw);
                history.push(raw);
                assert!(history.len() <= k);
                assert_eq!(history.is_occupied(), reference(&raws, k));
            }
        }
    }

    #[test]
    fn test_k_trues_always_occupied() {
        let mut history = OccupancyHistory::new(5);
        for _ in 0..5 {
            history.push(false);
        }
        for _ in 0..5 {
            history.push(true);
        }
        assert!(history.is_occupied());
    }

    #[test]
    fn test_tie_is_free() {
        let mut history = OccupancyHistory::new(4);
        history.push(true);
        history.push(true);
        history.push(false);
        history.push(false);
        assert!(!history.is_occupied());
    }

    #[test]
    fn test_transitions() {
        let mut debouncer = OccupancyDebouncer::new(0.7, 3);

        let o = debouncer.update("A1", 0.9);
        assert_eq!(o.transition, Transition::BecameOccupied);
        assert_eq!(o.generation, 0);

        // 0.7 is inclusive
        let o = debouncer.update("A1", 0.7);
        assert_eq!(o.transition, Transition::Unchanged);
        assert!(debouncer.is_occupied("A1"));

        debouncer.update("A1", 0.1);
        let o = debouncer.update("A1", 0.1);
        assert!(!o.occupied);
        assert_eq!(o.transition, Transition::BecameFree);
        assert_eq!(o.generation, 1);

        assert!(!debouncer.is_occupied("B2"));
        assert_eq!(debouncer.generation("B2"), 0);
    }

    #[test]
    fn test_generation_advances_on_every_release() {
        let mut debouncer = OccupancyDebouncer::new(0.5, 1);
        for expected in 0..3u64 {
            assert_eq!(debouncer.update("A1", 0.9).generation, expected);
            // staying occupied keeps the generation
            assert_eq!(debouncer.update("A1", 0.8).generation, expected);
            assert_eq!(debouncer.update("A1", 0.1).generation, expected + 1);
            assert_eq!(debouncer.update("A1", 0.2).generation, expected + 1);
        }
        assert_eq!(debouncer.generation("A1"), 3);
    }
}
