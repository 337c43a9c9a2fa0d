use crate::collectors::Sampled;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Cached<T> {
    ttl: Duration,
    value: Option<T>,
    error: Option<String>,
    refreshed_at: Option<Instant>,
}

impl<T: Clone + Default> Cached<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            value: None,
            error: None,
            refreshed_at: None,
        }
    }

    pub fn needs_refresh(&self, now: Instant) -> bool {
        match self.refreshed_at {
            Some(at) => now.saturating_duration_since(at) >= self.ttl,
            None => true,
        }
    }

    /// Records a fresh sample. An error-only result keeps the previous good value.
    pub fn store(&mut self, now: Instant, sampled: Sampled<T>) {
        if let Some(value) = sampled.value {
            self.value = Some(value);
        }
        self.error = sampled.error;
        self.refreshed_at = Some(now);
    }

    pub fn current(&self) -> (T, Option<String>) {
        (self.value.clone().unwrap_or_default(), self.error.clone())
    }

    pub fn get_or_refresh<F>(&mut self, now: Instant, sample: F) -> (T, Option<String>)
    where
        F: FnOnce() -> Sampled<T>,
    {
        if self.needs_refresh(now) {
            self.store(now, sample());
        }
        self.current()
    }
}
