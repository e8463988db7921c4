//! Shared server state and the in-flight request bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::control::ControlPlane;

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
    inflight: Arc<AtomicUsize>,
    max_inflight: usize,
}

impl AppState {
    pub fn new(control: Arc<ControlPlane>, max_inflight: usize) -> Self {
        Self {
            control,
            inflight: Arc::new(AtomicUsize::new(0)),
            max_inflight,
        }
    }

    /// Reserve an in-flight slot; None when the listener is saturated.
    pub fn acquire_slot(&self) -> Option<InflightGuard> {
        let previous = self.inflight.fetch_add(1, Ordering::SeqCst);
        if previous >= self.max_inflight {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(InflightGuard {
            counter: self.inflight.clone(),
        })
    }

    #[cfg(test)]
    pub fn inflight_now(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }
}

pub struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
