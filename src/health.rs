// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Health Gate
//!
//! Process-wide pause/resume signal. One writer flips the flag; every subscription
//! constructed with the gate observes it and stops pulling deliveries while paused.
//! Propagation is eventual: a subscription notices the change on its next loop turn.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared pause/resume flag handed to subscriptions at construction.
#[derive(Clone)]
pub struct HealthGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for HealthGate {
    fn default() -> Self {
        HealthGate::new()
    }
}

impl HealthGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        HealthGate {
            paused: Arc::new(paused),
        }
    }

    /// Stops every registered subscription from accepting new deliveries.
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("consumers paused");
        }
    }

    /// Lets every registered subscription accept deliveries again.
    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("consumers resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcasts_to_every_reader() {
        let gate = HealthGate::new();
        let mut first = gate.watch();
        let second = gate.clone().watch();

        gate.pause();
        first.changed().await.unwrap();
        assert!(*first.borrow_and_update());
        assert!(*second.borrow());
        assert!(gate.is_paused());

        gate.resume();
        first.changed().await.unwrap();
        assert!(!*first.borrow());
        assert!(!gate.is_paused());
    }
}
