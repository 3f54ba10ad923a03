//! Bounded parallel dispatch of queued work.
//!
//! Workers pull item indices off a shared channel and call the spawner; one
//! failure never cancels its siblings. The report lists outcomes in input
//! order regardless of completion order.

use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use serde::Serialize;

use crate::queue::QueueItem;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFailure {
    pub bead_id: String,
    pub rig: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<DispatchFailure>,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.error.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    parallelism: usize,
    limit: usize,
}

/// Free polecat slots under `max_polecats`; `None` when uncapped.
pub fn capacity_slots(max_polecats: usize, running: usize) -> Option<usize> {
    (max_polecats > 0).then(|| max_polecats.saturating_sub(running))
}

impl Dispatcher {
    /// `parallelism` below 1 is raised to 1.
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            limit: 0,
        }
    }

    /// Dispatch at most `limit` items per call; 0 means all of them.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Apply a capacity cap: `None` leaves the limit alone, `Some(0)` makes
    /// dispatch a no-op.
    pub fn with_capacity(self, slots: Option<usize>) -> Option<Self> {
        match slots {
            None => Some(self),
            Some(0) => None,
            Some(n) => Some(self.with_limit(n)),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// The items one `dispatch` call takes.
    pub fn head<'a>(&self, items: &'a [QueueItem]) -> &'a [QueueItem] {
        match self.limit {
            0 => items,
            n => &items[..n.min(items.len())],
        }
    }

    /// Run `spawner(rig, bead_id)` over the head of `items`.
    pub fn dispatch<F>(&self, items: &[QueueItem], spawner: F) -> DispatchReport
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Sync,
    {
        let items = self.head(items);
        if items.is_empty() {
            return DispatchReport::default();
        }
        let workers = self.parallelism.min(items.len());

        let (index_tx, index_rx) = mpsc::sync_channel(items.len());
        for i in 0..items.len() {
            // Capacity equals the item count, so this never blocks.
            let _ = index_tx.send(i);
        }
        drop(index_tx);
        let index_rx = Mutex::new(index_rx);
        let (result_tx, result_rx) = mpsc::channel();

        thread::scope(|scope| {
            let index_rx = &index_rx;
            let spawner = &spawner;
            for _ in 0..workers {
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    loop {
                        let next = index_rx.lock().ok().and_then(|rx| rx.recv().ok());
                        let Some(i) = next else { break };
                        let item = &items[i];
                        let outcome = spawner(&item.rig, &item.bead_id);
                        if result_tx.send((i, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut outcomes: Vec<(usize, anyhow::Result<()>)> = result_rx.into_iter().collect();
        outcomes.sort_by_key(|(i, _)| *i);

        let mut report = DispatchReport::default();
        for (i, outcome) in outcomes {
            let item = &items[i];
            match outcome {
                Ok(()) => {
                    tracing::info!(bead = %item.bead_id, rig = %item.rig, "dispatched");
                    report.succeeded.push(item.bead_id.clone());
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    tracing::warn!(bead = %item.bead_id, rig = %item.rig, error = %error, "dispatch failed");
                    report.failed.push(DispatchFailure {
                        bead_id: item.bead_id.clone(),
                        rig: item.rig.clone(),
                        error,
                    });
                }
            }
        }
        report
    }
}
