//! Batch engine shared by discovery and profiling
//!
//! A batch fans a target list out over a bounded [`pool::WorkerPool`]. Each
//! worker reports its finished unit over a channel to one aggregation loop
//! ([`runner`]), which is the only writer of the batch counters. The
//! aggregator emits a per-item event immediately, recomputes progress on a
//! timer, and fires the terminal [`BatchEvent::Completed`] exactly once.

pub mod pool;
pub mod runner;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use uuid::Uuid;

pub use pool::WorkerPool;
pub use runner::{BatchReport, BatchRunner, RunningBatch};

/// A finished unit of batch work
pub trait BatchItem: Clone + Send + Sync + 'static {
    fn is_online(&self) -> bool;
    fn open_port_count(&self) -> usize;
}

/// Processes one target of a batch
#[async_trait]
pub trait BatchWorker: Send + Sync + 'static {
    type Output: BatchItem;

    async fn process(&self, target: Ipv4Addr) -> Self::Output;
}

/// Events produced by one batch
#[derive(Debug, Clone)]
pub enum BatchEvent<T> {
    Started { batch_id: Uuid, total: usize },
    Item(T),
    /// Monotonic; 100 only right after `Completed`
    Progress { batch_id: Uuid, percent: u8 },
    Completed(BatchSummary),
}

/// Terminal accounting for a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub total: usize,
    pub completed: usize,
    pub hosts_online: usize,
    pub open_ports: usize,
    /// The batch was cut short by a stop request
    pub stopped: bool,
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
}

/// Live counters published by the aggregator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSnapshot {
    pub total: usize,
    pub completed: usize,
    pub hosts_online: usize,
    pub open_ports: usize,
    pub percent: u8,
    pub finished: bool,
}

impl BatchSnapshot {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub(crate) fn record<T: BatchItem>(&mut self, item: &T) {
        self.completed += 1;
        if item.is_online() {
            self.hosts_online += 1;
        }
        self.open_ports += item.open_port_count();
    }

    /// Raise `percent` to the current ratio, capped at 99 until the batch
    /// finishes; returns the new value only when it increased.
    pub(crate) fn advance_progress(&mut self) -> Option<u8> {
        if self.total == 0 || self.finished {
            return None;
        }
        let ratio = (self.completed * 100 / self.total).min(99) as u8;
        if ratio > self.percent {
            self.percent = ratio;
            Some(ratio)
        } else {
            None
        }
    }

    pub fn all_done(&self) -> bool {
        self.completed >= self.total
    }
}

impl BatchItem for crate::network::HostResult {
    fn is_online(&self) -> bool {
        self.is_online
    }

    fn open_port_count(&self) -> usize {
        self.open_ports.len()
    }
}
