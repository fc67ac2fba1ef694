// ABOUTME: Group (stream) configuration supplied by hosts and the runtime state the channel keeps per group.
// ABOUTME: GroupState tracks the optimistic pending counter, in-flight batches, and the flush timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::Log;
use beacon_transport::Ingestion;

use crate::error::ChannelError;
use crate::listener::GroupListener;
use crate::scheduler::TimerId;

/// How one group of records is batched and where it is sent.
#[derive(Clone)]
pub struct GroupConfig {
    pub name: String,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub max_parallel_batches: usize,
    /// Replaces the channel's default ingestion for this group. A group
    /// with an override may send without an app secret.
    pub ingestion: Option<Arc<dyn Ingestion>>,
    pub listener: Option<Arc<dyn GroupListener>>,
}

impl GroupConfig {
    pub fn new(
        name: impl Into<String>,
        batch_size: usize,
        batch_interval: Duration,
        max_parallel_batches: usize,
    ) -> Self {
        Self {
            name: name.into(),
            batch_size,
            batch_interval,
            max_parallel_batches,
            ingestion: None,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn GroupListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_ingestion(mut self, ingestion: Arc<dyn Ingestion>) -> Self {
        self.ingestion = Some(ingestion);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ChannelError> {
        let reason = if self.name.is_empty() {
            "name must not be empty"
        } else if self.batch_size == 0 {
            "batch_size must be at least 1"
        } else if self.max_parallel_batches == 0 {
            "max_parallel_batches must be at least 1"
        } else {
            return Ok(());
        };
        Err(ChannelError::InvalidGroup {
            group: self.name.clone(),
            reason: reason.to_string(),
        })
    }
}

impl fmt::Debug for GroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupConfig")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .field("batch_interval", &self.batch_interval)
            .field("max_parallel_batches", &self.max_parallel_batches)
            .field("ingestion_override", &self.ingestion.is_some())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// A scheduled flush. `seq` is unique per channel and identifies the fire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushTimer {
    pub id: TimerId,
    pub seq: u64,
}

pub(crate) struct GroupState {
    pub config: GroupConfig,
    /// Persisted records not yet handed to a batch. Decremented at dispatch.
    pub pending_count: usize,
    pub sending: HashMap<String, Vec<Log>>,
    pub timer: Option<FlushTimer>,
}

impl GroupState {
    pub fn new(config: GroupConfig, pending_count: usize) -> Self {
        Self {
            config,
            pending_count,
            sending: HashMap::new(),
            timer: None,
        }
    }

    pub fn has_free_slot(&self) -> bool {
        self.sending.len() < self.config.max_parallel_batches
    }

    /// Forget every in-flight batch and return its records.
    pub fn take_in_flight(&mut self) -> Vec<Vec<Log>> {
        self.sending.drain().map(|(_, logs)| logs).collect()
    }
}
