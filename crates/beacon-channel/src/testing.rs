// ABOUTME: Test doubles for the delivery channel: a manual scheduler, a recording ingestion, and recording listeners.
// ABOUTME: Lets tests drive timers and send completions deterministically without a network.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use beacon_core::{Log, LogContainer};
use beacon_transport::{HttpResponse, Ingestion, ServiceCall, ServiceCallback, TransportError};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::listener::{ChannelListener, GroupListener};
use crate::scheduler::{Scheduler, TimerId, TimerTask};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ManualState {
    next_id: u64,
    timers: Vec<(TimerId, Duration, TimerTask)>,
    scheduled: usize,
    cancelled: usize,
}

/// A scheduler whose timers only run when the test calls [`ManualScheduler::fire_all`].
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of timers ever scheduled.
    pub fn scheduled_count(&self) -> usize {
        lock(&self.state).scheduled
    }

    /// Number of live timers that were cancelled.
    pub fn cancel_count(&self) -> usize {
        lock(&self.state).cancelled
    }

    /// Timers scheduled and neither fired nor cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.state).timers.len()
    }

    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.state).timers.iter().map(|(_, d, _)| *d).collect()
    }

    /// Run every live timer and return how many ran.
    pub fn fire_all(&self) -> usize {
        let timers = std::mem::take(&mut lock(&self.state).timers);
        let fired = timers.len();
        for (_, _, task) in timers {
            task();
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        state.scheduled += 1;
        let id = TimerId(state.next_id);
        state.timers.push((id, delay, task));
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut state = lock(&self.state);
        if let Some(pos) = state.timers.iter().position(|(t, _, _)| *t == id) {
            drop(state.timers.remove(pos));
            state.cancelled += 1;
        }
    }
}

struct SentBatch {
    app_secret: Option<String>,
    install_id: Uuid,
    logs: Vec<Log>,
    callback: Option<ServiceCallback>,
}

#[derive(Default)]
struct IngestionState {
    sent: Vec<SentBatch>,
    log_urls: Vec<String>,
    closed: usize,
    reopened: usize,
}

/// An ingestion that records every batch and holds its callback until the
/// test completes it.
#[derive(Default)]
pub struct RecordingIngestion {
    state: Mutex<IngestionState>,
}

impl RecordingIngestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_count(&self) -> usize {
        lock(&self.state).sent.len()
    }

    pub fn sent_logs(&self, index: usize) -> Vec<Log> {
        lock(&self.state).sent[index].logs.clone()
    }

    pub fn app_secret(&self, index: usize) -> Option<String> {
        lock(&self.state).sent[index].app_secret.clone()
    }

    pub fn install_id(&self, index: usize) -> Uuid {
        lock(&self.state).sent[index].install_id
    }

    /// Deliver the outcome of the `index`th send. Returns `false` if it was
    /// already completed.
    pub fn complete(&self, index: usize, outcome: Result<HttpResponse, TransportError>) -> bool {
        let callback = lock(&self.state).sent[index].callback.take();
        match callback {
            Some(callback) => {
                callback(outcome);
                true
            }
            None => false,
        }
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closed
    }

    pub fn reopen_count(&self) -> usize {
        lock(&self.state).reopened
    }

    pub fn log_urls(&self) -> Vec<String> {
        lock(&self.state).log_urls.clone()
    }
}

impl Ingestion for RecordingIngestion {
    fn send_async(
        &self,
        app_secret: Option<&str>,
        install_id: Uuid,
        logs: &LogContainer,
        callback: ServiceCallback,
    ) -> ServiceCall {
        lock(&self.state).sent.push(SentBatch {
            app_secret: app_secret.map(str::to_string),
            install_id,
            logs: logs.logs.clone(),
            callback: Some(callback),
        });
        ServiceCall::completed()
    }

    fn set_log_url(&self, url: &str) {
        lock(&self.state).log_urls.push(url.to_string());
    }

    fn close(&self) {
        lock(&self.state).closed += 1;
    }

    fn reopen(&self) {
        lock(&self.state).reopened += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    BeforeSending(Ulid),
    Success(Ulid),
    Failure(Ulid, DeliveryError),
}

/// Records per-record delivery callbacks in order.
#[derive(Default)]
pub struct RecordingGroupListener {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl RecordingGroupListener {
    pub fn events(&self) -> Vec<DeliveryEvent> {
        lock(&self.events).clone()
    }

    pub fn before_sending_count(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::BeforeSending(_)))
    }

    pub fn success_count(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::Success(_)))
    }

    pub fn failure_count(&self) -> usize {
        self.failures().len()
    }

    pub fn failures(&self) -> Vec<DeliveryError> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                DeliveryEvent::Failure(_, err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&DeliveryEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| pred(*e)).count()
    }
}

impl GroupListener for RecordingGroupListener {
    fn on_before_sending(&self, log: &Log) {
        lock(&self.events).push(DeliveryEvent::BeforeSending(log.id));
    }

    fn on_success(&self, log: &Log) {
        lock(&self.events).push(DeliveryEvent::Success(log.id));
    }

    fn on_failure(&self, log: &Log, error: &DeliveryError) {
        lock(&self.events)
            .push(DeliveryEvent::Failure(log.id, error.clone()));
    }
}

#[derive(Default)]
struct ChannelCalls {
    enqueuing: Vec<(Ulid, String)>,
    filter_calls: usize,
    added: Vec<String>,
    removed: Vec<String>,
    cleared: Vec<String>,
    enabled: Vec<bool>,
}

/// Records global channel callbacks, optionally filtering one log type.
#[derive(Default)]
pub struct RecordingChannelListener {
    filter_type: Option<String>,
    calls: Mutex<ChannelCalls>,
}

impl RecordingChannelListener {
    pub fn filtering(log_type: impl Into<String>) -> Self {
        Self {
            filter_type: Some(log_type.into()),
            calls: Mutex::default(),
        }
    }

    pub fn enqueuing_count(&self) -> usize {
        lock(&self.calls).enqueuing.len()
    }

    pub fn filter_calls(&self) -> usize {
        lock(&self.calls).filter_calls
    }

    pub fn added_groups(&self) -> Vec<String> {
        lock(&self.calls).added.clone()
    }

    pub fn removed_groups(&self) -> Vec<String> {
        lock(&self.calls).removed.clone()
    }

    pub fn cleared_groups(&self) -> Vec<String> {
        lock(&self.calls).cleared.clone()
    }

    pub fn enabled_changes(&self) -> Vec<bool> {
        lock(&self.calls).enabled.clone()
    }
}

impl ChannelListener for RecordingChannelListener {
    fn on_enqueuing_log(&self, log: &Log, group: &str) {
        lock(&self.calls)
            .enqueuing
            .push((log.id, group.to_string()));
    }

    fn should_filter(&self, log: &Log) -> bool {
        lock(&self.calls).filter_calls += 1;
        self.filter_type.as_deref() == Some(log.log_type.as_str())
    }

    fn on_group_added(&self, group: &str) {
        lock(&self.calls).added.push(group.to_string());
    }

    fn on_group_removed(&self, group: &str) {
        lock(&self.calls).removed.push(group.to_string());
    }

    fn on_clear(&self, group: &str) {
        lock(&self.calls).cleared.push(group.to_string());
    }

    fn on_globally_enabled(&self, enabled: bool) {
        lock(&self.calls).enabled.push(enabled);
    }
}
