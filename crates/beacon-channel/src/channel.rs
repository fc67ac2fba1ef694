// ABOUTME: The delivery channel state machine: group registry, counters, timers, dispatch, and failure handling.
// ABOUTME: Single-threaded by construction; timer fires and send completions come back as ChannelEvent messages.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::{Device, Log, LogContainer, LogStore, MetadataError, MetadataSource, StaticMetadata};
use beacon_transport::{HttpResponse, Ingestion, TransportError};
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ChannelError, DeliveryError};
use crate::group::{FlushTimer, GroupConfig, GroupState};
use crate::listener::ChannelListener;
use crate::scheduler::{Scheduler, TokioScheduler};

/// Chunk size used when draining a group's backlog into failure callbacks.
pub const CLEAR_BATCH_SIZE: usize = 100;

/// Messages the channel posts to itself from timers and transport callbacks.
#[derive(Debug)]
pub enum ChannelEvent {
    TimerFired {
        group: String,
        seq: u64,
        epoch: u64,
    },
    SendCompleted {
        group: String,
        batch_id: String,
        epoch: u64,
        outcome: Result<HttpResponse, TransportError>,
    },
}

/// Collects the capabilities a channel is built from.
pub struct ChannelBuilder {
    store: Arc<dyn LogStore>,
    ingestion: Arc<dyn Ingestion>,
    app_secret: Option<String>,
    install_id: Uuid,
    scheduler: Option<Arc<dyn Scheduler>>,
    metadata: Option<Arc<dyn MetadataSource>>,
}

impl ChannelBuilder {
    pub fn new(store: Arc<dyn LogStore>, ingestion: Arc<dyn Ingestion>) -> Self {
        Self {
            store,
            ingestion,
            app_secret: None,
            install_id: Uuid::new_v4(),
            scheduler: None,
            metadata: None,
        }
    }

    pub fn app_secret(mut self, app_secret: impl Into<String>) -> Self {
        self.app_secret = Some(app_secret.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn install_id(mut self, install_id: Uuid) -> Self {
        self.install_id = install_id;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn MetadataSource>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Build the channel core. Events sent on `mailbox` must be fed back
    /// through [`DefaultChannel::handle_event`].
    pub fn build(self, mailbox: mpsc::UnboundedSender<ChannelEvent>) -> DefaultChannel {
        DefaultChannel {
            app_secret: self.app_secret,
            install_id: self.install_id,
            store: self.store,
            ingestion: self.ingestion,
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Arc::new(TokioScheduler::new())),
            metadata: self
                .metadata
                .unwrap_or_else(|| Arc::new(StaticMetadata::default())),
            mailbox,
            groups: HashMap::new(),
            listeners: Vec::new(),
            device: None,
            enabled: true,
            discard_logs: false,
            epoch: 0,
            next_timer_seq: 0,
        }
    }
}

/// The channel core. Every method runs to completion without blocking on
/// the network; the actor in [`crate::actor`] serializes access to it.
pub struct DefaultChannel {
    app_secret: Option<String>,
    install_id: Uuid,
    store: Arc<dyn LogStore>,
    ingestion: Arc<dyn Ingestion>,
    scheduler: Arc<dyn Scheduler>,
    metadata: Arc<dyn MetadataSource>,
    mailbox: mpsc::UnboundedSender<ChannelEvent>,
    groups: HashMap<String, GroupState>,
    listeners: Vec<Arc<dyn ChannelListener>>,
    device: Option<Device>,
    enabled: bool,
    discard_logs: bool,
    epoch: u64,
    next_timer_seq: u64,
}

fn cancel_timer(scheduler: &dyn Scheduler, state: &mut GroupState) {
    if let Some(timer) = state.timer.take() {
        scheduler.cancel(timer.id);
    }
}

impl DefaultChannel {
    pub fn install_id(&self) -> Uuid {
        self.install_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records counted for the group but not yet handed to a batch.
    pub fn pending_count(&self, group: &str) -> Option<usize> {
        self.groups.get(group).map(|s| s.pending_count)
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ChannelListener>) {
        self.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn ChannelListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Drop the cached device snapshot; the next enqueue takes a fresh one.
    pub fn invalidate_device_cache(&mut self) {
        self.device = None;
    }

    fn can_send(&self, config: &GroupConfig) -> bool {
        self.app_secret.is_some() || config.ingestion.is_some()
    }

    pub fn add_group(&mut self, config: GroupConfig) -> Result<(), ChannelError> {
        config.validate()?;
        let name = config.name.clone();

        // In-flight batches survive replacement so their completions still
        // delete the rows the store holds as pending.
        let mut in_flight = HashMap::new();
        if let Some(mut previous) = self.groups.remove(&name) {
            cancel_timer(self.scheduler.as_ref(), &mut previous);
            in_flight = std::mem::take(&mut previous.sending);
        }
        let in_flight_rows: usize = in_flight.values().map(Vec::len).sum();

        let pending = match self.store.count(&name) {
            Ok(count) => count.saturating_sub(in_flight_rows),
            Err(e) => {
                tracing::error!(group = %name, "failed to count stored logs: {}", e);
                0
            }
        };
        tracing::info!(group = %name, pending, in_flight = in_flight.len(), "group added");

        let mut state = GroupState::new(config, pending);
        state.sending = in_flight;
        self.groups.insert(name.clone(), state);
        self.check_pending(&name);

        for listener in &self.listeners {
            listener.on_group_added(&name);
        }
        Ok(())
    }

    pub fn remove_group(&mut self, group: &str) {
        let Some(mut state) = self.groups.remove(group) else {
            return;
        };
        cancel_timer(self.scheduler.as_ref(), &mut state);
        tracing::info!(group = %group, "group removed");

        for listener in &self.listeners {
            listener.on_group_removed(group);
        }
    }

    pub fn enqueue(&mut self, mut log: Log, group: &str) {
        let Some(state) = self.groups.get(group) else {
            tracing::warn!(group = %group, log_id = %log.id, "enqueue for unknown group, log dropped");
            return;
        };
        let listener = state.config.listener.clone();
        let can_send = self.can_send(&state.config);

        if self.discard_logs {
            tracing::warn!(group = %group, log_id = %log.id, "channel disabled, log discarded");
            if let Some(listener) = listener {
                listener.on_before_sending(&log);
                listener.on_failure(&log, &DeliveryError::Cancelled);
            }
            return;
        }

        for listener in &self.listeners {
            listener.on_enqueuing_log(&log, group);
        }

        if log.device.is_none() {
            match self.device_snapshot() {
                Ok(device) => log.device = Some(device),
                Err(e) => {
                    tracing::warn!(group = %group, log_id = %log.id, "log dropped: {}", e);
                    return;
                }
            }
        }
        if log.timestamp.is_none() {
            log.timestamp = Some(Utc::now());
        }

        if self.listeners.iter().any(|l| l.should_filter(&log)) {
            tracing::debug!(group = %group, log_id = %log.id, "log filtered out");
            return;
        }

        if !can_send {
            tracing::debug!(group = %group, log_id = %log.id, "no app secret configured, log not persisted");
            return;
        }

        if let Err(e) = self.store.put(group, &log) {
            tracing::error!(group = %group, log_id = %log.id, "failed to persist log: {}", e);
            return;
        }

        if let Some(state) = self.groups.get_mut(group) {
            state.pending_count += 1;
        }

        if self.enabled {
            self.check_pending(group);
        } else {
            tracing::debug!(group = %group, "channel suspended, log kept for later");
        }
    }

    fn device_snapshot(&mut self) -> Result<Device, MetadataError> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }
        let device = self.metadata.snapshot()?;
        self.device = Some(device.clone());
        Ok(device)
    }

    /// Dispatch every full batch a free slot allows, then make sure a
    /// remainder has a flush timer.
    fn check_pending(&mut self, group: &str) {
        if !self.enabled {
            return;
        }
        loop {
            let Some(state) = self.groups.get(group) else {
                return;
            };
            if !self.can_send(&state.config) {
                return;
            }

            if state.pending_count >= state.config.batch_size {
                if self.trigger_ingestion(group) {
                    continue;
                }
                return;
            }

            if state.pending_count > 0 && state.timer.is_none() {
                let interval = state.config.batch_interval;
                self.schedule_flush(group, interval);
            }
            return;
        }
    }

    fn schedule_flush(&mut self, group: &str, interval: std::time::Duration) {
        self.next_timer_seq += 1;
        let seq = self.next_timer_seq;
        let epoch = self.epoch;
        let mailbox = self.mailbox.clone();
        let name = group.to_string();

        let id = self.scheduler.schedule(
            interval,
            Box::new(move || {
                let _ = mailbox.send(ChannelEvent::TimerFired {
                    group: name,
                    seq,
                    epoch,
                });
            }),
        );

        if let Some(state) = self.groups.get_mut(group) {
            state.timer = Some(FlushTimer { id, seq });
        }
        tracing::debug!(group = %group, ?interval, "flush timer scheduled");
    }

    /// Read one batch from the store and hand it to the ingestion.
    /// Returns whether a batch was dispatched.
    fn trigger_ingestion(&mut self, group: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(state) = self.groups.get_mut(group) else {
            return false;
        };

        cancel_timer(self.scheduler.as_ref(), state);

        if !state.has_free_slot() {
            tracing::debug!(group = %group, in_flight = state.sending.len(), "all batch slots busy");
            return false;
        }

        let batch_size = state.config.batch_size;
        let batch = match self.store.get_logs(group, batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(group = %group, "failed to read logs: {}", e);
                return false;
            }
        };
        state.pending_count = state.pending_count.saturating_sub(batch_size);

        let Some(batch) = batch.filter(|b| !b.logs.is_empty()) else {
            tracing::debug!(group = %group, "no logs to send");
            return false;
        };

        if let Some(listener) = &state.config.listener {
            for log in &batch.logs {
                listener.on_before_sending(log);
            }
        }

        let ingestion = state
            .config
            .ingestion
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.ingestion));
        state
            .sending
            .insert(batch.batch_id.clone(), batch.logs.clone());

        tracing::debug!(
            group = %group,
            batch_id = %batch.batch_id,
            logs = batch.logs.len(),
            "dispatching batch"
        );

        let mailbox = self.mailbox.clone();
        let epoch = self.epoch;
        let name = group.to_string();
        let batch_id = batch.batch_id;
        let container = LogContainer::new(batch.logs);
        ingestion.send_async(
            self.app_secret.as_deref(),
            self.install_id,
            &container,
            Box::new(move |outcome| {
                let _ = mailbox.send(ChannelEvent::SendCompleted {
                    group: name,
                    batch_id,
                    epoch,
                    outcome,
                });
            }),
        );
        true
    }

    pub fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::TimerFired { group, seq, epoch } => self.on_timer(&group, seq, epoch),
            ChannelEvent::SendCompleted {
                group,
                batch_id,
                epoch,
                outcome,
            } => {
                if epoch != self.epoch {
                    tracing::debug!(group = %group, batch_id = %batch_id, "stale completion ignored");
                    return;
                }
                match outcome {
                    Ok(_) => self.on_send_success(&group, &batch_id),
                    Err(e) => self.on_send_failure(&group, &batch_id, e),
                }
            }
        }
    }

    fn on_timer(&mut self, group: &str, seq: u64, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        match state.timer {
            Some(timer) if timer.seq == seq => state.timer = None,
            _ => return,
        }

        if self.trigger_ingestion(group) {
            self.check_pending(group);
        }
    }

    fn on_send_success(&mut self, group: &str, batch_id: &str) {
        let Some(state) = self.groups.get_mut(group) else {
            tracing::debug!(group = %group, "completion for removed group ignored");
            return;
        };
        let Some(logs) = state.sending.remove(batch_id) else {
            tracing::debug!(group = %group, batch_id = %batch_id, "completion for unknown batch ignored");
            return;
        };
        let listener = state.config.listener.clone();

        if let Err(e) = self.store.delete_batch(group, batch_id) {
            tracing::error!(group = %group, batch_id = %batch_id, "failed to delete sent batch: {}", e);
        }
        tracing::debug!(group = %group, batch_id = %batch_id, logs = logs.len(), "batch delivered");

        if let Some(listener) = listener {
            for log in &logs {
                listener.on_success(log);
            }
        }

        self.check_pending(group);
    }

    fn on_send_failure(&mut self, group: &str, batch_id: &str, error: TransportError) {
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        let Some(logs) = state.sending.remove(batch_id) else {
            return;
        };

        if error.is_recoverable() {
            state.pending_count += logs.len();
            tracing::warn!(
                group = %group,
                batch_id = %batch_id,
                "recoverable send failure, suspending channel: {}",
                error
            );
            self.suspend();
            return;
        }

        tracing::error!(
            group = %group,
            batch_id = %batch_id,
            "fatal send failure, discarding group backlog and disabling channel: {}",
            error
        );
        let error = DeliveryError::Transport(error);
        if let Some(listener) = state.config.listener.clone() {
            for log in &logs {
                listener.on_failure(log, &error);
            }
        }
        self.fail_group(group, &error);

        self.enabled = false;
        self.discard_logs = true;
        self.release_in_flight();
        self.close_ingestions();
    }

    /// Fail in-flight batches of a group, drain its stored backlog into the
    /// group listener, then delete everything stored for it.
    fn fail_group(&mut self, group: &str, error: &DeliveryError) {
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        cancel_timer(self.scheduler.as_ref(), state);
        let in_flight = state.take_in_flight();
        state.pending_count = 0;

        if let Some(listener) = state.config.listener.clone() {
            for log in in_flight.iter().flatten() {
                listener.on_failure(log, error);
            }
            loop {
                match self.store.get_logs(group, CLEAR_BATCH_SIZE) {
                    Ok(Some(batch)) => {
                        for log in &batch.logs {
                            listener.on_before_sending(log);
                            listener.on_failure(log, error);
                        }
                        if batch.logs.len() < CLEAR_BATCH_SIZE {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(group = %group, "failed to read logs while discarding: {}", e);
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.store.delete_group(group) {
            tracing::error!(group = %group, "failed to delete group logs: {}", e);
        }
    }

    /// Stop sending without deleting anything: timers cancelled, in-flight
    /// batches returned to the counters, ingestions closed.
    fn suspend(&mut self) {
        self.enabled = false;
        for state in self.groups.values_mut() {
            cancel_timer(self.scheduler.as_ref(), state);
        }
        self.release_in_flight();
        self.close_ingestions();
    }

    fn release_in_flight(&mut self) {
        for state in self.groups.values_mut() {
            let returned: usize = state.take_in_flight().iter().map(Vec::len).sum();
            state.pending_count += returned;
        }
        if let Err(e) = self.store.clear_pending_state() {
            tracing::error!("failed to clear pending store state: {}", e);
        }
    }

    fn close_ingestions(&self) {
        self.ingestion.close();
        for state in self.groups.values() {
            if let Some(ingestion) = &state.config.ingestion {
                ingestion.close();
            }
        }
    }

    fn reopen_ingestions(&self) {
        self.ingestion.reopen();
        for state in self.groups.values() {
            if let Some(ingestion) = &state.config.ingestion {
                ingestion.reopen();
            }
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            tracing::debug!(enabled, "channel already in requested state");
            return;
        }

        let names: Vec<String> = self.groups.keys().cloned().collect();
        if enabled {
            self.enabled = true;
            self.discard_logs = false;
            self.epoch += 1;
            self.reopen_ingestions();
            for name in &names {
                if let Some(state) = self.groups.get_mut(name) {
                    cancel_timer(self.scheduler.as_ref(), state);
                }
                self.check_pending(name);
            }
        } else {
            for name in &names {
                self.fail_group(name, &DeliveryError::Cancelled);
            }
            self.enabled = false;
            self.discard_logs = true;
            self.close_ingestions();
        }
        tracing::info!(enabled, "channel enabled state changed");

        for listener in &self.listeners {
            listener.on_globally_enabled(enabled);
        }
    }

    /// Delete the persisted records of a group.
    pub fn clear(&mut self, group: &str) {
        let Some(state) = self.groups.get(group) else {
            return;
        };
        if !self.can_send(&state.config) {
            return;
        }

        if let Err(e) = self.store.delete_group(group) {
            tracing::error!(group = %group, "failed to clear group logs: {}", e);
            return;
        }
        if let Some(state) = self.groups.get_mut(group) {
            state.pending_count = 0;
        }
        tracing::info!(group = %group, "group cleared");

        for listener in &self.listeners {
            listener.on_clear(group);
        }
    }

    /// Suspend silently: nothing is deleted and no listener is called.
    pub fn shutdown(&mut self) {
        self.suspend();
        tracing::info!("channel shut down");
    }

    pub fn set_log_url(&mut self, url: &str) {
        if self.app_secret.is_none() {
            tracing::debug!("no app secret configured, log url not changed");
            return;
        }
        self.ingestion.set_log_url(url);
        for state in self.groups.values() {
            if let Some(ingestion) = &state.config.ingestion {
                ingestion.set_log_url(url);
            }
        }
    }
}
