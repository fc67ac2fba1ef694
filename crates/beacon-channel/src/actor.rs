// ABOUTME: Async actor that owns a DefaultChannel and serializes host calls, timer fires, and send completions.
// ABOUTME: Provides ChannelHandle, the cloneable async API hosts use to enqueue records and manage groups.

use std::sync::Arc;

use beacon_core::Log;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{ChannelBuilder, ChannelEvent, DefaultChannel};
use crate::error::ChannelError;
use crate::group::GroupConfig;
use crate::listener::ChannelListener;

enum Command {
    Enqueue { log: Box<Log>, group: String },
    AddGroup(GroupConfig),
    RemoveGroup(String),
    SetEnabled(bool),
    Clear(String),
    Shutdown,
    SetLogUrl(String),
    AddListener(Arc<dyn ChannelListener>),
    RemoveListener(Arc<dyn ChannelListener>),
    InvalidateDeviceCache,
    PendingCount(String),
    IsEnabled,
}

enum Reply {
    Done,
    PendingCount(Option<usize>),
    Enabled(bool),
}

type CommandMessage = (Command, oneshot::Sender<Result<Reply, ChannelError>>);

/// Async handle to a running channel actor.
#[derive(Clone)]
pub struct ChannelHandle {
    cmd_tx: mpsc::Sender<CommandMessage>,
}

impl ChannelHandle {
    async fn request(&self, cmd: Command) -> Result<Reply, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send((cmd, tx))
            .await
            .map_err(|_| ChannelError::ChannelClosed)?;
        rx.await.map_err(|_| ChannelError::ChannelClosed)?
    }

    async fn request_done(&self, cmd: Command) -> Result<(), ChannelError> {
        self.request(cmd).await.map(|_| ())
    }

    pub async fn enqueue(&self, log: Log, group: impl Into<String>) -> Result<(), ChannelError> {
        self.request_done(Command::Enqueue {
            log: Box::new(log),
            group: group.into(),
        })
        .await
    }

    pub async fn add_group(&self, config: GroupConfig) -> Result<(), ChannelError> {
        self.request_done(Command::AddGroup(config)).await
    }

    pub async fn remove_group(&self, group: impl Into<String>) -> Result<(), ChannelError> {
        self.request_done(Command::RemoveGroup(group.into())).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ChannelError> {
        self.request_done(Command::SetEnabled(enabled)).await
    }

    pub async fn clear(&self, group: impl Into<String>) -> Result<(), ChannelError> {
        self.request_done(Command::Clear(group.into())).await
    }

    /// Suspend delivery without deleting anything. The actor keeps running.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        self.request_done(Command::Shutdown).await
    }

    pub async fn set_log_url(&self, url: impl Into<String>) -> Result<(), ChannelError> {
        self.request_done(Command::SetLogUrl(url.into())).await
    }

    pub async fn add_listener(&self, listener: Arc<dyn ChannelListener>) -> Result<(), ChannelError> {
        self.request_done(Command::AddListener(listener)).await
    }

    pub async fn remove_listener(
        &self,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<(), ChannelError> {
        self.request_done(Command::RemoveListener(listener)).await
    }

    pub async fn invalidate_device_cache(&self) -> Result<(), ChannelError> {
        self.request_done(Command::InvalidateDeviceCache).await
    }

    pub async fn pending_count(&self, group: impl Into<String>) -> Result<Option<usize>, ChannelError> {
        match self.request(Command::PendingCount(group.into())).await? {
            Reply::PendingCount(count) => Ok(count),
            _ => Ok(None),
        }
    }

    pub async fn is_enabled(&self) -> Result<bool, ChannelError> {
        match self.request(Command::IsEnabled).await? {
            Reply::Enabled(enabled) => Ok(enabled),
            _ => Ok(false),
        }
    }
}

impl ChannelBuilder {
    /// Build the channel and run it on a new tokio task.
    pub fn spawn(self) -> ChannelHandle {
        spawn(self)
    }
}

/// Spawn a channel actor and return the handle for interacting with it.
/// The actor stops once every handle is dropped.
pub fn spawn(builder: ChannelBuilder) -> ChannelHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel::<CommandMessage>(256);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let actor = ChannelActor {
        channel: builder.build(event_tx),
        cmd_rx,
        event_rx,
    };
    tokio::spawn(actor.run());

    ChannelHandle { cmd_tx }
}

struct ChannelActor {
    channel: DefaultChannel,
    cmd_rx: mpsc::Receiver<CommandMessage>,
    event_rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some((cmd, reply_tx)) => {
                        let result = self.process_command(cmd);
                        let _ = reply_tx.send(result);
                    }
                    None => break,
                },
                // The channel holds a sender, so this arm never sees None.
                Some(event) = self.event_rx.recv() => self.channel.handle_event(event),
            }
        }
        tracing::debug!("channel actor stopped");
    }

    fn process_command(&mut self, cmd: Command) -> Result<Reply, ChannelError> {
        match cmd {
            Command::Enqueue { log, group } => self.channel.enqueue(*log, &group),
            Command::AddGroup(config) => self.channel.add_group(config)?,
            Command::RemoveGroup(group) => self.channel.remove_group(&group),
            Command::SetEnabled(enabled) => self.channel.set_enabled(enabled),
            Command::Clear(group) => self.channel.clear(&group),
            Command::Shutdown => self.channel.shutdown(),
            Command::SetLogUrl(url) => self.channel.set_log_url(&url),
            Command::AddListener(listener) => self.channel.add_listener(listener),
            Command::RemoveListener(listener) => self.channel.remove_listener(&listener),
            Command::InvalidateDeviceCache => self.channel.invalidate_device_cache(),
            Command::PendingCount(group) => {
                return Ok(Reply::PendingCount(self.channel.pending_count(&group)));
            }
            Command::IsEnabled => return Ok(Reply::Enabled(self.channel.is_enabled())),
        }
        Ok(Reply::Done)
    }
}
