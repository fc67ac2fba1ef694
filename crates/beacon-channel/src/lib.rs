// ABOUTME: Delivery channel for beacon: batches persisted records per group and hands them to an ingestion.
// ABOUTME: The DefaultChannel core is driven by a tokio actor exposed through ChannelHandle.

pub mod actor;
pub mod channel;
pub mod error;
pub mod group;
pub mod listener;
pub mod scheduler;
pub mod testing;

pub use actor::{ChannelHandle, spawn};
pub use channel::{CLEAR_BATCH_SIZE, ChannelBuilder, ChannelEvent, DefaultChannel};
pub use error::{ChannelError, DeliveryError};
pub use group::GroupConfig;
pub use listener::{ChannelListener, GroupListener};
pub use scheduler::{Scheduler, TimerId, TimerTask, TokioScheduler};
