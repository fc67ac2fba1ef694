// ABOUTME: Error types for the delivery channel.
// ABOUTME: ChannelError covers API misuse and a dead actor; DeliveryError is what group listeners see per record.

use beacon_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid group configuration for '{group}': {reason}")]
    InvalidGroup { group: String, reason: String },

    #[error("channel actor closed")]
    ChannelClosed,
}

/// Why a record was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("channel disabled, record discarded")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
