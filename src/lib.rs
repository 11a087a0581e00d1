#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines)]

mod fmt;

pub mod channel;
pub mod codec;
pub mod constants;
pub mod manager;
pub mod pool;
pub mod proxy;
pub mod recombiner;

pub use channel::{ChannelKey, ChannelKind, ChannelState, WriteError};
pub use manager::L2capChannelManager;
pub use pool::H4Packet;
pub use proxy::{ProxyHost, ProxyStats};
pub use recombiner::Recombiner;

use heapless::Vec;

/// Owned client payload handed to a channel write.
///
/// Fixed-capacity and move-only; on any failed write the payload travels back
/// to the caller inside [`WriteError`] so no data is silently lost.
pub type Payload = Vec<u8, { constants::MAX_WRITE_PAYLOAD_SIZE }>;

/// Status codes returned by proxy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProxyError {
    /// Malformed size, handle, or CID, or a buffer too small to serialize into
    InvalidArgument,
    /// A supplied byte span is shorter than the header it must contain
    OutOfRange,
    /// Wire data is corrupted or truncated mid-stream
    DataLoss,
    /// The operation is illegal in the current state
    FailedPrecondition,
    /// Transient exhaustion of a queue, buffer pool, or credit pool; retry
    /// after the matching availability event
    Unavailable,
    /// A bounded allocation could not be satisfied
    ResourceExhausted,
    /// The channel kind does not support this operation
    Unimplemented,
}

impl core::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::OutOfRange => write!(f, "span too short for header"),
            Self::DataLoss => write!(f, "wire data corrupted"),
            Self::FailedPrecondition => write!(f, "operation illegal in current state"),
            Self::Unavailable => write!(f, "resource transiently unavailable"),
            Self::ResourceExhausted => write!(f, "bounded allocation failed"),
            Self::Unimplemented => write!(f, "unsupported by this channel kind"),
        }
    }
}

/// Channel-level conditions raised to a channel's event sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelEvent {
    /// Queue space freed up after a write was refused with `Unavailable`
    WriteAvailable,
    /// The channel was closed from the remote/controller side
    ChannelClosedByOther,
    /// A PDU arrived while the channel was stopped and was dropped
    RxWhileStopped,
}

/// ACL transport type a channel's traffic rides on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AclTransport {
    /// LE ACL transport
    Le,
    /// BR/EDR ACL transport
    BrEdr,
}

/// Proxy construction parameters
///
/// Credit counts are the number of ACL packets the proxy may have in flight
/// to the controller per transport before a Number Of Completed Packets
/// event replenishes the pool.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProxyConfig {
    /// Credits reserved for LE ACL traffic
    pub le_credits: u16,
    /// Credits reserved for BR/EDR ACL traffic
    pub bredr_credits: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            le_credits: 4,
            bredr_credits: 4,
        }
    }
}
