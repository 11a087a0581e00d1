//! Proxy-Owned L2CAP Channels
//!
//! A [`ClientChannel`] represents one logical connection-oriented L2CAP flow
//! owned by the proxy, identified by its (connection handle, CID) pair. Each
//! channel keeps a bounded FIFO of outbound payloads and defers wire-frame
//! construction to dequeue time, so a queued payload costs no transmit
//! buffer until credits allow it to go out.
//!
//! Channel methods never invoke client callbacks themselves; they hand any
//! pending [`ChannelEvent`] back to the
//! [`L2capChannelManager`](crate::manager::L2capChannelManager), which fires
//! it after releasing its lock.

use crate::codec::{AclHeader, BasicL2capHeader, BroadcastFlag, H4PacketType, PacketBoundary};
use crate::constants::{
    ATT_HANDLE_VALUE_NTF, ATT_NOTIFICATION_HEADER_SIZE, MAX_VALID_CONNECTION_HANDLE,
    MAX_WRITE_PAYLOAD_SIZE, QUEUE_CAPACITY, cid,
};
use crate::pool::{H4Packet, TxPacketPool};
use crate::{AclTransport, ChannelEvent, Payload, ProxyError};
use heapless::Deque;

/// Routing and registration key for one logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelKey {
    /// ACL connection handle (12 bits)
    pub handle: u16,
    /// L2CAP channel identifier
    pub cid: u16,
}

/// Channel lifecycle state
///
/// `Running -> Stopped -> Closed`, with `Closed` terminal. There is no
/// moved-from state; ownership transfer is enforced by the type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    /// Accepting client writes and inbound PDUs
    Running,
    /// Queue cleared; writes fail, inbound PDUs are dropped and reported
    Stopped,
    /// Terminal; the channel is deregistered from the manager
    Closed,
}

/// How a channel turns a queued payload into a wire packet
///
/// The kind is fixed at construction and selects the framing used by
/// `generate_next_tx_packet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelKind {
    /// Payloads go out verbatim as basic L2CAP PDUs on this channel's CID
    Basic,
    /// Payloads are wrapped in an ATT Handle Value Notification on the ATT
    /// fixed channel; transmit-only
    GattNotify {
        /// Attribute handle carried in every notification
        attribute_handle: u16,
    },
}

impl ChannelKind {
    fn max_payload_size(self) -> usize {
        match self {
            Self::Basic => MAX_WRITE_PAYLOAD_SIZE,
            Self::GattNotify { .. } => MAX_WRITE_PAYLOAD_SIZE - ATT_NOTIFICATION_HEADER_SIZE,
        }
    }
}

/// A refused write, carrying the untouched payload back to the caller
#[derive(Debug)]
pub struct WriteError {
    /// Why the write was refused
    pub reason: ProxyError,
    /// The payload, returned unmodified
    pub payload: Payload,
}

impl WriteError {
    pub(crate) fn new(reason: ProxyError, payload: Payload) -> Self {
        Self { reason, payload }
    }
}

/// Where an inbound PDU for a channel should go
pub(crate) enum RxRoute<'d> {
    /// Deliver the PDU payload to the channel's receive sink
    Deliver(Option<&'d dyn Fn(&[u8])>),
    /// Drop the PDU and raise `RxWhileStopped` via the event sink
    WhileStopped(Option<&'d dyn Fn(ChannelEvent)>),
    /// The channel kind cannot receive; the PDU passes through to the host
    Unsupported,
}

/// One logical L2CAP flow owned by the proxy
///
/// Exclusively owned by the manager's channel registry, which is the only
/// entity permitted to destroy it. Move-only.
pub struct ClientChannel<'d> {
    key: ChannelKey,
    transport: AclTransport,
    kind: ChannelKind,
    state: ChannelState,
    queue: Deque<Payload, QUEUE_CAPACITY>,
    notify_on_dequeue: bool,
    event_sink: Option<&'d dyn Fn(ChannelEvent)>,
    rx_sink: Option<&'d dyn Fn(&[u8])>,
}

impl<'d> ClientChannel<'d> {
    /// Create a channel in the `Running` state
    ///
    /// # Errors
    /// `ProxyError::InvalidArgument` if the connection handle exceeds
    /// 0x0EFF or the CID is the reserved null identifier.
    pub fn new(
        key: ChannelKey,
        transport: AclTransport,
        kind: ChannelKind,
        event_sink: Option<&'d dyn Fn(ChannelEvent)>,
        rx_sink: Option<&'d dyn Fn(&[u8])>,
    ) -> Result<Self, ProxyError> {
        if key.handle > MAX_VALID_CONNECTION_HANDLE || key.cid == cid::NULL {
            return Err(ProxyError::InvalidArgument);
        }
        Ok(Self {
            key,
            transport,
            kind,
            state: ChannelState::Running,
            queue: Deque::new(),
            notify_on_dequeue: false,
            event_sink,
            rx_sink,
        })
    }

    /// The (handle, CID) pair identifying this channel
    #[must_use]
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// The transport whose credit pool this channel draws from
    #[must_use]
    pub fn transport(&self) -> AclTransport {
        self.transport
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn event_sink(&self) -> Option<&'d dyn Fn(ChannelEvent)> {
        self.event_sink
    }

    /// Whether the queue holds payloads ready for dequeue
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Queue `payload` for transmission
    ///
    /// # Errors
    /// `FailedPrecondition` unless `Running`; `InvalidArgument` if the
    /// payload cannot fit any transmit buffer for this channel kind;
    /// `Unavailable` when the queue is full, which also latches
    /// notify-on-dequeue so the event sink fires `WriteAvailable` exactly
    /// once when space frees. Every error returns the payload unmodified.
    pub fn write(&mut self, payload: Payload) -> Result<(), WriteError> {
        if self.state != ChannelState::Running {
            return Err(WriteError::new(ProxyError::FailedPrecondition, payload));
        }
        if payload.len() > self.kind.max_payload_size() {
            return Err(WriteError::new(ProxyError::InvalidArgument, payload));
        }
        match self.queue.push_back(payload) {
            Ok(()) => Ok(()),
            Err(payload) => {
                self.notify_on_dequeue = true;
                Err(WriteError::new(ProxyError::Unavailable, payload))
            }
        }
    }

    /// Probe for queue space
    ///
    /// # Errors
    /// `Unavailable` when the queue is full (this also arms the
    /// notify-on-dequeue latch); `FailedPrecondition` unless `Running`.
    pub fn is_write_available(&mut self) -> Result<(), ProxyError> {
        if self.state != ChannelState::Running {
            return Err(ProxyError::FailedPrecondition);
        }
        if self.queue.is_full() {
            self.notify_on_dequeue = true;
            return Err(ProxyError::Unavailable);
        }
        Ok(())
    }

    /// Build the next outbound H4 frame from the front of the queue
    ///
    /// The payload is only popped once the transmit buffer is secured, so a
    /// pool failure leaves the queue intact. When a pop occurs and
    /// notify-on-dequeue was latched, the latch clears and the pending
    /// `WriteAvailable` event is returned for the manager to fire.
    ///
    /// # Errors
    /// `FailedPrecondition` if the queue is empty; `Unavailable` if the
    /// pool is exhausted.
    pub(crate) fn generate_next_tx_packet(
        &mut self,
        pool: &mut TxPacketPool,
    ) -> Result<(H4Packet, Option<ChannelEvent>), ProxyError> {
        let payload = self.queue.front().ok_or(ProxyError::FailedPrecondition)?;

        let (pdu_cid, att_header) = match self.kind {
            ChannelKind::Basic => (self.key.cid, None),
            ChannelKind::GattNotify { attribute_handle } => {
                let mut header = [0u8; ATT_NOTIFICATION_HEADER_SIZE];
                header[0] = ATT_HANDLE_VALUE_NTF;
                header[1..3].copy_from_slice(&attribute_handle.to_le_bytes());
                (cid::ATT, Some(header))
            }
        };

        let att_len = att_header.map_or(0, |h| h.len());
        let pdu_length = att_len + payload.len();
        let data_length = BasicL2capHeader::SIZE + pdu_length;
        let total_size = 1 + AclHeader::SIZE + data_length;

        let boundary = match self.transport {
            AclTransport::Le => PacketBoundary::FirstNonFlushable,
            AclTransport::BrEdr => PacketBoundary::FirstFlushable,
        };

        let mut packet = pool.allocate(H4PacketType::Acl, total_size)?;
        // Sizes were computed from bounds-checked inputs; extend cannot fail.
        packet.extend(
            &AclHeader::new(
                self.key.handle,
                boundary,
                BroadcastFlag::PointToPoint,
                data_length as u16,
            )
            .to_bytes(),
        )?;
        packet.extend(&BasicL2capHeader::new(pdu_length as u16, pdu_cid).to_bytes())?;
        if let Some(header) = att_header {
            packet.extend(&header)?;
        }
        packet.extend(payload)?;

        self.queue.pop_front();
        let event = if self.notify_on_dequeue {
            self.notify_on_dequeue = false;
            Some(ChannelEvent::WriteAvailable)
        } else {
            None
        };
        Ok((packet, event))
    }

    /// Clear the queue and stop accepting writes
    ///
    /// Pending sends do not complete. Inbound PDUs are dropped and surfaced
    /// as `RxWhileStopped` until the channel is closed.
    ///
    /// # Errors
    /// `FailedPrecondition` if the channel is already `Closed`.
    pub fn stop(&mut self) -> Result<(), ProxyError> {
        if self.state == ChannelState::Closed {
            return Err(ProxyError::FailedPrecondition);
        }
        self.queue.clear();
        self.notify_on_dequeue = false;
        self.state = ChannelState::Stopped;
        Ok(())
    }

    /// Close the channel, raising `event` to the client
    ///
    /// Idempotent: a second close performs nothing and raises nothing.
    /// Returns the event for the manager to fire after deregistration.
    pub(crate) fn close(&mut self, event: ChannelEvent) -> Option<ChannelEvent> {
        if self.state == ChannelState::Closed {
            return None;
        }
        self.queue.clear();
        self.notify_on_dequeue = false;
        self.state = ChannelState::Closed;
        Some(event)
    }

    /// Decide where an inbound PDU for this channel goes
    pub(crate) fn rx_route(&self) -> RxRoute<'d> {
        match (self.state, self.kind) {
            (ChannelState::Running, ChannelKind::Basic) => RxRoute::Deliver(self.rx_sink),
            (ChannelState::Running, ChannelKind::GattNotify { .. }) => RxRoute::Unsupported,
            _ => RxRoute::WhileStopped(self.event_sink),
        }
    }
}
