//! Transmit Packet Pool
//!
//! Outbound frames travel as [`H4Packet`]s: owned, fixed-capacity buffers
//! acquired from a shared pool of [`TX_POOL_SIZE`](crate::constants::TX_POOL_SIZE)
//! permits. Ownership transfers at every step - pool to channel to send
//! callback to embedding layer - and the permit comes back through
//! [`ProxyHost::release_tx_packet`](crate::ProxyHost::release_tx_packet).
//! Allocation never blocks; exhaustion is a transient error cleared by the
//! next release.

use crate::ProxyError;
use crate::codec::H4PacketType;
use crate::constants::MAX_H4_FRAME_SIZE;
use heapless::Vec;

/// One complete H4 frame: type byte, type-specific header, payload
///
/// Move-only; there is exactly one owner of the wire buffer at any time.
#[derive(Debug)]
pub struct H4Packet {
    packet_type: H4PacketType,
    frame: Vec<u8, MAX_H4_FRAME_SIZE>,
    pooled: bool,
}

impl H4Packet {
    /// Wrap an existing wire frame for passthrough forwarding
    ///
    /// Passthrough frames do not consume a pool permit; the pool only
    /// governs proxy-generated traffic.
    ///
    /// # Errors
    /// Returns `ProxyError::DataLoss` for an empty span,
    /// `ProxyError::InvalidArgument` for an unknown type byte or a frame
    /// larger than the transmit buffer capacity.
    pub fn from_frame(bytes: &[u8]) -> Result<Self, ProxyError> {
        let Some(&type_byte) = bytes.first() else {
            return Err(ProxyError::DataLoss);
        };
        let packet_type = H4PacketType::try_from(type_byte)?;

        let mut frame = Vec::new();
        frame
            .extend_from_slice(bytes)
            .map_err(|()| ProxyError::InvalidArgument)?;

        Ok(Self {
            packet_type,
            frame,
            pooled: false,
        })
    }

    pub(crate) fn new_pooled(packet_type: H4PacketType) -> Self {
        Self::new_empty(packet_type, true)
    }

    /// An empty frame that holds no pool permit, for re-framing recombined
    /// PDUs on their way to the host
    pub(crate) fn new_unpooled(packet_type: H4PacketType) -> Self {
        Self::new_empty(packet_type, false)
    }

    fn new_empty(packet_type: H4PacketType, pooled: bool) -> Self {
        let mut frame = Vec::new();
        // Capacity is MAX_H4_FRAME_SIZE >= 1, the push cannot fail.
        let _ = frame.push(packet_type as u8);
        Self {
            packet_type,
            frame,
            pooled,
        }
    }

    /// Append bytes to the frame body
    ///
    /// # Errors
    /// Returns `ProxyError::InvalidArgument` if the frame would exceed the
    /// transmit buffer capacity.
    pub(crate) fn extend(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        self.frame
            .extend_from_slice(bytes)
            .map_err(|()| ProxyError::InvalidArgument)
    }

    /// The H4 packet type this frame carries
    #[must_use]
    pub fn packet_type(&self) -> H4PacketType {
        self.packet_type
    }

    /// The complete frame as it goes on the wire, type byte included
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Whether this packet holds a pool permit
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

/// Shared pool of transmit buffer permits
///
/// Tracks how many proxy-generated frames may be outstanding at once. The
/// buffers themselves live inline in each [`H4Packet`]; the pool counts
/// them so steady-state operation never allocates.
#[derive(Debug)]
pub struct TxPacketPool {
    free: usize,
}

impl TxPacketPool {
    /// Create a pool with `permits` transmit buffers
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self { free: permits }
    }

    /// Obtain a transmit buffer sized to hold a full frame of `total_size`
    /// bytes
    ///
    /// # Errors
    /// `ProxyError::InvalidArgument` if `total_size` exceeds the maximum
    /// supported H4 frame size, `ProxyError::Unavailable` if every permit is
    /// momentarily in use.
    pub fn allocate(
        &mut self,
        packet_type: H4PacketType,
        total_size: usize,
    ) -> Result<H4Packet, ProxyError> {
        if total_size > MAX_H4_FRAME_SIZE {
            return Err(ProxyError::InvalidArgument);
        }
        if self.free == 0 {
            return Err(ProxyError::Unavailable);
        }
        self.free -= 1;
        Ok(H4Packet::new_pooled(packet_type))
    }

    /// Return one permit to the pool
    pub fn release(&mut self) {
        self.free += 1;
    }

    /// Number of permits currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.free
    }
}
