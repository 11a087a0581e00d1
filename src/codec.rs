//! HCI/L2CAP Wire-Format Codec
//!
//! Typed views over the fixed-layout byte headers the proxy must inspect:
//! H4 framing, ACL data headers, and basic L2CAP headers, plus the Number Of
//! Completed Packets event parameters used for credit accounting. All
//! multi-byte fields are little-endian and every read is bounds-checked
//! before it happens.

use crate::ProxyError;

/// H4 packet type indicator, the first byte of every H4 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum H4PacketType {
    /// HCI command (host to controller)
    Command = 0x01,
    /// ACL data (both directions)
    Acl = 0x02,
    /// Synchronous (SCO) data
    Sync = 0x03,
    /// HCI event (controller to host)
    Event = 0x04,
    /// Isochronous data
    Iso = 0x05,
}

impl TryFrom<u8> for H4PacketType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Command),
            0x02 => Ok(Self::Acl),
            0x03 => Ok(Self::Sync),
            0x04 => Ok(Self::Event),
            0x05 => Ok(Self::Iso),
            _ => Err(ProxyError::InvalidArgument),
        }
    }
}

/// Fixed header size for a given H4 packet type, excluding the type byte
#[must_use]
pub fn h4_header_size(packet_type: H4PacketType) -> usize {
    match packet_type {
        H4PacketType::Command | H4PacketType::Sync => 3,
        H4PacketType::Acl | H4PacketType::Iso => 4,
        H4PacketType::Event => 2,
    }
}

/// Read the payload length field out of an H4 packet header
///
/// `header` is the type-specific header starting immediately after the H4
/// type byte. ISO data length is a 14-bit field masked out of the final
/// 16-bit word.
///
/// # Errors
/// Returns `ProxyError::OutOfRange` if `header` is shorter than the fixed
/// header size for `packet_type`.
pub fn h4_payload_size(packet_type: H4PacketType, header: &[u8]) -> Result<usize, ProxyError> {
    let header_size = h4_header_size(packet_type);
    if header.len() < header_size {
        return Err(ProxyError::OutOfRange);
    }

    let size = match packet_type {
        H4PacketType::Command | H4PacketType::Sync => usize::from(header[2]),
        H4PacketType::Event => usize::from(header[1]),
        H4PacketType::Acl => usize::from(u16::from_le_bytes([header[2], header[3]])),
        H4PacketType::Iso => {
            usize::from(u16::from_le_bytes([header[2], header[3]]) & 0x3FFF)
        }
    };
    Ok(size)
}

/// ACL Packet Boundary flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketBoundary {
    /// First non-flushable packet
    FirstNonFlushable = 0x00,
    /// Continuing fragment packet
    ContinuingFragment = 0x01,
    /// First flushable packet
    FirstFlushable = 0x02,
    /// Complete L2CAP PDU (no fragmentation)
    CompletePdu = 0x03,
}

impl PacketBoundary {
    /// Convert from the raw 2-bit field value
    #[must_use]
    pub fn from_bits(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::FirstNonFlushable,
            0x01 => Self::ContinuingFragment,
            0x02 => Self::FirstFlushable,
            _ => Self::CompletePdu,
        }
    }

    /// Whether this boundary value opens a new PDU
    #[must_use]
    pub fn starts_pdu(self) -> bool {
        !matches!(self, Self::ContinuingFragment)
    }
}

/// ACL Broadcast flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BroadcastFlag {
    /// Point-to-point (no broadcast)
    PointToPoint = 0x00,
    /// Active broadcast
    ActiveBroadcast = 0x01,
    /// Piconet broadcast
    PiconetBroadcast = 0x02,
    /// Reserved
    Reserved = 0x03,
}

impl BroadcastFlag {
    /// Convert from the raw 2-bit field value
    #[must_use]
    pub fn from_bits(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::PointToPoint,
            0x01 => Self::ActiveBroadcast,
            0x02 => Self::PiconetBroadcast,
            _ => Self::Reserved,
        }
    }
}

/// ACL data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AclHeader {
    /// Connection handle (12 bits)
    pub connection_handle: u16,
    /// Packet boundary flag (2 bits)
    pub packet_boundary: PacketBoundary,
    /// Broadcast flag (2 bits)
    pub broadcast_flag: BroadcastFlag,
    /// Data total length
    pub data_length: u16,
}

impl AclHeader {
    /// Size of the ACL header in bytes
    pub const SIZE: usize = 4;

    /// Create a new ACL header
    #[must_use]
    pub fn new(
        connection_handle: u16,
        packet_boundary: PacketBoundary,
        broadcast_flag: BroadcastFlag,
        data_length: u16,
    ) -> Self {
        Self {
            connection_handle: connection_handle & 0x0FFF,
            packet_boundary,
            broadcast_flag,
            data_length,
        }
    }

    /// Parse an ACL header from bytes
    ///
    /// # Errors
    /// Returns `ProxyError::OutOfRange` if fewer than 4 bytes are supplied.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProxyError> {
        if bytes.len() < Self::SIZE {
            return Err(ProxyError::OutOfRange);
        }

        let handle_and_flags = u16::from_le_bytes([bytes[0], bytes[1]]);
        let packet_boundary = PacketBoundary::from_bits((handle_and_flags >> 12) as u8);
        let broadcast_flag = BroadcastFlag::from_bits((handle_and_flags >> 14) as u8);
        let data_length = u16::from_le_bytes([bytes[2], bytes[3]]);

        Ok(Self::new(
            handle_and_flags & 0x0FFF,
            packet_boundary,
            broadcast_flag,
            data_length,
        ))
    }

    /// Serialize the header to its 4-byte wire form
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let handle_and_flags = self.connection_handle
            | (u16::from(self.packet_boundary as u8) << 12)
            | (u16::from(self.broadcast_flag as u8) << 14);

        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&handle_and_flags.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.data_length.to_le_bytes());
        bytes
    }
}

/// Basic L2CAP header carried at the start of every L2CAP PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BasicL2capHeader {
    /// Length of the PDU payload, not including this header
    pub pdu_length: u16,
    /// Channel identifier of the intended recipient
    pub channel_id: u16,
}

impl BasicL2capHeader {
    /// Size of the basic L2CAP header in bytes
    pub const SIZE: usize = 4;

    /// Create a new basic header
    #[must_use]
    pub fn new(pdu_length: u16, channel_id: u16) -> Self {
        Self {
            pdu_length,
            channel_id,
        }
    }

    /// Parse a basic L2CAP header from bytes
    ///
    /// # Errors
    /// Returns `ProxyError::DataLoss` if fewer than 4 bytes are supplied; a
    /// short first fragment means the surrounding frame is corrupt.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProxyError> {
        if bytes.len() < Self::SIZE {
            return Err(ProxyError::DataLoss);
        }

        Ok(Self {
            pdu_length: u16::from_le_bytes([bytes[0], bytes[1]]),
            channel_id: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    /// Serialize the header to its 4-byte wire form
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.pdu_length.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.channel_id.to_le_bytes());
        bytes
    }

    /// Total PDU size on the wire: this header plus the declared payload
    #[must_use]
    pub fn total_pdu_size(self) -> usize {
        Self::SIZE + usize::from(self.pdu_length)
    }
}

/// Parsed parameters of a Number Of Completed Packets event
///
/// The controller reports, per connection handle, how many ACL packets it
/// has finished transmitting; each completion returns one credit.
#[derive(Debug, Clone, Copy)]
pub struct NumberOfCompletedPackets<'a> {
    entries: &'a [u8],
}

impl<'a> NumberOfCompletedPackets<'a> {
    /// Parse from raw event parameters (everything after the 2-byte event
    /// header)
    ///
    /// # Errors
    /// Returns `ProxyError::DataLoss` if the parameter block does not hold
    /// exactly the advertised number of (handle, count) pairs.
    pub fn from_params(params: &'a [u8]) -> Result<Self, ProxyError> {
        let Some((&num_handles, entries)) = params.split_first() else {
            return Err(ProxyError::DataLoss);
        };
        if entries.len() != usize::from(num_handles) * 4 {
            return Err(ProxyError::DataLoss);
        }
        Ok(Self { entries })
    }

    /// Iterate over (connection handle, completed packet count) pairs
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + 'a {
        self.entries.chunks_exact(4).map(|chunk| {
            (
                u16::from_le_bytes([chunk[0], chunk[1]]) & 0x0FFF,
                u16::from_le_bytes([chunk[2], chunk[3]]),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_lookup() {
        assert_eq!(h4_header_size(H4PacketType::Command), 3);
        assert_eq!(h4_header_size(H4PacketType::Acl), 4);
        assert_eq!(h4_header_size(H4PacketType::Sync), 3);
        assert_eq!(h4_header_size(H4PacketType::Event), 2);
        assert_eq!(h4_header_size(H4PacketType::Iso), 4);
    }

    #[test]
    fn test_unknown_packet_type_rejected() {
        assert_eq!(H4PacketType::try_from(0x00), Err(ProxyError::InvalidArgument));
        assert_eq!(H4PacketType::try_from(0x06), Err(ProxyError::InvalidArgument));
        assert_eq!(H4PacketType::try_from(0xFF), Err(ProxyError::InvalidArgument));
    }

    #[test]
    fn test_acl_payload_size() {
        let header = [0x0C, 0x00, 0x34, 0x12];
        assert_eq!(h4_payload_size(H4PacketType::Acl, &header), Ok(0x1234));
    }

    #[test]
    fn test_payload_size_short_header() {
        let header = [0x0C, 0x00, 0x34];
        assert_eq!(
            h4_payload_size(H4PacketType::Acl, &header),
            Err(ProxyError::OutOfRange)
        );
        assert_eq!(
            h4_payload_size(H4PacketType::Event, &[0x13]),
            Err(ProxyError::OutOfRange)
        );
    }

    #[test]
    fn test_payload_size_per_type() {
        assert_eq!(
            h4_payload_size(H4PacketType::Command, &[0x03, 0x0C, 0x05]),
            Ok(5)
        );
        assert_eq!(h4_payload_size(H4PacketType::Event, &[0x13, 0x09]), Ok(9));
        assert_eq!(
            h4_payload_size(H4PacketType::Sync, &[0x0C, 0x00, 0x30]),
            Ok(0x30)
        );
    }

    #[test]
    fn test_iso_length_masked_to_14_bits() {
        // Upper two bits of the length word are flags, not length.
        let header = [0x0C, 0x00, 0xFF, 0xFF];
        assert_eq!(h4_payload_size(H4PacketType::Iso, &header), Ok(0x3FFF));
    }

    #[test]
    fn test_acl_header_parsing() {
        // Handle 0x0040, Complete PDU (bits 12-13 = 11), 8 bytes
        let bytes = [0x40, 0x30, 0x08, 0x00];
        let header = AclHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.connection_handle, 0x0040);
        assert_eq!(header.packet_boundary, PacketBoundary::CompletePdu);
        assert_eq!(header.broadcast_flag, BroadcastFlag::PointToPoint);
        assert_eq!(header.data_length, 8);
    }

    #[test]
    fn test_acl_header_roundtrip() {
        let header = AclHeader::new(
            0x0EFF,
            PacketBoundary::ContinuingFragment,
            BroadcastFlag::PointToPoint,
            512,
        );
        assert_eq!(AclHeader::from_bytes(&header.to_bytes()), Ok(header));
    }

    #[test]
    fn test_acl_header_too_short() {
        assert_eq!(
            AclHeader::from_bytes(&[0x40, 0x30, 0x08]),
            Err(ProxyError::OutOfRange)
        );
    }

    #[test]
    fn test_l2cap_header_little_endian() {
        let header = BasicL2capHeader::new(0x1234, 0x5678);
        assert_eq!(header.to_bytes(), [0x34, 0x12, 0x78, 0x56]);

        let parsed = BasicL2capHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.total_pdu_size(), 4 + 0x1234);
    }

    #[test]
    fn test_l2cap_header_too_short() {
        assert_eq!(
            BasicL2capHeader::from_bytes(&[0x01, 0x02, 0x03]),
            Err(ProxyError::DataLoss)
        );
    }

    #[test]
    fn test_nocp_parsing() {
        // Two handles: 0x0040 completed 2, 0x0041 completed 1.
        let params = [0x02, 0x40, 0x00, 0x02, 0x00, 0x41, 0x00, 0x01, 0x00];
        let nocp = NumberOfCompletedPackets::from_params(&params).unwrap();
        let entries: heapless::Vec<(u16, u16), 4> = nocp.iter().collect();
        assert_eq!(entries.as_slice(), &[(0x0040, 2), (0x0041, 1)]);
    }

    #[test]
    fn test_nocp_truncated_rejected() {
        let params = [0x02, 0x40, 0x00, 0x02, 0x00];
        assert_eq!(
            NumberOfCompletedPackets::from_params(&params).unwrap_err(),
            ProxyError::DataLoss
        );
        assert_eq!(
            NumberOfCompletedPackets::from_params(&[]).unwrap_err(),
            ProxyError::DataLoss
        );
    }

    #[test]
    fn test_boundary_flag_bits() {
        assert_eq!(
            PacketBoundary::from_bits(0x00),
            PacketBoundary::FirstNonFlushable
        );
        assert_eq!(
            PacketBoundary::from_bits(0x01),
            PacketBoundary::ContinuingFragment
        );
        assert_eq!(PacketBoundary::from_bits(0x02), PacketBoundary::FirstFlushable);
        assert_eq!(PacketBoundary::from_bits(0x03), PacketBoundary::CompletePdu);
        assert!(PacketBoundary::CompletePdu.starts_pdu());
        assert!(!PacketBoundary::ContinuingFragment.starts_pdu());
    }
}
