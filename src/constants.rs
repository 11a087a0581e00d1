//! `hciproxy` Constants
//!
//! This module contains all the constants used throughout the `hciproxy`
//! library. These define the bounded-memory limits, wire-format sizes, and
//! Bluetooth-specific parameters used in the implementation.

/// Highest connection handle value permitted by the HCI specification (12 bits)
pub const MAX_VALID_CONNECTION_HANDLE: u16 = 0x0EFF;

/// Maximum number of proxy-owned L2CAP channels across all connections
///
/// Must be a power of two (`FnvIndexMap` requirement).
pub const MAX_PROXY_CHANNELS: usize = 8;

/// Maximum number of ACL connections with in-flight receive state
///
/// Must be a power of two (`FnvIndexMap` requirement).
pub const MAX_ACL_CONNECTIONS: usize = 4;

/// Depth of each channel's outbound payload queue
pub const QUEUE_CAPACITY: usize = 5;

/// Number of transmit buffers in the shared pool
pub const TX_POOL_SIZE: usize = 8;

/// Maximum ACL data field size (L2CAP basic header plus payload)
pub const MAX_ACL_DATA_SIZE: usize = 1024;

/// Maximum size of a complete H4 frame: type byte, ACL header, ACL data
pub const MAX_H4_FRAME_SIZE: usize = 1 + 4 + MAX_ACL_DATA_SIZE;

/// Capacity of the recombination destination buffer (one full L2CAP PDU
/// including its basic header)
///
/// Covers the entire 16-bit declared-length range, so any PDU a conformant
/// controller can fragment is reassemblable.
pub const MAX_RECOMBINED_PDU_SIZE: usize = 65535 + 4;

/// Largest client payload accepted by a basic channel write
pub const MAX_WRITE_PAYLOAD_SIZE: usize = MAX_ACL_DATA_SIZE - 4;

/// L2CAP reserved channel identifiers
pub mod cid {
    /// Reserved - shall not be used
    pub const NULL: u16 = 0x0000;
    /// Attribute Protocol fixed channel
    pub const ATT: u16 = 0x0004;
}

/// ATT Handle Value Notification opcode
pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1B;

/// Size of the ATT Handle Value Notification header (opcode plus attribute
/// handle)
pub const ATT_NOTIFICATION_HEADER_SIZE: usize = 3;

/// HCI event code for Number Of Completed Packets
pub const EVENT_NUM_COMPLETED_PACKETS: u8 = 0x13;

/// HCI event code for Disconnection Complete
pub const EVENT_DISCONNECTION_COMPLETE: u8 = 0x05;
