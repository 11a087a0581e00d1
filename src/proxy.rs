//! Proxy Host - the single ingress/egress point
//!
//! [`ProxyHost`] sits on the H4 wire between a host stack and a controller.
//! Frames it does not claim pass through unmodified in both directions.
//! Controller-to-host ACL data runs through per-connection recombination and
//! is dispatched by CID to the matching proxy channel; Number Of Completed
//! Packets events replenish the credit pools and re-drain blocked queues;
//! Disconnection Complete events tear down everything riding on the dead
//! handle.
//!
//! Corruption policy: a malformed, conflicting, or oversized fragment
//! sequence drops the whole in-flight frame, bumps the drop counter, and is
//! logged. No partial PDU is ever delivered.

use crate::channel::{ChannelKey, ChannelKind, ClientChannel, RxRoute, WriteError};
use crate::codec::{
    AclHeader, BasicL2capHeader, BroadcastFlag, H4PacketType, NumberOfCompletedPackets,
    PacketBoundary,
};
use crate::constants::{
    EVENT_DISCONNECTION_COMPLETE, EVENT_NUM_COMPLETED_PACKETS, MAX_ACL_CONNECTIONS, cid,
};
use crate::manager::L2capChannelManager;
use crate::pool::H4Packet;
use crate::recombiner::{RecombinedPdu, Recombiner};
use crate::{AclTransport, ChannelEvent, Payload, ProxyConfig, ProxyError};
use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::FnvIndexMap;

/// Counters for traffic the proxy has intercepted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProxyStats {
    /// Frames abandoned due to corruption, preemption, or exhaustion
    pub frames_dropped: u32,
    /// PDUs reassembled from more than one fragment
    pub pdus_recombined: u32,
    /// Complete PDUs passed through to the host for unclaimed CIDs
    pub pdus_forwarded: u32,
}

/// Per-connection-handle receive state
#[derive(Default)]
struct ConnectionRx {
    recombiner: Recombiner,
    /// Bytes of an unclaimed, fragmented PDU still expected; continuing
    /// fragments pass straight through to the host while this is non-zero
    forward_remaining: usize,
}

#[derive(Default)]
struct RxState {
    connections: FnvIndexMap<u16, ConnectionRx, MAX_ACL_CONNECTIONS>,
    stats: ProxyStats,
}

/// What a locked receive-state transition decided to do with a fragment
enum RxAction {
    /// Pass the original frame through to the host
    Forward,
    /// A PDU completed; dispatch it by CID
    Dispatch(RecombinedPdu),
    /// The fragment was absorbed into an in-progress recombination
    Consumed,
    /// The fragment (and possibly its whole sequence) was dropped
    Dropped(ProxyError),
}

/// Single entry point wiring the recombiner and channel manager to the two
/// directional send callbacks
pub struct ProxyHost<'d> {
    manager: L2capChannelManager<'d>,
    rx: Mutex<CriticalSectionRawMutex, RefCell<RxState>>,
    send_to_host: &'d dyn Fn(H4Packet),
    send_to_controller: &'d dyn Fn(H4Packet),
}

impl<'d> ProxyHost<'d> {
    /// Create a proxy with the two directional callbacks and reserved
    /// credit counts
    #[must_use]
    pub fn new(
        send_to_host: &'d dyn Fn(H4Packet),
        send_to_controller: &'d dyn Fn(H4Packet),
        config: ProxyConfig,
    ) -> Self {
        Self {
            manager: L2capChannelManager::new(config),
            rx: Mutex::new(RefCell::new(RxState::default())),
            send_to_host,
            send_to_controller,
        }
    }

    /// The channel manager backing this proxy
    #[must_use]
    pub fn manager(&self) -> &L2capChannelManager<'d> {
        &self.manager
    }

    /// Snapshot of the intercept counters
    #[must_use]
    pub fn stats(&self) -> ProxyStats {
        self.rx.lock(|cell| cell.borrow().stats)
    }

    /// Open a connection-oriented channel the proxy will own
    ///
    /// Inbound PDUs addressed to (`handle`, `cid`) are delivered to
    /// `rx_sink` instead of the host; outbound writes go through
    /// [`write`](Self::write).
    ///
    /// # Errors
    /// `InvalidArgument` for a bad handle/CID or duplicate registration,
    /// `ResourceExhausted` when the registry is full.
    pub fn open_channel(
        &self,
        handle: u16,
        channel_id: u16,
        transport: AclTransport,
        event_sink: Option<&'d dyn Fn(ChannelEvent)>,
        rx_sink: Option<&'d dyn Fn(&[u8])>,
    ) -> Result<(), ProxyError> {
        let channel = ClientChannel::new(
            ChannelKey {
                handle,
                cid: channel_id,
            },
            transport,
            ChannelKind::Basic,
            event_sink,
            rx_sink,
        )?;
        self.manager.register_channel(channel)
    }

    /// Open a transmit-only channel that wraps every payload in an ATT
    /// Handle Value Notification on the ATT fixed channel
    ///
    /// # Errors
    /// Same contract as [`open_channel`](Self::open_channel).
    pub fn open_gatt_notify_channel(
        &self,
        handle: u16,
        attribute_handle: u16,
        event_sink: Option<&'d dyn Fn(ChannelEvent)>,
    ) -> Result<(), ProxyError> {
        let channel = ClientChannel::new(
            ChannelKey {
                handle,
                cid: cid::ATT,
            },
            AclTransport::Le,
            ChannelKind::GattNotify { attribute_handle },
            event_sink,
            None,
        )?;
        self.manager.register_channel(channel)
    }

    /// Queue `payload` on a channel and drain towards the controller
    ///
    /// # Errors
    /// The channel write contract; the payload rides back in the error.
    pub fn write(&self, handle: u16, channel_id: u16, payload: Payload) -> Result<(), WriteError> {
        let result = self.manager.write(
            ChannelKey {
                handle,
                cid: channel_id,
            },
            payload,
        );
        self.manager.drain(self.send_to_controller);
        result
    }

    /// Probe a channel's queue for space
    ///
    /// # Errors
    /// `Unavailable` when the queue is full (arming the `WriteAvailable`
    /// latch), `FailedPrecondition` unless running, `InvalidArgument` for
    /// an unknown channel.
    pub fn is_write_available(&self, handle: u16, channel_id: u16) -> Result<(), ProxyError> {
        self.manager.is_write_available(ChannelKey {
            handle,
            cid: channel_id,
        })
    }

    /// Stop a channel: pending sends are discarded, writes refused
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown channel, `FailedPrecondition` if
    /// already closed.
    pub fn stop_channel(&self, handle: u16, channel_id: u16) -> Result<(), ProxyError> {
        self.manager.stop(ChannelKey {
            handle,
            cid: channel_id,
        })
    }

    /// Close a channel and deregister it; idempotent
    ///
    /// Returns whether a channel was actually closed.
    pub fn close_channel(&self, handle: u16, channel_id: u16) -> bool {
        self.manager.close(
            ChannelKey {
                handle,
                cid: channel_id,
            },
            ChannelEvent::ChannelClosedByOther,
        )
    }

    /// Return a spent transmit packet's pool permit and re-drain
    pub fn release_tx_packet(&self, packet: H4Packet) {
        self.manager.release_tx_packet(packet);
        self.manager.drain(self.send_to_controller);
    }

    /// Tear down all state riding on `handle`: in-flight recombination is
    /// discarded and every channel on the handle closes with
    /// `ChannelClosedByOther`
    pub fn handle_disconnection(&self, handle: u16) {
        let dropped = self.rx.lock(|cell| {
            let mut state = cell.borrow_mut();
            let dropped = state
                .connections
                .remove(&handle)
                .is_some_and(|conn| conn.recombiner.is_active());
            if dropped {
                state.stats.frames_dropped += 1;
            }
            dropped
        });
        if dropped {
            warn!("dropping in-flight recombination for disconnected handle {}", handle);
        }
        // The controller never reports completions for a dead connection.
        self.manager.reclaim_in_flight(handle);
        self.manager.close_all_on_handle(handle);
    }

    /// Process one H4 frame travelling host to controller
    ///
    /// Everything passes through unmodified; proxy-originated traffic uses
    /// [`write`](Self::write) instead.
    ///
    /// # Errors
    /// `DataLoss` for an empty frame, `InvalidArgument` for an unknown H4
    /// packet type.
    pub fn handle_h4_from_host(&self, frame: &[u8]) -> Result<(), ProxyError> {
        let packet = H4Packet::from_frame(frame)?;
        (self.send_to_controller)(packet);
        Ok(())
    }

    /// Process one H4 frame travelling controller to host
    ///
    /// ACL data is routed through recombination and channel dispatch;
    /// Number Of Completed Packets and Disconnection Complete events are
    /// inspected (and still forwarded); everything else passes through.
    ///
    /// # Errors
    /// `DataLoss`/`OutOfRange` for corrupt framing (the affected PDU is
    /// dropped and counted), `InvalidArgument` for an unknown packet type,
    /// `FailedPrecondition` for a continuing fragment with no sequence in
    /// flight, `ResourceExhausted` when receive state cannot be allocated.
    pub fn handle_h4_from_controller(&self, frame: &[u8]) -> Result<(), ProxyError> {
        let Some(&type_byte) = frame.first() else {
            return Err(self.report_drop(ProxyError::DataLoss));
        };
        match H4PacketType::try_from(type_byte)? {
            H4PacketType::Acl => self.acl_from_controller(frame),
            H4PacketType::Event => self.event_from_controller(frame),
            _ => self.forward_to_host(frame),
        }
    }

    fn event_from_controller(&self, frame: &[u8]) -> Result<(), ProxyError> {
        if let Some(&code) = frame.get(1) {
            let params = frame.get(3..).unwrap_or(&[]);
            match code {
                EVENT_NUM_COMPLETED_PACKETS => self.grant_from_nocp(params),
                EVENT_DISCONNECTION_COMPLETE => {
                    // Params: status, handle, reason.
                    if params.len() >= 4 && params[0] == 0x00 {
                        let handle = u16::from_le_bytes([params[1], params[2]]) & 0x0FFF;
                        self.handle_disconnection(handle);
                    }
                }
                _ => {}
            }
        }
        self.forward_to_host(frame)
    }

    fn grant_from_nocp(&self, params: &[u8]) {
        let Ok(nocp) = NumberOfCompletedPackets::from_params(params) else {
            warn!("malformed Number Of Completed Packets event");
            return;
        };
        let mut granted = false;
        for (handle, count) in nocp.iter() {
            if self.manager.complete_packets(handle, count) {
                granted = true;
            }
        }
        if granted {
            self.manager.drain(self.send_to_controller);
        }
    }

    fn acl_from_controller(&self, frame: &[u8]) -> Result<(), ProxyError> {
        let acl = &frame[1..];
        let header = match AclHeader::from_bytes(acl) {
            Ok(header) => header,
            Err(e) => return Err(self.report_drop(e)),
        };
        let data = &acl[AclHeader::SIZE..];
        if data.len() != usize::from(header.data_length) {
            return Err(self.report_drop(ProxyError::DataLoss));
        }

        if header.packet_boundary.starts_pdu() {
            self.start_pdu(frame, header.connection_handle, data)
        } else {
            self.continue_pdu(frame, header.connection_handle, data)
        }
    }

    /// First fragment (or complete PDU) of a new sequence
    fn start_pdu(&self, frame: &[u8], handle: u16, data: &[u8]) -> Result<(), ProxyError> {
        // A new sequence preempts whatever was in flight on this handle;
        // the old sequence is dropped and reported.
        let preempted = self.rx.lock(|cell| {
            let mut state = cell.borrow_mut();
            let RxState { connections, stats } = &mut *state;
            connections.get_mut(&handle).is_some_and(|conn| {
                let was_active = conn.recombiner.is_active();
                conn.recombiner.end();
                conn.forward_remaining = 0;
                if was_active {
                    stats.frames_dropped += 1;
                }
                was_active
            })
        });
        if preempted {
            warn!("recombination preempted on handle {}, dropping partial PDU", handle);
        }

        let l2cap = match BasicL2capHeader::from_bytes(data) {
            Ok(l2cap) => l2cap,
            Err(e) => return Err(self.report_drop(e)),
        };
        let total = l2cap.total_pdu_size();
        if data.len() > total {
            // More payload than the header declares: stream corruption.
            return Err(self.report_drop(ProxyError::DataLoss));
        }

        let key = ChannelKey {
            handle,
            cid: l2cap.channel_id,
        };
        let claimed = matches!(
            self.manager.rx_route(key),
            Some(RxRoute::Deliver(_) | RxRoute::WhileStopped(_))
        );

        if !claimed {
            if data.len() < total {
                self.set_forwarding(handle, total - data.len())?;
            } else {
                self.bump_forwarded();
            }
            return self.forward_to_host(frame);
        }

        if data.len() == total {
            // Unfragmented; no recombination state needed.
            return self.dispatch_pdu(key, data);
        }

        let started = self.rx.lock(|cell| {
            let mut state = cell.borrow_mut();
            let RxState { connections, stats } = &mut *state;
            if !connections.contains_key(&handle)
                && connections.insert(handle, ConnectionRx::default()).is_err()
            {
                stats.frames_dropped += 1;
                return Err(ProxyError::ResourceExhausted);
            }
            let Some(conn) = connections.get_mut(&handle) else {
                return Err(ProxyError::Unavailable);
            };
            conn.recombiner
                .start(l2cap.channel_id, total)
                .and_then(|()| conn.recombiner.add_fragment(data))
                .inspect_err(|_| {
                    conn.recombiner.end();
                    stats.frames_dropped += 1;
                })
        });
        match started {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("failed to start recombination on handle {}", handle);
                Err(e)
            }
        }
    }

    /// Continuing fragment of an in-flight sequence
    fn continue_pdu(&self, frame: &[u8], handle: u16, data: &[u8]) -> Result<(), ProxyError> {
        let action = self.rx.lock(|cell| {
            let mut state = cell.borrow_mut();
            let RxState { connections, stats } = &mut *state;
            let Some(conn) = connections.get_mut(&handle) else {
                stats.frames_dropped += 1;
                return RxAction::Dropped(ProxyError::FailedPrecondition);
            };

            if conn.forward_remaining > 0 {
                conn.forward_remaining = conn.forward_remaining.saturating_sub(data.len());
                if conn.forward_remaining == 0 {
                    stats.pdus_forwarded += 1;
                }
                return RxAction::Forward;
            }

            if !conn.recombiner.is_active() {
                // Continuing fragment while idle.
                stats.frames_dropped += 1;
                return RxAction::Dropped(ProxyError::FailedPrecondition);
            }

            match conn.recombiner.add_fragment(data) {
                Ok(()) => {
                    if conn.recombiner.is_complete() {
                        stats.pdus_recombined += 1;
                        RxAction::Dispatch(conn.recombiner.take_and_end())
                    } else {
                        RxAction::Consumed
                    }
                }
                Err(e) => {
                    conn.recombiner.end();
                    stats.frames_dropped += 1;
                    RxAction::Dropped(e)
                }
            }
        });

        match action {
            RxAction::Forward => self.forward_to_host(frame),
            RxAction::Dispatch(pdu) => {
                let l2cap = BasicL2capHeader::from_bytes(&pdu)?;
                self.dispatch_pdu(
                    ChannelKey {
                        handle,
                        cid: l2cap.channel_id,
                    },
                    &pdu,
                )
            }
            RxAction::Consumed => Ok(()),
            RxAction::Dropped(e) => {
                warn!("dropping ACL fragment on handle {}", handle);
                Err(e)
            }
        }
    }

    /// Hand a complete PDU to whoever claims its CID
    fn dispatch_pdu(&self, key: ChannelKey, pdu: &[u8]) -> Result<(), ProxyError> {
        let payload = &pdu[BasicL2capHeader::SIZE..];
        match self.manager.rx_route(key) {
            Some(RxRoute::Deliver(sink)) => {
                if let Some(sink) = sink {
                    sink(payload);
                }
                Ok(())
            }
            Some(RxRoute::WhileStopped(sink)) => {
                self.rx
                    .lock(|cell| cell.borrow_mut().stats.frames_dropped += 1);
                debug!("PDU for stopped channel dropped");
                if let Some(sink) = sink {
                    sink(ChannelEvent::RxWhileStopped);
                }
                Ok(())
            }
            // Unclaimed, or a transmit-only kind: re-frame for the host.
            Some(RxRoute::Unsupported) | None => {
                self.bump_forwarded();
                self.forward_pdu_to_host(key.handle, pdu)
            }
        }
    }

    /// Re-frame a recombined PDU as a single ACL packet bound for the host
    fn forward_pdu_to_host(&self, handle: u16, pdu: &[u8]) -> Result<(), ProxyError> {
        let mut packet = H4Packet::new_unpooled(H4PacketType::Acl);
        let header = AclHeader::new(
            handle,
            PacketBoundary::FirstFlushable,
            BroadcastFlag::PointToPoint,
            pdu.len() as u16,
        );
        // A PDU recombined for a channel that vanished before completion
        // can exceed what fits in one outbound frame.
        if packet
            .extend(&header.to_bytes())
            .and_then(|()| packet.extend(pdu))
            .is_err()
        {
            return Err(self.report_drop(ProxyError::ResourceExhausted));
        }
        (self.send_to_host)(packet);
        Ok(())
    }

    fn forward_to_host(&self, frame: &[u8]) -> Result<(), ProxyError> {
        let packet = H4Packet::from_frame(frame)?;
        (self.send_to_host)(packet);
        Ok(())
    }

    fn set_forwarding(&self, handle: u16, remaining: usize) -> Result<(), ProxyError> {
        self.rx.lock(|cell| {
            let mut state = cell.borrow_mut();
            let RxState { connections, stats } = &mut *state;
            match connections.get_mut(&handle) {
                Some(conn) => {
                    conn.forward_remaining = remaining;
                    Ok(())
                }
                None => {
                    let conn = ConnectionRx {
                        forward_remaining: remaining,
                        ..ConnectionRx::default()
                    };
                    connections.insert(handle, conn).map(|_| ()).map_err(|_| {
                        stats.frames_dropped += 1;
                        ProxyError::ResourceExhausted
                    })
                }
            }
        })
    }

    fn bump_forwarded(&self) {
        self.rx
            .lock(|cell| cell.borrow_mut().stats.pdus_forwarded += 1);
    }

    fn report_drop(&self, reason: ProxyError) -> ProxyError {
        self.rx
            .lock(|cell| cell.borrow_mut().stats.frames_dropped += 1);
        warn!("dropping malformed ACL frame");
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    // Links the std critical-section implementation into the test binary.
    use critical_section as _;
    use heapless::Vec;

    type Captured = RefCell<Vec<Vec<u8, 64>, 8>>;

    fn capture(into: &Captured, packet: &H4Packet) {
        let mut copy = Vec::new();
        copy.extend_from_slice(packet.as_bytes()).unwrap();
        into.borrow_mut().push(copy).unwrap();
    }

    fn payload_of(bytes: &[u8]) -> Payload {
        let mut payload = Payload::new();
        payload.extend_from_slice(bytes).unwrap();
        payload
    }

    /// Build a controller-to-host ACL frame
    fn acl_frame(handle: u16, boundary: PacketBoundary, data: &[u8]) -> Vec<u8, 64> {
        let mut frame = Vec::new();
        frame.push(0x02).unwrap();
        frame
            .extend_from_slice(
                &AclHeader::new(handle, boundary, BroadcastFlag::PointToPoint, data.len() as u16)
                    .to_bytes(),
            )
            .unwrap();
        frame.extend_from_slice(data).unwrap();
        frame
    }

    /// L2CAP basic header followed by payload
    fn pdu(cid: u16, payload: &[u8]) -> Vec<u8, 64> {
        let mut data = Vec::new();
        data.extend_from_slice(&BasicL2capHeader::new(payload.len() as u16, cid).to_bytes())
            .unwrap();
        data.extend_from_slice(payload).unwrap();
        data
    }

    #[test]
    fn test_complete_pdu_delivered_to_channel() {
        let to_host = |_packet: H4Packet| panic!("claimed PDU must not reach the host");
        let to_controller = |_packet: H4Packet| {};
        let received: RefCell<Vec<u8, 64>> = RefCell::new(Vec::new());
        let rx_sink = |payload: &[u8]| {
            received.borrow_mut().extend_from_slice(payload).unwrap();
        };

        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, Some(&rx_sink))
            .unwrap();

        let data = pdu(0x0041, &[0xDE, 0xAD]);
        let frame = acl_frame(0x0040, PacketBoundary::FirstNonFlushable, &data);
        proxy.handle_h4_from_controller(&frame).unwrap();

        assert_eq!(received.borrow().as_slice(), &[0xDE, 0xAD]);
    }

    #[test]
    fn test_fragmented_pdu_recombined_byte_exact() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let received: RefCell<Vec<u8, 64>> = RefCell::new(Vec::new());
        let rx_sink = |payload: &[u8]| {
            received.borrow_mut().extend_from_slice(payload).unwrap();
        };

        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, Some(&rx_sink))
            .unwrap();

        let data = pdu(0x0041, b"derp");
        // The 8-byte PDU arrives split across three fragments.
        proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::FirstNonFlushable,
                &data[..5],
            ))
            .unwrap();
        assert!(received.borrow().is_empty());
        proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::ContinuingFragment,
                &data[5..7],
            ))
            .unwrap();
        assert!(received.borrow().is_empty());
        proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::ContinuingFragment,
                &data[7..],
            ))
            .unwrap();

        assert_eq!(received.borrow().as_slice(), b"derp");
        assert_eq!(proxy.stats().pdus_recombined, 1);
    }

    #[test]
    fn test_new_sequence_preempts_old_one() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let received: RefCell<Vec<u8, 64>> = RefCell::new(Vec::new());
        let rx_sink = |payload: &[u8]| {
            received.borrow_mut().extend_from_slice(payload).unwrap();
        };

        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, Some(&rx_sink))
            .unwrap();

        // First sequence never completes.
        let old = pdu(0x0041, &[0x01, 0x02, 0x03, 0x04]);
        proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::FirstNonFlushable,
                &old[..6],
            ))
            .unwrap();

        // A second first-fragment drops the old sequence and proceeds.
        let new = pdu(0x0041, &[0xAA, 0xBB]);
        proxy
            .handle_h4_from_controller(&acl_frame(0x0040, PacketBoundary::FirstNonFlushable, &new))
            .unwrap();

        assert_eq!(received.borrow().as_slice(), &[0xAA, 0xBB]);
        assert_eq!(proxy.stats().frames_dropped, 1);
    }

    #[test]
    fn test_continuing_fragment_while_idle_dropped() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());

        let err = proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::ContinuingFragment,
                &[0x01, 0x02],
            ))
            .unwrap_err();
        assert_eq!(err, ProxyError::FailedPrecondition);
        assert_eq!(proxy.stats().frames_dropped, 1);
    }

    #[test]
    fn test_oversized_fragments_drop_whole_sequence() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let received: RefCell<Vec<u8, 64>> = RefCell::new(Vec::new());
        let rx_sink = |payload: &[u8]| {
            received.borrow_mut().extend_from_slice(payload).unwrap();
        };
        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, Some(&rx_sink))
            .unwrap();

        // Declared total: header + 2 payload bytes.
        let data = pdu(0x0041, &[0x01, 0x02]);
        proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::FirstNonFlushable,
                &data[..4],
            ))
            .unwrap();
        // Three more bytes overflow the declared total.
        let err = proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::ContinuingFragment,
                &[0x01, 0x02, 0x03],
            ))
            .unwrap_err();

        assert_eq!(err, ProxyError::DataLoss);
        assert!(received.borrow().is_empty());
        assert_eq!(proxy.stats().frames_dropped, 1);
    }

    #[test]
    fn test_malformed_first_fragment_dropped() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());

        // Too short for a basic L2CAP header.
        let err = proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::FirstNonFlushable,
                &[0x02, 0x00],
            ))
            .unwrap_err();
        assert_eq!(err, ProxyError::DataLoss);

        // Declared length smaller than the payload actually present.
        let mut lying = pdu(0x0041, &[0x01]);
        lying.push(0xFF).unwrap();
        let err = proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::FirstNonFlushable,
                &lying,
            ))
            .unwrap_err();
        assert_eq!(err, ProxyError::DataLoss);
        assert_eq!(proxy.stats().frames_dropped, 2);
    }

    #[test]
    fn test_unclaimed_cid_passes_through() {
        let to_host_frames: Captured = RefCell::new(Vec::new());
        let to_host = |packet: H4Packet| capture(&to_host_frames, &packet);
        let to_controller = |_packet: H4Packet| {};
        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());

        let data = pdu(0x0051, &[0x01, 0x02, 0x03, 0x04]);
        let first = acl_frame(0x0040, PacketBoundary::FirstNonFlushable, &data[..6]);
        let second = acl_frame(0x0040, PacketBoundary::ContinuingFragment, &data[6..]);

        proxy.handle_h4_from_controller(&first).unwrap();
        proxy.handle_h4_from_controller(&second).unwrap();

        let frames = to_host_frames.borrow();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_slice(), first.as_slice());
        assert_eq!(frames[1].as_slice(), second.as_slice());
        assert_eq!(proxy.stats().pdus_forwarded, 1);
    }

    #[test]
    fn test_events_and_commands_pass_through() {
        let to_host_frames: Captured = RefCell::new(Vec::new());
        let to_host = |packet: H4Packet| capture(&to_host_frames, &packet);
        let to_controller_frames: Captured = RefCell::new(Vec::new());
        let to_controller = |packet: H4Packet| capture(&to_controller_frames, &packet);
        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());

        // Unrelated event controller to host.
        proxy
            .handle_h4_from_controller(&[0x04, 0x0E, 0x03, 0x01, 0x03, 0x0C])
            .unwrap();
        // Command host to controller.
        proxy.handle_h4_from_host(&[0x01, 0x03, 0x0C, 0x00]).unwrap();

        assert_eq!(to_host_frames.borrow().len(), 1);
        assert_eq!(
            to_host_frames.borrow()[0].as_slice(),
            &[0x04, 0x0E, 0x03, 0x01, 0x03, 0x0C]
        );
        assert_eq!(to_controller_frames.borrow().len(), 1);
        assert_eq!(
            to_controller_frames.borrow()[0].as_slice(),
            &[0x01, 0x03, 0x0C, 0x00]
        );
    }

    #[test]
    fn test_unknown_h4_type_rejected() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());

        assert_eq!(
            proxy.handle_h4_from_controller(&[0x09, 0x00]).unwrap_err(),
            ProxyError::InvalidArgument
        );
        assert_eq!(
            proxy.handle_h4_from_host(&[]).unwrap_err(),
            ProxyError::DataLoss
        );
    }

    #[test]
    fn test_write_consumes_credits_and_nocp_replenishes() {
        let to_host = |_packet: H4Packet| {};
        let sent = Cell::new(0usize);
        let to_controller = |_packet: H4Packet| sent.set(sent.get() + 1);
        let proxy = ProxyHost::new(
            &to_host,
            &to_controller,
            ProxyConfig {
                le_credits: 1,
                bredr_credits: 0,
            },
        );
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, None)
            .unwrap();

        proxy.write(0x0040, 0x0041, payload_of(&[0x01])).unwrap();
        proxy.write(0x0040, 0x0041, payload_of(&[0x02])).unwrap();

        // One credit: only the first write went out.
        assert_eq!(sent.get(), 1);
        assert_eq!(proxy.manager().credits(AclTransport::Le), 0);

        // Number Of Completed Packets: handle 0x0040 completed one packet.
        let nocp = [0x04, 0x13, 0x05, 0x01, 0x40, 0x00, 0x01, 0x00];
        proxy.handle_h4_from_controller(&nocp).unwrap();

        assert_eq!(sent.get(), 2);
        assert_eq!(proxy.manager().credits(AclTransport::Le), 0);
    }

    #[test]
    fn test_completion_after_close_returns_credit() {
        let to_host = |_packet: H4Packet| {};
        let sent = Cell::new(0usize);
        let to_controller = |_packet: H4Packet| sent.set(sent.get() + 1);
        let proxy = ProxyHost::new(
            &to_host,
            &to_controller,
            ProxyConfig {
                le_credits: 1,
                bredr_credits: 0,
            },
        );
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, None)
            .unwrap();
        proxy.write(0x0040, 0x0041, payload_of(&[0x01])).unwrap();
        assert_eq!(sent.get(), 1);
        assert!(proxy.close_channel(0x0040, 0x0041));

        // The completion for the already-sent packet arrives after close;
        // its credit must still come back.
        let nocp = [0x04, 0x13, 0x05, 0x01, 0x40, 0x00, 0x01, 0x00];
        proxy.handle_h4_from_controller(&nocp).unwrap();
        assert_eq!(proxy.manager().credits(AclTransport::Le), 1);

        // A reopened channel on the transport can send again.
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, None)
            .unwrap();
        proxy.write(0x0040, 0x0041, payload_of(&[0x02])).unwrap();
        assert_eq!(sent.get(), 2);
    }

    #[test]
    fn test_host_traffic_completions_grant_nothing() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, None)
            .unwrap();

        // No proxy packet is outstanding, so completions on the handle
        // belong to host-originated traffic and must not inflate the pool.
        let nocp = [0x04, 0x13, 0x05, 0x01, 0x40, 0x00, 0x03, 0x00];
        proxy.handle_h4_from_controller(&nocp).unwrap();
        assert_eq!(proxy.manager().credits(AclTransport::Le), 4);
    }

    #[test]
    fn test_disconnection_reclaims_outstanding_credits() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let proxy = ProxyHost::new(
            &to_host,
            &to_controller,
            ProxyConfig {
                le_credits: 1,
                bredr_credits: 0,
            },
        );
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, None)
            .unwrap();
        proxy.write(0x0040, 0x0041, payload_of(&[0x01])).unwrap();
        assert_eq!(proxy.manager().credits(AclTransport::Le), 0);

        // Disconnection Complete: the controller will never report the
        // in-flight packet, so its credit is reclaimed directly.
        proxy
            .handle_h4_from_controller(&[0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13])
            .unwrap();
        assert_eq!(proxy.manager().credits(AclTransport::Le), 1);
    }

    #[test]
    fn test_large_pdu_recombined_across_fragments() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let received: RefCell<Vec<u8, 2048>> = RefCell::new(Vec::new());
        let rx_sink = |payload: &[u8]| {
            received.borrow_mut().extend_from_slice(payload).unwrap();
        };
        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, Some(&rx_sink))
            .unwrap();

        // A 2000-byte PDU, larger than any single ACL buffer.
        let payload_len: usize = 1996;
        let mut data: Vec<u8, 2048> = Vec::new();
        data.extend_from_slice(&BasicL2capHeader::new(payload_len as u16, 0x0041).to_bytes())
            .unwrap();
        for i in 0..payload_len {
            data.push((i % 251) as u8).unwrap();
        }

        let mut first: Vec<u8, 1100> = Vec::new();
        first.push(0x02).unwrap();
        first
            .extend_from_slice(
                &AclHeader::new(
                    0x0040,
                    PacketBoundary::FirstNonFlushable,
                    BroadcastFlag::PointToPoint,
                    1000,
                )
                .to_bytes(),
            )
            .unwrap();
        first.extend_from_slice(&data[..1000]).unwrap();
        proxy.handle_h4_from_controller(&first).unwrap();
        assert!(received.borrow().is_empty());

        let mut second: Vec<u8, 1100> = Vec::new();
        second.push(0x02).unwrap();
        second
            .extend_from_slice(
                &AclHeader::new(
                    0x0040,
                    PacketBoundary::ContinuingFragment,
                    BroadcastFlag::PointToPoint,
                    1000,
                )
                .to_bytes(),
            )
            .unwrap();
        second.extend_from_slice(&data[1000..]).unwrap();
        proxy.handle_h4_from_controller(&second).unwrap();

        assert_eq!(received.borrow().as_slice(), &data[4..]);
        assert_eq!(proxy.stats().pdus_recombined, 1);
        assert_eq!(proxy.stats().frames_dropped, 0);
    }

    #[test]
    fn test_rx_while_stopped_raises_event() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let events: RefCell<Vec<ChannelEvent, 4>> = RefCell::new(Vec::new());
        let sink = |event: ChannelEvent| events.borrow_mut().push(event).unwrap();

        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, Some(&sink), None)
            .unwrap();
        proxy.stop_channel(0x0040, 0x0041).unwrap();

        let data = pdu(0x0041, &[0x01]);
        proxy
            .handle_h4_from_controller(&acl_frame(0x0040, PacketBoundary::FirstNonFlushable, &data))
            .unwrap();

        assert_eq!(events.borrow().as_slice(), &[ChannelEvent::RxWhileStopped]);
        assert_eq!(proxy.stats().frames_dropped, 1);
    }

    #[test]
    fn test_disconnection_complete_tears_down_handle() {
        let to_host = |_packet: H4Packet| {};
        let to_controller = |_packet: H4Packet| {};
        let events: RefCell<Vec<ChannelEvent, 4>> = RefCell::new(Vec::new());
        let sink = |event: ChannelEvent| events.borrow_mut().push(event).unwrap();

        let proxy = ProxyHost::new(&to_host, &to_controller, ProxyConfig::default());
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, Some(&sink), None)
            .unwrap();

        // Leave a recombination in flight on the handle.
        let data = pdu(0x0041, &[0x01, 0x02, 0x03, 0x04]);
        proxy
            .handle_h4_from_controller(&acl_frame(
                0x0040,
                PacketBoundary::FirstNonFlushable,
                &data[..6],
            ))
            .unwrap();

        // Disconnection Complete, status success, handle 0x0040.
        proxy
            .handle_h4_from_controller(&[0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13])
            .unwrap();

        assert_eq!(
            events.borrow().as_slice(),
            &[ChannelEvent::ChannelClosedByOther]
        );
        assert_eq!(proxy.stats().frames_dropped, 1);
        // The channel is gone; writes fail.
        assert_eq!(
            proxy
                .write(0x0040, 0x0041, payload_of(&[0x01]))
                .unwrap_err()
                .reason,
            ProxyError::InvalidArgument
        );
    }

    #[test]
    fn test_release_tx_packet_unblocks_pool() {
        let to_host = |_packet: H4Packet| {};
        let captured: RefCell<Vec<H4Packet, 16>> = RefCell::new(Vec::new());
        let to_controller = |packet: H4Packet| {
            captured.borrow_mut().push(packet).ok().unwrap();
        };
        let proxy = ProxyHost::new(
            &to_host,
            &to_controller,
            ProxyConfig {
                le_credits: 32,
                bredr_credits: 0,
            },
        );
        proxy
            .open_channel(0x0040, 0x0041, AclTransport::Le, None, None)
            .unwrap();

        // Drain the whole transmit pool; every packet is held by the
        // callback, so no permits come back.
        for i in 0..crate::constants::TX_POOL_SIZE {
            proxy
                .write(0x0040, 0x0041, payload_of(&[i as u8]))
                .unwrap();
        }
        assert_eq!(captured.borrow().len(), crate::constants::TX_POOL_SIZE);

        // With the pool empty the next write queues but cannot go out.
        proxy.write(0x0040, 0x0041, payload_of(&[0xFF])).unwrap();
        assert_eq!(captured.borrow().len(), crate::constants::TX_POOL_SIZE);

        // Returning one permit re-drains the queued packet.
        let packet = captured.borrow_mut().swap_remove(0);
        proxy.release_tx_packet(packet);
        assert_eq!(captured.borrow().len(), crate::constants::TX_POOL_SIZE);
        let last = captured.borrow_mut().pop().unwrap();
        assert_eq!(last.as_bytes().last(), Some(&0xFF));
    }
}
