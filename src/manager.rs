//! L2CAP Channel Manager - registry, credits, and queue draining
//!
//! The manager owns every proxy channel, the shared transmit buffer pool,
//! and the per-transport ACL credit pools. One blocking mutex per manager
//! instance guards all of it; there is no shared static state.
//!
//! ## Locking discipline
//!
//! Every operation takes the lock, mutates, and releases it before any
//! client-supplied callback runs. Packets to send and channel events to
//! raise are collected under the lock and emitted after it drops, which
//! rules out reentrancy deadlocks from callbacks that call back into the
//! proxy.
//!
//! ## Drain policy
//!
//! [`L2capChannelManager::drain`] serves channels round-robin starting just
//! after the last channel served, one packet per ready channel per round,
//! repeating until credits, buffers, or data run out. The order is
//! deterministic and no channel with both credit and data can starve.

use crate::channel::{ChannelKey, ClientChannel, RxRoute, WriteError};
use crate::constants::MAX_PROXY_CHANNELS;
use crate::pool::{H4Packet, TxPacketPool};
use crate::{AclTransport, ChannelEvent, Payload, ProxyConfig, ProxyError};
use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::{FnvIndexMap, Vec};

/// Proxy packets sent on one connection handle and not yet completed by
/// the controller
#[derive(Debug, Clone, Copy)]
struct InFlight {
    transport: AclTransport,
    count: u16,
}

struct ManagerInner<'d> {
    channels: FnvIndexMap<ChannelKey, ClientChannel<'d>, MAX_PROXY_CHANNELS>,
    // Keyed by connection handle; at most one entry per handle with
    // proxy traffic outstanding, so the channel registry bound covers it.
    in_flight: FnvIndexMap<u16, InFlight, MAX_PROXY_CHANNELS>,
    pool: TxPacketPool,
    le_credits: u16,
    bredr_credits: u16,
    drain_cursor: usize,
}

/// Registry of active channels plus the shared transmit and credit pools
pub struct L2capChannelManager<'d> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<ManagerInner<'d>>>,
}

impl<'d> L2capChannelManager<'d> {
    /// Create a manager with the configured per-transport credit counts
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(ManagerInner {
                channels: FnvIndexMap::new(),
                in_flight: FnvIndexMap::new(),
                pool: TxPacketPool::new(crate::constants::TX_POOL_SIZE),
                le_credits: config.le_credits,
                bredr_credits: config.bredr_credits,
                drain_cursor: 0,
            })),
        }
    }

    /// Add `channel` to the drainable set
    ///
    /// # Errors
    /// `ProxyError::InvalidArgument` if a channel with the same (handle,
    /// CID) pair is already registered, `ProxyError::ResourceExhausted` if
    /// the registry is full.
    pub fn register_channel(&self, channel: ClientChannel<'d>) -> Result<(), ProxyError> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let key = channel.key();
            if inner.channels.contains_key(&key) {
                return Err(ProxyError::InvalidArgument);
            }
            inner
                .channels
                .insert(key, channel)
                .map(|_| ())
                .map_err(|_| ProxyError::ResourceExhausted)
        })
    }

    /// Remove a channel from the drainable set without raising any event
    ///
    /// Returns whether the channel was actually registered.
    pub fn release_channel(&self, key: ChannelKey) -> bool {
        self.inner
            .lock(|cell| cell.borrow_mut().channels.remove(&key).is_some())
    }

    /// Queue `payload` on the channel identified by `key`
    ///
    /// # Errors
    /// `ProxyError::InvalidArgument` (payload returned) if no such channel
    /// is registered; otherwise the channel's own write contract applies.
    pub fn write(&self, key: ChannelKey, payload: Payload) -> Result<(), WriteError> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            match inner.channels.get_mut(&key) {
                Some(channel) => channel.write(payload),
                None => Err(WriteError::new(ProxyError::InvalidArgument, payload)),
            }
        })
    }

    /// Probe the channel's queue for space, arming its backpressure latch
    /// when full
    ///
    /// # Errors
    /// `ProxyError::InvalidArgument` if no such channel is registered;
    /// otherwise the channel's own contract applies.
    pub fn is_write_available(&self, key: ChannelKey) -> Result<(), ProxyError> {
        self.inner.lock(|cell| {
            cell.borrow_mut()
                .channels
                .get_mut(&key)
                .ok_or(ProxyError::InvalidArgument)?
                .is_write_available()
        })
    }

    /// Stop the channel: clear its queue and refuse further writes
    ///
    /// # Errors
    /// `ProxyError::InvalidArgument` if no such channel is registered.
    pub fn stop(&self, key: ChannelKey) -> Result<(), ProxyError> {
        self.inner.lock(|cell| {
            cell.borrow_mut()
                .channels
                .get_mut(&key)
                .ok_or(ProxyError::InvalidArgument)?
                .stop()
        })
    }

    /// Close the channel, deregister it, and raise `event` to its sink
    ///
    /// Idempotent: closing an unknown or already-closed channel does
    /// nothing. Returns whether a channel was actually closed.
    pub fn close(&self, key: ChannelKey, event: ChannelEvent) -> bool {
        let fired = self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let Some(mut channel) = inner.channels.remove(&key) else {
                return None;
            };
            channel
                .close(event)
                .map(|event| (channel.event_sink(), event))
        });
        match fired {
            Some((Some(sink), event)) => {
                sink(event);
                true
            }
            Some((None, _)) => true,
            None => false,
        }
    }

    /// Close every channel riding on `handle`, raising `ChannelClosedByOther`
    pub fn close_all_on_handle(&self, handle: u16) {
        let mut sinks: Vec<&'d dyn Fn(ChannelEvent), MAX_PROXY_CHANNELS> = Vec::new();
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let keys: Vec<ChannelKey, MAX_PROXY_CHANNELS> = inner
                .channels
                .keys()
                .copied()
                .filter(|key| key.handle == handle)
                .collect();
            for key in keys {
                if let Some(mut channel) = inner.channels.remove(&key)
                    && channel.close(ChannelEvent::ChannelClosedByOther).is_some()
                    && let Some(sink) = channel.event_sink()
                {
                    let _ = sinks.push(sink);
                }
            }
        });
        for sink in sinks {
            sink(ChannelEvent::ChannelClosedByOther);
        }
    }

    /// Where an inbound PDU for (handle, CID) should be routed, if the pair
    /// is claimed at all
    pub(crate) fn rx_route(&self, key: ChannelKey) -> Option<RxRoute<'d>> {
        self.inner.lock(|cell| {
            cell.borrow()
                .channels
                .get(&key)
                .map(ClientChannel::rx_route)
        })
    }

    /// Record controller completions for `handle` and convert them back
    /// into credits
    ///
    /// Only completions matching proxy-sent packets grant credit; the count
    /// is capped at what is actually outstanding so completions of
    /// host-originated traffic on the same handle never inflate the pool.
    /// Tracking survives channel close, so late completions still return
    /// their credits. Returns whether any credit was granted.
    pub(crate) fn complete_packets(&self, handle: u16, count: u16) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let ManagerInner {
                in_flight,
                le_credits,
                bredr_credits,
                ..
            } = &mut *inner;
            let Some(entry) = in_flight.get_mut(&handle) else {
                return false;
            };
            let granted = count.min(entry.count);
            if granted == 0 {
                return false;
            }
            entry.count -= granted;
            let transport = entry.transport;
            if entry.count == 0 {
                in_flight.remove(&handle);
            }
            match transport {
                AclTransport::Le => *le_credits = le_credits.saturating_add(granted),
                AclTransport::BrEdr => {
                    *bredr_credits = bredr_credits.saturating_add(granted);
                }
            }
            true
        })
    }

    /// Return every outstanding credit on `handle` to its transport pool
    ///
    /// For a dead connection the controller never reports completions, so
    /// the credits its in-flight packets consumed are reclaimed directly.
    pub(crate) fn reclaim_in_flight(&self, handle: u16) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let Some(entry) = inner.in_flight.remove(&handle) else {
                return;
            };
            match entry.transport {
                AclTransport::Le => {
                    inner.le_credits = inner.le_credits.saturating_add(entry.count);
                }
                AclTransport::BrEdr => {
                    inner.bredr_credits = inner.bredr_credits.saturating_add(entry.count);
                }
            }
        });
    }

    /// Add `count` credits to `transport`'s pool
    ///
    /// The caller re-drains afterwards; granting itself never sends.
    pub fn grant_credits(&self, transport: AclTransport, count: u16) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            match transport {
                AclTransport::Le => inner.le_credits = inner.le_credits.saturating_add(count),
                AclTransport::BrEdr => {
                    inner.bredr_credits = inner.bredr_credits.saturating_add(count);
                }
            }
        });
    }

    /// Credits currently available on `transport`
    #[must_use]
    pub fn credits(&self, transport: AclTransport) -> u16 {
        self.inner.lock(|cell| {
            let inner = cell.borrow();
            match transport {
                AclTransport::Le => inner.le_credits,
                AclTransport::BrEdr => inner.bredr_credits,
            }
        })
    }

    /// Return a spent transmit packet's permit to the pool
    ///
    /// Passthrough packets hold no permit and are simply dropped. The
    /// caller re-drains afterwards.
    pub fn release_tx_packet(&self, packet: H4Packet) {
        if packet.is_pooled() {
            self.inner.lock(|cell| cell.borrow_mut().pool.release());
        }
    }

    /// Drain ready channel queues against available credits and buffers
    ///
    /// Invoked whenever credits or buffer capacity become available,
    /// including immediately after any channel enqueues a packet. Completed
    /// frames go to `send` and any latched `WriteAvailable` events fire,
    /// both strictly outside the lock.
    pub fn drain(&self, send: &dyn Fn(H4Packet)) {
        loop {
            let mut batch: Vec<H4Packet, MAX_PROXY_CHANNELS> = Vec::new();
            let mut events: Vec<(&'d dyn Fn(ChannelEvent), ChannelEvent), MAX_PROXY_CHANNELS> =
                Vec::new();

            self.inner.lock(|cell| {
                let mut inner = cell.borrow_mut();
                let ManagerInner {
                    channels,
                    in_flight,
                    pool,
                    le_credits,
                    bredr_credits,
                    drain_cursor,
                } = &mut *inner;

                let count = channels.len();
                if count == 0 {
                    return;
                }
                let start = *drain_cursor % count;

                for offset in 0..count {
                    let index = (start + offset) % count;
                    let Some((_, channel)) = channels.iter_mut().nth(index) else {
                        continue;
                    };
                    if !channel.has_pending() {
                        continue;
                    }
                    let credits = match channel.transport() {
                        AclTransport::Le => &mut *le_credits,
                        AclTransport::BrEdr => &mut *bredr_credits,
                    };
                    if *credits == 0 {
                        continue;
                    }
                    match channel.generate_next_tx_packet(pool) {
                        Ok((packet, event)) => {
                            *credits -= 1;
                            let handle = channel.key().handle;
                            let transport = channel.transport();
                            match in_flight.get_mut(&handle) {
                                Some(entry) => entry.count = entry.count.saturating_add(1),
                                None => {
                                    let _ = in_flight.insert(
                                        handle,
                                        InFlight {
                                            transport,
                                            count: 1,
                                        },
                                    );
                                }
                            }
                            *drain_cursor = index + 1;
                            if let (Some(sink), Some(event)) = (channel.event_sink(), event) {
                                let _ = events.push((sink, event));
                            }
                            let _ = batch.push(packet);
                        }
                        // Buffer pool exhausted; end the round and wait for
                        // the next release.
                        Err(_) => break,
                    }
                }
            });

            if batch.is_empty() && events.is_empty() {
                return;
            }
            for packet in batch {
                send(packet);
            }
            for (sink, event) in events {
                sink(event);
            }
        }
    }
}
