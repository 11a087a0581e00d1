//! L2CAP PDU Recombination
//!
//! An ACL link delivers one logical L2CAP PDU as one or more fragments. The
//! [`Recombiner`] accumulates the fragments addressed to a single connection
//! handle into one contiguous buffer, enforcing at most one active
//! recombination per connection. Corruption never produces a partial PDU:
//! any error path abandons the whole in-progress frame and the caller
//! reports it as dropped.

use crate::ProxyError;
use crate::constants::MAX_RECOMBINED_PDU_SIZE;
use heapless::Vec;

/// Destination buffer for a recombined PDU
pub type RecombinedPdu = Vec<u8, MAX_RECOMBINED_PDU_SIZE>;

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Recombining {
        cid: u16,
        expected: usize,
        buffer: RecombinedPdu,
    },
}

/// Reassembles one logical L2CAP PDU from successive ACL fragments
///
/// State machine: `Idle -> Recombining -> (complete) -> Idle`, or
/// `Recombining -> (dropped) -> Idle` via [`Recombiner::end`].
#[derive(Debug, Default)]
pub struct Recombiner {
    state: State,
}

impl Recombiner {
    /// Create an idle recombiner
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin recombining a PDU of `expected` total bytes destined for `cid`
    ///
    /// # Errors
    /// `ProxyError::FailedPrecondition` if a recombination is already active;
    /// the caller must explicitly [`end`](Self::end) it first.
    /// `ProxyError::ResourceExhausted` if `expected` exceeds the destination
    /// buffer capacity.
    pub fn start(&mut self, cid: u16, expected: usize) -> Result<(), ProxyError> {
        if self.is_active() {
            return Err(ProxyError::FailedPrecondition);
        }
        if expected > MAX_RECOMBINED_PDU_SIZE {
            return Err(ProxyError::ResourceExhausted);
        }
        self.state = State::Recombining {
            cid,
            expected,
            buffer: Vec::new(),
        };
        Ok(())
    }

    /// Append one fragment's payload at the current write offset
    ///
    /// # Errors
    /// `ProxyError::FailedPrecondition` if no recombination is active.
    /// `ProxyError::DataLoss` if the fragment would push the accumulated
    /// size past the declared total; the write is bounds-checked and the
    /// buffer is left untouched.
    pub fn add_fragment(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        let State::Recombining {
            expected, buffer, ..
        } = &mut self.state
        else {
            return Err(ProxyError::FailedPrecondition);
        };

        if buffer.len() + data.len() > *expected {
            return Err(ProxyError::DataLoss);
        }
        // Bounded by the capacity check in start().
        buffer
            .extend_from_slice(data)
            .map_err(|()| ProxyError::DataLoss)
    }

    /// Whether a recombination is in progress
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Recombining { .. })
    }

    /// Whether the accumulated bytes equal the declared total
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match &self.state {
            State::Recombining {
                expected, buffer, ..
            } => buffer.len() == *expected,
            State::Idle => false,
        }
    }

    /// CID the active recombination is destined for, if any
    #[must_use]
    pub fn cid(&self) -> Option<u16> {
        match &self.state {
            State::Recombining { cid, .. } => Some(*cid),
            State::Idle => None,
        }
    }

    /// Take ownership of the completed PDU and reset to idle
    ///
    /// # Panics
    /// Panics if no recombination is active or the PDU is incomplete; both
    /// indicate a caller logic bug, not a runtime condition.
    #[must_use]
    pub fn take_and_end(&mut self) -> RecombinedPdu {
        assert!(
            self.is_complete(),
            "take_and_end on inactive or incomplete recombination"
        );
        let State::Recombining { buffer, .. } = core::mem::take(&mut self.state) else {
            unreachable!()
        };
        buffer
    }

    /// Unconditionally abandon any in-progress recombination
    ///
    /// The caller is responsible for reporting the abandoned frame as
    /// dropped.
    pub fn end(&mut self) {
        self.state = State::Idle;
    }
}
