//! Flow-control windows (RFC 7540 §6.9).
//!
//! One pair per stream plus one pair for the connection. Windows are signed:
//! a SETTINGS-driven shrink can push an in-flight window negative, and the
//! sender must then wait for updates before transmitting again.

use super::frame::{Reason, MAX_WINDOW_SIZE};

#[derive(Clone, Copy, Debug)]
pub(crate) struct FlowControl {
    window: i64,
}

impl FlowControl {
    pub(crate) fn new(initial: u32) -> FlowControl {
        FlowControl {
            window: initial as i64,
        }
    }

    /// Bytes that may currently be sent (zero when the window is negative).
    pub(crate) fn available(&self) -> u32 {
        self.window.clamp(0, MAX_WINDOW_SIZE as i64) as u32
    }

    /// Consumes window for outgoing DATA.
    pub(crate) fn take(&mut self, n: u32) {
        debug_assert!(n <= self.available());
        self.window -= n as i64;
    }

    /// Accounts an incoming DATA frame against the receive window.
    pub(crate) fn recv_data(&mut self, n: u32) -> Result<(), Reason> {
        if (n as i64) > self.window {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window -= n as i64;
        Ok(())
    }

    /// Applies a WINDOW_UPDATE; overflowing 2^31-1 is a flow-control error.
    pub(crate) fn grant(&mut self, n: u32) -> Result<(), Reason> {
        let grown = self.window + n as i64;
        if grown > MAX_WINDOW_SIZE as i64 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window = grown;
        Ok(())
    }

    /// Retroactive INITIAL_WINDOW_SIZE change; may go negative.
    pub(crate) fn adjust(&mut self, delta: i64) {
        self.window += delta;
    }
}
