//! HTTP/2 flow control
//!
//! Window accounting as defined in RFC 7540 Section 5.2. The same
//! send/receive pair is kept for the connection (stream 0) and for every
//! stream; only DATA frames count against windows.

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// One direction of flow control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlWindow {
    initial_size: u32,
    /// May go negative after a SETTINGS_INITIAL_WINDOW_SIZE reduction
    available: i64,
}

impl FlowControlWindow {
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            available: initial_size as i64,
        }
    }

    /// Current window size
    pub fn size(&self) -> i64 {
        self.available
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    pub fn can_send(&self, amount: usize) -> bool {
        self.available >= amount as i64
    }

    /// Account for `amount` flow-controlled bytes; fails if the window is too small
    pub fn consume(&mut self, amount: usize) -> Result<()> {
        if !self.can_send(amount) {
            return Err(Error::FlowControl(format!(
                "{} bytes exceed window of {}",
                amount, self.available
            )));
        }
        self.available -= amount as i64;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE increment, returning the new size
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol("window increment must be non-zero".to_string()));
        }

        let new_size = self.available + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.available = new_size;
        Ok(self.available)
    }

    /// Shift the window by the change in SETTINGS_INITIAL_WINDOW_SIZE (RFC 7540 Section 6.9.2)
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_size = self.available + diff;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.initial_size = new_initial_size;
        self.available = new_size;
        Ok(())
    }

    /// Increment that restores the window once it has dropped below half its initial size
    pub fn replenish_increment(&self) -> Option<u32> {
        let initial = self.initial_size as i64;
        if self.available < initial / 2 {
            Some((initial - self.available) as u32)
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Send and receive windows for one flow-control scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControl {
    send: FlowControlWindow,
    recv: FlowControlWindow,
}

/// Connection-level windows (stream 0)
pub type ConnectionFlowControl = FlowControl;

/// Per-stream windows
pub type StreamFlowControl = FlowControl;

impl FlowControl {
    pub fn new(send_size: u32, recv_size: u32) -> Self {
        FlowControl {
            send: FlowControlWindow::with_initial_size(send_size),
            recv: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv
    }

    /// Outbound DATA
    pub fn consume_send(&mut self, amount: usize) -> Result<()> {
        self.send.consume(amount)
    }

    /// Inbound DATA; exceeding the advertised window is a flow control error
    pub fn consume_recv(&mut self, amount: usize) -> Result<()> {
        self.recv.consume(amount)
    }

    /// Inbound WINDOW_UPDATE
    pub fn increase_send(&mut self, increment: u32) -> Result<i64> {
        self.send.increase(increment)
    }

    /// Peer changed SETTINGS_INITIAL_WINDOW_SIZE
    pub fn update_send_initial(&mut self, size: u32) -> Result<()> {
        self.send.update_initial_size(size)
    }

    /// If the receive window fell below half, reopen it and return the
    /// increment to announce in a WINDOW_UPDATE
    pub fn take_window_update(&mut self) -> Option<u32> {
        let increment = self.recv.replenish_increment()?;
        self.recv.increase(increment).ok()?;
        Some(increment)
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_consume() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(60).unwrap();
        assert_eq!(window.size(), 40);
        assert!(matches!(window.consume(41), Err(Error::FlowControl(_))));
        assert_eq!(window.size(), 40);
    }

    #[test]
    fn test_window_increase_and_overflow() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(50).unwrap();
        assert_eq!(window.increase(100).unwrap(), 150);

        let mut full = FlowControlWindow::with_initial_size(MAX_WINDOW_SIZE);
        assert!(matches!(full.increase(1), Err(Error::FlowControl(_))));
        assert!(matches!(full.increase(0), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_window_update_initial_size() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(50).unwrap();

        window.update_initial_size(200).unwrap();
        assert_eq!(window.initial_size(), 200);
        assert_eq!(window.size(), 150);

        window.update_initial_size(10).unwrap();
        assert_eq!(window.size(), -40);
        assert!(!window.can_send(1));
    }

    #[test]
    fn test_take_window_update() {
        let mut flow = FlowControl::new(100, 100);
        assert_eq!(flow.take_window_update(), None);

        flow.consume_recv(40).unwrap();
        assert_eq!(flow.take_window_update(), None);

        flow.consume_recv(20).unwrap();
        assert_eq!(flow.take_window_update(), Some(60));
        assert_eq!(flow.recv_window().size(), 100);
        assert_eq!(flow.take_window_update(), None);
    }

    #[test]
    fn test_send_side() {
        let mut flow = FlowControl::default();
        flow.consume_send(1000).unwrap();
        assert_eq!(
            flow.send_window().size(),
            (DEFAULT_INITIAL_WINDOW_SIZE - 1000) as i64
        );
        flow.increase_send(1000).unwrap();
        assert!(flow.send_window().can_send(DEFAULT_INITIAL_WINDOW_SIZE as usize));
    }
}
