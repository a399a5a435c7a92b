use crate::tftp;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MAX_RETRIES: u8 = 5;

/// Retransmission state for one session: the last packet sent, when to give up waiting for a
/// reply to it, and how many times it has been resent.
#[derive(Debug)]
pub struct Retransmitter {
    timeout: Duration,
    max_retries: u8,
    retries: u8,
    last_sent: Option<tftp::Packet>,
    deadline: Instant,
}

impl Retransmitter {
    pub fn new(timeout: Duration, max_retries: u8) -> Retransmitter {
        Retransmitter {
            timeout,
            max_retries,
            retries: 0,
            last_sent: None,
            deadline: Instant::now() + timeout,
        }
    }

    /// Records a freshly sent packet. The retry count starts over and a full timeout period is
    /// allowed for the reply.
    pub fn arm(&mut self, packet: tftp::Packet) {
        self.last_sent = Some(packet);
        self.retries = 0;
        self.deadline = Instant::now() + self.timeout;
    }

    /// Time left before the current wait expires.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Called when the wait expired. Returns the packet to resend, or None once the retry budget
    /// is spent.
    pub fn expire(&mut self) -> Option<&tftp::Packet> {
        if self.retries >= self.max_retries {
            return None;
        }
        self.retries += 1;
        self.deadline = Instant::now() + self.timeout;
        self.last_sent.as_ref()
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn last_sent(&self) -> Option<&tftp::Packet> {
        self.last_sent.as_ref()
    }
}
