// Test doubles shared by the unit tests of several modules.

use crate::tftp::{Packet, SocketError, TftpResult, Transport};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;

/// An in-memory sink whose contents stay readable after it has been boxed and handed away.
#[derive(Clone, Default)]
pub struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for SharedSink {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// What the scripted peer does the next time the session waits for a packet.
pub enum Incoming {
    Packet(Packet, SocketAddr),
    /// The packet arrives once the given time has passed.
    Delayed(Duration, Packet, SocketAddr),
    Garbage,
    Silence,
}

/// A transport that replays a fixed script of incoming events and records everything sent.
/// Once the script runs out the peer goes silent.
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<VecDeque<Incoming>>>,
    sent: Arc<Mutex<Vec<(Packet, SocketAddr)>>>,
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl MockTransport {
    pub fn new(script: Vec<Incoming>) -> MockTransport {
        MockTransport {
            script: Arc::new(Mutex::new(script.into())),
            sent: Arc::default(),
            waits: Arc::default(),
        }
    }

    pub fn sent(&self) -> Vec<(Packet, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    /// How long the session was prepared to wait on each receive, in order.
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }

    /// Packets sent to `dst`, in order.
    pub fn sent_to(&self, dst: SocketAddr) -> Vec<Packet> {
        self.sent()
            .into_iter()
            .filter(|(_, addr)| *addr == dst)
            .map(|(packet, _)| packet)
            .collect()
    }
}

impl Transport for MockTransport {
    async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sent.lock().unwrap().push((packet.clone(), dst));
        Ok(())
    }

    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        self.waits.lock().unwrap().push(ttl);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Incoming::Packet(packet, src)) => Ok((packet, src)),
            Some(Incoming::Delayed(delay, packet, src)) => {
                tokio::time::sleep(delay).await;
                Ok((packet, src))
            }
            Some(Incoming::Garbage) => Err(SocketError::PacketParse("garbage".to_string())),
            Some(Incoming::Silence) | None => Err(SocketError::Timeout),
        }
    }
}
