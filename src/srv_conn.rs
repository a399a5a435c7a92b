// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received. The server handles
// this by creating a ServerRequestHandler, which works in roughly the following stages:
//
// 1. Check whether the request can be serviced: the mode is supported, the file can be opened
//    and the requested options are acceptable. If not, an error packet is sent and no session
//    is started.
// 2. If options were honored, send an OACK and wait for the peer to accept it (Negotiating).
// 3. Enter a phase of work and wait cycles (Transferring). The work is done by the packet
//    processor, which reads or writes the file and decides what to send next; the handler sends
//    it and waits for the peer's reply, resending the last packet whenever the wait times out.
// 4. The session ends Completed once the last block has been acknowledged, or Aborted on an
//    error packet from either side or when the peer stops answering.
//
// All packets go out from a socket dedicated to the session, so the peer's address and port
// identify the transfer. Packets from anyone else are answered with an Unknown TID error and
// otherwise ignored.

use crate::options::{self, Limits, OptionRejected};
use crate::processor::{PacketProcessor, ResultAction};
use crate::retransmit::Retransmitter;
use crate::storage::Storage;
use crate::tftp::{self, RequestKind, SocketError, TftpSocket, TransferRequest, Transport};
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

const BIND_ATTEMPTS: usize = 32;

/// Where a session is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// An OACK was sent and the peer has not accepted it yet.
    Negotiating,
    Transferring,
    Completed,
    Aborted,
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler<T: Transport> {
    /// The socket used to send and receive packets for this transfer only.
    sock: T,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The packet processor.
    processor: PacketProcessor,

    /// The last packet sent and when to resend it.
    retransmit: Retransmitter,

    state: SessionState,
}

/// Binds the socket a new session talks from. Without a port range the OS picks a free port;
/// with one, random ports from the range are tried until one binds.
pub fn bind_session_socket(
    ip: IpAddr,
    port_range: Option<&RangeInclusive<u16>>,
) -> tftp::TftpResult<TftpSocket> {
    let Some(range) = port_range else {
        return TftpSocket::bind((ip, 0).into());
    };

    let mut rng = rand::thread_rng();
    let mut sock = TftpSocket::bind((ip, rng.gen_range(range.clone())).into());
    for _ in 1..BIND_ATTEMPTS {
        if sock.is_ok() {
            break;
        }
        log::warn!("Couldn't bind socket: {:#?}", sock.as_ref().err());
        sock = TftpSocket::bind((ip, rng.gen_range(range.clone())).into());
    }
    sock
}

async fn send_error_packet<T: Transport>(
    sock: &mut T,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

impl<T: Transport> ServerRequestHandler<T> {
    /// Prepares a session for `request`, received from `src`, talking over `sock`. If the
    /// request can't be serviced the peer is sent the matching error packet and the error is
    /// returned.
    pub async fn accept(
        mut sock: T,
        request: &TransferRequest,
        src: SocketAddr,
        storage: &Storage,
        limits: &Limits,
        max_retries: u8,
    ) -> Result<ServerRequestHandler<T>, SessionError> {
        match prepare_processor(request, storage, limits).await {
            Ok((processor, timeout)) => {
                Ok(ServerRequestHandler::new(sock, src, processor, timeout, max_retries))
            }
            Err(e) => {
                if let Some(packet) = e.error_packet() {
                    let _ = sock.send(&packet, src).await;
                }
                Err(e)
            }
        }
    }

    pub fn new(
        sock: T,
        dst: SocketAddr,
        processor: PacketProcessor,
        timeout: Duration,
        max_retries: u8,
    ) -> ServerRequestHandler<T> {
        ServerRequestHandler {
            sock,
            dst,
            processor,
            retransmit: Retransmitter::new(timeout, max_retries),
            state: SessionState::Transferring,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.dst
    }

    /// Does the work of sending and receiving data over the connection until the connection
    /// closes.
    pub async fn handle(&mut self) -> Result<(), SessionError> {
        let mut action = self.processor.first_packet().await;

        loop {
            match action {
                ResultAction::SendPacketAndAwait(p) => {
                    self.state = if self.processor.is_negotiating() {
                        SessionState::Negotiating
                    } else {
                        SessionState::Transferring
                    };
                    if let Err(e) = self.sock.send(&p, self.dst).await {
                        return self.abort(e.into()).await;
                    }
                    self.retransmit.arm(p);
                }
                ResultAction::RetryRecv => {}
                ResultAction::FinishWithPacket(p) => {
                    if let Err(e) = self.sock.send(&p, self.dst).await {
                        return self.abort(e.into()).await;
                    }
                    self.retransmit.arm(p);
                    self.dally().await;
                    self.complete();
                    return Ok(());
                }
                ResultAction::CloseConnection => {
                    self.complete();
                    return Ok(());
                }
                ResultAction::Abort(e) => return self.abort(e).await,
            }

            action = match self.await_reply().await {
                Ok(action) => action,
                Err(e) => return self.abort(e).await,
            };
        }
    }

    /// Waits for the peer's answer to the last packet sent and hands it to the processor. Takes
    /// care of resending on timeout, and of anything arriving that is not from the peer.
    async fn await_reply(&mut self) -> Result<ResultAction, SessionError> {
        loop {
            match self.sock.recv_with_timeout(self.retransmit.remaining()).await {
                Ok((packet, src)) => {
                    // First, check whether the data came from the src we were expecting.
                    if src != self.dst {
                        log::warn!("Got packet from unknown peer {src} on the session with {}", self.dst);
                        send_error_packet(
                            &mut self.sock,
                            src,
                            tftp::ErrorCode::UnknownTid,
                            "This connection belongs to a different client".to_string(),
                        )
                        .await;
                        // Continue waiting for a good packet from the expected peer.
                        continue;
                    }

                    log::debug!("Got {:?} packet from {src}", packet.op_code());
                    return Ok(self.processor.process_packet(&packet).await);
                }
                // If we timed out, rebroadcast the last sent packet
                Err(SocketError::Timeout) => {
                    let Some(packet) = self.retransmit.expire().cloned() else {
                        return Err(SessionError::Timeout);
                    };
                    log::info!(
                        "Timed out waiting for {}, resending {:?} (retry {})",
                        self.dst,
                        packet.op_code(),
                        self.retransmit.retries()
                    );
                    self.sock.send(&packet, self.dst).await?;
                }
                // Unparseable datagrams get no reply.
                Err(SocketError::PacketParse(msg)) => {
                    log::debug!("Dropping malformed packet on the session with {}: {msg}", self.dst);
                }
                Err(SocketError::IO(e)) => return Err(SessionError::Transport(e)),
            }
        }
    }

    /// Whoever sends the final ack lingers for a while in case it gets lost, which shows as the
    /// peer sending its final block again.
    async fn dally(&mut self) {
        let final_block = self.processor.current_block();
        loop {
            match self.sock.recv_with_timeout(self.retransmit.remaining()).await {
                Ok((packet, src)) if src != self.dst => {
                    log::debug!("Ignoring {:?} packet from unknown peer {src}", packet.op_code());
                    send_error_packet(
                        &mut self.sock,
                        src,
                        tftp::ErrorCode::UnknownTid,
                        "This connection belongs to a different client".to_string(),
                    )
                    .await;
                }
                Ok((tftp::Packet::Data { block, .. }, _)) if block == final_block => {
                    if let Some(ack) = self.retransmit.last_sent().cloned() {
                        log::debug!("Final ack to {} was lost, resending", self.dst);
                        let _ = self.sock.send(&ack, self.dst).await;
                    }
                }
                Ok(_) | Err(SocketError::PacketParse(_)) => {}
                Err(SocketError::Timeout) | Err(SocketError::IO(_)) => return,
            }
        }
    }

    fn complete(&mut self) {
        log::info!("Transfer with {} completed", self.dst);
        self.state = SessionState::Completed;
    }

    async fn abort(&mut self, e: SessionError) -> Result<(), SessionError> {
        if let Some(packet) = e.error_packet() {
            let _ = self.sock.send(&packet, self.dst).await;
        }
        log::warn!("Closing connection with {}: {e}", self.dst);
        self.state = SessionState::Aborted;
        Err(e)
    }
}

/// Opens the file behind a request and negotiates its options. Returns the processor that will
/// run the transfer and the retransmission timeout to use.
async fn prepare_processor(
    request: &TransferRequest,
    storage: &Storage,
    limits: &Limits,
) -> Result<(PacketProcessor, Duration), SessionError> {
    match &request.mode {
        tftp::FileMode::Octet | tftp::FileMode::NetAscii => {}
        tftp::FileMode::Mail => {
            return Err(SessionError::IllegalOperation(
                "Support for mail mode is unimplemented".to_string(),
            ))
        }
        tftp::FileMode::Unknown(raw) => {
            return Err(SessionError::IllegalOperation(format!("Unknown transfer mode '{raw}'")))
        }
    }
    if request.path.is_empty() {
        return Err(SessionError::AccessDenied("Request does not name a file".to_string()));
    }

    match request.kind {
        RequestKind::Read => {
            let (source, size) = storage.open_source(&request.path).await?;
            let negotiation = options::negotiate(request.kind, &request.options, limits, size)?;
            let timeout = negotiation.options.timeout;
            let oack = negotiation.needs_oack().then_some(negotiation.acknowledged);
            let processor =
                PacketProcessor::new_for_reading(source, negotiation.options.block_size, oack);
            Ok((processor, timeout))
        }
        RequestKind::Write => {
            // Negotiate first so a refused request leaves no file behind.
            let negotiation = options::negotiate(request.kind, &request.options, limits, None)?;
            let sink = storage.create_sink(&request.path).await?;
            let timeout = negotiation.options.timeout;
            let oack = negotiation.needs_oack().then_some(negotiation.acknowledged);
            let processor =
                PacketProcessor::new_for_writing(sink, negotiation.options.block_size, oack);
            Ok((processor, timeout))
        }
    }
}

/// Why a session could not be started or did not complete.
#[derive(Debug)]
pub enum SessionError {
    /// A requested option was refused during negotiation.
    OptionRejected(OptionRejected),

    /// The peer sent an error packet.
    PeerError { code: tftp::ErrorCode, message: String },

    /// The peer stopped answering.
    Timeout,

    /// The file being read could not be opened or read.
    SourceUnavailable(io::Error),

    /// The file being written could not be created or written.
    SinkFailure(io::Error),

    AccessDenied(String),

    /// The peer broke the protocol.
    IllegalOperation(String),

    /// The session's own socket failed.
    Transport(io::Error),
}

impl SessionError {
    /// The error packet to send the peer, if this error warrants one.
    pub fn error_packet(&self) -> Option<tftp::Packet> {
        use tftp::ErrorCode;

        let (code, message) = match self {
            Self::PeerError { .. } | Self::Timeout | Self::Transport(_) => return None,
            Self::OptionRejected(e) => (ErrorCode::OptionNegotiation, e.to_string()),
            Self::SourceUnavailable(e) => {
                let code = match e.kind() {
                    io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                    io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
                    _ => ErrorCode::Undefined,
                };
                (code, format!("Failed to read from file: {e}"))
            }
            Self::SinkFailure(e) => {
                let code = match e.kind() {
                    io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                    io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
                    io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
                    _ => ErrorCode::DiskFull,
                };
                (code, format!("Error writing to file: {e}"))
            }
            Self::AccessDenied(msg) => (ErrorCode::AccessViolation, msg.clone()),
            Self::IllegalOperation(msg) => (ErrorCode::Illegal, msg.clone()),
        };
        Some(tftp::Packet::Error { code, message })
    }
}

impl error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OptionRejected(e) => write!(f, "{e}"),
            Self::PeerError { code, message } => {
                write!(f, "Client sent error packet: code: {:?}, message: '{}'", code, message)
            }
            Self::Timeout => write!(f, "Peer stopped responding"),
            Self::SourceUnavailable(e) => write!(f, "File read error: {e}"),
            Self::SinkFailure(e) => write!(f, "File write error: {e}"),
            Self::AccessDenied(msg) => write!(f, "Access denied: {msg}"),
            Self::IllegalOperation(msg) => write!(f, "Illegal operation: {msg}"),
            Self::Transport(e) => write!(f, "Socket IO error: {e}"),
        }
    }
}

impl PartialEq for SessionError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::OptionRejected(a), Self::OptionRejected(b)) => a == b,
            (
                Self::PeerError { code: a, message: m },
                Self::PeerError { code: b, message: n },
            ) => a == b && m == n,
            (Self::Timeout, Self::Timeout) => true,
            (Self::SourceUnavailable(a), Self::SourceUnavailable(b))
            | (Self::SinkFailure(a), Self::SinkFailure(b))
            | (Self::Transport(a), Self::Transport(b)) => a.kind() == b.kind(),
            (Self::AccessDenied(a), Self::AccessDenied(b))
            | (Self::IllegalOperation(a), Self::IllegalOperation(b)) => a == b,
            _ => false,
        }
    }
}

impl From<OptionRejected> for SessionError {
    fn from(e: OptionRejected) -> SessionError {
        SessionError::OptionRejected(e)
    }
}

impl From<SocketError> for SessionError {
    fn from(e: SocketError) -> SessionError {
        match e {
            SocketError::IO(e) => SessionError::Transport(e),
            SocketError::Timeout => SessionError::Timeout,
            SocketError::PacketParse(msg) => SessionError::IllegalOperation(msg),
        }
    }
}
