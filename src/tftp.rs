use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// The largest datagram a socket will accept: a DATA header plus the largest block RFC 2348
/// allows.
pub const MAX_PACKET_SIZE: usize = 4 + 65464;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout,
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {:#?}", e),
            SocketError::Timeout => write!(f, "Socket IO timeout"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(_: Elapsed) -> Self {
        SocketError::Timeout
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

fn parse_error<T>(msg: impl Into<String>) -> TftpResult<T> {
    Err(SocketError::PacketParse(msg.into()))
}

/// Represents the mode for a file the client wishes to read or write.
/// A mode string that names none of the RFC 1350 modes is kept as sent, so the request can be
/// refused with an error packet instead of being dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileMode { NetAscii, Octet, Mail, Unknown(String) }

impl FileMode {
    pub fn as_str(&self) -> &str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
            FileMode::Unknown(raw) => raw,
        }
    }

    fn parse(raw: String) -> FileMode {
        match raw.to_lowercase().as_str() {
            "netascii" => FileMode::NetAscii,
            "octet" => FileMode::Octet,
            "mail" => FileMode::Mail,
            _ => FileMode::Unknown(raw),
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    Illegal = 4,
    UnknownTid = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiation = 8,
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            _ => ErrorCode::Undefined,
        }
    }
}

/// Option name/value pairs in the order they appeared on the wire.
pub type OptionList = Vec<(String, String)>;

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        /// RFC 2347 options appended to the request.
        options: OptionList,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
        options: OptionList,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },

    /// An option acknowledgment, sent by the server in reply to a request carrying options it
    /// is willing to honor.
    OptionAck {
        options: OptionList,
    },
}

/// Opcodes of the packets defined by RFC 1350 and RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode { Rrq = 1, Wrq = 2, Data = 3, Ack = 4, Error = 5, Oack = 6 }

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs up to the
/// first 0 byte.
///
/// Returns the string along with the number of bytes it occupied, terminator included. Returns
/// None if the buffer holds no 0 byte.
fn string_from_buffer(buf: &[u8]) -> Option<(String, usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    Some((String::from_utf8_lossy(&buf[..end]).into_owned(), end + 1))
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        6 => Ok(OpCode::Oack),
        _ => parse_error(format!("Unknown opcode retrieved: {rawcode}")),
    }
}

fn parse_options(buf: &[u8]) -> TftpResult<OptionList> {
    let mut options = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let Some((name, name_len)) = string_from_buffer(rest) else {
            return parse_error("Option name must be terminated with a null byte!");
        };
        // Some clients pad requests with trailing zeroes.
        if name.is_empty() {
            break;
        }
        rest = &rest[name_len..];

        let Some((value, value_len)) = string_from_buffer(rest) else {
            return parse_error(format!("Option '{name}' is missing a null-terminated value"));
        };
        rest = &rest[value_len..];
        options.push((name, value));
    }
    Ok(options)
}

fn parse_request(buf: &[u8]) -> TftpResult<(String, FileMode, OptionList)> {
    let Some((path, path_len)) = string_from_buffer(buf) else {
        return parse_error("Path must be terminated with a null byte!");
    };

    let Some((raw_mode, mode_len)) = string_from_buffer(&buf[path_len..]) else {
        return parse_error("Mode must be terminated with a null byte!");
    };
    let mode = FileMode::parse(raw_mode);

    let options = parse_options(&buf[path_len + mode_len..])?;
    Ok((path, mode, options))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode, options) = parse_request(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode, options })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode, options) = parse_request(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode, options })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error_packet(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    // Tolerate peers that leave off the terminator.
    let message = match string_from_buffer(&buf[4..]) {
        Some((message, _)) => message,
        None => String::from_utf8_lossy(&buf[4..]).into_owned(),
    };
    Ok(Packet::Error { code, message })
}

fn parse_oack(buf: &[u8]) -> TftpResult<Packet> {
    Ok(Packet::OptionAck { options: parse_options(&buf[2..])? })
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

fn push_options(buf: &mut Vec<u8>, options: &[(String, String)]) {
    for (name, value) in options {
        push_string(buf, name);
        push_string(buf, value);
    }
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return parse_error("Packet too short!");
        }

        let op_code = retrieve_op_code(&buf[..2])?;
        if matches!(op_code, OpCode::Data | OpCode::Ack | OpCode::Error) && buf.len() < 4 {
            return parse_error(format!("{op_code:?} packet is missing its 4-byte header"));
        }

        match op_code {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error_packet(buf),
            OpCode::Oack => parse_oack(buf),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::OptionAck { .. } => OpCode::Oack,
        }
    }

    /// Serializes the packet into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&(self.op_code() as u16).to_be_bytes());
        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                push_string(&mut buf, path);
                push_string(&mut buf, mode.as_str());
                push_options(&mut buf, options);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                push_string(&mut buf, message);
            }
            Packet::OptionAck { options } => push_options(&mut buf, options),
        }
        buf
    }
}

/// Which way the file travels in a transfer, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// RRQ: the server sends the file.
    Read,
    /// WRQ: the server receives the file.
    Write,
}

/// A request that opens a transfer, parsed once from the datagram that triggered it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub kind: RequestKind,
    pub path: String,
    pub mode: FileMode,
    pub options: OptionList,
}

impl TransferRequest {
    /// Returns the request carried by the packet, or None if the packet is not a RRQ or WRQ.
    pub fn from_packet(packet: Packet) -> Option<TransferRequest> {
        match packet {
            Packet::ReadReq { path, mode, options } => {
                Some(TransferRequest { kind: RequestKind::Read, path, mode, options })
            }
            Packet::WriteReq { path, mode, options } => {
                Some(TransferRequest { kind: RequestKind::Write, path, mode, options })
            }
            _ => None,
        }
    }
}

///////////////////////////////////////////////////////////////
/// A datagram endpoint that speaks TFTP packets. Sessions are written against this trait so
/// they can be driven by a scripted peer in tests.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()>;

    /// Waits at most `ttl` for the next packet.
    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)>;
}

/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    buf: Vec<u8>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            buf: vec![0; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Waits for the next packet with no deadline.
    pub async fn recv(&mut self) -> TftpResult<(Packet, SocketAddr)> {
        let (total_written, src) = self.sock.recv_from(&mut self.buf).await?;
        let packet = Packet::parse_from_buf(&self.buf[..total_written])?;
        Ok((packet, src))
    }
}

impl Transport for TftpSocket {
    async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}
