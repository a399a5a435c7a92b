// The packet processors are the protocol state machines of a transfer, kept free of any socket
// handling: they are handed the peer's packets one at a time and answer with the action the
// connection handler should take. Reading from the source and writing to the sink happen here;
// sending, timing and retransmission happen in srv_conn.

use crate::srv_conn::SessionError;
use crate::tftp;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Where the blocks of a read request come from.
pub type DataSource = Box<dyn AsyncRead + Send + Unpin>;

/// Where the blocks of a write request go.
pub type DataSink = Box<dyn AsyncWrite + Send + Unpin>;

pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

/// An entity that can process packets and produce a response.
impl PacketProcessor {
    /// Builds a processor that serves `source` to the peer. When `oack` is given, the transfer
    /// opens with an OACK carrying those options instead of the first data block.
    pub fn new_for_reading(
        source: DataSource,
        block_size: u16,
        oack: Option<tftp::OptionList>,
    ) -> PacketProcessor {
        PacketProcessor::Read(ReadProcessor {
            source,
            block_size,
            curr_block: 0,
            oack,
            negotiating: false,
            awaiting_final_ack: false,
        })
    }

    /// Builds a processor that stores the peer's blocks into `sink`. When `oack` is given, the
    /// OACK takes the place of the initial ACK.
    pub fn new_for_writing(
        sink: DataSink,
        block_size: u16,
        oack: Option<tftp::OptionList>,
    ) -> PacketProcessor {
        PacketProcessor::Write(WriteProcessor {
            sink,
            block_size,
            curr_block: 0,
            oack,
            negotiating: false,
        })
    }

    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => {
                if let Some(options) = p.oack.take() {
                    p.negotiating = true;
                    return ResultAction::SendPacketAndAwait(tftp::Packet::OptionAck { options });
                }
                p.process_ack(&tftp::Packet::Ack { block: 0 }).await
            }
            PacketProcessor::Write(p) => {
                if let Some(options) = p.oack.take() {
                    p.negotiating = true;
                    return ResultAction::SendPacketAndAwait(tftp::Packet::OptionAck { options });
                }
                ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 })
            }
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }

    /// Whether an OACK has been sent and the peer has not answered it yet.
    pub fn is_negotiating(&self) -> bool {
        match self {
            PacketProcessor::Read(p) => p.negotiating,
            PacketProcessor::Write(p) => p.negotiating,
        }
    }

    /// The number of the last block sent (reads) or written (writes).
    pub fn current_block(&self) -> u16 {
        match self {
            PacketProcessor::Read(p) => p.curr_block,
            PacketProcessor::Write(p) => p.curr_block,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// The transfer is complete and nothing more needs to be sent.
    CloseConnection,

    /// Caller should send the final packet of the transfer, after which it is complete.
    FinishWithPacket(tftp::Packet),

    /// Caller should keep waiting for a reply to the last packet it sent.
    RetryRecv,

    /// The transfer failed. The caller should send the error's courtesy packet, if it has one,
    /// and close the connection.
    Abort(SessionError),
}

/// True if `block` comes before `expected` in 16-bit wrapping sequence space.
fn is_stale(block: u16, expected: u16) -> bool {
    (1..=0x7FFF).contains(&expected.wrapping_sub(block))
}

pub struct ReadProcessor {
    source: DataSource,
    block_size: u16,
    curr_block: u16,
    oack: Option<tftp::OptionList>,
    negotiating: bool,
    awaiting_final_ack: bool,
}

impl ReadProcessor {
    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } if block == self.curr_block => {
                self.negotiating = false;
                if self.awaiting_final_ack {
                    return ResultAction::CloseConnection;
                }
                match read_block(&mut self.source, self.block_size).await {
                    Ok(data) => {
                        self.curr_block = self.curr_block.wrapping_add(1);
                        if data.len() < usize::from(self.block_size) {
                            self.awaiting_final_ack = true;
                        }
                        ResultAction::SendPacketAndAwait(
                            tftp::Packet::Data { block: self.curr_block, data }
                        )
                    },
                    Err(e) => ResultAction::Abort(SessionError::SourceUnavailable(e)),
                }
            },
            // Acks for blocks that were already acknowledged are duplicates; the data they
            // answer has been sent again by now, so just keep waiting.
            &tftp::Packet::Ack { block } if is_stale(block, self.curr_block) => ResultAction::RetryRecv,
            &tftp::Packet::Ack { block } => ResultAction::Abort(SessionError::IllegalOperation(format!(
                "Cannot acknowledge a block which was not yet sent. Server's current block is {cb}, but received an ack for {block}",
                cb = self.curr_block
            ))),
            tftp::Packet::Error { code, message } => ResultAction::Abort(SessionError::PeerError {
                code: *code,
                message: message.clone(),
            }),
            _ => ResultAction::Abort(SessionError::IllegalOperation(format!(
                "Expected to receive an Ack packet, but got {:?} instead",
                packet.op_code()
            ))),
        }
    }
}

async fn read_block(source: &mut DataSource, block_size: u16) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; usize::from(block_size)];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for without the source being exhausted,
    // so keep reading into the rest of the buffer until it is full or the source hits EOF.
    while cursor < buf.len() {
        match source.read(&mut buf[cursor..]).await? {
            0 => break,
            s => cursor += s,
        }
    }
    buf.truncate(cursor);
    Ok(buf)
}

pub struct WriteProcessor {
    sink: DataSink,
    block_size: u16,
    curr_block: u16,
    oack: Option<tftp::OptionList>,
    negotiating: bool,
}

impl WriteProcessor {
    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        let expected = self.curr_block.wrapping_add(1);
        match packet {
            tftp::Packet::Data { block, data } if *block == expected => {
                self.negotiating = false;
                if data.len() > usize::from(self.block_size) {
                    return ResultAction::Abort(SessionError::IllegalOperation(format!(
                        "Block {block} carries {} bytes, but the block size is {}",
                        data.len(),
                        self.block_size
                    )));
                }
                if let Err(e) = self.sink.write_all(data).await {
                    return ResultAction::Abort(SessionError::SinkFailure(e));
                }
                self.curr_block = expected;
                let ack = tftp::Packet::Ack { block: self.curr_block };

                if data.len() < usize::from(self.block_size) {
                    // The file is only complete once it is flushed, so the final ack waits on it.
                    if let Err(e) = self.sink.flush().await {
                        return ResultAction::Abort(SessionError::SinkFailure(e));
                    }
                    ResultAction::FinishWithPacket(ack)
                } else {
                    ResultAction::SendPacketAndAwait(ack)
                }
            },
            // Ignore data packets that were already written, e.g. ones duplicated in transit.
            tftp::Packet::Data { block, .. } if is_stale(*block, expected) => ResultAction::RetryRecv,
            tftp::Packet::Data { block, .. } => ResultAction::Abort(SessionError::IllegalOperation(format!(
                "Data blocks must be received by the server in sequence. Server received data for block {block}, \
                but the server has only received up to block {cb}.", cb = self.curr_block))),
            tftp::Packet::Error { code, message } => ResultAction::Abort(SessionError::PeerError {
                code: *code,
                message: message.clone(),
            }),
            _ => ResultAction::Abort(SessionError::IllegalOperation(format!(
                "Expected to receive a Data packet, but got {:?} instead",
                packet.op_code()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SharedSink;
    use std::io::Cursor;
    use tokio_test::io::Builder;

    fn reader(contents: Vec<u8>) -> PacketProcessor {
        PacketProcessor::new_for_reading(Box::new(Cursor::new(contents)), 512, None)
    }

    fn writer(sink: &SharedSink) -> PacketProcessor {
        PacketProcessor::new_for_writing(Box::new(sink.clone()), 512, None)
    }

    fn data(block: u16, data: Vec<u8>) -> tftp::Packet {
        tftp::Packet::Data { block, data }
    }

    #[tokio::test]
    async fn test_read_first_packet_succeeds() {
        let mut processor = reader(b"testing".to_vec());

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(data(1, vec![0x74, 0x65, 0x73, 0x74, 0x69, 0x6E, 0x67]))
        );
        assert!(!processor.is_negotiating());
    }

    #[tokio::test]
    async fn test_read_multiple_packets_succeeds() {
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        let mut processor = reader(contents);

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(data(1, vec![0x78; 512]))
        );

        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::SendPacketAndAwait(data(2, vec![0x78; 512]))
        );

        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 2 }).await,
            ResultAction::SendPacketAndAwait(data(3, b"testing".to_vec()))
        );

        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 3 }).await,
            ResultAction::CloseConnection
        );
    }

    #[tokio::test]
    async fn test_read_exact_multiple_ends_with_empty_block() {
        let mut processor = reader(vec![0x01; 1024]);

        assert_eq!(processor.first_packet().await, ResultAction::SendPacketAndAwait(data(1, vec![0x01; 512])));
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::SendPacketAndAwait(data(2, vec![0x01; 512]))
        );
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 2 }).await,
            ResultAction::SendPacketAndAwait(data(3, vec![]))
        );
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 3 }).await,
            ResultAction::CloseConnection
        );
    }

    #[tokio::test]
    async fn test_read_empty_file_sends_one_empty_block() {
        let mut processor = reader(vec![]);
        assert_eq!(processor.first_packet().await, ResultAction::SendPacketAndAwait(data(1, vec![])));
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::CloseConnection
        );
    }

    #[tokio::test]
    async fn test_read_with_oack_waits_for_ack_zero() {
        let options = vec![("blksize".to_string(), "1024".to_string())];
        let mut processor = PacketProcessor::new_for_reading(
            Box::new(Cursor::new(vec![0x61; 2000])),
            1024,
            Some(options.clone()),
        );

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(tftp::Packet::OptionAck { options })
        );
        assert!(processor.is_negotiating());

        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 0 }).await,
            ResultAction::SendPacketAndAwait(data(1, vec![0x61; 1024]))
        );
        assert!(!processor.is_negotiating());
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::SendPacketAndAwait(data(2, vec![0x61; 976]))
        );
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 2 }).await,
            ResultAction::CloseConnection
        );
    }

    #[tokio::test]
    async fn test_read_duplicate_ack_does_not_advance() {
        // The source only has two full blocks' worth of reads scripted; a re-read would panic.
        let source = Builder::new().read(&[0x78; 512]).read(&[0x79; 512]).build();
        let mut processor = PacketProcessor::new_for_reading(Box::new(source), 512, None);

        assert_eq!(processor.first_packet().await, ResultAction::SendPacketAndAwait(data(1, vec![0x78; 512])));
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::SendPacketAndAwait(data(2, vec![0x79; 512]))
        );
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::RetryRecv
        );
        assert_eq!(processor.current_block(), 2);
    }

    #[tokio::test]
    async fn test_read_block_numbers_wrap() {
        let mut processor = PacketProcessor::new_for_reading(Box::new(Cursor::new(vec![0x00; 64 * 3])), 64, None);
        if let PacketProcessor::Read(p) = &mut processor {
            p.curr_block = 65534;
        }

        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 65534 }).await,
            ResultAction::SendPacketAndAwait(data(65535, vec![0x00; 64]))
        );
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 65535 }).await,
            ResultAction::SendPacketAndAwait(data(0, vec![0x00; 64]))
        );
        // A late duplicate from before the wrap is still recognized as old.
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 65535 }).await,
            ResultAction::RetryRecv
        );
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 0 }).await,
            ResultAction::SendPacketAndAwait(data(1, vec![0x00; 64]))
        );
    }

    #[tokio::test]
    async fn test_read_source_failure_aborts() {
        let source = Builder::new()
            .read(&[0x78; 512])
            .read_error(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
            .build();
        let mut processor = PacketProcessor::new_for_reading(Box::new(source), 512, None);

        let _ = processor.first_packet().await;
        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::Abort(SessionError::SourceUnavailable(io::Error::from(io::ErrorKind::PermissionDenied)))
        );
    }

    #[tokio::test]
    async fn test_process_recv_error() {
        let mut processor = reader(vec![0x78; 1030]);
        let _ = processor.first_packet().await;

        assert_eq!(
            processor
                .process_packet(&tftp::Packet::Error {
                    code: tftp::ErrorCode::Undefined,
                    message: "whoops".to_string()
                })
                .await,
            ResultAction::Abort(SessionError::PeerError {
                code: tftp::ErrorCode::Undefined,
                message: "whoops".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_process_read_invalid_packet() {
        let mut processor = reader(vec![0x78; 1030]);
        let _ = processor.first_packet().await;

        assert_eq!(
            processor.process_packet(&data(1, vec![0x01])).await,
            ResultAction::Abort(SessionError::IllegalOperation(
                "Expected to receive an Ack packet, but got Data instead".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_process_ack_too_large() {
        let mut processor = reader(vec![0x78; 1030]);
        let _ = processor.first_packet().await;

        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 2 }).await,
            ResultAction::Abort(SessionError::IllegalOperation(
                "Cannot acknowledge a block which was not yet sent. Server's current block is 1, but received an ack for 2".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_write_first_packet_succeeds() {
        let sink = SharedSink::default();
        let mut processor = writer(&sink);

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 })
        );
    }

    #[tokio::test]
    async fn test_write_multiple_packets_succeeds() {
        let sink = SharedSink::default();
        let mut processor = writer(&sink);

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 })
        );

        assert_eq!(
            processor.process_packet(&data(1, vec![0x78; 512])).await,
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 1 })
        );

        assert_eq!(
            processor.process_packet(&data(2, b"testing".to_vec())).await,
            ResultAction::FinishWithPacket(tftp::Packet::Ack { block: 2 })
        );

        let mut expected = vec![0x78; 512];
        expected.extend_from_slice(b"testing");
        assert_eq!(sink.contents(), expected);
    }

    #[tokio::test]
    async fn test_write_with_oack_expects_first_block() {
        let sink = SharedSink::default();
        let options = vec![("blksize".to_string(), "8".to_string())];
        let mut processor = PacketProcessor::new_for_writing(Box::new(sink.clone()), 8, Some(options.clone()));

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(tftp::Packet::OptionAck { options })
        );
        assert!(processor.is_negotiating());
        assert_eq!(
            processor.process_packet(&data(1, b"12345678".to_vec())).await,
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 1 })
        );
        assert_eq!(
            processor.process_packet(&data(2, vec![])).await,
            ResultAction::FinishWithPacket(tftp::Packet::Ack { block: 2 })
        );
        assert_eq!(sink.contents(), b"12345678".to_vec());
    }

    #[tokio::test]
    async fn test_write_duplicate_data_is_ignored() {
        let sink = SharedSink::default();
        let mut processor = writer(&sink);
        let _ = processor.first_packet().await;

        let _ = processor.process_packet(&data(1, vec![0x78; 512])).await;
        assert_eq!(processor.process_packet(&data(1, vec![0x78; 512])).await, ResultAction::RetryRecv);
        assert_eq!(sink.contents().len(), 512);
    }

    #[tokio::test]
    async fn test_write_oversized_block_aborts() {
        let sink = SharedSink::default();
        let mut processor = writer(&sink);
        let _ = processor.first_packet().await;

        assert!(matches!(
            processor.process_packet(&data(1, vec![0x00; 513])).await,
            ResultAction::Abort(SessionError::IllegalOperation(_))
        ));
        assert!(sink.contents().is_empty());
    }

    #[tokio::test]
    async fn test_write_sink_failure_aborts() {
        let sink = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::WriteZero, "disk full"))
            .build();
        let mut processor = PacketProcessor::new_for_writing(Box::new(sink), 512, None);
        let _ = processor.first_packet().await;

        assert_eq!(
            processor.process_packet(&data(1, b"abc".to_vec())).await,
            ResultAction::Abort(SessionError::SinkFailure(io::Error::from(io::ErrorKind::WriteZero)))
        );
    }

    #[tokio::test]
    async fn test_process_write_recv_error() {
        let sink = SharedSink::default();
        let mut processor = writer(&sink);
        let _ = processor.first_packet().await;

        assert_eq!(
            processor
                .process_packet(&tftp::Packet::Error {
                    code: tftp::ErrorCode::DiskFull,
                    message: "whoops".to_string()
                })
                .await,
            ResultAction::Abort(SessionError::PeerError {
                code: tftp::ErrorCode::DiskFull,
                message: "whoops".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_process_write_invalid_packet() {
        let sink = SharedSink::default();
        let mut processor = writer(&sink);
        let _ = processor.first_packet().await;

        assert_eq!(
            processor.process_packet(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::Abort(SessionError::IllegalOperation(
                "Expected to receive a Data packet, but got Ack instead".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_process_data_too_large() {
        let sink = SharedSink::default();
        let mut processor = writer(&sink);
        let _ = processor.first_packet().await;

        assert_eq!(
            processor.process_packet(&data(2, vec![0x01])).await,
            ResultAction::Abort(SessionError::IllegalOperation(
                "Data blocks must be received by the server in sequence. Server received data \
                    for block 2, but the server has only received up to block 0.".to_string()
            ))
        );
    }
}
