// A TFTP server: RFC 1350, with the option extension of RFC 2347 and the blksize (RFC 2348),
// timeout and tsize (RFC 2349) options.
//
// A client starts a transfer by sending a read request (RRQ) or write request (WRQ) to the
// well-known port. The server answers from a fresh port of its own, and the two ports (the
// transfer identifiers, or TIDs) name the transfer from then on.
//
// Files move in numbered blocks, 512 bytes unless a different blksize is negotiated. The
// transfer is strictly stop-and-wait: each DATA must be acknowledged by an ACK of the same
// number before the next one is sent. A block shorter than the block size ends the transfer,
// so a file whose length is a multiple of the block size is followed by an empty block.
//
// UDP may lose, duplicate or reorder any of these packets. Whoever is waiting for a reply
// resends its last packet when none arrives in time, and gives up after a fixed number of
// attempts. Duplicates of packets that were already answered are ignored.
//
// Packet layouts (opcode and numbers are 16-bit big-endian, strings are NUL-terminated):
//
//   RRQ/WRQ  1/2 | filename | mode | [option | value]*
//   DATA     3   | block #  | 0 to blksize bytes
//   ACK      4   | block #
//   ERROR    5   | code     | message
//   OACK     6   | [option | value]*
//
// An ERROR ends the transfer and is never acknowledged or resent. The one error that does not
// end anything is Unknown TID, sent to a stray packet that arrives on a transfer's port from
// somebody other than its peer.

pub mod config;
pub mod options;
pub mod processor;
pub mod retransmit;
pub mod server;
pub mod srv_conn;
pub mod storage;
pub mod tftp;

#[cfg(test)]
mod testing;

use clap::Parser;
use config::{Cli, Config};
use server::Server;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::try_from(Cli::parse())?;
    let server = Server::bind(config)?;
    log::info!("TFTP server listening on {}", server.local_addr()?);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Couldn't listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}
