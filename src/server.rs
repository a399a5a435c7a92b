// The request dispatcher. It owns the well-known port and does no transferring itself: each
// RRQ or WRQ gets a socket of its own and a task that runs the session on it, and the loop goes
// straight back to waiting for the next request.

use crate::config::Config;
use crate::srv_conn::{bind_session_socket, ServerRequestHandler};
use crate::storage::Storage;
use crate::tftp::{self, RequestKind, SocketError, TftpSocket, TransferRequest, Transport};
use anyhow::Context;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct Server {
    sock: TftpSocket,
    config: Arc<Config>,
    storage: Storage,
    sessions: Arc<Semaphore>,
}

impl Server {
    pub fn bind(config: Config) -> anyhow::Result<Server> {
        let sock = TftpSocket::bind(config.listen)
            .with_context(|| format!("Couldn't bind {}", config.listen))?;
        let storage = Storage::new(config.root.clone(), config.allow_writes);
        let sessions = Arc::new(Semaphore::new(config.max_connections));
        Ok(Server { sock, config: Arc::new(config), storage, sessions })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Accepts requests until `shutdown` resolves. Transfers already running are left to
    /// finish on their own.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        log::info!(
            "Serving {} (writes {}), timeout: {:?}, retries: {}, max blksize: {}",
            self.storage.root().display(),
            if self.config.allow_writes { "allowed" } else { "refused" },
            self.config.limits.default_timeout,
            self.config.max_retries,
            self.config.limits.max_block_size,
        );

        tokio::pin!(shutdown);
        loop {
            let received = tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down");
                    return Ok(());
                }
                received = self.sock.recv() => received,
            };
            self.dispatch(received).await;
        }
    }

    async fn dispatch(&mut self, received: tftp::TftpResult<(tftp::Packet, SocketAddr)>) {
        let (packet, src) = match received {
            Ok(received) => received,
            Err(SocketError::PacketParse(msg)) => {
                log::debug!("Dropping malformed request: {msg}");
                return;
            }
            Err(e) => {
                log::warn!("Couldn't receive request: {e}");
                return;
            }
        };

        let Some(request) = TransferRequest::from_packet(packet) else {
            log::debug!("Ignoring non-request packet from {src}");
            return;
        };
        log::info!(
            "{src} requested {:?} of {:#?} ({})",
            request.kind,
            request.path,
            request.mode.as_str()
        );

        let mut sock = match bind_session_socket(self.config.listen.ip(), self.config.port_range.as_ref()) {
            Ok(sock) => sock,
            Err(e) => {
                log::error!("Couldn't bind a socket for {src}: {e}");
                return;
            }
        };

        let permit = match self.sessions.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log::warn!("Refusing {src}: {} transfers already running", self.config.max_connections);
                let busy = tftp::Packet::Error {
                    code: tftp::ErrorCode::Undefined,
                    message: "Server is busy, try again later".to_string(),
                };
                let _ = sock.send(&busy, src).await;
                return;
            }
        };

        let config = self.config.clone();
        let storage = self.storage.clone();
        tokio::spawn(async move {
            run_session(sock, request, src, &storage, &config).await;
            drop(permit);
        });
    }
}

async fn run_session(
    sock: TftpSocket,
    request: TransferRequest,
    src: SocketAddr,
    storage: &Storage,
    config: &Config,
) {
    let mut handler = match ServerRequestHandler::accept(
        sock,
        &request,
        src,
        storage,
        &config.limits,
        config.max_retries,
    )
    .await
    {
        Ok(handler) => handler,
        Err(e) => {
            log::warn!("Refused request from {src}: {e}");
            return;
        }
    };

    if let Err(e) = handler.handle().await {
        log::warn!("Transfer of {:#?} with {} failed: {e}", request.path, handler.peer());
        if request.kind == RequestKind::Write {
            storage.discard(&request.path).await;
        }
    }
    log::debug!("Session with {} ended {:?}", handler.peer(), handler.state());
}
