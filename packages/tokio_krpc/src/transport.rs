//! Non-blocking-send / blocking-with-timeout-recv UDP transport. Separate
//! send and receive queues, each driven by its own task, matching the
//! concurrency model of one receive task and one send task per socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::TransportError;

/// Datagrams that exhaust this many send attempts are dropped silently.
pub const DEFAULT_SEND_RETRIES: u32 = 100;

/// Per-datagram receive buffer size.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

pub struct UdpTransport {
    local_addr: SocketAddr,
    send_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    recv_rx: AsyncMutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    cancel: CancellationToken,
    send_task: tokio::task::JoinHandle<()>,
    recv_task: tokio::task::JoinHandle<()>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<UdpTransport, TransportError> {
        Self::bind_with_retries(addr, DEFAULT_SEND_RETRIES).await
    }

    pub async fn bind_with_retries(
        addr: SocketAddr,
        send_retries: u32,
    ) -> Result<UdpTransport, TransportError> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(TransportError::Bind)?,
        );
        let local_addr = socket.local_addr().map_err(TransportError::Bind)?;
        let cancel = CancellationToken::new();

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();

        let send_task = tokio::spawn(send_loop(socket.clone(), send_rx, cancel.clone(), send_retries));
        let recv_task = tokio::spawn(recv_loop(socket, recv_tx, cancel.clone()));

        Ok(UdpTransport {
            local_addr,
            send_tx,
            recv_rx: AsyncMutex::new(recv_rx),
            cancel,
            send_task,
            recv_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Non-blocking send: enqueues the datagram and returns immediately.
    pub fn send(&self, addr: SocketAddr, bytes: Vec<u8>) {
        // An error here means the send task has already shut down; the
        // datagram is simply dropped, matching a closed transport's
        // "drain and discard" contract.
        let _ = self.send_tx.send((addr, bytes));
    }

    /// Blocks until a datagram arrives or the transport is closed, in which
    /// case it returns `None` (the "null result" unblocking shutdown
    /// waiters). Callers needing a bounded wait wrap this in
    /// `tokio::time::timeout`.
    pub async fn recv(&self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut rx = self.recv_rx.lock().await;
        rx.recv().await
    }

    /// Drains both queues and unblocks any waiter with a null result.
    pub async fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn join(&mut self) {
        let _ = tokio::join!(&mut self.send_task, &mut self.recv_task);
    }
}

#[instrument(skip(socket, rx, cancel))]
async fn send_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    cancel: CancellationToken,
    max_retries: u32,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some((addr, bytes)) = item else { break };

        let mut attempts = 0;
        loop {
            match socket.send_to(&bytes, addr).await {
                Ok(_) => break,
                Err(err) if attempts < max_retries => {
                    attempts += 1;
                    tracing::trace!(%addr, attempts, error = %err, "retrying datagram send");
                }
                Err(err) => {
                    tracing::debug!(%addr, error = %err, "dropping datagram after exhausting retry budget");
                    break;
                }
            }
        }
    }
}

#[instrument(skip(socket, tx, cancel))]
async fn recv_loop(
    socket: Arc<UdpSocket>,
    tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((n, addr)) => {
                        if tx.send((buf[..n].to_vec(), addr)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "udp recv error");
                    }
                }
            }
        }
    }
}
