//! Inbound datagram loop.
//!
//! One task owns the receive half of the shared socket. Each datagram is
//! decoded as a [`ProtocolWindow`](crate::wire::ProtocolWindow) and handed to
//! the connection for its `source_uuid`. Undecodable datagrams and unknown
//! sources are logged and dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ConnectionManager;
use crate::clock::SyncedClock;
use crate::transport::decode_window;
use crate::wire::MAX_DATAGRAM_SIZE;

pub struct Listener {
    local_addr: Option<SocketAddr>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Starts receiving on `socket`. Must be called inside a tokio runtime.
    pub fn spawn(socket: Arc<UdpSocket>, manager: Arc<ConnectionManager>, clock: SyncedClock) -> Self {
        let local_addr = socket.local_addr().ok();
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            info!(addr = ?local_addr, "listener started");
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => handle_datagram(&buf[..len], from, &manager, &clock),
                        Err(e) => warn!(error = %e, "receive failed"),
                    },
                }
            }
            info!("listener stopped");
        });
        Self {
            local_addr,
            shutdown,
            task,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Ends the receive loop and waits for it to exit.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "listener task failed");
        }
    }
}

fn handle_datagram(datagram: &[u8], from: SocketAddr, manager: &ConnectionManager, clock: &SyncedClock) {
    let received_at = clock.local_now();
    let window = match decode_window(datagram) {
        Ok(window) => window,
        Err(e) => {
            warn!(from = %from, error = %e, "undecodable datagram dropped");
            return;
        }
    };
    match manager.connect(&window.source_uuid) {
        Ok(conn) => {
            let accepted = conn.receive_window(&window, received_at);
            debug!(
                peer = %window.source_uuid,
                frames = window.frames.len(),
                accepted,
                "window processed"
            );
        }
        Err(e) => warn!(from = %from, error = %e, "datagram from unknown source dropped"),
    }
}
