/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! A running broker: every service built from one [`BrokerConfig`] and wired
//! together.
//!
//! ```text
//!  UdpSocket ─┬─ Listener ──► ConnectionManager ──► PeerConnection ──► Dispatcher
//!             └─ UdpTransport (optionally LossyTransport) ◄──┘              │
//!                                                             ┌──────────────┤
//!                                         ClockSynchronizer ◄─┘ "clk"        └─► module handlers
//!                                               │                                  (PhaseScheduler)
//!                                               └── SyncedClock ──► PhaseScheduler, sessions
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::synchronizer::CLOCK_RECIPIENT;
use crate::clock::{ClockSynchronizer, SyncedClock};
use crate::config::BrokerConfig;
use crate::connection::manager::MessageSender;
use crate::connection::{ConnectionContext, ConnectionManager, Listener, PeerList};
use crate::dispatch::Dispatcher;
use crate::scheduler::PhaseScheduler;
use crate::transport::{DatagramSink, LossyTransport, UdpTransport};

pub struct BrokerNode {
    uuid: String,
    clock: SyncedClock,
    scheduler: Arc<PhaseScheduler>,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionManager>,
    synchronizer: Arc<ClockSynchronizer>,
    listener: Listener,
    scheduler_task: JoinHandle<()>,
}

impl BrokerNode {
    /// Binds the socket and starts every service. Must be called inside a
    /// tokio runtime.
    pub async fn start(config: BrokerConfig) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(config.listen)
                .await
                .with_context(|| format!("Cannot bind UDP socket on {}", config.listen))?,
        );
        let local_addr = socket
            .local_addr()
            .context("Cannot read local socket address")?;
        info!(uuid = %config.uuid, addr = %local_addr, protocol = %config.protocol, "broker starting");

        let clock = SyncedClock::new();

        let scheduler = PhaseScheduler::new(clock.clone(), config.timings.alignment_duration);
        for module in &config.modules {
            scheduler.register_module(module.name.as_str(), module.phase);
        }
        let scheduler_task = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };

        let dispatcher = Dispatcher::new(Arc::clone(&scheduler));

        let udp = UdpTransport::new(Arc::clone(&socket));
        let sink: Arc<dyn DatagramSink> = if config.reliability < 100 {
            warn!(reliability = config.reliability, "link-loss emulation enabled");
            Arc::new(LossyTransport::new(udp, config.reliability))
        } else {
            Arc::new(udp)
        };

        let peers = Arc::new(PeerList::new(
            config.uuid.clone(),
            local_addr,
            config.peers.clone(),
        ));
        let connections = ConnectionManager::new(
            Arc::clone(&peers),
            ConnectionContext {
                local_uuid: config.uuid.clone(),
                kind: config.protocol,
                sink,
                clock: clock.clone(),
                dispatcher: Arc::clone(&dispatcher),
                reliable: config.timings.reliable(),
                unreliable_resend: config.timings.csuc_resend_time,
            },
        );

        let listener = Listener::spawn(socket, Arc::clone(&connections), clock.clone());

        let synchronizer = ClockSynchronizer::new(
            peers,
            Arc::clone(&connections) as Arc<dyn MessageSender>,
            clock.clone(),
            config.timings.clock_query_interval,
        );
        let weak = Arc::downgrade(&synchronizer);
        dispatcher.register_handler(CLOCK_RECIPIENT, None, move |delivery| {
            if let Some(sync) = weak.upgrade() {
                sync.handle_delivery(&delivery);
            }
        });
        synchronizer.run();

        Ok(Self {
            uuid: config.uuid,
            clock,
            scheduler,
            dispatcher,
            connections,
            synchronizer,
            listener,
            scheduler_task,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn clock(&self) -> &SyncedClock {
        &self.clock
    }

    pub fn scheduler(&self) -> &Arc<PhaseScheduler> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn synchronizer(&self) -> &Arc<ClockSynchronizer> {
        &self.synchronizer
    }

    /// Stops the synchronizer, the connections, the listener and finally the
    /// scheduler, draining its queued work.
    pub async fn shutdown(self) {
        info!(uuid = %self.uuid, "broker shutting down");
        self.synchronizer.stop();
        self.connections.stop_all();
        self.listener.stop().await;
        self.scheduler.stop();
        if let Err(e) = self.scheduler_task.await {
            warn!(error = %e, "scheduler task failed");
        }
        info!("broker stopped");
    }
}
