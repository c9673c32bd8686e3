//! Routing of accepted payloads to the modules that asked for them.
//!
//! Handlers register under a recipient name (the `recipient_module` of a
//! [`ModuleMessage`]). A handler bound to a scheduler module runs as a task in
//! that module's queue; an unbound handler runs inline on the receive path.
//! The recipient [`BROADCAST`] reaches every registered handler.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::scheduler::{ModuleId, PhaseScheduler};
use crate::sync::lock;
use crate::wire::ModuleMessage;

/// Recipient name that addresses every handler.
pub const BROADCAST: &str = "all";

/// An accepted payload together with where and when it arrived.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: String,
    pub message: ModuleMessage,
    /// Local, uncorrected receive time.
    pub received_at: DateTime<Utc>,
}

pub type Handler = Arc<dyn Fn(Delivery) + Send + Sync + 'static>;

#[derive(Clone)]
struct HandlerEntry {
    module: Option<ModuleId>,
    handler: Handler,
}

pub struct Dispatcher {
    scheduler: Arc<PhaseScheduler>,
    handlers: Mutex<BTreeMap<String, Vec<HandlerEntry>>>,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<PhaseScheduler>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            handlers: Mutex::new(BTreeMap::new()),
        })
    }

    /// Adds a handler for messages addressed to `recipient`.
    ///
    /// With `module` set, each delivery is queued on that module instead of
    /// running inline.
    pub fn register_handler<F>(&self, recipient: impl Into<String>, module: Option<&str>, handler: F)
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let recipient = recipient.into();
        debug!(recipient = %recipient, module = ?module, "handler registered");
        lock(&self.handlers)
            .entry(recipient)
            .or_default()
            .push(HandlerEntry {
                module: module.map(str::to_string),
                handler: Arc::new(handler),
            });
    }

    /// Hands `delivery` to every matching handler and returns how many
    /// received it.
    pub fn dispatch(&self, delivery: Delivery) -> usize {
        let targets: Vec<HandlerEntry> = {
            let handlers = lock(&self.handlers);
            if delivery.message.recipient_module == BROADCAST {
                handlers.values().flatten().cloned().collect()
            } else {
                handlers
                    .get(&delivery.message.recipient_module)
                    .cloned()
                    .unwrap_or_default()
            }
        };

        if targets.is_empty() {
            warn!(
                recipient = %delivery.message.recipient_module,
                source = %delivery.source,
                "no handler for message"
            );
            return 0;
        }

        let mut delivered = 0;
        for entry in targets {
            let handler = entry.handler;
            match entry.module {
                None => {
                    handler(delivery.clone());
                    delivered += 1;
                }
                Some(module) => {
                    let d = delivery.clone();
                    match self.scheduler.schedule(&module, move || handler(d), true) {
                        Ok(()) => delivered += 1,
                        Err(e) => warn!(module = %module, error = %e, "delivery not scheduled"),
                    }
                }
            }
        }
        delivered
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
