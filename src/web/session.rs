//! Per-connection WebSocket session state.
//!
//! An [`IoSession`] is the subscription filter for one connection: it tracks
//! the explicit name sets and wildcard flags for both namespaces, decides
//! which notifications the client receives, and manages the session's
//! registration with the cache. It is also the cache listener half of the
//! WebSocket bridge: notifications are encoded on the cache worker thread
//! and pushed onto the session's outbound queue, never written to the socket
//! from the callback.
//!
//! # Wire protocol (JSON text frames)
//! Inbound:
//! ```json
//! {"type": "input_subscribe", "name": "Distance"}
//! {"type": "output_subscribe"}
//! {"type": "input_publish", "name": "Distance", "dataType": "I16", "value": "BQA="}
//! ```
//! Omitting `name` on a (un)subscribe means the whole namespace (wildcard).
//! Payloads travel base64-encoded in `value`.
//!
//! Outbound:
//! ```json
//! {"type": "input", "name": "Distance", "dataType": "I16", "value": "BQA="}
//! {"type": "error", "code": "parse_error", "message": "..."}
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{IoCache, IoCacheListener, ListenerRef, Origin};
use crate::error::{AppError, ClientFacingError};

/// Messages a client may send over the session.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsInbound {
    InputSubscribe {
        #[serde(default)]
        name: Option<String>,
    },
    InputUnsubscribe {
        #[serde(default)]
        name: Option<String>,
    },
    OutputSubscribe {
        #[serde(default)]
        name: Option<String>,
    },
    OutputUnsubscribe {
        #[serde(default)]
        name: Option<String>,
    },
    InputPublish {
        name: String,
        #[serde(rename = "dataType")]
        data_type: String,
        value: String,
    },
    OutputPublish {
        name: String,
        #[serde(rename = "dataType")]
        data_type: String,
        value: String,
    },
}

/// Messages the session sends to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutbound {
    Input {
        name: String,
        #[serde(rename = "dataType")]
        data_type: String,
        value: String,
    },
    Output {
        name: String,
        #[serde(rename = "dataType")]
        data_type: String,
        value: String,
    },
    Error { code: String, message: String },
}

/// Interest state for one session. `registered` tracks whether the session is
/// currently in the cache's listener registry.
#[derive(Debug, Default)]
struct FilterState {
    inputs: HashSet<String>,
    all_inputs: bool,
    outputs: HashSet<String>,
    all_outputs: bool,
    registered: bool,
}

impl FilterState {
    fn is_empty(&self) -> bool {
        !self.all_inputs && !self.all_outputs && self.inputs.is_empty() && self.outputs.is_empty()
    }

    fn wants_input(&self, name: &str) -> bool {
        self.all_inputs || self.inputs.contains(name)
    }

    fn wants_output(&self, name: &str) -> bool {
        self.all_outputs || self.outputs.contains(name)
    }
}

pub struct IoSession {
    peer: String,
    origin: Origin,
    cache: Arc<IoCache>,
    outbound_tx: mpsc::UnboundedSender<WsOutbound>,
    state: Mutex<FilterState>,
}

impl IoSession {
    pub fn new(
        peer: String,
        cache: Arc<IoCache>,
        outbound_tx: mpsc::UnboundedSender<WsOutbound>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            origin: Origin::unique(),
            cache,
            outbound_tx,
            state: Mutex::new(FilterState::default()),
        })
    }

    fn as_listener(self: &Arc<Self>) -> ListenerRef {
        self.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FilterState> {
        self.state.lock().expect("session filter mutex poisoned")
    }

    pub fn handle_message(self: &Arc<Self>, msg: WsInbound) {
        match msg {
            WsInbound::InputSubscribe { name } => self.subscribe_inputs(name),
            WsInbound::InputUnsubscribe { name } => self.unsubscribe_inputs(name),
            WsInbound::OutputSubscribe { name } => self.subscribe_outputs(name),
            WsInbound::OutputUnsubscribe { name } => self.unsubscribe_outputs(name),
            WsInbound::InputPublish {
                name,
                data_type,
                value,
            } => self.publish_input(&name, &data_type, &value),
            WsInbound::OutputPublish {
                name,
                data_type,
                value,
            } => self.publish_output(&name, &data_type, &value),
        }
    }

    pub fn subscribe_inputs(self: &Arc<Self>, name: Option<String>) {
        let register = {
            let mut state = self.lock_state();
            match name {
                Some(name) => {
                    state.inputs.insert(name);
                }
                None => state.all_inputs = true,
            }
            let register = !state.registered;
            state.registered = true;
            register
        };
        // replay current values first, then go live; the cache applies both
        // requests in submission order, so the transition is glitch-free
        self.cache.snapshot_inputs(self.as_listener());
        if register {
            self.cache.register_listener(self.as_listener());
        }
    }

    pub fn subscribe_outputs(self: &Arc<Self>, name: Option<String>) {
        let register = {
            let mut state = self.lock_state();
            match name {
                Some(name) => {
                    state.outputs.insert(name);
                }
                None => state.all_outputs = true,
            }
            let register = !state.registered;
            state.registered = true;
            register
        };
        self.cache.snapshot_outputs(self.as_listener());
        if register {
            self.cache.register_listener(self.as_listener());
        }
    }

    pub fn unsubscribe_inputs(self: &Arc<Self>, name: Option<String>) {
        let deregister = {
            let mut state = self.lock_state();
            match name {
                Some(name) => {
                    state.inputs.remove(&name);
                }
                None => state.all_inputs = false,
            }
            state.registered && state.is_empty() && {
                state.registered = false;
                true
            }
        };
        if deregister {
            self.cache.deregister_listener(self.as_listener());
        }
    }

    pub fn unsubscribe_outputs(self: &Arc<Self>, name: Option<String>) {
        let deregister = {
            let mut state = self.lock_state();
            match name {
                Some(name) => {
                    state.outputs.remove(&name);
                }
                None => state.all_outputs = false,
            }
            state.registered && state.is_empty() && {
                state.registered = false;
                true
            }
        };
        if deregister {
            self.cache.deregister_listener(self.as_listener());
        }
    }

    fn publish_input(&self, name: &str, data_type: &str, value_b64: &str) {
        match BASE64.decode(value_b64) {
            Ok(value) => {
                debug!(peer = %self.peer, %name, %data_type, "Publishing input");
                self.cache.set_input(name, data_type, &value, self.origin);
            }
            Err(e) => self.reject(AppError::Parse(format!("invalid base64 value: {e}"))),
        }
    }

    fn publish_output(&self, name: &str, data_type: &str, value_b64: &str) {
        match BASE64.decode(value_b64) {
            Ok(value) => {
                debug!(peer = %self.peer, %name, %data_type, "Publishing output");
                self.cache.set_output(name, data_type, &value, self.origin);
            }
            Err(e) => self.reject(AppError::Parse(format!("invalid base64 value: {e}"))),
        }
    }

    /// Sends a client-facing error packet for a frame rejected at the boundary.
    pub fn reject(&self, error: AppError) {
        let ClientFacingError { code, message } = error.into();
        let _ = self.outbound_tx.send(WsOutbound::Error { code, message });
    }

    /// Tears the session down: drops it from the cache registry regardless of
    /// remaining interest. Safe to call more than once.
    pub fn close(self: &Arc<Self>) {
        self.lock_state().registered = false;
        self.cache.deregister_listener(self.as_listener());
    }
}

impl IoCacheListener for IoSession {
    fn on_input(&self, name: &str, data_type: &str, value: &[u8], _origin: Origin) -> Result<()> {
        if !self.lock_state().wants_input(name) {
            return Ok(());
        }
        self.outbound_tx
            .send(WsOutbound::Input {
                name: name.to_string(),
                data_type: data_type.to_string(),
                value: BASE64.encode(value),
            })
            .map_err(|_| eyre::eyre!("session {} outbound queue closed", self.peer))
    }

    fn on_output(&self, name: &str, data_type: &str, value: &[u8], _origin: Origin) -> Result<()> {
        if !self.lock_state().wants_output(name) {
            return Ok(());
        }
        self.outbound_tx
            .send(WsOutbound::Output {
                name: name.to_string(),
                data_type: data_type.to_string(),
                value: BASE64.encode(value),
            })
            .map_err(|_| eyre::eyre!("session {} outbound queue closed", self.peer))
    }
}
