// -----------------------------------------------------------------------------
// Rust SECoP playground
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA 02111-1307 USA
//
// Module authors:
// Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! The process-wide Registry singleton: node directory, builder cursor,
//! and the polling bridge's action queues.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use mlzutil::time::localtime;
use parking_lot::Mutex;

use crate::backend::{ActionEntry, ActionKind, BackendAnswer};
use crate::errors::{Error, ErrorKind};
use crate::module::Module;
use crate::node::Node;
use crate::variant::Variant;

/// Default per-module poll interval, in seconds.
pub const SECOP_DEFAULT_POLLINTERVAL: f64 = 1.0;
/// Maximum per-module poll interval, in seconds (3,600,000 ms).
pub const SECOP_MAX_POLLINTERVAL: f64 = 3_600.0;
/// Lifetime bound for a queued `ActionEntry`, in seconds (60,000 ms).
pub const SECOP_POLLING_TIMEOUT: f64 = 60.0;

#[derive(Default)]
struct Cursor {
    node: Option<String>,
    module: Option<String>,
}

struct RegistryState {
    nodes: Vec<Arc<Node>>,
    cursor: Cursor,
    pending: Vec<ActionEntry>,
    in_flight: Vec<ActionEntry>,
    next_action_id: u64,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            cursor: Cursor::default(),
            pending: Vec::new(),
            in_flight: Vec::new(),
            next_action_id: 1,
        }
    }

    fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.id().eq_ignore_ascii_case(id)).cloned()
    }

    fn cursor_node(&self) -> Result<Arc<Node>, Error> {
        let id = self.cursor.node.as_ref().ok_or_else(Error::no_module)?;
        self.node(id).ok_or_else(Error::no_module)
    }

    fn cursor_module(&self) -> Result<Arc<Module>, Error> {
        let node = self.cursor_node()?;
        let id = self.cursor.module.as_ref().ok_or_else(Error::no_module)?;
        node.module(id).ok_or_else(Error::no_module)
    }
}

static REGISTRY: Mutex<Option<RegistryState>> = Mutex::new(None);

/// Process-wide entry point. All methods are
/// associated functions on this zero-sized handle; the actual state lives
/// behind the one static mutex named above, with explicit init/shutdown
/// rather than implicit first-use initialization.
pub struct Registry;

impl Registry {
    pub fn init() {
        *REGISTRY.lock() = Some(RegistryState::new());
        info!("registry initialized");
        spawn_sweeper();
    }

    pub fn shutdown() {
        *REGISTRY.lock() = None;
        info!("registry shut down");
    }

    pub fn is_ready() -> bool {
        REGISTRY.lock().is_some()
    }

    fn with_state<T>(f: impl FnOnce(&mut RegistryState) -> Result<T, Error>) -> Result<T, Error> {
        let mut guard = REGISTRY.lock();
        let state = guard.as_mut().ok_or_else(Error::not_initialized)?;
        f(state)
    }

    pub fn create_node(id: &str, description: &str, iface: &str, port: u16) -> Result<(), Error> {
        Self::with_state(|state| {
                let node = Arc::new(Node::new(id, description, iface, port)?);
                state.cursor = Cursor { node: Some(node.id().to_owned()), module: None };
                state.nodes.push(node);
                Ok(())
        })
    }

    pub fn add_module(id: &str) -> Result<(), Error> {
        Self::with_state(|state| {
                let node = state.cursor_node()?;
                node.add_module(Arc::new(Module::new(id)))?;
                state.cursor.module = Some(id.to_owned());
                Ok(())
        })
    }

    pub fn set_add_focus(path: &str) -> Result<(), Error> {
        Self::with_state(|state| {
                let mut parts = path.splitn(2, ':');
                let module = parts.next().unwrap_or_default();
                state.cursor_node()?.module(module).ok_or_else(Error::no_module)?;
                state.cursor.module = Some(module.to_owned());
                Ok(())
        })
    }

    pub fn add_property(name: &str, value: serde_json::Value) -> Result<(), Error> {
        Self::with_state(|state| {
                if state.cursor.module.is_some() {
                    state.cursor_module()?.add_property(name, value).map_err(|d| Error::new(d.kind, d.message))?;
                } else {
                    state.cursor_node()?.add_property(name, value).map_err(|d| Error::new(d.kind, d.message))?;
                }
                Ok(())
        })
    }

    pub fn node_complete() -> Result<Vec<crate::errors::Diagnostic>, Error> {
        Self::with_state(|state| state.cursor_node()?.node_complete())
    }

    pub fn node(id: &str) -> Result<Arc<Node>, Error> {
        Self::with_state(|state| state.node(id).ok_or_else(Error::no_module))
    }

    pub fn module(node_id: &str, module_id: &str) -> Result<Arc<Module>, Error> {
        Self::with_state(|state| {
                state.node(node_id).ok_or_else(Error::no_module)?
                .module(module_id).ok_or_else(Error::no_module)
        })
    }

    /// Out-of-band value push from application code.
    pub fn update_parameter(path: &str, value: Variant, sigma: Option<Variant>, ts: f64) -> Result<(), Error> {
        let mut parts = path.splitn(3, ':');
        let node_id = parts.next().unwrap_or_default();
        let module_id = parts.next().ok_or_else(Error::no_module)?;
        let param = parts.next().ok_or_else(Error::no_param)?;
        let module = Self::module(node_id, module_id)?;
        let ts = if ts.is_nan() || ts <= 0.0 { localtime() } else { ts };
        let payload = module.apply_value(param, value, sigma, ts);
        module.fan_out(param, payload, None);
        Ok(())
    }

    /// Queue a deferred action, coalescing with an existing pending/in-flight
    /// `Read` on the same (module, name).
    pub fn queue_action(
        node: &str,
        module: Arc<Module>,
        name: &str,
        kind: ActionKind,
        payload: Option<Variant>,
        complete: Box<dyn FnOnce(Result<BackendAnswer, Error>) + Send>,
    ) -> Result<u64, Error> {
        Self::with_state(|state| {
                if kind == ActionKind::Read {
                    let key = (module.id().to_owned(), name.to_owned());
                    if let Some(existing) = state.pending.iter_mut().chain(state.in_flight.iter_mut())
                    .find(|e| (e.module.id().to_owned(), e.name.clone()) == key && e.kind == ActionKind::Read) {
                        existing.complete.push(complete);
                        return Ok(existing.id);
                    }
                }
                let id = state.next_action_id;
                state.next_action_id += 1;
                state.pending.push(ActionEntry {
                        id, node: node.to_owned(), module, name: name.to_owned(), kind,
                        payload, created_at: localtime(), complete: vec![complete],
                });
                Ok(id)
        })
    }

    /// Pull the oldest pending action for the polling-mode embedding to
    /// answer out of band.
    pub fn next_stored_action() -> Result<Option<(u64, ActionKind, String, String)>, Error> {
        Self::with_state(|state| {
                if state.pending.is_empty() {
                    return Ok(None);
                }
                let mut entry = state.pending.remove(0);
                entry.created_at = localtime();
                let summary = (entry.id, entry.kind, entry.module.id().to_owned(), entry.name.clone());
                state.in_flight.push(entry);
                Ok(Some(summary))
        })
    }

    /// Deliver the polling-mode embedding's answer.
    pub fn put_answer(id: u64, answer: Result<BackendAnswer, Error>) -> Result<(), Error> {
        let entry = Self::with_state(|state| {
                let pos = state.in_flight.iter().position(|e| e.id == id)
                .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, "no such in-flight action"))?;
                Ok(state.in_flight.remove(pos))
        })?;
        deliver(entry, answer);
        Ok(())
    }

    /// Cancel a single queued/in-flight action without delivering a reply,
    /// used when its owning Worker disconnects.
    /// Frees the parameter's in-flight slot so other requesters aren't
    /// stuck behind a client that is no longer there to receive an answer.
    pub fn cancel_action(id: u64) {
        let entry = REGISTRY.lock().as_mut().and_then(|state| {
                if let Some(pos) = state.pending.iter().position(|e| e.id == id) {
                    return Some(state.pending.remove(pos));
                }
                state.in_flight.iter().position(|e| e.id == id).map(|pos| state.in_flight.remove(pos))
        });
        if let Some(entry) = entry {
            entry.module.end_request(&entry.name);
        }
    }
}

fn deliver(entry: ActionEntry, answer: Result<BackendAnswer, Error>) {
    entry.module.end_request(&entry.name);
    for complete in entry.complete {
        complete(answer.clone());
    }
}

fn spawn_sweeper() {
    std::thread::spawn(move || {
            mlzlog::set_thread_prefix("Registry: ".to_owned());
            loop {
                std::thread::sleep(Duration::from_secs(1));
                if !Registry::is_ready() {
                    return;
                }
                let expired: Vec<ActionEntry> = {
                    let mut guard = REGISTRY.lock();
                    let state = match guard.as_mut() {
                        Some(s) => s,
                        None => return,
                    };
                    let now = localtime();
                    let mut expired = Vec::new();
                    state.pending.retain(|e| {
                            if now - e.created_at > SECOP_POLLING_TIMEOUT {
                                false
                            } else {
                                true
                            }
                    });
                    let mut remaining = Vec::new();
                    for e in state.in_flight.drain(..) {
                        if now - e.created_at > SECOP_POLLING_TIMEOUT {
                            expired.push(e);
                        } else {
                            remaining.push(e);
                        }
                    }
                    state.in_flight = remaining;
                    expired
                };
                for entry in expired {
                    warn!("action {} on {}:{} timed out", entry.id, entry.module.id(), entry.name);
                    deliver(entry, Err(Error::timeout()));
                }
            }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendOutcome;
    use crate::variant::IntegerInfo;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn int_shape(min: i64, max: i64) -> Variant {
        Variant::Integer(IntegerInfo { value: 0, min, max })
    }

    #[test]
    fn calls_before_init_are_not_initialized() {
        Registry::shutdown();
        assert_eq!(Registry::add_module("m").unwrap_err().kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn builder_sequence_creates_node_and_module() {
        Registry::init();
        Registry::create_node("n1", "desc", "0.0.0.0", 2055).unwrap();
        Registry::add_module("m1").unwrap();
        Registry::add_property("description", json!("a module")).ok();
        let module = Registry::module("n1", "m1").unwrap();
        assert_eq!(module.id(), "m1");
        Registry::shutdown();
    }

    #[test]
    fn queue_action_coalesces_reads() {
        Registry::init();
        Registry::create_node("n2", "desc", "0.0.0.0", 2056).unwrap();
        let module = Arc::new(Module::new("m"));
        module.add_readable_parameter("value", int_shape(0, 10),
            Box::new(|_| BackendOutcome::Pending));
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let id1 = Registry::queue_action("n2", module.clone(), "value", ActionKind::Read, None,
            Box::new(move |_| { called.store(true, Ordering::SeqCst); })).unwrap();
        let id2 = Registry::queue_action("n2", module.clone(), "value", ActionKind::Read, None,
            Box::new(move |_| { called2.store(true, Ordering::SeqCst); })).unwrap();
        assert_eq!(id1, id2);
        Registry::shutdown();
    }
}
