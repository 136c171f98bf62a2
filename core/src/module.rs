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
//! A module: an ordered set of parameters and commands, with per-parameter
//! request serialization, change/read/do dispatch, and update fan-out.

use std::collections::HashMap;

use crossbeam_channel::Sender;
use fxhash::FxHashMap;
use log::debug;
use mlzutil::time::localtime;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::accessible::{Command, Parameter};
use crate::backend::{BackendAnswer, BackendOutcome, CommandHandler, Getter, Setter};
use crate::errors::{Error, ErrorKind};
use crate::property::{Property, PropertyCatalog, Scope};
use crate::variant::Variant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessibleKind {
    Parameter,
    Command,
}

/// What `dispatch_*` tells the caller to do next: either the answer is
/// already known, or no handler is registered and the caller (the
/// Registry, via the Worker) must queue an `ActionEntry`.
pub enum Dispatch {
    Ready(Result<BackendAnswer, Error>),
    Queue,
}

struct Subscriber {
    id: u64,
    sender: Sender<String>,
}

struct ModuleInner {
    parameters: Vec<Parameter>,
    commands: Vec<Command>,
    accessibles_order: Vec<(AccessibleKind, String)>,
    properties: Vec<Property>,
    poll_interval: f64,
    getters: FxHashMap<String, Getter>,
    setters: FxHashMap<String, Setter>,
    command_handlers: FxHashMap<String, CommandHandler>,
    /// Per-parameter/command in-flight request id; presence means "busy".
    in_flight: HashMap<String, u64>,
    subscribers: Vec<Subscriber>,
    next_request_id: u64,
}

pub struct Module {
    id: String,
    inner: Mutex<ModuleInner>,
}

impl Module {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id,
            inner: Mutex::new(ModuleInner {
                    parameters: Vec::new(),
                    commands: Vec::new(),
                    accessibles_order: Vec::new(),
                    properties: vec![
                        Property::placeholder("description", Value::String(String::new())),
                        Property::placeholder("interface_class", Value::Array(vec![])),
                    ],
                    poll_interval: crate::registry::SECOP_DEFAULT_POLLINTERVAL,
                    getters: FxHashMap::default(),
                    setters: FxHashMap::default(),
                    command_handlers: FxHashMap::default(),
                    in_flight: HashMap::new(),
                    subscribers: Vec::new(),
                    next_request_id: 1,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // -- builder API -----------------

    pub fn add_readable_parameter(&self, name: &str, shape: Variant, getter: Getter) {
        let mut inner = self.inner.lock();
        let mut p = Parameter::new(name, shape, true);
        p.mark_has_getter();
        inner.parameters.push(p);
        inner.getters.insert(name.to_owned(), getter);
        inner.accessibles_order.push((AccessibleKind::Parameter, name.to_owned()));
    }

    pub fn add_writable_parameter(&self, name: &str, shape: Variant, getter: Getter, setter: Setter) {
        let mut inner = self.inner.lock();
        let mut p = Parameter::new(name, shape, false);
        p.mark_has_getter();
        p.mark_has_setter();
        inner.parameters.push(p);
        inner.getters.insert(name.to_owned(), getter);
        inner.setters.insert(name.to_owned(), setter);
        inner.accessibles_order.push((AccessibleKind::Parameter, name.to_owned()));
    }

    pub fn add_constant_parameter(&self, name: &str, value: Variant) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let p = Parameter::new(name, value.clone(), true).constant(value)?;
        inner.parameters.push(p);
        inner.accessibles_order.push((AccessibleKind::Parameter, name.to_owned()));
        Ok(())
    }

    pub fn add_command(&self, name: &str, arg: Variant, result: Variant, handler: CommandHandler) {
        let mut inner = self.inner.lock();
        let mut c = Command::new(name, arg, result);
        c.mark_has_handler();
        inner.commands.push(c);
        inner.command_handlers.insert(name.to_owned(), handler);
        inner.accessibles_order.push((AccessibleKind::Command, name.to_owned()));
    }

    pub fn add_property(&self, name: &str, value: Value) -> Result<(), crate::errors::Diagnostic> {
        let mut inner = self.inner.lock();
        if name.eq_ignore_ascii_case("pollinterval") {
            if let Some(v) = value.as_f64() {
                inner.poll_interval = v.clamp(0.001, crate::registry::SECOP_MAX_POLLINTERVAL);
            }
        }
        let diag = PropertyCatalog::check(name, Scope::Module, &value).err();
        if let Some(existing) = inner.properties.iter_mut().find(|p| p.key().eq_ignore_ascii_case(name)) {
            existing.force_set(value);
        } else {
            inner.properties.push(Property::new(name, value));
        }
        match diag {
            Some(d) if d.is_warning() => Err(d),
            Some(d) => Err(d),
            None => Ok(()),
        }
    }

    pub fn add_accessible_property(&self, accessible: &str, prop: &str, value: Value) -> Result<(), crate::errors::Diagnostic> {
        let mut inner = self.inner.lock();
        if let Some(p) = inner.parameters.iter_mut().find(|p| p.id() == accessible) {
            return p.add_property(prop, value);
        }
        if let Some(c) = inner.commands.iter_mut().find(|c| c.id() == accessible) {
            return c.add_property(prop, value);
        }
        Err(crate::errors::Diagnostic::new(ErrorKind::InvalidParameter,
                format!("no such accessible {:?}", accessible)))
    }

    pub fn poll_interval(&self) -> f64 {
        self.inner.lock().poll_interval
    }

    pub fn properties(&self) -> Vec<Property> {
        self.inner.lock().properties.clone()
    }

    pub fn accessibles_order(&self) -> Vec<(AccessibleKind, String)> {
        self.inner.lock().accessibles_order.clone()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.inner.lock().parameters.iter().map(|p| p.id().to_owned()).collect()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.inner.lock().commands.iter().map(|c| c.id().to_owned()).collect()
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.inner.lock().parameters.iter().any(|p| p.id() == name)
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.inner.lock().commands.iter().any(|c| c.id() == name)
    }

    pub fn parameter_shape(&self, name: &str) -> Option<Variant> {
        self.inner.lock().parameters.iter().find(|p| p.id() == name).map(|p| p.shape().clone())
    }

    pub fn command_shapes(&self, name: &str) -> Option<(Variant, Variant)> {
        self.inner.lock().commands.iter().find(|c| c.id() == name)
        .map(|c| (c.arg_type().clone(), c.result_type().clone()))
    }

    /// Property keys actually present on a parameter, used by
    /// `node_complete` to check mandatory accessible properties.
    pub fn parameter_property_keys(&self, name: &str) -> Option<Vec<String>> {
        self.inner.lock().parameters.iter().find(|p| p.id() == name)
        .map(|p| p.properties().iter().map(|prop| prop.key().to_owned()).collect())
    }

    /// Property keys actually present on a command, same purpose as above.
    pub fn command_property_keys(&self, name: &str) -> Option<Vec<String>> {
        self.inner.lock().commands.iter().find(|c| c.id() == name)
        .map(|c| c.properties().iter().map(|prop| prop.key().to_owned()).collect())
    }

    /// Invariant check: every non-constant parameter needs a getter,
    /// writable ones need a setter too. Called from `node_complete`.
    pub fn check_handlers(&self) -> Vec<Error> {
        self.inner.lock().parameters.iter()
        .filter_map(|p| p.check_handlers().err())
        .collect()
    }

    /// Full descriptor JSON fragment for this module.
    pub fn describe(&self) -> Value {
        let inner = self.inner.lock();
        let mut obj = serde_json::Map::new();
        for p in &inner.properties {
            obj.insert(p.key().to_owned(), p.value().clone());
        }
        let mut accessibles = serde_json::Map::new();
        for (kind, name) in &inner.accessibles_order {
            let json = match kind {
                AccessibleKind::Parameter => inner.parameters.iter().find(|p| p.id() == name).map(Parameter::describe),
                AccessibleKind::Command => inner.commands.iter().find(|c| c.id() == name).map(Command::describe),
            };
            if let Some(json) = json {
                accessibles.insert(name.clone(), json);
            }
        }
        obj.insert("accessibles".into(), Value::Object(accessibles));
        Value::Object(obj)
    }

    // -- per-parameter request coordination -----------------

    /// Reserve the parameter/command for an in-flight request. `None` means
    /// the caller (Worker) must defer: push a `TodoEntry` and retry later.
    pub fn begin_request(&self, name: &str) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.in_flight.contains_key(name) {
            return None;
        }
        let id = inner.next_request_id;
        inner.next_request_id += 1;
        inner.in_flight.insert(name.to_owned(), id);
        Some(id)
    }

    pub fn end_request(&self, name: &str) {
        self.inner.lock().in_flight.remove(name);
    }

    pub fn is_busy(&self, name: &str) -> bool {
        self.inner.lock().in_flight.contains_key(name)
    }

    // -- dispatch ----------------------

    pub fn dispatch_read(&self, param: &str) -> Result<Dispatch, Error> {
        let inner = self.inner.lock();
        let p = inner.parameters.iter().find(|p| p.id() == param).ok_or_else(Error::no_param)?;
        if p.is_constant() {
            return Ok(Dispatch::Ready(Ok(BackendAnswer::Value {
                            value: p.value().clone(),
                            sigma: p.sigma().cloned(),
                            timestamp: localtime(),
            })));
        }
        match inner.getters.get(param) {
            Some(getter) => Ok(match getter(param) {
                    BackendOutcome::Ready(res) => Dispatch::Ready(res.map(
                            |(v, s, t)| BackendAnswer::Value { value: v, sigma: s, timestamp: t })),
                    BackendOutcome::Pending => Dispatch::Queue,
            }),
            None => Ok(Dispatch::Queue),
        }
    }

    pub fn dispatch_change(&self, param: &str, raw: &str) -> Result<Dispatch, Error> {
        let inner = self.inner.lock();
        let p = inner.parameters.iter().find(|p| p.id() == param).ok_or_else(Error::no_param)?;
        if p.is_constant() || p.is_readonly() {
            return Err(Error::read_only());
        }
        let value = p.shape().import_secop(raw)?;
        match inner.setters.get(param) {
            Some(setter) => Ok(match setter(param, value) {
                    BackendOutcome::Ready(res) => Dispatch::Ready(res.map(
                            |(v, s, t)| BackendAnswer::Value { value: v, sigma: s, timestamp: t })),
                    BackendOutcome::Pending => Dispatch::Queue,
            }),
            None => Ok(Dispatch::Queue),
        }
    }

    pub fn dispatch_do(&self, command: &str, raw: &str) -> Result<Dispatch, Error> {
        let inner = self.inner.lock();
        let c = inner.commands.iter().find(|c| c.id() == command).ok_or_else(Error::no_command)?;
        let arg = if matches!(c.arg_type(), Variant::Null) {
            Variant::Null
        } else {
            c.arg_type().import_secop(raw)?
        };
        match inner.command_handlers.get(command) {
            Some(handler) => Ok(match handler(command, arg) {
                    BackendOutcome::Ready(res) => Dispatch::Ready(res.map(
                            |(v, t)| BackendAnswer::Done { result: v, timestamp: t })),
                    BackendOutcome::Pending => Dispatch::Queue,
            }),
            None => Ok(Dispatch::Queue),
        }
    }

    /// Apply a completed read/change answer to the parameter cache and
    /// build the wire payload `[value, {"t":…, "e":…}]`. Does not fan out;
    /// the caller (Registry/Worker) does that via `fan_out` so the direct
    /// reply and the subscriber broadcast stay consistent.
    pub fn apply_value(&self, param: &str, value: Variant, sigma: Option<Variant>, timestamp: f64) -> Value {
        let mut inner = self.inner.lock();
        if let Some(p) = inner.parameters.iter_mut().find(|p| p.id() == param) {
            p.set_cached(value.clone(), sigma.clone(), timestamp);
        }
        qualified_payload(&value, sigma.as_ref(), timestamp)
    }

    pub fn fan_out(&self, param: &str, payload: Value, except: Option<u64>) {
        let inner = self.inner.lock();
        let line = crate::proto::Msg::Update {
            module: self.id.clone(),
            param: param.to_owned(),
            data: payload,
        }.to_string();
        for sub in &inner.subscribers {
            if Some(sub.id) != except {
                let _ = sub.sender.send(line.clone());
            }
        }
        debug!("fanned out update for {}:{}", self.id, param);
    }

    pub fn subscribe(&self, id: u64, sender: Sender<String>) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.push(Subscriber { id, sender });
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.retain(|s| s.id != id);
    }

    /// Snapshot of every non-constant parameter's cached value, in
    /// accessibles order, used by `activate`.
    pub fn activate_snapshot(&self) -> Vec<(String, Value)> {
        let inner = self.inner.lock();
        inner.accessibles_order.iter()
        .filter(|(kind, _)| *kind == AccessibleKind::Parameter)
        .filter_map(|(_, name)| inner.parameters.iter().find(|p| p.id() == name))
        .filter(|p| !p.is_constant())
        .map(|p| (p.id().to_owned(), qualified_payload(p.value(), p.sigma(), p.timestamp())))
        .collect()
    }
}

pub fn qualified_payload(value: &Variant, sigma: Option<&Variant>, timestamp: f64) -> Value {
    let mut qualifiers = serde_json::Map::new();
    if timestamp.is_finite() {
        qualifiers.insert("t".into(), json!(timestamp));
    }
    if let Some(sigma) = sigma {
        qualifiers.insert("e".into(), sigma.export_json());
    }
    json!([value.export_json(), qualifiers])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::IntegerInfo;

    fn int_shape(min: i64, max: i64) -> Variant {
        Variant::Integer(IntegerInfo { value: 0, min, max })
    }

    #[test]
    fn request_coordination_allows_one_in_flight() {
        let m = Module::new("m");
        m.add_readable_parameter("value", int_shape(0, 10),
            Box::new(|_| BackendOutcome::Ready(Ok((Variant::Integer(IntegerInfo { value: 5, min: 0, max: 10 }), None, 0.0)))));
        let id1 = m.begin_request("value");
        assert!(id1.is_some());
        assert!(m.begin_request("value").is_none());
        m.end_request("value");
        assert!(m.begin_request("value").is_some());
    }

    #[test]
    fn dispatch_read_uses_getter_synchronously() {
        let m = Module::new("m");
        m.add_readable_parameter("value", int_shape(0, 10),
            Box::new(|_| BackendOutcome::Ready(Ok((Variant::Integer(IntegerInfo { value: 7, min: 0, max: 10 }), None, 1.0)))));
        match m.dispatch_read("value").unwrap() {
            Dispatch::Ready(Ok(BackendAnswer::Value { value, .. })) => {
                assert_eq!(value.export_json(), json!(7));
            }
            _ => panic!("expected ready value"),
        }
    }

    #[test]
    fn dispatch_read_without_getter_queues() {
        let inner_only = Module::new("n");
        {
            let mut inner = inner_only.inner.lock();
            inner.parameters.push(Parameter::new("value", int_shape(0, 10), true));
            inner.accessibles_order.push((AccessibleKind::Parameter, "value".into()));
        }
        match inner_only.dispatch_read("value").unwrap() {
            Dispatch::Queue => {}
            _ => panic!("expected queue"),
        }
    }

    #[test]
    fn readonly_parameter_rejects_change() {
        let m = Module::new("m");
        m.add_readable_parameter("value", int_shape(0, 10),
            Box::new(|_| BackendOutcome::Ready(Ok((Variant::Integer(IntegerInfo { value: 0, min: 0, max: 10 }), None, 0.0)))));
        assert!(m.dispatch_change("value", "3").is_err());
    }

    #[test]
    fn activate_snapshot_skips_constants() {
        let m = Module::new("m");
        m.add_readable_parameter("value", int_shape(0, 10),
            Box::new(|_| BackendOutcome::Ready(Ok((Variant::Integer(IntegerInfo { value: 0, min: 0, max: 10 }), None, 0.0)))));
        m.add_constant_parameter("const_value", Variant::Integer(IntegerInfo { value: 1, min: 0, max: 10 })).unwrap();
        let snap = m.activate_snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, "value");
    }
}
