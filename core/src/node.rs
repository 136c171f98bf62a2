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
//! A node: the TCP-bound equipment group that owns modules and freezes
//! into an immutable descriptor via `node_complete`.

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::{json, Value};

use crate::errors::{Diagnostic, Error, ErrorKind};
use crate::module::{AccessibleKind, Module};
use crate::property::{Property, PropertyCatalog, Scope};
use crate::registry::SECOP_DEFAULT_POLLINTERVAL;
use crate::variant::Variant;

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^_?[A-Za-z][0-9A-Za-z_]{0,62}$").expect("valid regex");
    static ref IDLE_RE: Regex = Regex::new(r"(?i)^idle(_.*)?$").expect("valid regex");
    static ref BUSY_RE: Regex = Regex::new(r"(?i)^busy(_.*)?$").expect("valid regex");
}

pub fn valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Building,
    Ready,
    Closed,
}

pub struct Node {
    id: String,
    bind_addr: String,
    port: u16,
    properties: Mutex<Vec<Property>>,
    modules: RwLock<Vec<Arc<Module>>>,
    descriptor: Mutex<Option<Value>>,
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(id: impl Into<String>, description: impl Into<String>, bind_addr: impl Into<String>, port: u16) -> Result<Self, Error> {
        let id = id.into();
        if !valid_name(&id) {
            return Err(Error::new(ErrorKind::InvalidName, format!("{:?} is not a valid name", id)));
        }
        Ok(Self {
                id,
                bind_addr: bind_addr.into(),
                port,
                properties: Mutex::new(vec![
                        Property::new("description", Value::String(description.into())),
                        Property::placeholder("equipment_id", Value::String(String::new())),
                        Property::placeholder("firmware", json!("secop-rs")),
                        Property::placeholder("implementor", Value::Null),
                        Property::placeholder("timeout", json!(10.0)),
                ]),
                modules: RwLock::new(Vec::new()),
                descriptor: Mutex::new(None),
                state: Mutex::new(NodeState::Building),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == NodeState::Ready
    }

    pub fn descriptor(&self) -> Option<Value> {
        self.descriptor.lock().clone()
    }

    fn assert_building(&self) -> Result<(), Error> {
        if *self.state.lock() != NodeState::Building {
            return Err(Error::new(ErrorKind::InvalidNode, "node is no longer mutable"));
        }
        Ok(())
    }

    pub fn add_module(&self, module: Arc<Module>) -> Result<(), Error> {
        self.assert_building()?;
        if !valid_name(module.id()) {
            return Err(Error::new(ErrorKind::InvalidName, format!("{:?} is not a valid name", module.id())));
        }
        self.modules.write().push(module);
        Ok(())
    }

    pub fn add_property(&self, name: &str, value: Value) -> Result<(), Diagnostic> {
        if self.assert_building().is_err() {
            return Err(Diagnostic::new(ErrorKind::InvalidNode, "node is no longer mutable"));
        }
        let diag = PropertyCatalog::check(name, Scope::Node, &value).err();
        let mut props = self.properties.lock();
        if let Some(existing) = props.iter_mut().find(|p| p.key().eq_ignore_ascii_case(name)) {
            existing.force_set(value);
        } else {
            props.push(Property::new(name, value));
        }
        match diag {
            Some(d) if d.is_warning() => Err(d),
            Some(d) => Err(d),
            None => Ok(()),
        }
    }

    pub fn module(&self, id: &str) -> Option<Arc<Module>> {
        self.modules.read().iter().find(|m| m.id() == id).cloned()
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.read().clone()
    }

    /// Freezes the node: validates standard properties, synthesizes/
    /// validates `order`, checks `interface_class` structural requirements,
    /// then builds and publishes the descriptor JSON.
    pub fn node_complete(&self) -> Result<Vec<Diagnostic>, Error> {
        self.assert_building()?;
        let mut diagnostics = Vec::new();

        {
            let props = self.properties.lock();
            diagnostics.extend(PropertyCatalog::missing(Scope::Node,
                    &props.iter().map(Property::key).collect::<Vec<_>>()));
        }

        self.validate_order(&mut diagnostics)?;

        let modules = self.modules.read().clone();
        for module in &modules {
            let present: Vec<String> = module.properties().iter().map(|p| p.key().to_owned()).collect();
            let present_refs: Vec<&str> = present.iter().map(String::as_str).collect();
            diagnostics.extend(PropertyCatalog::missing(Scope::Module, &present_refs));
            diagnostics.extend(self.check_interface_class(module));
            for err in module.check_handlers() {
                diagnostics.push(Diagnostic::new(err.kind(), err.message().to_owned()));
            }
            for (kind, name) in module.accessibles_order() {
                let present: Vec<String> = match kind {
                    AccessibleKind::Parameter => module.parameter_property_keys(&name).unwrap_or_default(),
                    AccessibleKind::Command => module.command_property_keys(&name).unwrap_or_default(),
                };
                let scope = match kind {
                    AccessibleKind::Parameter => Scope::Parameter,
                    AccessibleKind::Command => Scope::Command,
                };
                let refs: Vec<&str> = present.iter().map(String::as_str).collect();
                diagnostics.extend(PropertyCatalog::missing(scope, &refs));
            }
        }

        if diagnostics.iter().any(|d| !d.is_warning()) {
            let joined = diagnostics.iter().filter(|d| !d.is_warning())
            .map(|d| d.message.clone()).collect::<Vec<_>>().join("; ");
            return Err(Error::new(ErrorKind::InvalidProperty, joined));
        }

        let descriptor = self.build_descriptor();
        *self.descriptor.lock() = Some(descriptor);
        *self.state.lock() = NodeState::Ready;
        self.start_polling();

        for d in &diagnostics {
            warn!("node {}: {}", self.id, d);
        }
        Ok(diagnostics)
    }

    fn validate_order(&self, diagnostics: &mut Vec<Diagnostic>) -> Result<(), Error> {
        let modules = self.modules.read();
        let mut ids: Vec<String> = modules.iter().map(|m| m.id().to_owned()).collect();
        let mut props = self.properties.lock();
        if let Some(order_prop) = props.iter_mut().find(|p| p.key().eq_ignore_ascii_case("order")) {
            if order_prop.is_auto() {
                let _ = order_prop.set_value(json!(ids));
            } else {
                let declared = order_prop.value().as_array()
                .map(|a| a.iter().filter_map(Value::as_str).map(str::to_owned).collect::<Vec<_>>());
                match declared {
                    Some(declared) if is_permutation(&declared, &ids) => {}
                    _ => {
                        diagnostics.push(Diagnostic::new(ErrorKind::InvalidProperty,
                                "node order is not a permutation of module ids".into()));
                        ids.sort();
                    }
                }
            }
        } else {
            props.push(Property::new("order", json!(ids)));
        }
        Ok(())
    }

    fn check_interface_class(&self, module: &Module) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let classes: Vec<String> = module.properties().iter()
        .find(|p| p.key().eq_ignore_ascii_case("interface_class"))
        .and_then(|p| p.value().as_array().map(|a| a.iter().filter_map(Value::as_str).map(str::to_owned).collect()))
        .unwrap_or_default();
        if classes.is_empty() {
            return diagnostics;
        }
        let readable = classes.iter().any(|c| c.eq_ignore_ascii_case("readable"))
        || classes.iter().any(|c| c.eq_ignore_ascii_case("writable"))
        || classes.iter().any(|c| c.eq_ignore_ascii_case("drivable"));
        let writable = classes.iter().any(|c| c.eq_ignore_ascii_case("writable") || c.eq_ignore_ascii_case("drivable"));
        let drivable = classes.iter().any(|c| c.eq_ignore_ascii_case("drivable"));

        if readable {
            if !module.has_parameter("value") {
                diagnostics.push(Diagnostic::new(ErrorKind::InvalidModule,
                        format!("module {:?} is readable but has no \"value\" parameter", module.id())));
            }
            match module.parameter_shape("status") {
                Some(Variant::Tuple(items)) if items.len() == 2 => {
                    if let Variant::Enum(e) = &items[0] {
                        if !status_has_idle(e) {
                            diagnostics.push(Diagnostic::new(ErrorKind::InvalidModule,
                                    format!("module {:?} status enum has no idle-like member", module.id())));
                        }
                        if drivable && !status_has_busy(e) {
                            diagnostics.push(Diagnostic::new(ErrorKind::InvalidModule,
                                    format!("module {:?} status enum has no busy-like member", module.id())));
                        }
                    } else {
                        diagnostics.push(Diagnostic::new(ErrorKind::InvalidModule,
                                format!("module {:?} status tuple's first member must be an enum", module.id())));
                    }
                    if !matches!(&items[1], Variant::Str(_)) {
                        diagnostics.push(Diagnostic::new(ErrorKind::InvalidModule,
                                format!("module {:?} status tuple's second member must be a string", module.id())));
                    }
                }
                _ => diagnostics.push(Diagnostic::new(ErrorKind::InvalidModule,
                        format!("module {:?} is readable but has no status Tuple(Enum,String)", module.id()))),
            }
        }
        if writable && !module.has_parameter("target") {
            diagnostics.push(Diagnostic::new(ErrorKind::InvalidModule,
                    format!("module {:?} is writable but has no \"target\" parameter", module.id())));
        }
        if drivable && !module.has_command("stop") {
            diagnostics.push(Diagnostic::new(ErrorKind::InvalidModule,
                    format!("module {:?} is drivable but has no \"stop\" command", module.id())));
        }
        diagnostics
    }

    fn build_descriptor(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for p in self.properties.lock().iter() {
            obj.insert(p.key().to_owned(), p.value().clone());
        }
        let mut modules = serde_json::Map::new();
        for module in self.modules.read().iter() {
            modules.insert(module.id().to_owned(), module.describe());
        }
        obj.insert("modules".into(), Value::Object(modules));
        Value::Object(obj)
    }

    /// Minimal per-module poll loop: periodically
    /// re-reads every non-constant parameter that has a getter, so cached
    /// values stay fresh for subscribers even without client-driven reads.
    fn start_polling(&self) {
        for module in self.modules.read().iter() {
            let module = Arc::clone(module);
            let interval = module.poll_interval().max(0.05).min(SECOP_DEFAULT_POLLINTERVAL * 3600.0);
            std::thread::spawn(move || {
                    mlzlog::set_thread_prefix(format!("[{}-poll] ", module.id()));
                    loop {
                        std::thread::sleep(Duration::from_secs_f64(interval));
                        for name in module.parameter_names() {
                            if module.is_busy(&name) {
                                continue;
                            }
                            if let Ok(crate::module::Dispatch::Ready(Ok(crate::backend::BackendAnswer::Value { value, sigma, timestamp }))) = module.dispatch_read(&name) {
                                let payload = module.apply_value(&name, value, sigma, timestamp);
                                module.fan_out(&name, payload, None);
                            }
                        }
                        debug!("poll tick for module {}", module.id());
                    }
            });
        }
    }
}

fn is_permutation(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

fn status_has_idle(e: &crate::variant::EnumInfo) -> bool {
    e.members.iter().any(|(name, code)| IDLE_RE.is_match(name) || (100..200).contains(code))
}

fn status_has_busy(e: &crate::variant::EnumInfo) -> bool {
    e.members.iter().any(|(name, code)| BUSY_RE.is_match(name) || (300..400).contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendOutcome;
    use crate::variant::IntegerInfo;

    fn int_shape(min: i64, max: i64) -> Variant {
        Variant::Integer(IntegerInfo { value: 0, min, max })
    }

    #[test]
    fn name_validation() {
        assert!(valid_name("motor1"));
        assert!(valid_name("_internal"));
        assert!(!valid_name("1motor"));
        assert!(!valid_name(""));
    }

    #[test]
    fn minimal_node_completes() {
        let node = Node::new("n", "desc", "0.0.0.0", 2055).unwrap();
        node.add_property("equipment_id", json!("n")).ok();
        let m = Arc::new(Module::new("m"));
        m.add_property("description", json!("only")).ok();
        m.add_readable_parameter("value", int_shape(0, 10),
            Box::new(|_| BackendOutcome::Ready(Ok((Variant::Integer(IntegerInfo { value: 3, min: 0, max: 10 }), None, 0.0)))));
        node.add_module(m).unwrap();
        let diags = node.node_complete().unwrap();
        assert!(diags.iter().all(|d| d.is_warning()));
        assert!(node.is_ready());
        let desc = node.descriptor().unwrap();
        assert_eq!(desc["modules"]["m"]["accessibles"]["value"]["datainfo"]["type"], "int");
    }

    #[test]
    fn readable_without_value_parameter_errors() {
        let node = Node::new("n", "desc", "0.0.0.0", 2055).unwrap();
        node.add_property("equipment_id", json!("n")).ok();
        let m = Arc::new(Module::new("m"));
        m.add_property("description", json!("only")).ok();
        m.add_property("interface_class", json!(["readable"])).ok();
        node.add_module(m).unwrap();
        assert!(node.node_complete().is_err());
    }
}
