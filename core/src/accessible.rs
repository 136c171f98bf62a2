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
//! Accessible leaves: `Parameter` and `Command`.

use serde_json::Value;

use crate::errors::Error;
use crate::property::{Property, PropertyCatalog, Scope};
use crate::variant::Variant;

/// A parameter: a cached value slot, optionally writable, optionally backed
/// by a getter/setter.
#[derive(Debug, Clone)]
pub struct Parameter {
    id: String,
    value: Variant,
    sigma: Option<Variant>,
    timestamp: f64,
    readonly: bool,
    constant: bool,
    has_getter: bool,
    has_setter: bool,
    properties: Vec<Property>,
}

impl Parameter {
    pub fn new(id: impl Into<String>, shape: Variant, readonly: bool) -> Self {
        let id = id.into();
        let mut properties = vec![
            Property::placeholder("description", Value::String(String::new())),
            Property::new("datainfo", shape.describe_datainfo()),
            Property::new("readonly", Value::Bool(readonly)),
        ];
        properties.dedup_by(|a, b| a.key() == b.key());
        Self {
            id,
            value: shape,
            sigma: None,
            timestamp: f64::NAN,
            readonly,
            constant: false,
            has_getter: false,
            has_setter: false,
            properties,
        }
    }

    pub fn constant(mut self, value: Variant) -> Result<Self, Error> {
        self.constant = true;
        self.readonly = true;
        self.value = value;
        self.timestamp = f64::NAN;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub fn shape(&self) -> &Variant {
        &self.value
    }

    pub fn value(&self) -> &Variant {
        &self.value
    }

    pub fn sigma(&self) -> Option<&Variant> {
        self.sigma.as_ref()
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn mark_has_getter(&mut self) {
        self.has_getter = true;
    }

    pub fn mark_has_setter(&mut self) {
        self.has_setter = true;
    }

    /// Validates the "a parameter requires a getter unless constant; a
    /// writable parameter requires a setter unless constant" invariant.
    pub fn check_handlers(&self) -> Result<(), Error> {
        if self.constant {
            return Ok(());
        }
        if !self.has_getter {
            return Err(Error::new(crate::errors::ErrorKind::NoGetter,
                    format!("parameter {:?} has no getter", self.id)));
        }
        if !self.readonly && !self.has_setter {
            return Err(Error::new(crate::errors::ErrorKind::NoSetter,
                    format!("parameter {:?} is writable but has no setter", self.id)));
        }
        Ok(())
    }

    pub fn set_cached(&mut self, value: Variant, sigma: Option<Variant>, timestamp: f64) {
        self.value = value;
        self.sigma = sigma;
        self.timestamp = timestamp;
    }

    pub fn add_property(&mut self, name: &str, value: Value) -> Result<(), crate::errors::Diagnostic> {
        add_scoped_property(&mut self.properties, name, value, Scope::Parameter)
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Descriptor JSON fragment: `{"<prop>": …, "datainfo": …}`.
    pub fn describe(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for p in &self.properties {
            if p.key() == "datainfo" {
                obj.insert(p.key().to_owned(), self.value.describe_datainfo());
            } else {
                obj.insert(p.key().to_owned(), p.value().clone());
            }
        }
        Value::Object(obj)
    }
}

/// A command: argument/result shapes derived from its `datainfo` property.
#[derive(Debug, Clone)]
pub struct Command {
    id: String,
    arg_type: Variant,
    result_type: Variant,
    has_handler: bool,
    properties: Vec<Property>,
}

impl Command {
    pub fn new(id: impl Into<String>, arg_type: Variant, result_type: Variant) -> Self {
        let id = id.into();
        let datainfo = Variant::Command {
            arg: Box::new(arg_type.clone()),
            result: Box::new(result_type.clone()),
        };
        let properties = vec![
            Property::placeholder("description", Value::String(String::new())),
            Property::new("datainfo", datainfo.describe_datainfo()),
        ];
        Self { id, arg_type, result_type, has_handler: false, properties }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn arg_type(&self) -> &Variant {
        &self.arg_type
    }

    pub fn result_type(&self) -> &Variant {
        &self.result_type
    }

    pub fn mark_has_handler(&mut self) {
        self.has_handler = true;
    }

    pub fn has_handler(&self) -> bool {
        self.has_handler
    }

    pub fn add_property(&mut self, name: &str, value: Value) -> Result<(), crate::errors::Diagnostic> {
        add_scoped_property(&mut self.properties, name, value, Scope::Command)
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn describe(&self) -> Value {
        let datainfo = Variant::Command {
            arg: Box::new(self.arg_type.clone()),
            result: Box::new(self.result_type.clone()),
        };
        let mut obj = serde_json::Map::new();
        for p in &self.properties {
            if p.key() == "datainfo" {
                obj.insert(p.key().to_owned(), datainfo.describe_datainfo());
            } else {
                obj.insert(p.key().to_owned(), p.value().clone());
            }
        }
        Value::Object(obj)
    }
}

/// Shared `add_property` plumbing for both accessible kinds: looks the name
/// up in `PropertyCatalog`, records a warning-level `Diagnostic` for
/// custom/mismatched properties rather than failing outright, and either
/// updates an existing placeholder or appends a new entry.
fn add_scoped_property(
    properties: &mut Vec<Property>,
    name: &str,
    value: Value,
    scope: Scope,
) -> Result<(), crate::errors::Diagnostic> {
    let diag = PropertyCatalog::check(name, scope, &value).err();
    if let Some(existing) = properties.iter_mut().find(|p| p.key().eq_ignore_ascii_case(name)) {
        existing.force_set(value);
    } else {
        properties.push(Property::new(name, value));
    }
    match diag {
        Some(d) if d.is_warning() => Err(d),
        Some(d) => Err(d),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::IntegerInfo;

    fn int_shape(min: i64, max: i64) -> Variant {
        Variant::Integer(IntegerInfo { value: 0, min, max })
    }

    #[test]
    fn constant_parameter_is_readonly() {
        let p = Parameter::new("value", int_shape(0, 10), false)
        .constant(int_shape(0, 10)).unwrap();
        assert!(p.is_readonly());
        assert!(p.is_constant());
        assert!(p.check_handlers().is_ok());
    }

    #[test]
    fn non_constant_parameter_requires_getter() {
        let p = Parameter::new("value", int_shape(0, 10), true);
        assert!(p.check_handlers().is_err());
    }

    #[test]
    fn writable_parameter_requires_setter() {
        let mut p = Parameter::new("target", int_shape(0, 10), false);
        p.mark_has_getter();
        assert!(p.check_handlers().is_err());
        p.mark_has_setter();
        assert!(p.check_handlers().is_ok());
    }

    #[test]
    fn command_describe_includes_datainfo() {
        let cmd = Command::new("stop", Variant::Null, Variant::Null);
        let json = cmd.describe();
        assert_eq!(json["datainfo"]["type"], "command");
    }
}
