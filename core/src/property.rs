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
//! Property storage and the standard-property catalog.

use serde_json::Value;

use crate::errors::{Diagnostic, Error, ErrorKind};

/// Which kind of accessible a property is attached to. Mirrors the four
/// scopes the standard property table is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Node,
    Module,
    Parameter,
    Command,
}

impl Scope {
    fn name(self) -> &'static str {
        match self {
            Scope::Node => "Node",
            Scope::Module => "Module",
            Scope::Parameter => "Parameter",
            Scope::Command => "Command",
        }
    }
}

/// Mandatory level a standard property carries: absence is silently fine,
/// produces a warning, or is an outright error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mandatory {
    Optional = 0,
    Recommended = 1,
    Required = 2,
}

/// The JSON shape a standard property accepts. Most are simple scalars;
/// `Json` covers structured properties (`datainfo`, `interface_class`,
/// `order`) that carry arbitrary nested JSON instead of a `Variant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    String,
    Double,
    Bool,
    Integer,
    Json,
    /// `constant` carries no value of its own; its mere presence flags the
    /// accessible as constant-valued.
    None,
}

struct Rule {
    scope: Scope,
    name: &'static str,
    mandatory: Mandatory,
    types: &'static [PropertyType],
}

/// The standard property table, grounded directly in the
/// original `fillSECoPPropertyList`.
static STANDARD_PROPERTIES: &[Rule] = &[
    // Node
    Rule { scope: Scope::Node, name: "equipment_id", mandatory: Mandatory::Required, types: &[PropertyType::String] },
    Rule { scope: Scope::Node, name: "description", mandatory: Mandatory::Required, types: &[PropertyType::String] },
    Rule { scope: Scope::Node, name: "firmware", mandatory: Mandatory::Optional, types: &[PropertyType::String] },
    Rule { scope: Scope::Node, name: "implementor", mandatory: Mandatory::Optional, types: &[PropertyType::String] },
    Rule { scope: Scope::Node, name: "timeout", mandatory: Mandatory::Optional, types: &[PropertyType::Double] },
    Rule { scope: Scope::Node, name: "order", mandatory: Mandatory::Optional, types: &[PropertyType::Json] },
    // Module
    Rule { scope: Scope::Module, name: "interface_class", mandatory: Mandatory::Required, types: &[PropertyType::Json] },
    Rule { scope: Scope::Module, name: "description", mandatory: Mandatory::Required, types: &[PropertyType::String] },
    Rule { scope: Scope::Module, name: "pollinterval", mandatory: Mandatory::Optional, types: &[PropertyType::Double] },
    Rule { scope: Scope::Module, name: "visibility", mandatory: Mandatory::Optional, types: &[PropertyType::Integer, PropertyType::Double] },
    Rule { scope: Scope::Module, name: "group", mandatory: Mandatory::Optional, types: &[PropertyType::String] },
    Rule { scope: Scope::Module, name: "meaning", mandatory: Mandatory::Optional, types: &[PropertyType::Integer, PropertyType::Double] },
    Rule { scope: Scope::Module, name: "importance", mandatory: Mandatory::Optional, types: &[PropertyType::Integer, PropertyType::Double] },
    Rule { scope: Scope::Module, name: "implementor", mandatory: Mandatory::Optional, types: &[PropertyType::String] },
    Rule { scope: Scope::Module, name: "order", mandatory: Mandatory::Optional, types: &[PropertyType::Json] },
    // Parameter
    Rule { scope: Scope::Parameter, name: "description", mandatory: Mandatory::Required, types: &[PropertyType::String] },
    Rule { scope: Scope::Parameter, name: "datainfo", mandatory: Mandatory::Required, types: &[PropertyType::Json] },
    Rule { scope: Scope::Parameter, name: "constant", mandatory: Mandatory::Optional, types: &[PropertyType::None] },
    Rule { scope: Scope::Parameter, name: "readonly", mandatory: Mandatory::Required, types: &[PropertyType::Bool] },
    Rule { scope: Scope::Parameter, name: "pollinterval", mandatory: Mandatory::Optional, types: &[PropertyType::Double] },
    Rule { scope: Scope::Parameter, name: "visibility", mandatory: Mandatory::Optional, types: &[PropertyType::Integer] },
    Rule { scope: Scope::Parameter, name: "group", mandatory: Mandatory::Optional, types: &[PropertyType::String] },
    // Command
    Rule { scope: Scope::Command, name: "description", mandatory: Mandatory::Required, types: &[PropertyType::String] },
    Rule { scope: Scope::Command, name: "datainfo", mandatory: Mandatory::Required, types: &[PropertyType::Json] },
    Rule { scope: Scope::Command, name: "visibility", mandatory: Mandatory::Optional, types: &[PropertyType::Integer] },
    Rule { scope: Scope::Command, name: "group", mandatory: Mandatory::Optional, types: &[PropertyType::String] },
];

pub struct PropertyCatalog;

impl PropertyCatalog {
    fn lookup(name: &str, scope: Scope) -> Option<&'static Rule> {
        STANDARD_PROPERTIES.iter().find(
            |r| r.scope == scope && r.name.eq_ignore_ascii_case(name))
    }

    /// -1 equivalent: `None` means the property is non-standard (custom).
    pub fn mandatory_level(name: &str, scope: Scope) -> Option<Mandatory> {
        Self::lookup(name, scope).map(|r| r.mandatory)
    }

    pub fn allowed_types(name: &str, scope: Scope) -> &'static [PropertyType] {
        Self::lookup(name, scope).map(|r| r.types).unwrap_or(&[])
    }

    /// All standard property names for a scope, in table order.
    pub fn standard_names(scope: Scope) -> Vec<&'static str> {
        STANDARD_PROPERTIES.iter().filter(|r| r.scope == scope).map(|r| r.name).collect()
    }

    /// Check that `value` matches one of the allowed shapes for a standard
    /// property; custom (non-standard) properties are always accepted,
    /// emitting the `CustomProperty` warning instead.
    pub fn check(name: &str, scope: Scope, value: &Value) -> Result<(), Diagnostic> {
        let rule = match Self::lookup(name, scope) {
            Some(r) => r,
            None => return Err(Diagnostic::new(
                    ErrorKind::CustomProperty,
                    format!("{:?} property {:?} is not a standard property", scope, name))),
        };
        let matches = rule.types.iter().any(|t| match t {
                PropertyType::String => value.is_string(),
                PropertyType::Double => value.is_number(),
                PropertyType::Bool => value.is_boolean(),
                PropertyType::Integer => value.is_i64() || value.is_u64(),
                PropertyType::Json => true,
                PropertyType::None => value.is_null(),
        });
        if matches {
            Ok(())
        } else {
            Err(Diagnostic::new(
                    ErrorKind::InvalidProperty,
                    format!("{} property {:?} has the wrong type", rule.scope.name(), name)))
        }
    }

    /// Diagnostics for missing mandatory/recommended standard properties
    /// that were never supplied.
    pub fn missing(scope: Scope, present: &[&str]) -> Vec<Diagnostic> {
        STANDARD_PROPERTIES.iter()
        .filter(|r| r.scope == scope && r.mandatory != Mandatory::Optional)
        .filter(|r| !present.iter().any(|p| p.eq_ignore_ascii_case(r.name)))
        .map(|r| {
                let kind = if r.mandatory == Mandatory::Required {
                    ErrorKind::MissingMandatory
                } else {
                    ErrorKind::MissingProperties
                };
                Diagnostic::new(kind, format!("{} is missing standard property {:?}", r.scope.name(), r.name))
        })
        .collect()
    }
}

/// A single property slot on a node/module/parameter/command.
///
/// Standard properties that a builder never explicitly set are filled in
/// automatically (`auto = true`) with a sensible placeholder so descriptor
/// JSON is always complete; the first explicit `set_value` call overwrites
/// the placeholder and clears the flag, mirroring
/// `SECoP_S_Property::setValue`.
#[derive(Debug, Clone)]
pub struct Property {
    key: String,
    value: Value,
    auto: bool,
}

impl Property {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), value, auto: false }
    }

    pub fn placeholder(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), value, auto: true }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_auto(&self) -> bool {
        self.auto
    }

    /// Overwrite the value, but only while still a placeholder. Returns an
    /// error (not silently ignored) if the property was already set
    /// explicitly -- callers that want last-write-wins use `force_set`.
    pub fn set_value(&mut self, value: Value) -> Result<(), Error> {
        if self.auto {
            self.value = value;
            self.auto = false;
            Ok(())
        } else {
            Err(Error::new(ErrorKind::NameAlreadyUsed,
                    format!("property {:?} was already explicitly set", self.key)))
        }
    }

    pub fn force_set(&mut self, value: Value) {
        self.value = value;
        self.auto = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mandatory_levels_match_table() {
        assert_eq!(PropertyCatalog::mandatory_level("equipment_id", Scope::Node), Some(Mandatory::Required));
        assert_eq!(PropertyCatalog::mandatory_level("firmware", Scope::Node), Some(Mandatory::Optional));
        assert_eq!(PropertyCatalog::mandatory_level("nonsense", Scope::Node), None);
    }

    #[test]
    fn check_accepts_declared_types() {
        assert!(PropertyCatalog::check("timeout", Scope::Node, &json!(1.5)).is_ok());
        assert!(PropertyCatalog::check("timeout", Scope::Node, &json!("oops")).is_err());
    }

    #[test]
    fn check_flags_custom_property_as_warning() {
        let err = PropertyCatalog::check("favorite_color", Scope::Module, &json!("blue")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CustomProperty);
        assert!(err.is_warning());
    }

    #[test]
    fn missing_mandatory_reported() {
        let diags = PropertyCatalog::missing(Scope::Node, &["firmware"]);
        assert!(diags.iter().any(|d| d.message.contains("equipment_id")));
    }

    #[test]
    fn placeholder_overwritten_once() {
        let mut p = Property::placeholder("description", json!(""));
        assert!(p.is_auto());
        p.set_value(json!("a real description")).unwrap();
        assert!(!p.is_auto());
        assert!(p.set_value(json!("again")).is_err());
    }
}
