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
// Enrico Faulhaber <enrico.faulhaber@frm2.tum.de>
//
// -----------------------------------------------------------------------------
//
//! SECoP datainfo/value type system.
//!
//! Unlike a compile-time `TypeInfo<Repr>` hierarchy, a SECoP server builds
//! its module tree at runtime from client-agnostic, dynamically supplied
//! `datainfo` JSON, so the shape and the value have to live in the same
//! dynamic object. `Variant` is a tagged union that carries both: the
//! shape (unit, bounds, member layout, …) is fixed when the variant is
//! constructed, and every subsequent import is checked against it.

use std::collections::HashSet;
use regex::Regex;
use serde_json::{json, Value};
use lazy_static::lazy_static;

use crate::errors::Error;

lazy_static! {
    static ref FMTSTR_RE: Regex = Regex::new(r"^%\.\d+[feg]$").expect("valid regex");
}

/// Rounds to the nearest integer, ties to even -- the rounding rule used
/// for `Scaled` import.
fn round_ties_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if diff < 0.5 {
        floor
    } else if diff > 0.5 {
        floor + 1.0
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoubleInfo {
    pub value: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub unit: Option<String>,
    pub fmtstr: Option<String>,
    pub absolute_resolution: Option<f64>,
    pub relative_resolution: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaledInfo {
    pub value: f64, // logical (already multiplied by scale) value
    pub scale: f64,
    pub min: i64,
    pub max: i64,
    pub unit: Option<String>,
    pub fmtstr: Option<String>,
    pub absolute_resolution: Option<f64>,
    pub relative_resolution: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegerInfo {
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumInfo {
    pub value: i64,
    /// Declaration-order member list; small enough that linear lookup beats
    /// pulling in a map crate just for this.
    pub members: Vec<(String, i64)>,
}

impl EnumInfo {
    pub fn code_for(&self, name: &str) -> Option<i64> {
        self.members.iter().find(|(n, _)| n == name).map(|(_, c)| *c)
    }
    pub fn name_for(&self, code: i64) -> Option<&str> {
        self.members.iter().find(|(_, c)| *c == code).map(|(n, _)| n.as_str())
    }
    pub fn has_code(&self, code: i64) -> bool {
        self.members.iter().any(|(_, c)| *c == code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringInfo {
    pub value: String,
    pub min_chars: usize,
    pub max_chars: usize,
    pub is_utf8: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobInfo {
    pub value: Vec<u8>,
    pub min_bytes: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayInfo {
    pub values: Vec<Variant>,
    pub member_shape: Box<Variant>,
    pub min_len: usize,
    pub max_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructInfo {
    pub members: Vec<(String, Variant)>,
    pub optional: HashSet<String>,
}

/// The closed sum type of every datainfo/value shape a SECoP accessible
/// can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Null,
    Double(DoubleInfo),
    Integer(IntegerInfo),
    Bool(bool),
    Enum(EnumInfo),
    Scaled(ScaledInfo),
    Str(StringInfo),
    Blob(BlobInfo),
    /// Freeform JSON document stored as its parsed form; round-trips
    /// textually rather than by type-checked shape.
    Json(Value),
    Array(ArrayInfo),
    Tuple(Vec<Variant>),
    Struct(StructInfo),
    /// Only legal as a property value (a command's datainfo), never as a
    /// transported parameter/command-argument value.
    Command { arg: Box<Variant>, result: Box<Variant> },
}

impl Variant {
    pub fn double() -> DoubleInfo {
        DoubleInfo { value: 0.0, min: None, max: None, unit: None, fmtstr: None,
            absolute_resolution: None, relative_resolution: None }
    }

    pub fn integer() -> IntegerInfo {
        IntegerInfo { value: 0, min: i64::MIN, max: i64::MAX }
    }

    /// The wire `"type"` discriminant (also used by `PropertyCatalog` for
    /// the "allowed kinds" check).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Variant::Null => "null",
            Variant::Double(_) => "double",
            Variant::Integer(_) => "int",
            Variant::Bool(_) => "bool",
            Variant::Enum(_) => "enum",
            Variant::Scaled(_) => "scaled",
            Variant::Str(_) => "string",
            Variant::Blob(_) => "blob",
            Variant::Json(_) => "json",
            Variant::Array(_) => "array",
            Variant::Tuple(_) => "tuple",
            Variant::Struct(_) => "struct",
            Variant::Command {.. } => "command",
        }
    }

    /// Deep clone preserving shape. `Variant` already derives `Clone`,
    /// which is always a deep clone since there are no shared/interior-
    /// mutable fields; kept as a named method for readability at call sites.
    pub fn duplicate(&self) -> Variant {
        self.clone()
    }

    /// Range/shape self-check on the currently held value.
    pub fn is_valid(&self) -> bool {
        match self {
            Variant::Null | Variant::Bool(_) | Variant::Json(_) | Variant::Command {.. } => true,
            Variant::Double(d) => in_bounds(d.value, d.min, d.max) || d.value.is_nan(),
            Variant::Scaled(s) => {
                let scaled = (s.value / s.scale).round() as i64;
                scaled >= s.min && scaled <= s.max
            }
            Variant::Integer(i) => i.value >= i.min && i.value <= i.max,
            Variant::Enum(e) => e.has_code(e.value),
            Variant::Str(s) => s.value.len() >= s.min_chars && s.value.len() <= s.max_chars,
            Variant::Blob(b) => b.value.len() >= b.min_bytes && b.value.len() <= b.max_bytes,
            Variant::Array(a) => a.values.len() >= a.min_len && a.values.len() <= a.max_len
            && a.values.iter().all(Variant::is_valid),
            Variant::Tuple(items) => items.iter().all(Variant::is_valid),
            Variant::Struct(s) => s.members.iter().all(|(_, v)| v.is_valid()),
        }
    }

    // -- datainfo (shape) construction --------------------------------

    /// Parse a `datainfo` JSON object into a shape-only `Variant` (value
    /// defaulted). `Command` is only accepted when `at_root` is set, since
    /// a command's argument/result shapes are never themselves nested
    /// inside another value.
    pub fn from_datainfo(doc: &Value, at_root: bool) -> Result<Variant, Error> {
        let obj = doc.as_object().ok_or_else(|| Error::bad_value("datainfo must be a JSON object"))?;
        let ty = obj.get("type").and_then(Value::as_str)
        .ok_or_else(|| Error::bad_value("datainfo missing \"type\""))?;

        let get_f64 = |key: &str| obj.get(key).and_then(Value::as_f64);
        let get_i64 = |key: &str| obj.get(key).and_then(Value::as_i64);
        let get_str = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_owned);
        let get_usize = |key: &str, default: usize| obj.get(key).and_then(Value::as_u64)
        .map(|v| v as usize).unwrap_or(default);

        Ok(match ty {
                "double" => Variant::Double(DoubleInfo {
                        value: 0.0,
                        min: get_f64("min"),
                        max: get_f64("max"),
                        unit: get_str("unit"),
                        fmtstr: get_str("fmtstr"),
                        absolute_resolution: get_f64("absolute_resolution"),
                        relative_resolution: get_f64("relative_resolution"),
                }),
                "scaled" => {
                    let scale = get_f64("scale").ok_or_else(|| Error::bad_value("scaled requires \"scale\""))?;
                    Variant::Scaled(ScaledInfo {
                            value: 0.0,
                            scale,
                            min: get_i64("min").unwrap_or(i64::MIN),
                            max: get_i64("max").unwrap_or(i64::MAX),
                            unit: get_str("unit"),
                            fmtstr: get_str("fmtstr"),
                            absolute_resolution: get_f64("absolute_resolution"),
                            relative_resolution: get_f64("relative_resolution"),
                    })
                }
                "int" => Variant::Integer(IntegerInfo {
                        value: 0,
                        min: get_i64("min").unwrap_or(i64::MIN),
                        max: get_i64("max").unwrap_or(i64::MAX),
                }),
                "bool" => Variant::Bool(false),
                "enum" => {
                    let members_obj = obj.get("members").and_then(Value::as_object)
                    .ok_or_else(|| Error::bad_value("enum requires \"members\""))?;
                    let mut members: Vec<(String, i64)> = members_obj.iter()
                    .map(|(k, v)| Ok((k.clone(), v.as_i64().ok_or_else(
                                    || Error::bad_value("enum member code must be an integer"))?)))
                    .collect::<Result<_, Error>>()?;
                    members.sort_by_key(|(_, code)| *code);
                    let value = members.first().map(|(_, c)| *c).unwrap_or(0);
                    Variant::Enum(EnumInfo { value, members })
                }
                "string" => Variant::Str(StringInfo {
                        value: String::new(),
                        min_chars: get_usize("minchars", 0),
                        max_chars: get_usize("maxchars", 1024),
                        is_utf8: obj.get("isUTF8").and_then(Value::as_bool).unwrap_or(false),
                }),
                "blob" => Variant::Blob(BlobInfo {
                        value: Vec::new(),
                        min_bytes: get_usize("minbytes", 0),
                        max_bytes: get_usize("maxbytes", 1024),
                }),
                "json" => Variant::Json(Value::Null),
                "array" => {
                    let members = obj.get("members")
                    .ok_or_else(|| Error::bad_value("array requires \"members\""))?;
                    let member_shape = Variant::from_datainfo(members, false)?;
                    Variant::Array(ArrayInfo {
                            values: Vec::new(),
                            member_shape: Box::new(member_shape),
                            min_len: get_usize("minlen", 0),
                            max_len: get_usize("maxlen", usize::MAX),
                    })
                }
                "tuple" => {
                    let members = obj.get("members").and_then(Value::as_array)
                    .ok_or_else(|| Error::bad_value("tuple requires \"members\" array"))?;
                    let parsed = members.iter()
                    .map(|m| Variant::from_datainfo(m, false))
                    .collect::<Result<Vec<_>, Error>>()?;
                    Variant::Tuple(parsed)
                }
                "struct" => {
                    let members_obj = obj.get("members").and_then(Value::as_object)
                    .ok_or_else(|| Error::bad_value("struct requires \"members\""))?;
                    let mut members = Vec::new();
                    for (name, shape) in members_obj {
                        members.push((name.clone(), Variant::from_datainfo(shape, false)?));
                    }
                    let optional = obj.get("optional").and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_owned).collect())
                    .unwrap_or_default();
                    Variant::Struct(StructInfo { members, optional })
                }
                "command" => {
                    if !at_root {
                        return Err(Error::bad_value("command type only valid at property root"));
                    }
                    let argument = match obj.get("argument") {
                        Some(Value::Null) | None => Variant::Null,
                        Some(v) => Variant::from_datainfo(v, false)?,
                    };
                    let result = match obj.get("result") {
                        Some(Value::Null) | None => Variant::Null,
                        Some(v) => Variant::from_datainfo(v, false)?,
                    };
                    Variant::Command { arg: Box::new(argument), result: Box::new(result) }
                }
                other => return Err(Error::bad_value(format!("unknown datainfo type {:?}", other))),
        })
    }

    /// The shape description, as it appears under `"datainfo"` in the
    /// descriptor JSON.
    pub fn describe_datainfo(&self) -> Value {
        match self {
            Variant::Null => json!({"type": "null"}),
            Variant::Double(d) => {
                let mut m = json!({"type": "double"});
                put_opt(&mut m, "min", d.min.map(|v| json!(v)));
                put_opt(&mut m, "max", d.max.map(|v| json!(v)));
                put_opt(&mut m, "unit", d.unit.clone().map(Value::String));
                put_opt(&mut m, "fmtstr", d.fmtstr.clone().map(Value::String));
                put_opt(&mut m, "absolute_resolution", d.absolute_resolution.map(|v| json!(v)));
                put_opt(&mut m, "relative_resolution", d.relative_resolution.map(|v| json!(v)));
                m
            }
            Variant::Scaled(s) => {
                let mut m = json!({"type": "scaled", "scale": s.scale, "min": s.min, "max": s.max});
                put_opt(&mut m, "unit", s.unit.clone().map(Value::String));
                put_opt(&mut m, "fmtstr", s.fmtstr.clone().map(Value::String));
                put_opt(&mut m, "absolute_resolution", s.absolute_resolution.map(|v| json!(v)));
                put_opt(&mut m, "relative_resolution", s.relative_resolution.map(|v| json!(v)));
                m
            }
            Variant::Integer(i) => json!({"type": "int", "min": i.min, "max": i.max}),
            Variant::Bool(_) => json!({"type": "bool"}),
            Variant::Enum(e) => {
                let members: serde_json::Map<_, _> = e.members.iter()
                .map(|(n, c)| (n.clone(), json!(c))).collect();
                json!({"type": "enum", "members": members})
            }
            Variant::Str(s) => {
                let mut m = json!({"type": "string", "maxchars": s.max_chars});
                if s.min_chars > 0 {
                    m["minchars"] = json!(s.min_chars);
                }
                if s.is_utf8 {
                    m["isUTF8"] = json!(true);
                }
                m
            }
            Variant::Blob(b) => {
                let mut m = json!({"type": "blob", "maxbytes": b.max_bytes});
                if b.min_bytes > 0 {
                    m["minbytes"] = json!(b.min_bytes);
                }
                m
            }
            Variant::Json(_) => json!({"type": "json"}),
            Variant::Array(a) => json!({
                    "type": "array",
                    "minlen": a.min_len,
                    "maxlen": a.max_len,
                    "members": a.member_shape.describe_datainfo(),
            }),
            Variant::Tuple(items) => json!({
                    "type": "tuple",
                    "members": items.iter().map(Variant::describe_datainfo).collect::<Vec<_>>(),
            }),
            Variant::Struct(s) => {
                let members: serde_json::Map<_, _> = s.members.iter()
                .map(|(n, v)| (n.clone(), v.describe_datainfo())).collect();
                let mut m = json!({"type": "struct", "members": members});
                if !s.optional.is_empty() {
                    let mut opt: Vec<_> = s.optional.iter().cloned().collect();
                    opt.sort();
                    m["optional"] = json!(opt);
                }
                m
            }
            Variant::Command { arg, result } => json!({
                    "type": "command",
                    "argument": if matches!(**arg, Variant::Null) { Value::Null } else { arg.describe_datainfo() },
                    "result": if matches!(**result, Variant::Null) { Value::Null } else { result.describe_datainfo() },
            }),
        }
    }

    // -- value import/export -------------------------------------------

    /// Parse SECoP wire text (raw JSON, possibly unquoted garbage) into a
    /// new `Variant` of the same shape as `self`. Fails closed: any
    /// structural mismatch is `InvalidValue`, never a silently-wrong tag.
    pub fn import_secop(&self, text: &str) -> Result<Variant, Error> {
        let value: Value = serde_json::from_str(text)
        .map_err(|_| Error::bad_value(format!("invalid JSON: {}", text)))?;
        self.import_json(&value)
    }

    pub fn import_json(&self, val: &Value) -> Result<Variant, Error> {
        match self {
            Variant::Null => {
                if val.is_null() { Ok(Variant::Null) } else { Err(Error::bad_value("expected null")) }
            }
            Variant::Bool(_) => {
                val.as_bool().map(Variant::Bool).ok_or_else(|| Error::bad_value("expected boolean"))
            }
            Variant::Double(d) => {
                let v = parse_double_ish(val).ok_or_else(|| Error::bad_value("expected double"))?;
                if !v.is_nan() && !v.is_infinite() && !in_bounds(v, d.min, d.max) {
                    return Err(Error::bad_value(format!(
                                "expected double in range [{:?}, {:?}]", d.min, d.max)));
                }
                Ok(Variant::Double(DoubleInfo { value: v, ..d.clone() }))
            }
            Variant::Scaled(s) => {
                let raw = val.as_f64().ok_or_else(|| Error::bad_value("expected number"))?;
                let scaled = round_ties_even(raw / s.scale) as i64;
                if scaled < s.min || scaled > s.max {
                    return Err(Error::bad_value(format!(
                                "expected value between {} and {}", s.scale * s.min as f64, s.scale * s.max as f64)));
                }
                Ok(Variant::Scaled(ScaledInfo { value: scaled as f64 * s.scale, ..s.clone() }))
            }
            Variant::Integer(i) => {
                let v = val.as_i64().ok_or_else(|| Error::bad_value("expected integer"))?;
                if v < i.min || v > i.max {
                    return Err(Error::bad_value(format!("expected integer in [{}, {}]", i.min, i.max)));
                }
                Ok(Variant::Integer(IntegerInfo { value: v, ..*i }))
            }
            Variant::Enum(e) => {
                let code = if let Some(name) = val.as_str() {
                    e.code_for(name).ok_or_else(|| Error::bad_value(format!("{:?} is not an enum member", name)))?
                } else if let Some(code) = val.as_i64() {
                    if !e.has_code(code) {
                        return Err(Error::bad_value(format!("{} is not an enum member", code)));
                    }
                    code
                } else {
                    return Err(Error::bad_value("expected enum name or code"));
                };
                Ok(Variant::Enum(EnumInfo { value: code, members: e.members.clone() }))
            }
            Variant::Str(s) => {
                let v = val.as_str().ok_or_else(|| Error::bad_value("expected string"))?;
                if v.len() < s.min_chars || v.len() > s.max_chars {
                    return Err(Error::bad_value("string length out of range"));
                }
                Ok(Variant::Str(StringInfo { value: v.to_owned(), ..s.clone() }))
            }
            Variant::Blob(b) => {
                let decoded = val.as_str().and_then(|s| base64::decode(s).ok())
                .ok_or_else(|| Error::bad_value("expected base64-encoded blob"))?;
                if decoded.len() < b.min_bytes || decoded.len() > b.max_bytes {
                    return Err(Error::bad_value("blob length out of range"));
                }
                Ok(Variant::Blob(BlobInfo { value: decoded, ..b.clone() }))
            }
            Variant::Json(_) => Ok(Variant::Json(val.clone())),
            Variant::Array(a) => {
                let arr = val.as_array().ok_or_else(|| Error::bad_value("expected array"))?;
                if arr.len() < a.min_len || arr.len() > a.max_len {
                    return Err(Error::bad_value("array length out of range"));
                }
                let values = arr.iter().enumerate()
                .map(|(i, item)| a.member_shape.import_json(item).map_err(|e| e.amend(&format!("in item {}", i + 1))))
                .collect::<Result<Vec<_>, Error>>()?;
                Ok(Variant::Array(ArrayInfo { values, member_shape: a.member_shape.clone(),
                            min_len: a.min_len, max_len: a.max_len }))
            }
            Variant::Tuple(shapes) => {
                let arr = val.as_array().ok_or_else(|| Error::bad_value("expected array"))?;
                if arr.len() != shapes.len() {
                    return Err(Error::bad_value(format!("expected {} elements", shapes.len())));
                }
                let items = shapes.iter().zip(arr.iter()).enumerate()
                .map(|(i, (shape, item))| shape.import_json(item).map_err(|e| e.amend(&format!("in item {}", i + 1))))
                .collect::<Result<Vec<_>, Error>>()?;
                Ok(Variant::Tuple(items))
            }
            Variant::Struct(s) => {
                let obj = val.as_object().ok_or_else(|| Error::bad_value("expected object"))?;
                let mut members = Vec::with_capacity(s.members.len());
                for (name, shape) in &s.members {
                    match obj.get(name) {
                        Some(v) => members.push((name.clone(), shape.import_json(v)
                                .map_err(|e| e.amend(&format!("in member {}", name)))?)),
                        None if s.optional.contains(name) => members.push((name.clone(), shape.clone())),
                        None => return Err(Error::bad_value(format!("missing struct member {:?}", name))),
                    }
                }
                Ok(Variant::Struct(StructInfo { members, optional: s.optional.clone() }))
            }
            Variant::Command {.. } => Err(Error::bad_value("command is not a transportable value")),
        }
    }

    pub fn export_json(&self) -> Value {
        match self {
            Variant::Null => Value::Null,
            Variant::Bool(b) => json!(b),
            Variant::Double(d) => {
                if d.value.is_nan() { Value::Null }
                else if d.value.is_infinite() { Value::Null }
                else { json!(d.value) }
            }
            Variant::Scaled(s) => json!(round_ties_even(s.value / s.scale) as i64),
            Variant::Integer(i) => json!(i.value),
            Variant::Enum(e) => json!(e.value),
            Variant::Str(s) => json!(s.value),
            Variant::Blob(b) => json!(base64::encode(&b.value)),
            Variant::Json(v) => v.clone(),
            Variant::Array(a) => Value::Array(a.values.iter().map(Variant::export_json).collect()),
            Variant::Tuple(items) => Value::Array(items.iter().map(Variant::export_json).collect()),
            Variant::Struct(s) => Value::Object(
                s.members.iter().map(|(n, v)| (n.clone(), v.export_json())).collect()),
            Variant::Command {.. } => Value::Null,
        }
    }

    pub fn export_secop(&self) -> String {
        self.export_json().to_string()
    }
}

fn in_bounds(v: f64, min: Option<f64>, max: Option<f64>) -> bool {
    match (min, max) {
        (Some(lo), Some(hi)) => v >= lo && v <= hi,
        (Some(lo), None) => v >= lo,
        (None, Some(hi)) => v <= hi,
        (None, None) => true,
    }
}

fn parse_double_ish(val: &Value) -> Option<f64> {
    if let Some(v) = val.as_f64() {
        return Some(v);
    }
    match val.as_str() {
        Some("NaN") => Some(f64::NAN),
        Some("Inf") => Some(f64::INFINITY),
        Some("-Inf") => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

fn put_opt(obj: &mut Value, key: &str, val: Option<Value>) {
    if let Some(v) = val {
        obj[key] = v;
    }
}

/// Validate a `fmtstr` metadata value against `%.<digits>[feg]`.
pub fn valid_fmtstr(s: &str) -> bool {
    FMTSTR_RE.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_shape(min: i64, max: i64) -> Variant {
        Variant::Integer(IntegerInfo { value: 0, min, max })
    }

    #[test]
    fn integer_round_trips() {
        let shape = int_shape(0, 10);
        let v = shape.import_secop("7").unwrap();
        assert_eq!(v.export_secop(), "7");
    }

    #[test]
    fn integer_out_of_range_rejected() {
        let shape = int_shape(0, 10);
        assert!(shape.import_secop("11").is_err());
    }

    #[test]
    fn double_nan_round_trips_as_null() {
        let shape = Variant::Double(Variant::double());
        let v = shape.import_secop("\"NaN\"").unwrap();
        match v {
            Variant::Double(d) => assert!(d.value.is_nan()),
            _ => panic!(),
        }
        assert_eq!(v.export_json(), Value::Null);
    }

    #[test]
    fn scaled_rounds_ties_to_even() {
        let shape = Variant::Scaled(ScaledInfo {
                value: 0.0, scale: 1.0, min: -100, max: 100, unit: None,
                fmtstr: None, absolute_resolution: None, relative_resolution: None,
        });
        // 2.5 ties to even -> 2
        let v = shape.import_json(&json!(2.5)).unwrap();
        assert_eq!(v.export_json(), json!(2));
        // 3.5 ties to even -> 4
        let v = shape.import_json(&json!(3.5)).unwrap();
        assert_eq!(v.export_json(), json!(4));
    }

    #[test]
    fn enum_imports_by_name_and_code() {
        let shape = Variant::Enum(EnumInfo {
                value: 0,
                members: vec![("idle".into(), 100), ("busy".into(), 300)],
        });
        let by_name = shape.import_json(&json!("busy")).unwrap();
        let by_code = shape.import_json(&json!(300)).unwrap();
        assert_eq!(by_name.export_json(), json!(300));
        assert_eq!(by_code.export_json(), json!(300));
        assert!(shape.import_json(&json!("unknown")).is_err());
    }

    #[test]
    fn struct_respects_optional_members() {
        let shape = Variant::Struct(StructInfo {
                members: vec![
                    ("a".into(), int_shape(0, 10)),
                    ("b".into(), int_shape(0, 10)),
                ],
                optional: ["b".to_string()].into_iter().collect(),
        });
        let v = shape.import_json(&json!({"a": 3})).unwrap();
        assert_eq!(v.export_json(), json!({"a": 3, "b": 0}));
        assert!(shape.import_json(&json!({})).is_err());
    }

    #[test]
    fn command_rejected_inside_nested_type() {
        let doc = json!({"type": "array", "members": {"type": "command"}});
        assert!(Variant::from_datainfo(&doc, false).is_err());
    }

    #[test]
    fn command_accepted_at_root() {
        let doc = json!({"type": "command", "argument": {"type": "int"}, "result": null});
        let v = Variant::from_datainfo(&doc, true).unwrap();
        assert!(matches!(v, Variant::Command {.. }));
    }

    #[test]
    fn fmtstr_validation() {
        assert!(valid_fmtstr("%.3f"));
        assert!(valid_fmtstr("%.1g"));
        assert!(!valid_fmtstr("%3f"));
        assert!(!valid_fmtstr("%.f"));
    }

    #[test]
    fn from_datainfo_round_trips_description() {
        let doc = json!({"type": "int", "min": 0, "max": 10});
        let shape = Variant::from_datainfo(&doc, true).unwrap();
        assert_eq!(shape.describe_datainfo(), doc);
    }
}
