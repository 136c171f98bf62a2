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
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA  02111-1307  USA
//
// Module authors:
//   Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! This module contains the definition of a protocol message, along with tools
//! to parse and string-format it.

use std::fmt;
use regex::Regex;
use serde_json::{Value, json};
use lazy_static::lazy_static;

use crate::errors::Error;

lazy_static! {
    static ref MSG_RE: Regex = Regex::new(r#"(?x)
        ^
        (?P<type>[*?\w]+) # message type (verb)
        (?: \s
            (?P<spec>[^\s]+) # spec (object)
            (?: \s
                (?P<json>.*) # data (json)
            )?
        )?
        $
        "#).expect("valid regex");
}

pub const IDENT_REPLY: &str = "ISSE&SINE2020,SECoP,V2019-09-16,v1.0";

const HELP_TEXT: &str = "\
Try one of: *IDN?, describe, ping [token], activate [module], \
deactivate [module], read mod:param, change mod:param value, do mod:cmd arg";

/// Enum that represents any message that can be sent over the network in the
/// protocol, and a few that are only used internally between the Worker and
/// the Module/Registry layers.
#[derive(Debug, Clone)]
pub enum Msg {
    /// `*IDN?` identify request
    Idn,
    /// identify reply (special-cased, not a normal verb/spec/json line)
    IdnReply,
    /// `describe` request
    Describe,
    /// `describing . <json>` reply
    Describing { id: String, structure: Value },
    /// `activate [<module>]` request
    Activate { module: String },
    /// `active [<module>]` reply
    Active { module: String },
    /// `deactivate [<module>]` request
    Deactivate { module: String },
    /// `inactive [<module>]` reply
    Inactive { module: String },
    /// `do <mod>:<cmd> <json-arg>` request. The argument is kept as raw
    /// wire text: decoding and shape-checking it is the arg type's job,
    /// so a malformed payload surfaces as `BadValue` rather than a
    /// parse-level `ProtocolError`.
    Do { module: String, command: String, arg: String },
    /// `done <mod>:<cmd> [<result>, {"t":...}]` reply
    Done { module: String, command: String, data: Value },
    /// `change <mod>:<param> <json-value>` request, raw wire text (see `Do`).
    Change { module: String, param: String, value: String },
    /// `changed <mod>:<param> [...]` reply
    Changed { module: String, param: String, data: Value },
    /// `read <mod>:<param>` request
    Read { module: String, param: String },
    /// `reply <mod>:<param> [...]` reply to a `read`
    Reply { module: String, param: String, data: Value },
    /// `ping [<token>]` request
    Ping { token: String },
    /// `pong <token> [...]` reply
    Pong { token: String, data: Value },
    /// `help` request
    Help,
    /// `error_<verb> <spec> ["<token>", "<description>", {}]` reply
    ErrMsg { verb: String, spec: String, token: String, description: String },
    /// `update <mod>:<param> [...]` asynchronous event
    Update { module: String, param: String, data: Value },

    /// not a protocol message: a collection of updates to emit on activation
    InitUpdates { module: String, updates: Vec<Msg> },
    /// not a protocol message: indicates the connection is done
    Quit,
}

/// An incoming message that carries around the verb of the originating
/// line, needed to format an `error_<verb>` reply if dispatch fails later.
#[derive(Clone)]
pub struct IncomingMsg(pub String, pub Msg);

use self::Msg::*;

mod wire {
    pub const IDN: &str = "*IDN?";
    pub const DESCRIBE: &str = "describe";
    pub const DESCRIBING: &str = "describing";
    pub const ACTIVATE: &str = "activate";
    pub const ACTIVE: &str = "active";
    pub const DEACTIVATE: &str = "deactivate";
    pub const INACTIVE: &str = "inactive";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR_PREFIX: &str = "error_";
    pub const DO: &str = "do";
    pub const DONE: &str = "done";
    pub const CHANGE: &str = "change";
    pub const CHANGED: &str = "changed";
    pub const READ: &str = "read";
    pub const REPLY: &str = "reply";
    pub const UPDATE: &str = "update";
    pub const HELP: &str = "help";
}

impl Msg {
    /// The verb this message would be parsed from / formatted as, used to
    /// build `error_<verb>` replies for requests that fail during dispatch.
    pub fn verb(&self) -> &'static str {
        match self {
            Idn | IdnReply => wire::IDN,
            Describe | Describing { .. } => wire::DESCRIBE,
            Activate { .. } | Active { .. } => wire::ACTIVATE,
            Deactivate { .. } | Inactive { .. } => wire::DEACTIVATE,
            Do { .. } | Done { .. } => wire::DO,
            Change { .. } | Changed { .. } => wire::CHANGE,
            Read { .. } | Reply { .. } => wire::READ,
            Ping { .. } | Pong { .. } => wire::PING,
            Help => wire::HELP,
            Update { .. } => wire::UPDATE,
            ErrMsg { .. } | InitUpdates { .. } | Quit => "",
        }
    }

    /// Parse a string slice containing a message.
    pub fn parse(msg: &str) -> Result<IncomingMsg, Msg> {
        match Self::parse_inner(msg) {
            Ok(v) => Ok(IncomingMsg(v.verb().into(), v)),
            Err(e) => {
                let verb = msg.split_whitespace().next().unwrap_or("").to_owned();
                let spec = msg.split_whitespace().nth(1).unwrap_or(".").to_owned();
                Err(e.into_msg(&verb, spec))
            }
        }
    }

    fn parse_inner(msg: &str) -> Result<Msg, Error> {
        if msg == IDENT_REPLY {
            // SCPI-compatible special-case line, not verb/spec/json shaped.
            return Ok(IdnReply);
        }
        let captures = MSG_RE.captures(msg).ok_or_else(|| Error::protocol("invalid message format"))?;
        let action = captures.name("type").expect("always present").as_str();

        let specifier = captures.name("spec").map(|m| m.as_str()).unwrap_or("");
        let mut spec_split = specifier.splitn(2, ':').map(Into::into);
        let module: String = spec_split.next().unwrap_or_default();
        let mut param = || spec_split.next().ok_or_else(|| Error::protocol("missing parameter"));

        let raw_data = captures.name("json").map(|m| m.as_str().to_owned()).unwrap_or_default();

        Ok(match action.to_ascii_lowercase().as_str() {
            wire::READ => Read { module, param: param()? },
            wire::CHANGE => Change { module, param: param()?, value: raw_data },
            wire::DO => Do { module, command: param()?, arg: raw_data },
            wire::DESCRIBE => Describe,
            wire::ACTIVATE => Activate { module },
            wire::DEACTIVATE => Deactivate { module },
            wire::PING => Ping { token: specifier.into() },
            wire::HELP => Help,
            _ if action.eq_ignore_ascii_case(wire::IDN) => Idn,
            _ => return Err(Error::protocol("no such message type")),
        })
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reply { module, param, data } =>
                write!(f, "{} {}:{} {}", wire::REPLY, module, param, data),
            Update { module, param, data } =>
                write!(f, "{} {}:{} {}", wire::UPDATE, module, param, data),
            Changed { module, param, data } =>
                write!(f, "{} {}:{} {}", wire::CHANGED, module, param, data),
            Done { module, command, data } =>
                write!(f, "{} {}:{} {}", wire::DONE, module, command, data),
            Describing { id, structure } =>
                write!(f, "{} {} {}", wire::DESCRIBING, id, structure),
            Active { module } =>
                if module.is_empty() { f.write_str(wire::ACTIVE) }
                else { write!(f, "{} {}", wire::ACTIVE, module) },
            Inactive { module } =>
                if module.is_empty() { f.write_str(wire::INACTIVE) }
                else { write!(f, "{} {}", wire::INACTIVE, module) },
            Pong { token, data } =>
                write!(f, "{} {} {}", wire::PONG, token, data),
            Idn => f.write_str(wire::IDN),
            IdnReply => f.write_str(IDENT_REPLY),
            Read { module, param } =>
                write!(f, "{} {}:{}", wire::READ, module, param),
            Change { module, param, value } =>
                write!(f, "{} {}:{} {}", wire::CHANGE, module, param, value),
            Do { module, command, arg } =>
                write!(f, "{} {}:{} {}", wire::DO, module, command, arg),
            Describe => f.write_str(wire::DESCRIBE),
            Activate { module } =>
                if module.is_empty() { f.write_str(wire::ACTIVATE) }
                else { write!(f, "{} {}", wire::ACTIVATE, module) },
            Deactivate { module } =>
                if module.is_empty() { f.write_str(wire::DEACTIVATE) }
                else { write!(f, "{} {}", wire::DEACTIVATE, module) },
            Ping { token } =>
                if token.is_empty() { f.write_str(wire::PING) }
                else { write!(f, "{} {}", wire::PING, token) },
            Help => write!(f, "{}\n{}", wire::HELP, HELP_TEXT),
            ErrMsg { verb, spec, token, description } =>
                write!(f, "{}{} {} {}", wire::ERROR_PREFIX, verb, spec,
                    json!([token, description, {}])),
            InitUpdates { .. } => write!(f, "<updates>"),
            Quit => write!(f, "<eof>"),
        }
    }
}

impl fmt::Display for IncomingMsg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read() {
        let IncomingMsg(verb, msg) = Msg::parse("read m:value").unwrap();
        assert_eq!(verb, "read");
        match msg {
            Read { module, param } => {
                assert_eq!(module, "m");
                assert_eq!(param, "value");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_change_with_json() {
        let IncomingMsg(_, msg) = Msg::parse("change m:target 7").unwrap();
        match msg {
            Change { module, param, value } => {
                assert_eq!(module, "m");
                assert_eq!(param, "target");
                assert_eq!(value, "7");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn non_json_change_value_parses_as_raw_text() {
        // Malformed payloads are not a parse-level failure: decoding and
        // shape-checking the value is the datainfo's job, so this should
        // surface later as a BadValue reply, not a ProtocolError one.
        let IncomingMsg(_, msg) = Msg::parse("change m:target banana").unwrap();
        match msg {
            Change { value, .. } => assert_eq!(value, "banana"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unparseable_line_is_protocol_error() {
        let err = Msg::parse("\u{0}\u{0}\u{0}").unwrap_err();
        assert!(matches!(err, ErrMsg { ref token, .. } if token == "ProtocolError"));
    }

    #[test]
    fn idn_round_trips() {
        assert_eq!(Msg::Idn.to_string(), "*IDN?");
        let IncomingMsg(_, msg) = Msg::parse(IDENT_REPLY).unwrap();
        assert!(matches!(msg, IdnReply));
    }

    #[test]
    fn error_reply_format() {
        let e = Error::bad_value("expected integer between 0 and 10");
        let msg = e.into_msg("change", "m:target".into());
        let text = msg.to_string();
        assert!(text.starts_with("error_change m:target [\"BadValue\""));
    }
}
