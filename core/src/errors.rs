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
//! Enumeration of possible SECoP errors and warnings.

use std::{error, fmt, result};
use serde_json::json;

use crate::proto::Msg;

pub type Result<T> = result::Result<T, Error>;

/// Internal error/warning taxonomy. Warnings never abort an
/// operation; errors do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Warnings.
    NoDescription,
    CustomProperty,
    BufferTooSmall,
    MissingProperties,

    // Errors.
    UnknownCommand,
    InvalidName,
    InvalidNode,
    InvalidModule,
    InvalidParameter,
    InvalidProperty,
    InvalidCommand,
    NotImplemented,
    ReadOnly,
    NoData,
    NotInitialized,
    InvalidValue,
    MissingMandatory,
    NoSetter,
    NoGetter,
    NameAlreadyUsed,
    Timeout,
    CommandFailed,
    CommandRunning,
    CommFailed,
    IsBusy,
    IsError,
    Disabled,
    Syntax,
    Internal,
}

impl ErrorKind {
    /// True for entries that only ever accumulate as warnings.
    pub fn is_warning(self) -> bool {
        use ErrorKind::*;
        matches!(self, NoDescription | CustomProperty | BufferTooSmall | MissingProperties)
    }

    /// The wire error token, as it appears in an `error_<verb>` reply.
    pub fn token(self) -> &'static str {
        use ErrorKind::*;
        match self {
            NoDescription | CustomProperty | BufferTooSmall | MissingProperties => "Warning",
            UnknownCommand => "NotImplemented",
            InvalidName | InvalidNode | InvalidModule | InvalidParameter |
            InvalidProperty | InvalidCommand | MissingMandatory |
            NameAlreadyUsed | Syntax => "ProtocolError",
            NotImplemented => "NotImplemented",
            ReadOnly => "ReadOnly",
            NoData | InvalidValue => "BadValue",
            NotInitialized | Internal | NoSetter | NoGetter => "InternalError",
            Timeout | CommFailed => "CommunicationFailed",
            CommandFailed => "CommandFailed",
            CommandRunning => "CommandRunning",
            IsBusy => "IsBusy",
            IsError => "IsError",
            Disabled => "Disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn bad_value(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::InvalidValue, message: msg.into() }
    }

    pub fn amend(mut self, msg: &str) -> Self {
        self.message = format!("{} ({})", self.message, msg);
        self
    }

    /// Build the wire `error_<verb> <spec> ["token", "description", {}]` reply.
    pub fn into_msg(self, verb: &str, spec: String) -> Msg {
        Msg::ErrMsg {
            verb: verb.into(),
            spec,
            token: self.kind.token().into(),
            description: self.message,
        }
    }

    // Quick constructors mirroring the taxonomy above.

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Syntax, message: msg.into() }
    }

    pub fn no_module() -> Self {
        Self { kind: ErrorKind::InvalidModule, message: "no such module".into() }
    }

    pub fn no_param() -> Self {
        Self { kind: ErrorKind::InvalidParameter, message: "no such parameter".into() }
    }

    pub fn no_command() -> Self {
        Self { kind: ErrorKind::InvalidCommand, message: "no such command".into() }
    }

    pub fn comm_failed(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::CommFailed, message: msg.into() }
    }

    pub fn timeout() -> Self {
        Self { kind: ErrorKind::Timeout, message: "request timed out".into() }
    }

    pub fn read_only() -> Self {
        Self { kind: ErrorKind::ReadOnly, message: "parameter is read-only".into() }
    }

    pub fn command_running() -> Self {
        Self { kind: ErrorKind::CommandRunning, message: "command already in flight".into() }
    }

    pub fn not_initialized() -> Self {
        Self { kind: ErrorKind::NotInitialized, message: "registry not initialized".into() }
    }
}

/// Allow quick conversion of io::Error to SECoP errors.
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::comm_failed(e.to_string())
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind.token(), self.message)
    }
}

/// A non-fatal diagnostic accumulated during `node_complete` or property
/// assignment, where several must be gathered before deciding whether the
/// overall operation failed.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn is_warning(&self) -> bool {
        self.kind.is_warning()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_mapping_matches_wire_set() {
        assert_eq!(ErrorKind::InvalidModule.token(), "ProtocolError");
        assert_eq!(ErrorKind::Timeout.token(), "CommunicationFailed");
        assert_eq!(ErrorKind::InvalidValue.token(), "BadValue");
    }

    #[test]
    fn amend_appends_context() {
        let e = Error::bad_value("expected integer").amend("in item 2");
        assert_eq!(e.message(), "expected integer (in item 2)");
    }
}
