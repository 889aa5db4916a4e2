/*
 * Copyright 2020 Joyent, Inc.
 */

//! Error handling for the server engine.
//!
//! There are two layers. [`Error`] covers failures that end a connection:
//! broken streams, malformed records, idle timeouts. Everything that only
//! spoils a single request is recorded on an [`ErrorStack`] instead, which is
//! merged into the [`ServerBlock`](crate::blocks::ServerBlock) sent back to
//! the client so the client can read the failure before any data section.

use std::fmt;
use std::io;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocks::ServerBlock;
use crate::protocol::{ProtocolError, RecordKind};

/// Numeric error codes carried in error stack records.
pub mod codes {
    /// No plugin or built-in verb matches the request.
    pub const UNKNOWN_FUNCTION: i32 = 20;
    /// The matched plugin is registered but has no callable entry point.
    pub const PLUGIN_NOT_OPERATIONAL: i32 = 21;
    /// A result type or layout the negotiated protocol version cannot carry.
    pub const VERSION_INCOMPATIBLE: i32 = 30;
    /// A plugin returned a non-zero status without describing the failure.
    pub const PLUGIN_FAILED: i32 = 40;
    /// The file handle cache or socket registry could not provide a handle.
    pub const RESOURCE: i32 = 50;
    pub const PROXY_REDIRECTION: i32 = 60;
    pub const SERVER_SIDE_PROCESSING: i32 = 779;
    pub const PROTOCOL_INCORRECT_REQUEST: i32 = 997;
    pub const PROTOCOL_INCONSISTENCY: i32 = 998;
    /// Out-of-sequence section request from a legacy client.
    pub const PROTOCOL_SEQUENCE: i32 = 999;
    pub const SERVER_TIMEOUT: i32 = 999;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// An operating system failure; the code is the OS error number.
    System,
    /// A failure detected by the server or a plugin.
    Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub origin: String,
    pub code: i32,
    pub message: String,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} {} [{}] [{}]",
            self.kind, self.code, self.origin, self.message
        )
    }
}

/// Ordered, append-only list of diagnostics gathered during one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStack {
    records: Vec<ErrorRecord>,
}

impl ErrorStack {
    pub fn new() -> ErrorStack {
        ErrorStack {
            records: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        kind: ErrorKind,
        origin: &str,
        code: i32,
        message: &str,
    ) {
        self.records.push(ErrorRecord {
            kind,
            origin: origin.to_string(),
            code,
            message: message.to_string(),
        });
    }

    pub fn push_code(&mut self, origin: &str, code: i32, message: &str) {
        self.push(ErrorKind::Code, origin, code, message)
    }

    /// Record an operating system failure. The OS description is appended to
    /// the message, or used on its own when the message is empty.
    pub fn push_system(&mut self, origin: &str, err: &io::Error, message: &str) {
        let code = err.raw_os_error().unwrap_or(0);
        let message = if message.is_empty() {
            err.to_string()
        } else {
            format!("{}; {}", message, err)
        };
        self.records.push(ErrorRecord {
            kind: ErrorKind::System,
            origin: origin.to_string(),
            code,
            message,
        });
    }

    /// Append a copy of every record to the server block's own stack and
    /// refresh its canonical error. This stack is left untouched.
    pub fn merge_into(&self, server: &mut ServerBlock) {
        if self.records.is_empty() {
            return;
        }
        server.errors.records.extend(self.records.iter().cloned());
        if let Some(first) = server.errors.first() {
            server.error = first.code;
            server.msg = first.message.clone();
        }
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }

    pub fn first(&self) -> Option<&ErrorRecord> {
        self.records.first()
    }

    /// Canonical failure code: the code of the first record, if any.
    pub fn first_code(&self) -> Option<i32> {
        self.records.first().map(|r| r.code)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.records.iter()
    }
}

/// Failures that end a connection.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed by peer")]
    Disconnected,

    #[error("no record received within {0} seconds")]
    Timeout(u64),

    #[error("unexpected {received:?} record while waiting for {expected}")]
    UnexpectedRecord {
        expected: &'static str,
        received: RecordKind,
    },

    /// A request-level failure the client must see before the connection is
    /// dropped, e.g. a failed send of part of a reply.
    #[error("fatal protocol failure {code}: {message}")]
    Fatal { code: i32, message: String },
}

impl Error {
    /// Code reported in a final server block when this failure ends a
    /// session, or `None` when the client can no longer be reached.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Io(_) | Error::Disconnected => None,
            Error::Timeout(_) => Some(codes::SERVER_TIMEOUT),
            Error::Protocol(_) | Error::UnexpectedRecord { .. } => {
                Some(codes::PROTOCOL_INCONSISTENCY)
            }
            Error::Fatal { code, .. } => Some(*code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_empty_stack_leaves_server_block_unchanged() {
        let mut server = ServerBlock::new(9, "Linux", "cfg");
        server.errors.push_code("earlier", 5, "kept");
        let before = server.clone();

        ErrorStack::new().merge_into(&mut server);

        assert_eq!(server, before);
    }

    #[test]
    fn merge_copies_records_and_sets_canonical_code() {
        let mut stack = ErrorStack::new();
        stack.push_code("dispatch", codes::UNKNOWN_FUNCTION, "no plugin");
        stack.push_code("dispatch", 7, "second");

        let mut server = ServerBlock::new(9, "Linux", "cfg");
        stack.merge_into(&mut server);

        assert_eq!(stack.len(), 2);
        assert_eq!(server.errors.len(), 2);
        assert_eq!(server.error, codes::UNKNOWN_FUNCTION);
        assert_eq!(server.msg, "no plugin");
    }

    #[test]
    fn system_records_carry_os_description() {
        let err = io::Error::from_raw_os_error(2);
        let mut stack = ErrorStack::new();
        stack.push_system("cache", &err, "open failed");

        let record = stack.first().unwrap();
        assert_eq!(record.kind, ErrorKind::System);
        assert_eq!(record.code, 2);
        assert!(record.message.starts_with("open failed; "));
    }

    #[test]
    fn only_reachable_failures_carry_a_code() {
        assert_eq!(Error::Timeout(30).code(), Some(codes::SERVER_TIMEOUT));
        assert_eq!(
            Error::UnexpectedRecord {
                expected: "request block",
                received: RecordKind::Signal,
            }
            .code(),
            Some(codes::PROTOCOL_INCONSISTENCY)
        );
        assert_eq!(
            Error::Fatal {
                code: codes::PROTOCOL_SEQUENCE,
                message: "out of order".to_string(),
            }
            .code(),
            Some(codes::PROTOCOL_SEQUENCE)
        );
        assert_eq!(Error::Disconnected.code(), None);
        assert_eq!(
            Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)).code(),
            None
        );
    }

    #[test]
    fn reset_clears_every_record() {
        let mut stack = ErrorStack::new();
        stack.push_code("a", 1, "x");
        stack.reset();
        assert!(stack.is_empty());
        assert_eq!(stack.first_code(), None);
    }
}
