/*
 * Copyright 2020 Joyent, Inc.
 */

//! Registry of outbound links held while this server acts as a client of
//! other servers.
//!
//! The registry never dials. A caller looks up `(host, port)` and supplies the
//! connection itself when no open entry exists; the registry only guarantees
//! that every link it has seen is torn down on [`SocketRegistry::close_all`].

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::process::Child;

use bytes::BytesMut;
use slog::{debug, o, warn, Drain, Logger};

use crate::protocol::{encode_record, Record, RecordKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// A peer speaking this protocol; told to close down before disconnect.
    Native,
    /// A differently-protocoled peer; the link is simply dropped or killed.
    Foreign,
}

#[derive(Debug)]
pub enum PeerHandle {
    Tcp(TcpStream),
    Process(Child),
}

#[derive(Debug)]
pub struct SocketEntry {
    pub host: String,
    pub port: u16,
    pub kind: PeerKind,
    handle: Option<PeerHandle>,
}

impl SocketEntry {
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle_mut(&mut self) -> Option<&mut PeerHandle> {
        self.handle.as_mut()
    }

    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        match self.handle.as_mut() {
            Some(PeerHandle::Tcp(stream)) => Some(stream),
            _ => None,
        }
    }

    fn teardown(&mut self) -> io::Result<()> {
        match (self.kind, self.handle.take()) {
            (_, None) => Ok(()),
            (PeerKind::Native, Some(PeerHandle::Tcp(mut stream))) => {
                let mut buf = BytesMut::new();
                let closedown = Record::next(RecordKind::Closedown);
                if encode_record(&closedown, &mut buf).is_ok() {
                    let _ = stream.write_all(&buf);
                }
                stream.shutdown(Shutdown::Both)
            }
            (PeerKind::Foreign, Some(PeerHandle::Tcp(stream))) => {
                stream.shutdown(Shutdown::Both)
            }
            (_, Some(PeerHandle::Process(mut child))) => {
                let _ = child.kill();
                child.wait().map(|_| ())
            }
        }
    }
}

pub struct SocketRegistry {
    entries: Vec<SocketEntry>,
    log: Logger,
}

impl SocketRegistry {
    pub fn new(log: Option<&Logger>) -> SocketRegistry {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        SocketRegistry {
            entries: Vec::new(),
            log: log.new(o!("component" => "socket_registry")),
        }
    }

    /// Return the open entry for `(host, port)`, or record the link produced
    /// by `connect`. A closed entry for the same pair is revived in place.
    pub fn find_or_note<F>(
        &mut self,
        host: &str,
        port: u16,
        kind: PeerKind,
        connect: F,
    ) -> io::Result<&mut SocketEntry>
    where
        F: FnOnce() -> io::Result<PeerHandle>,
    {
        let idx = match self.position(host, port) {
            Some(idx) if self.entries[idx].is_open() => idx,
            Some(idx) => {
                self.entries[idx].handle = Some(connect()?);
                self.entries[idx].kind = kind;
                idx
            }
            None => {
                let handle = connect()?;
                debug!(self.log, "noted outbound link";
                    "host" => host, "port" => port);
                self.entries.push(SocketEntry {
                    host: host.to_string(),
                    port,
                    kind,
                    handle: Some(handle),
                });
                self.entries.len() - 1
            }
        };
        Ok(&mut self.entries[idx])
    }

    pub fn find(&mut self, host: &str, port: u16) -> Option<&mut SocketEntry> {
        match self.position(host, port) {
            Some(idx) if self.entries[idx].is_open() => {
                Some(&mut self.entries[idx])
            }
            _ => None,
        }
    }

    /// Tear down and forget the link to `(host, port)`. Returns whether an
    /// entry existed.
    pub fn close_named(&mut self, host: &str, port: u16) -> bool {
        match self.position(host, port) {
            Some(idx) => {
                let mut entry = self.entries.remove(idx);
                if let Err(e) = entry.teardown() {
                    warn!(self.log, "failed to close outbound link";
                        "host" => host, "port" => port, "error" => %e);
                }
                true
            }
            None => false,
        }
    }

    /// Tear down every link. Safe to call repeatedly.
    pub fn close_all(&mut self) {
        for mut entry in self.entries.drain(..) {
            if let Err(e) = entry.teardown() {
                warn!(self.log, "failed to close outbound link";
                    "host" => &entry.host, "port" => entry.port,
                    "error" => %e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, host: &str, port: u16) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.port == port && e.host == host)
    }
}

impl Drop for SocketRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
