/*
 * Copyright 2020 Joyent, Inc.
 */

//! Plugin forwarding a request to another data server.
//!
//! The request path has the form `host[:port]/source`. The outbound link is
//! kept in the session's socket registry so later requests to the same server
//! reuse it and session shutdown closes it.
//!
//! Calls block. Reads and writes on the link give up after the requesting
//! client's timeout, capped by the plugin's own limit.

use std::cmp;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use slog::{debug, warn};

use crate::blocks::{ClientBlock, RequestData};
use crate::client;
use crate::errors::{codes, Error};
use crate::plugin::{Plugin, PluginInterface};
use crate::sockets::{PeerHandle, PeerKind};

pub const DEFAULT_PORT: u16 = 56565;
/// Protocol version this server speaks when acting as a client.
pub const CLIENT_VERSION: i32 = 9;

pub struct ForwardPlugin {
    connect_timeout: Duration,
    max_io_timeout: Duration,
}

impl Default for ForwardPlugin {
    fn default() -> ForwardPlugin {
        ForwardPlugin {
            connect_timeout: Duration::from_secs(10),
            max_io_timeout: Duration::from_secs(600),
        }
    }
}

fn set_deadlines(stream: &TcpStream, limit: Duration) -> io::Result<()> {
    stream.set_read_timeout(Some(limit))?;
    stream.set_write_timeout(Some(limit))
}

/// Split `host[:port]/source` into its parts.
pub fn parse_target(path: &str) -> Option<(String, u16, String)> {
    let path = path.trim_start_matches('/');
    let (address, source) = match path.find('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (path, ""),
    };
    if address.is_empty() {
        return None;
    }
    let (host, port) = match address.rfind(':') {
        Some(idx) => (&address[..idx], address[idx + 1..].parse().ok()?),
        None => (address, DEFAULT_PORT),
    };
    Some((host.to_string(), port, source.to_string()))
}

impl ForwardPlugin {
    /// Time allowed for each read or write on a link serving `client`.
    fn io_limit(&self, client: &ClientBlock) -> Duration {
        cmp::min(Duration::from_secs(client.timeout.max(1)), self.max_io_timeout)
    }

    fn dial(
        &self,
        host: &str,
        port: u16,
        client: &ClientBlock,
    ) -> io::Result<PeerHandle> {
        let mut stream = match (host, port).to_socket_addrs()?.next() {
            Some(sock) => TcpStream::connect_timeout(&sock, self.connect_timeout)?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", host),
                ))
            }
        };
        set_deadlines(&stream, self.io_limit(client))?;
        let ack = client::handshake(&mut stream, client).map_err(|e| match e {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        })?;
        if ack.failed() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{}:{} refused the session: {}", host, port, ack.msg),
            ));
        }
        Ok(PeerHandle::Tcp(stream))
    }
}

impl Plugin for ForwardPlugin {
    fn call(&self, iface: &mut PluginInterface<'_>) -> i32 {
        let (host, port, source) = match parse_target(&iface.request.path) {
            Some(target) => target,
            None => {
                iface.errors.push_code(
                    "ForwardPlugin",
                    codes::PROXY_REDIRECTION,
                    &format!("no server named in {}", iface.request.path),
                );
                return codes::PROXY_REDIRECTION;
            }
        };

        let mut outbound = ClientBlock {
            version: CLIENT_VERSION,
            ..iface.client.clone()
        };
        if outbound.timeout == 0 {
            outbound.timeout = 1;
        }

        let mut remote = RequestData::new(&iface.request.signal, &source);
        remote.subset = iface.request.subset.clone();
        remote.put = iface.request.put;
        remote.put_data = iface.request.put_data.clone();

        debug!(iface.log, "forwarding request";
            "host" => &host, "port" => port, "source" => &source);

        let entry = match iface.sockets.find_or_note(
            &host,
            port,
            PeerKind::Native,
            || self.dial(&host, port, &outbound),
        ) {
            Ok(entry) => entry,
            Err(e) => {
                iface.errors.push_system(
                    "ForwardPlugin",
                    &e,
                    &format!("unable to reach {}:{}", host, port),
                );
                return codes::RESOURCE;
            }
        };

        let limit = self.io_limit(&outbound);
        let reply = match entry.stream() {
            Some(stream) => set_deadlines(stream, limit)
                .map_err(Error::from)
                .and_then(|()| client::get(stream, &outbound, &remote)),
            None => Err(Error::Disconnected),
        };

        let mut reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!(iface.log, "forwarded request failed"; "error" => %e);
                iface.sockets.close_named(&host, port);
                iface.errors.push_code(
                    "ForwardPlugin",
                    codes::PROXY_REDIRECTION,
                    &format!("{}:{}: {}", host, port, e),
                );
                return codes::PROXY_REDIRECTION;
            }
        };

        if reply.server.failed() {
            for record in reply.server.errors.iter() {
                iface.errors.push(
                    record.kind,
                    &record.origin,
                    record.code,
                    &record.message,
                );
            }
            if iface.errors.is_empty() {
                iface.errors.push_code(
                    "ForwardPlugin",
                    reply.server.error,
                    &reply.server.msg,
                );
            }
            return reply.server.error.max(1);
        }

        if let Some(metadata) = reply.metadata.take() {
            *iface.metadata = metadata;
        }
        match reply.data.as_mut() {
            Some(block) => {
                iface.data_block.adopt(block);
                0
            }
            None => {
                iface.errors.push_code(
                    "ForwardPlugin",
                    codes::PROXY_REDIRECTION,
                    "remote server sent no data block",
                );
                codes::PROXY_REDIRECTION
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_parse_with_and_without_port() {
        assert_eq!(
            parse_target("data.example.org:56566/shot/42"),
            Some(("data.example.org".to_string(), 56566, "shot/42".to_string()))
        );
        assert_eq!(
            parse_target("data.example.org/42"),
            Some(("data.example.org".to_string(), DEFAULT_PORT, "42".to_string()))
        );
        assert_eq!(parse_target("/"), None);
        assert_eq!(parse_target("host:port/x"), None);
    }

    #[test]
    fn link_deadlines_follow_the_client_timeout() {
        let plugin = ForwardPlugin::default();
        assert_eq!(
            plugin.io_limit(&ClientBlock::new(9, 3)),
            Duration::from_secs(3)
        );
        assert_eq!(
            plugin.io_limit(&ClientBlock::new(9, 0)),
            Duration::from_secs(1)
        );
        assert_eq!(
            plugin.io_limit(&ClientBlock::new(9, 100_000)),
            Duration::from_secs(600)
        );
    }
}
