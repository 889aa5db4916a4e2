/*
 * Copyright 2020 Joyent, Inc.
 */

//! This module provides the interface for creating data servers. A server
//! task is created with [`make_task`] for each accepted connection. The task
//! performs the handshake, negotiates the protocol version and then serves
//! requests until the client closes the session, goes idle past its timeout
//! or breaks the protocol.
//!
//! Clients whose version is at or below the configured legacy threshold are
//! served by the engine in [`crate::legacy`]; everyone else is served here.
//! Both engines run the same request cycle, [`Session::serve`], and differ
//! only in how the reply is laid out on the wire.
//!
//! ```no_run
//! use slog::{o, Drain, Logger};
//! use tokio::net::TcpListener;
//!
//! use dataserve::config::ServerConfig;
//! use dataserve::plugin::PluginRegistry;
//! use dataserve::server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
//!     let config = ServerConfig::default();
//!     let plugins = PluginRegistry::with_builtins();
//!
//!     let listener = TcpListener::bind(config.listen).await.unwrap();
//!     loop {
//!         let (stream, _) = listener.accept().await.unwrap();
//!         let (plugins, config, log) =
//!             (plugins.clone(), config.clone(), log.clone());
//!         tokio::spawn(async move {
//!             server::make_task(stream, &plugins, &config, Some(&log)).await;
//!         });
//!     }
//! }
//! ```

use std::cmp;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use slog::{debug, error, info, o, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::codec::Framed;

use crate::blocks::{
    ClientBlock, LegacyClientBlock, LegacyServerBlock, Metadata, PutDataBlock,
    RequestData, ServerBlock,
};
use crate::cache::FileCache;
use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, ProxyPolicy};
use crate::errors::{codes, Error, ErrorStack};
use crate::legacy;
use crate::plugin::{PluginInterface, PluginRegistry};
use crate::processing;
use crate::protocol::{Record, RecordCodec, RecordKind};
use crate::sockets::SocketRegistry;
use crate::types::{protocol_version_type_test, BlockLedger, DataBlock, OpaqueTag};

/// A framed record stream to one client.
pub struct Connection<S> {
    framed: Framed<S, RecordCodec>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_record_size: usize) -> Connection<S> {
        Connection {
            framed: Framed::new(stream, RecordCodec::new(max_record_size)),
        }
    }

    /// Wait for the next record, giving up after `idle` if one is given.
    pub async fn recv(&mut self, idle: Option<Duration>) -> Result<Record, Error> {
        let next = match idle {
            Some(limit) => tokio::time::timeout(limit, self.framed.next())
                .await
                .map_err(|_| Error::Timeout(limit.as_secs()))?,
            None => self.framed.next().await,
        };
        match next {
            Some(Ok(record)) => Ok(record),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::Disconnected),
        }
    }

    /// Receive a record that must be of `kind`.
    pub async fn expect(
        &mut self,
        kind: RecordKind,
        expected: &'static str,
        idle: Option<Duration>,
    ) -> Result<Record, Error> {
        let record = self.recv(idle).await?;
        if record.kind == kind {
            Ok(record)
        } else {
            Err(Error::UnexpectedRecord {
                expected,
                received: record.kind,
            })
        }
    }

    pub async fn send(&mut self, record: Record) -> Result<(), Error> {
        self.framed.send(record).await?;
        Ok(())
    }

    pub async fn send_body<T: Serialize>(
        &mut self,
        kind: RecordKind,
        body: &T,
    ) -> Result<(), Error> {
        self.send(Record::new(kind, body)?).await
    }
}

/// Per-connection state: the negotiated descriptors and everything a request
/// cycle touches.
pub struct Session {
    pub client: ClientBlock,
    pub server: ServerBlock,
    /// Negotiated protocol version.
    pub version: i32,
    pub errors: ErrorStack,
    pub metadata: Metadata,
    pub files: FileCache,
    pub sockets: SocketRegistry,
    pub ledger: BlockLedger,
    /// Engine serving the session, fixed once the handshake is done.
    engine: Option<Engine>,
    plugins: PluginRegistry,
    proxy: ProxyPolicy,
    config: ServerConfig,
    log: Logger,
    closed: bool,
}

impl Session {
    pub fn new(plugins: &PluginRegistry, config: &ServerConfig, log: &Logger) -> Session {
        Session {
            client: ClientBlock::default(),
            server: ServerBlock::new(
                config.server_version,
                &config.os_name,
                &config.config_id,
            ),
            version: config.server_version,
            errors: ErrorStack::new(),
            metadata: Metadata::default(),
            files: FileCache::new(config.file_cache_capacity, Some(log)),
            sockets: SocketRegistry::new(Some(log)),
            ledger: BlockLedger::new(),
            engine: None,
            plugins: plugins.clone(),
            proxy: ProxyPolicy {
                proxy: config.proxy.clone(),
                this_server: config.this_server.clone(),
            },
            config: config.clone(),
            log: log.clone(),
            closed: false,
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Whether replies use the legacy layouts. Follows the engine once one
    /// is chosen, else the negotiated version.
    pub fn is_legacy(&self) -> bool {
        match self.engine {
            Some(engine) => engine == Engine::Legacy,
            None => self.version <= self.config.legacy_version,
        }
    }

    pub fn engine(&self) -> Option<Engine> {
        self.engine
    }

    /// Idle timeout for the current client, capped by the configuration.
    pub fn idle_timeout(&self) -> Duration {
        let secs = match self.client.timeout {
            0 => self.config.max_timeout_secs,
            t => cmp::min(t, self.config.max_timeout_secs),
        };
        Duration::from_secs(cmp::max(secs, 1))
    }

    /// Adopt a client descriptor and negotiate the session version. A client
    /// newer than this server is refused and the error pushed on the stack.
    pub fn accept_client(&mut self, client: ClientBlock) -> bool {
        if client.version > self.config.server_version {
            self.errors.push_code(
                "handshake",
                codes::VERSION_INCOMPATIBLE,
                &format!(
                    "client protocol version {} is newer than server version {}",
                    client.version, self.config.server_version
                ),
            );
            self.errors.merge_into(&mut self.server);
            self.client = client;
            return false;
        }
        self.version = cmp::min(client.version, self.config.server_version);
        debug!(self.log, "client accepted";
            "uid" => &client.uid, "version" => self.version);
        self.client = client;
        true
    }

    /// Parse a client descriptor laid out for `self`'s engine. Before the
    /// engine is chosen the layout follows the version the client announces.
    pub fn decode_client(&self, record: &Record) -> Result<ClientBlock, Error> {
        let client: ClientBlock = record.body()?;
        let legacy = match self.engine {
            Some(engine) => engine == Engine::Legacy,
            None => client.version <= self.config.legacy_version,
        };
        if legacy {
            let legacy: LegacyClientBlock = record.body()?;
            return Ok(legacy.into());
        }
        Ok(client)
    }

    /// The server block in the layout the client expects.
    pub fn server_record(&self) -> Result<Record, Error> {
        let record = if self.is_legacy() {
            Record::new(RecordKind::ServerBlock, &LegacyServerBlock::from(&self.server))?
        } else {
            Record::new(RecordKind::ServerBlock, &self.server)?
        };
        Ok(record)
    }

    fn reset_cycle(&mut self) {
        self.errors.reset();
        self.server.reset();
        self.metadata.reset();
    }

    /// Run one request cycle: resolve and call the plugin, post-process the
    /// result and check it can be sent at the negotiated version. Failures
    /// are merged into the server block; the returned block is then ready to
    /// transmit.
    pub fn serve(&mut self, request: &mut RequestData) -> DataBlock {
        self.reset_cycle();
        let mut block = DataBlock::tracked(&self.ledger);
        let dispatcher = Dispatcher {
            registry: &self.plugins,
            proxy: &self.proxy,
            delimiter: &self.config.api_delimiter,
            server_version: self.config.server_version,
            log: &self.log,
        };

        if dispatcher.prepare(request, self.version, &mut self.errors) {
            let mut iface = PluginInterface {
                request: &*request,
                client: &self.client,
                data_block: &mut block,
                metadata: &mut self.metadata,
                errors: &mut self.errors,
                files: &mut self.files,
                sockets: &mut self.sockets,
                log: &self.log,
            };
            dispatcher.execute(&mut iface, self.version);
        }

        if self.errors.is_empty() {
            if let Err(msg) = processing::post_process(&self.client, &mut block) {
                self.errors.push_code(
                    "processing",
                    codes::SERVER_SIDE_PROCESSING,
                    &msg,
                );
            }
        }
        if self.errors.is_empty() {
            self.check_types(&mut block);
        }

        self.errors.merge_into(&mut self.server);
        block
    }

    /// [`Session::serve`] for async callers. Plugins may block on files or
    /// other servers; on a multi-threaded runtime the worker's other tasks
    /// move to another thread while the cycle runs.
    pub fn serve_blocking(&mut self, request: &mut RequestData) -> DataBlock {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.serve(request))
            }
            _ => self.serve(request),
        }
    }

    fn check_types(&mut self, block: &mut DataBlock) {
        block.downgrade_types(self.version);
        if let Some(bad) = block
            .element_types()
            .into_iter()
            .find(|t| !protocol_version_type_test(self.version, *t))
        {
            self.errors.push_code(
                "server",
                codes::VERSION_INCOMPATIBLE,
                &format!(
                    "{:?} data cannot be sent at protocol version {}",
                    bad, self.version
                ),
            );
            return;
        }
        if self.is_legacy()
            && block.opaque_type() != OpaqueTag::None
            && block.opaque().record_kind(true).is_none()
        {
            self.errors.push_code(
                "server",
                codes::VERSION_INCOMPATIBLE,
                &format!(
                    "{:?} opaque data cannot be sent at protocol version {}",
                    block.opaque_type(),
                    self.version
                ),
            );
        }
    }

    /// Write the access log line for a finished cycle.
    pub fn log_access(&self, request: &RequestData, block: &DataBlock, started: Instant) {
        info!(self.log, "request served";
            "date" => Utc::now().to_rfc3339(),
            "uid" => &self.client.uid,
            "version" => self.version,
            "signal" => &request.signal,
            "source" => &request.source,
            "error" => self.server.error,
            "bytes" => block.estimated_size(),
            "elapsed_ms" => started.elapsed().as_millis() as u64);
        for record in self.server.errors.iter() {
            error!(self.log, "request error"; "error" => %record);
        }
    }

    /// Release everything the session holds. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sockets.close_all();
        self.files.close_all();
        self.plugins.release();
        debug!(self.log, "session resources released";
            "blocks_outstanding" => self.ledger.outstanding());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read the request that starts a cycle, along with the put data it
/// announces.
pub async fn receive_request<S>(
    conn: &mut Connection<S>,
    first: Record,
    idle: Duration,
) -> Result<RequestData, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request: RequestData = first.body()?;
    if request.put {
        let put = conn
            .expect(RecordKind::PutDataBlockList, "put data block list", Some(idle))
            .await?;
        let blocks: Vec<PutDataBlock> = put.body()?;
        request.put_data = blocks;
    }
    Ok(request)
}

/// Serve one connection until it ends. Resources held by the session are
/// released before returning.
pub async fn make_task<S>(
    stream: S,
    plugins: &PluginRegistry,
    config: &ServerConfig,
    log: Option<&Logger>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let log = log.cloned().unwrap_or_else(|| {
        Logger::root(slog_stdlog::StdLog.fuse(), o!())
    });
    let log = log.new(o!("component" => "session"));
    let mut conn = Connection::new(stream, config.max_record_size);
    let mut session = Session::new(plugins, config, &log);

    match run_session(&mut conn, &mut session).await {
        Ok(()) => debug!(log, "session closed"),
        Err(Error::Disconnected) => debug!(log, "client disconnected"),
        Err(e) => {
            match e {
                Error::Timeout(secs) => {
                    info!(log, "closing idle session"; "timeout_secs" => secs)
                }
                _ => error!(log, "session failed"; "error" => %e),
            }
            report_fatal(&mut conn, &mut session, &e).await;
        }
    }
    session.shutdown();
}

/// The request loop serving a session once the handshake is done. Chosen
/// once from the negotiated version and kept for the life of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Modern,
    Legacy,
}

impl Engine {
    pub fn for_session(session: &Session) -> Engine {
        if session.is_legacy() {
            Engine::Legacy
        } else {
            Engine::Modern
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Engine::Modern => "modern",
            Engine::Legacy => "legacy",
        }
    }

    pub async fn run<S>(
        self,
        conn: &mut Connection<S>,
        session: &mut Session,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Engine::Modern => run_modern(conn, session).await,
            Engine::Legacy => legacy::run(conn, session).await,
        }
    }
}

async fn run_session<S>(
    conn: &mut Connection<S>,
    session: &mut Session,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !handshake(conn, session).await? {
        return Ok(());
    }
    let engine = Engine::for_session(session);
    session.engine = Some(engine);
    session.log = session.log.new(o!(
        "engine" => engine.name(),
        "protocol_version" => session.version));
    debug!(session.log, "session established");
    engine.run(conn, session).await
}

/// Exchange descriptors. Returns false when the session ends here.
async fn handshake<S>(
    conn: &mut Connection<S>,
    session: &mut Session,
) -> Result<bool, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle = Duration::from_secs(session.config.max_timeout_secs);
    let record = conn.recv(Some(idle)).await?;
    match record.kind {
        RecordKind::ClientBlock => (),
        RecordKind::NextProtocol => {
            if record.next_kind()? == RecordKind::Closedown {
                return Ok(false);
            }
            return Err(Error::UnexpectedRecord {
                expected: "client block",
                received: RecordKind::NextProtocol,
            });
        }
        other => {
            return Err(Error::UnexpectedRecord {
                expected: "client block",
                received: other,
            })
        }
    }

    let client = session.decode_client(&record)?;
    let closedown = client.wants_closedown();
    let accepted = session.accept_client(client);
    conn.send(session.server_record()?).await?;
    if !accepted {
        info!(session.log, "client rejected"; "version" => session.client.version);
        return Ok(false);
    }
    Ok(!closedown)
}

async fn run_modern<S>(
    conn: &mut Connection<S>,
    session: &mut Session,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let record = conn.recv(Some(session.idle_timeout())).await?;
        match record.kind {
            RecordKind::NextProtocol => match record.next_kind()? {
                RecordKind::Closedown => return Ok(()),
                RecordKind::Sleep | RecordKind::WakeUp => continue,
                other => {
                    return Err(Error::UnexpectedRecord {
                        expected: "request block",
                        received: other,
                    })
                }
            },
            RecordKind::ClientBlock => {
                let client = session.decode_client(&record)?;
                if !session.accept_client(client) {
                    return Err(Error::Fatal {
                        code: codes::VERSION_INCOMPATIBLE,
                        message: "client changed to an unsupported version".to_string(),
                    });
                }
                if session.client.wants_closedown() {
                    return Ok(());
                }
            }
            RecordKind::RequestBlock => {
                let started = Instant::now();
                let mut request =
                    receive_request(conn, record, session.idle_timeout()).await?;
                let block = session.serve_blocking(&mut request);
                transmit(conn, session, &block).await?;
                session.log_access(&request, &block, started);
            }
            other => {
                return Err(Error::UnexpectedRecord {
                    expected: "request block",
                    received: other,
                })
            }
        }
    }
}

/// Send a reply in the fixed order: server block, metadata when asked for,
/// the data block list, then any opaque record the block announces.
async fn transmit<S>(
    conn: &mut Connection<S>,
    session: &Session,
    block: &DataBlock,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(session.server_record()?).await?;
    if session.server.failed() {
        return Ok(());
    }

    if session.client.get_meta {
        let meta = &session.metadata;
        conn.send_body(RecordKind::DataSystem, &meta.data_system).await?;
        conn.send_body(RecordKind::SystemConfig, &meta.system_config).await?;
        conn.send_body(RecordKind::DataSource, &meta.data_source).await?;
        conn.send_body(RecordKind::Signal, &meta.signal).await?;
        conn.send_body(RecordKind::SignalDesc, &meta.signal_desc).await?;
    }

    conn.send_body(RecordKind::DataBlockList, &std::slice::from_ref(block))
        .await?;

    if let Some(record) = block.opaque().to_record(false)? {
        conn.send(record).await?;
    }
    Ok(())
}

/// Tell the client why the session is ending, where the failure allows it.
async fn report_fatal<S>(conn: &mut Connection<S>, session: &mut Session, err: &Error)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let code = match err.code() {
        Some(code) => code,
        None => return,
    };
    let message = match err {
        Error::Fatal { message, .. } => message.clone(),
        other => other.to_string(),
    };
    session.server.reset();
    let mut stack = ErrorStack::new();
    stack.push_code("server", code, &message);
    stack.merge_into(&mut session.server);
    match session.server_record() {
        Ok(record) => {
            if let Err(e) = conn.send(record).await {
                debug!(session.log, "unable to report failure"; "error" => %e);
            }
        }
        Err(e) => debug!(session.log, "unable to report failure"; "error" => %e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{self, Read};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use byteorder::{ByteOrder, LittleEndian};
    use bytes::BytesMut;
    use quickcheck::quickcheck;
    use tokio_test::block_on;
    use tokio_test::io::Builder;

    use crate::cache::{FileReader, NativeHandle};
    use crate::config::SERVER_VERSION;
    use crate::plugin::{Plugin, PluginClass, PluginEntry};
    use crate::protocol::encode_record;
    use crate::sockets::{PeerHandle, PeerKind};
    use crate::types::{DataType, OpaquePayload};

    struct Xml;

    impl Plugin for Xml {
        fn call(&self, iface: &mut PluginInterface<'_>) -> i32 {
            iface.data_block.set_scalar_f64(2.5);
            iface
                .data_block
                .set_opaque(OpaquePayload::XmlDocument("<a/>".to_string()));
            0
        }
    }

    struct Structured;

    impl Plugin for Structured {
        fn call(&self, iface: &mut PluginInterface<'_>) -> i32 {
            iface.data_block.set_scalar_f64(1.0);
            iface
                .data_block
                .set_opaque(OpaquePayload::Structures(serde_json::json!({"a": 1})));
            0
        }
    }

    /// Reports the total size and names of the put blocks it was given.
    struct PutEcho;

    impl Plugin for PutEcho {
        fn call(&self, iface: &mut PluginInterface<'_>) -> i32 {
            let put = &iface.request.put_data;
            let total: usize = put.iter().map(|b| b.data.len()).sum();
            let names: Vec<&str> = put.iter().map(|b| b.block_name.as_str()).collect();
            iface.data_block.set_scalar_i32(total as i32);
            iface.data_block.data_label = names.join(",");
            0
        }
    }

    struct CountingReader(Arc<AtomicUsize>);

    impl FileReader for CountingReader {
        fn open(&self, path: &Path) -> io::Result<NativeHandle> {
            Ok(Box::new(path.to_path_buf()))
        }

        fn close(&self, _handle: NativeHandle) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Leaves a cached file and an outbound link open in the session.
    struct Holder {
        closes: Arc<AtomicUsize>,
        peer: SocketAddr,
    }

    impl Plugin for Holder {
        fn call(&self, iface: &mut PluginInterface<'_>) -> i32 {
            iface.files.register_reader(
                "count",
                Box::new(CountingReader(Arc::clone(&self.closes))),
            );
            if let Err(e) = iface.files.open("count", Path::new("/held")) {
                iface.errors.push_system("Holder", &e, "open");
                return 1;
            }
            let peer = self.peer;
            let linked = iface.sockets.find_or_note(
                "127.0.0.1",
                peer.port(),
                PeerKind::Foreign,
                || TcpStream::connect(peer).map(PeerHandle::Tcp),
            );
            if let Err(e) = linked {
                iface.errors.push_system("Holder", &e, "connect");
                return 1;
            }
            iface.data_block.set_scalar_i32(1);
            0
        }
    }

    fn new_session(version: i32) -> Session {
        let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
        let mut plugins = PluginRegistry::with_builtins();
        plugins.register(PluginEntry::new("XML", PluginClass::Function, Arc::new(Xml)));
        plugins.register(PluginEntry::new(
            "STRUCT",
            PluginClass::Function,
            Arc::new(Structured),
        ));
        let mut session = Session::new(&plugins, &ServerConfig::default(), &log);
        assert!(session.accept_client(ClientBlock::new(version, 30)));
        session
    }

    fn framed(records: &[Record]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for record in records {
            encode_record(record, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn closedown_before_handshake_sends_nothing() {
        let mock = Builder::new()
            .read(&framed(&[Record::next(RecordKind::Closedown)]))
            .build();
        block_on(make_task(
            mock,
            &PluginRegistry::new(),
            &ServerConfig::default(),
            None,
        ));
    }

    #[test]
    fn newer_client_gets_exactly_one_rejection() {
        let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
        let config = ServerConfig::default();
        let client = ClientBlock::new(config.server_version + 1, 30);

        let mut expected = Session::new(&PluginRegistry::new(), &config, &log);
        assert!(!expected.accept_client(client.clone()));
        let reply = framed(&[expected.server_record().unwrap()]);

        let mock = Builder::new()
            .read(&framed(&[Record::new(RecordKind::ClientBlock, &client).unwrap()]))
            .write(&reply)
            .build();
        block_on(make_task(mock, &PluginRegistry::new(), &config, None));
    }

    #[test]
    fn zero_timeout_closes_after_the_acknowledgement() {
        let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
        let config = ServerConfig::default();
        let client = ClientBlock::new(8, 0);

        let mut expected = Session::new(&PluginRegistry::new(), &config, &log);
        assert!(expected.accept_client(client.clone()));
        let reply = framed(&[expected.server_record().unwrap()]);

        let mock = Builder::new()
            .read(&framed(&[Record::new(RecordKind::ClientBlock, &client).unwrap()]))
            .write(&reply)
            .build();
        block_on(make_task(mock, &PluginRegistry::new(), &config, None));
    }

    quickcheck! {
        fn negotiation_never_exceeds_either_side(raw: u8) -> bool {
            let version = i32::from(raw % 16);
            let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
            let mut session =
                Session::new(&PluginRegistry::new(), &ServerConfig::default(), &log);
            let accepted = session.accept_client(ClientBlock::new(version, 30));
            if version > SERVER_VERSION {
                !accepted && session.server.failed()
            } else {
                accepted
                    && session.version == version
                    && session.is_legacy() == (version <= 6)
            }
        }
    }

    #[test]
    fn newer_clients_are_refused() {
        let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
        let config = ServerConfig::default();
        let mut session = Session::new(&PluginRegistry::new(), &config, &log);
        assert!(!session.accept_client(ClientBlock::new(config.server_version + 1, 30)));
        assert_eq!(session.server.error, codes::VERSION_INCOMPATIBLE);
    }

    #[test]
    fn negotiation_picks_the_lower_version() {
        let session = new_session(7);
        assert_eq!(session.version, 7);
        assert!(!session.is_legacy());
        assert!(session.server.errors.is_empty());
        assert!(new_session(5).is_legacy());
    }

    #[test]
    fn idle_timeout_is_capped() {
        let mut session = new_session(9);
        session.client.timeout = 1_000_000;
        assert_eq!(
            session.idle_timeout(),
            Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS)
        );
        session.client.timeout = 5;
        assert_eq!(session.idle_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn blocks_are_released_after_each_cycle() {
        let mut session = new_session(9);
        for _ in 0..3 {
            let mut request = RequestData::new("XML::get()", "");
            let block = session.serve(&mut request);
            assert!(!session.server.failed());
            drop(block);
        }
        assert_eq!(session.ledger.created(), 3);
        assert_eq!(session.ledger.outstanding(), 0);
    }

    #[test]
    fn legacy_sessions_refuse_structured_opaque_data() {
        let mut session = new_session(5);
        let mut request = RequestData::new("STRUCT::get()", "");
        let _block = session.serve(&mut request);
        assert_eq!(session.server.error, codes::VERSION_INCOMPATIBLE);
    }

    #[test]
    fn reply_layout_stays_with_the_chosen_engine() {
        let mut session = new_session(9);
        session.engine = Some(Engine::for_session(&session));
        assert!(session.accept_client(ClientBlock::new(5, 30)));
        assert_eq!(session.version, 5);
        assert!(!session.is_legacy());
        let body: serde_json::Value = session.server_record().unwrap().body().unwrap();
        assert!(body.get("os_name").is_some());

        let mut session = new_session(5);
        session.engine = Some(Engine::for_session(&session));
        assert!(session.accept_client(ClientBlock::new(7, 30)));
        assert!(session.is_legacy());
        let body: serde_json::Value = session.server_record().unwrap().body().unwrap();
        assert!(body.get("os_name").is_none());
    }

    #[test]
    fn text_is_downgraded_for_old_clients() {
        let mut session = new_session(3);
        let mut request = RequestData::new("SERVER::help()", "");
        let block = session.serve(&mut request);
        assert_eq!(block.data_type, crate::types::DataType::Char);
        assert!(!session.server.failed());
    }

    #[tokio::test]
    async fn modern_reply_follows_the_fixed_order() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
        let mut plugins = PluginRegistry::new();
        plugins.register(PluginEntry::new("XML", PluginClass::Function, Arc::new(Xml)));
        let config = ServerConfig::default();
        let task = tokio::spawn(async move {
            make_task(server_io, &plugins, &config, Some(&log)).await;
        });

        let mut conn = Connection::new(client_io, 1024 * 1024);
        let client = ClientBlock {
            get_meta: true,
            ..ClientBlock::new(9, 30)
        };
        conn.send_body(RecordKind::ClientBlock, &client).await.unwrap();
        let ack: ServerBlock = conn
            .expect(RecordKind::ServerBlock, "server block", None)
            .await
            .unwrap()
            .body()
            .unwrap();
        assert!(!ack.failed());

        conn.send_body(RecordKind::RequestBlock, &RequestData::new("XML::get()", "/x"))
            .await
            .unwrap();
        let kinds = [
            RecordKind::ServerBlock,
            RecordKind::DataSystem,
            RecordKind::SystemConfig,
            RecordKind::DataSource,
            RecordKind::Signal,
            RecordKind::SignalDesc,
            RecordKind::DataBlockList,
            RecordKind::Meta,
        ];
        for kind in kinds.iter() {
            let record = conn.recv(None).await.unwrap();
            assert_eq!(record.kind, *kind);
        }

        conn.send(Record::next(RecordKind::Closedown)).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_requests_send_only_the_server_block() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let plugins = PluginRegistry::new();
        let config = ServerConfig::default();
        let task = tokio::spawn(async move {
            make_task(server_io, &plugins, &config, None).await;
        });

        let mut conn = Connection::new(client_io, 1024 * 1024);
        conn.send_body(RecordKind::ClientBlock, &ClientBlock::new(9, 30))
            .await
            .unwrap();
        conn.recv(None).await.unwrap();

        conn.send_body(RecordKind::RequestBlock, &RequestData::new("NOPE::x()", ""))
            .await
            .unwrap();
        let server: ServerBlock = conn.recv(None).await.unwrap().body().unwrap();
        assert_eq!(server.error, codes::UNKNOWN_FUNCTION);

        conn.send(Record::next(RecordKind::Sleep)).await.unwrap();
        conn.send_body(RecordKind::RequestBlock, &RequestData::new("SERVER::ping()", ""))
            .await
            .unwrap();
        let server: ServerBlock = conn.recv(None).await.unwrap().body().unwrap();
        assert!(!server.failed());
        assert_eq!(conn.recv(None).await.unwrap().kind, RecordKind::DataBlockList);

        drop(conn);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_told_and_closed() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let plugins = PluginRegistry::new();
        let config = ServerConfig::default();
        let task = tokio::spawn(async move {
            make_task(server_io, &plugins, &config, None).await;
        });

        let mut conn = Connection::new(client_io, 1024 * 1024);
        conn.send_body(RecordKind::ClientBlock, &ClientBlock::new(9, 5))
            .await
            .unwrap();
        conn.recv(None).await.unwrap();

        let started = tokio::time::Instant::now();
        let report: ServerBlock = conn.recv(None).await.unwrap().body().unwrap();
        assert_eq!(report.error, codes::SERVER_TIMEOUT);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(matches!(conn.recv(None).await, Err(Error::Disconnected)));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn put_data_reaches_the_plugin() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut plugins = PluginRegistry::new();
        plugins.register(PluginEntry::new("PUT", PluginClass::Function, Arc::new(PutEcho)));
        let config = ServerConfig::default();
        let task = tokio::spawn(async move {
            make_task(server_io, &plugins, &config, None).await;
        });

        let mut conn = Connection::new(client_io, 1024 * 1024);
        conn.send_body(RecordKind::ClientBlock, &ClientBlock::new(9, 30))
            .await
            .unwrap();
        conn.recv(None).await.unwrap();

        let request = RequestData {
            put: true,
            ..RequestData::new("PUT::store()", "")
        };
        let blocks = vec![
            PutDataBlock {
                data_type: DataType::UnsignedChar,
                rank: 1,
                count: 3,
                shape: vec![3],
                data: vec![1, 2, 3],
                block_name: "coils".to_string(),
            },
            PutDataBlock {
                data_type: DataType::UnsignedChar,
                rank: 1,
                count: 2,
                shape: vec![2],
                data: vec![4, 5],
                block_name: "probes".to_string(),
            },
        ];
        conn.send_body(RecordKind::RequestBlock, &request).await.unwrap();
        conn.send_body(RecordKind::PutDataBlockList, &blocks)
            .await
            .unwrap();

        let server: ServerBlock = conn.recv(None).await.unwrap().body().unwrap();
        assert!(!server.failed());
        let list: Vec<DataBlock> = conn
            .expect(RecordKind::DataBlockList, "data block list", None)
            .await
            .unwrap()
            .body()
            .unwrap();
        assert_eq!(list[0].data_label, "coils,probes");
        assert_eq!(LittleEndian::read_i32(&list[0].data), 5);

        conn.send(Record::next(RecordKind::Closedown)).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn protocol_errors_still_release_files_and_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let mut plugins = PluginRegistry::new();
        plugins.register(PluginEntry::new(
            "HOLD",
            PluginClass::Function,
            Arc::new(Holder {
                closes: Arc::clone(&closes),
                peer: listener.local_addr().unwrap(),
            }),
        ));
        let config = ServerConfig::default();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            make_task(server_io, &plugins, &config, None).await;
        });

        let mut conn = Connection::new(client_io, 1024 * 1024);
        conn.send_body(RecordKind::ClientBlock, &ClientBlock::new(9, 30))
            .await
            .unwrap();
        conn.recv(None).await.unwrap();
        conn.send_body(RecordKind::RequestBlock, &RequestData::new("HOLD::get()", ""))
            .await
            .unwrap();
        let server: ServerBlock = conn.recv(None).await.unwrap().body().unwrap();
        assert!(!server.failed(), "{:?}", server);
        conn.expect(RecordKind::DataBlockList, "data block list", None)
            .await
            .unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        conn.send(Record::next(RecordKind::Signal)).await.unwrap();
        let report: ServerBlock = conn.recv(None).await.unwrap().body().unwrap();
        assert_eq!(report.error, codes::PROTOCOL_INCONSISTENCY);
        task.await.unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let mut buf = [0u8; 16];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }
}
