//! Listeners, thread pools and the accept loops.
//!
//! A [`Server`] owns two tokio runtimes. The I/O runtime accepts connections, runs TLS
//! handshakes and drives the HTTP codec; its threads are marked so blocking primitives refuse
//! to run on them. The worker runtime runs whatever the [`ExchangeHandler`] dispatches.
//!
//! ```no_run
//! use std::sync::Arc;
//! use micro_exchange::handler::make_handler;
//! use micro_exchange::server::{Listener, Server};
//!
//! let mut server = Server::builder().listener(Listener::http("127.0.0.1:8080")).build().unwrap();
//! let handler = make_handler(|exchange| {
//!     exchange.dispatch(|exchange| {
//!         let worker = tokio::runtime::Handle::current();
//!         worker.block_on(exchange.end_exchange());
//!     })
//! });
//! let bound = server.start(Arc::new(handler)).unwrap();
//! println!("listening on {}", bound[0].local_addr);
//! server.stop();
//! ```

use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::runtime::{Handle, Runtime};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::HttpConnection;
use crate::exchange::{ConnectionInfo, ExchangeContext, Scheme};
use crate::handler::ExchangeHandler;
use crate::protocol::ServerError;
use crate::runtime::mark_io_thread;

mod listener;
mod tls;

pub use listener::{BoundListener, Listener, TlsMaterial};

/// Smallest accepted per-connection buffer.
const MIN_BUFFER_SIZE: usize = 1024;

#[derive(Debug)]
pub struct ServerBuilder {
    listeners: Vec<Listener>,
    io_threads: usize,
    worker_threads: usize,
    buffer_size: usize,
    direct_buffers: bool,
    shutdown_timeout: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(2, usize::from);
        Self {
            listeners: Vec::new(),
            io_threads: cpus.max(2),
            worker_threads: cpus * 8,
            buffer_size: 8 * 1024,
            direct_buffers: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerBuilder {
    pub fn listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads;
        self
    }

    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Read buffer size of every connection.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Allocate each connection's read buffer at full size up front instead of growing it on demand.
    pub fn direct_buffers(mut self, direct_buffers: bool) -> Self {
        self.direct_buffers = direct_buffers;
        self
    }

    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        if self.listeners.is_empty() {
            return Err(ServerError::invalid_config("at least one listener is required"));
        }
        if self.io_threads == 0 || self.worker_threads == 0 {
            return Err(ServerError::invalid_config("io_threads and worker_threads must be positive"));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ServerError::invalid_config(format!("buffer_size must be at least {MIN_BUFFER_SIZE}")));
        }

        let io_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.io_threads)
            .thread_name_fn(thread_namer("exchange-io"))
            .on_thread_start(mark_io_thread)
            .enable_all()
            .build()
            .map_err(|source| ServerError::Runtime { name: "io", source })?;

        let worker_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name_fn(thread_namer("exchange-worker"))
            .enable_all()
            .build()
            .map_err(|source| ServerError::Runtime { name: "worker", source })?;

        let context = ExchangeContext { io: io_runtime.handle().clone(), worker: worker_runtime.handle().clone() };

        Ok(Server {
            listeners: self.listeners,
            settings: ConnectionSettings { buffer_size: self.buffer_size, direct_buffers: self.direct_buffers },
            shutdown_timeout: self.shutdown_timeout,
            context,
            runtimes: Some((io_runtime, worker_runtime)),
            shutdown: CancellationToken::new(),
            state: ServerState::Built,
        })
    }
}

fn thread_namer(prefix: &'static str) -> impl Fn() -> String + Send + Sync + 'static {
    let next_id = AtomicUsize::new(0);
    move || format!("{prefix}-{}", next_id.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    buffer_size: usize,
    direct_buffers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Built,
    Started,
    Stopped,
}

#[derive(Debug)]
pub struct Server {
    listeners: Vec<Listener>,
    settings: ConnectionSettings,
    shutdown_timeout: Duration,
    context: ExchangeContext,
    runtimes: Option<(Runtime, Runtime)>,
    shutdown: CancellationToken,
    state: ServerState,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The worker pool exchanges are dispatched to.
    pub fn worker_handle(&self) -> Handle {
        self.context.worker.clone()
    }

    /// Binds every listener and starts accepting, every exchange goes to `handler`.
    ///
    /// Returns the bound addresses in listener order. Nothing is left listening on failure.
    pub fn start(&mut self, handler: Arc<dyn ExchangeHandler>) -> Result<Vec<BoundListener>, ServerError> {
        match self.state {
            ServerState::Built => {}
            ServerState::Started => return Err(ServerError::AlreadyStarted),
            ServerState::Stopped => return Err(ServerError::Stopped),
        }
        let Some((io_runtime, _)) = &self.runtimes else {
            return Err(ServerError::Stopped);
        };

        let mut prepared = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            let acceptor = listener.tls.as_ref().map(tls::acceptor).transpose()?;
            let (std_listener, local_addr) = bind(&listener.address)?;
            prepared.push((listener.scheme, std_listener, local_addr, acceptor));
        }

        let _guard = io_runtime.enter();
        let mut bound = Vec::with_capacity(prepared.len());
        for (scheme, std_listener, local_addr, acceptor) in prepared {
            let tcp_listener = TcpListener::from_std(std_listener).map_err(|source| ServerError::Bind { address: local_addr, source })?;

            info!(%scheme, %local_addr, "start listening");
            let accept = AcceptLoop {
                listener: tcp_listener,
                scheme,
                local_addr,
                acceptor,
                handler: Arc::clone(&handler),
                context: self.context.clone(),
                settings: self.settings,
                shutdown: self.shutdown.child_token(),
            };
            io_runtime.spawn(accept.run());
            bound.push(BoundListener { scheme, local_addr });
        }

        self.state = ServerState::Started;
        Ok(bound)
    }

    /// Stops accepting, closes connections and shuts both pools down. Idempotent.
    ///
    /// Blocks for up to the shutdown timeout per pool, so it must not be called from async code.
    pub fn stop(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.state = ServerState::Stopped;
        self.shutdown.cancel();

        if let Some((io_runtime, worker_runtime)) = self.runtimes.take() {
            worker_runtime.shutdown_timeout(self.shutdown_timeout);
            io_runtime.shutdown_timeout(self.shutdown_timeout);
        }
        info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state == ServerState::Started
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some((io_runtime, worker_runtime)) = self.runtimes.take() {
            worker_runtime.shutdown_background();
            io_runtime.shutdown_background();
        }
    }
}

fn bind(address: &str) -> Result<(StdTcpListener, SocketAddr), ServerError> {
    let addr = address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ServerError::Resolve { address: address.to_string() })?;

    let listener = StdTcpListener::bind(addr).map_err(|source| ServerError::Bind { address: addr, source })?;
    listener.set_nonblocking(true).map_err(|source| ServerError::Bind { address: addr, source })?;
    let local_addr = listener.local_addr().map_err(|source| ServerError::Bind { address: addr, source })?;
    Ok((listener, local_addr))
}

struct AcceptLoop {
    listener: TcpListener,
    scheme: Scheme,
    local_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn ExchangeHandler>,
    context: ExchangeContext,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let (tcp_stream, remote_addr) = tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!(local_addr = %self.local_addr, "accept loop stopped");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(stream_and_addr) => stream_and_addr,
                    Err(e) => {
                        warn!(cause = %e, "failed to accept");
                        continue;
                    }
                },
            };

            if let Err(e) = tcp_stream.set_nodelay(true) {
                debug!(cause = %e, "can't set TCP_NODELAY");
            }

            // a wildcard listener only knows its interface once a connection lands on it
            let local_addr = tcp_stream.local_addr().unwrap_or(self.local_addr);
            let info = ConnectionInfo { scheme: self.scheme, local_addr, remote_addr };
            let handler = Arc::clone(&self.handler);
            let context = self.context.clone();
            let settings = self.settings;
            let shutdown = self.shutdown.clone();
            let acceptor = self.acceptor.clone();

            tokio::spawn(async move {
                match acceptor {
                    None => {
                        let (reader, writer) = tcp_stream.into_split();
                        serve(reader, writer, info, context, settings, shutdown, handler.as_ref()).await;
                    }
                    Some(acceptor) => match acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => {
                            let (reader, writer) = tokio::io::split(tls_stream);
                            serve(reader, writer, info, context, settings, shutdown, handler.as_ref()).await;
                        }
                        Err(e) => debug!(cause = %e, remote = %remote_addr, "tls handshake failed"),
                    },
                }
            });
        }
    }
}

async fn serve<R, W>(
    reader: R,
    writer: W,
    info: ConnectionInfo,
    context: ExchangeContext,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
    handler: &dyn ExchangeHandler,
) where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let initial_capacity = if settings.direct_buffers { settings.buffer_size } else { MIN_BUFFER_SIZE };
    let connection = HttpConnection::new(reader, writer, info, context, initial_capacity, shutdown);
    match connection.process(handler).await {
        Ok(()) => debug!(remote = %info.remote_addr, "finished process, connection shutdown"),
        Err(e) => error!(cause = %e, remote = %info.remote_addr, "service has error, connection shutdown"),
    }
}
