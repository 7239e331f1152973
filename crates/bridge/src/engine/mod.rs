//! The engine owns the server and wires the [`DispatchHandler`] in as its only handler.
//!
//! ```text
//! start: Starting -> build server -> bind connectors -> Started(connectors)
//! stop:  Stopping -> cancel worker scope -> wait for calls -> stop server -> Stopped
//! ```
//!
//! Start and stop are serialized, and both block the calling thread: call them from outside
//! any async runtime.

mod config;

pub use config::{ConnectorConfig, ConnectorScheme, EngineConfig, TlsConfig};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use micro_exchange::server::{BoundListener, Server};
use micro_pipeline::Pipeline;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::call::CallSettings;
use crate::{DispatchHandler, EngineError, WorkerScope};

/// A connector after binding, with the address actually assigned.
pub type BoundConnector = BoundListener;

const EVENT_CAPACITY: usize = 16;

/// Lifecycle notifications, see [`BridgeEngine::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Starting,
    Started(Vec<BoundConnector>),
    Stopping,
    Stopped,
}

enum EngineState {
    Idle,
    Running { server: Server, scope: WorkerScope, connectors: Vec<BoundConnector> },
}

pub struct BridgeEngine {
    config: EngineConfig,
    pipeline: Arc<dyn Pipeline>,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl fmt::Debug for BridgeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

impl BridgeEngine {
    pub fn new<P: Pipeline>(config: EngineConfig, pipeline: P) -> Self {
        Self::with_shared_pipeline(config, Arc::new(pipeline))
    }

    pub fn with_shared_pipeline(config: EngineConfig, pipeline: Arc<dyn Pipeline>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { config, pipeline, state: Mutex::new(EngineState::Idle), events }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lifecycle events raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Starts serving, returns the bound connectors in configuration order.
    ///
    /// A stopped engine can be started again.
    pub fn start(&self) -> Result<Vec<BoundConnector>, EngineError> {
        let mut state = self.lock();
        if matches!(*state, EngineState::Running { .. }) {
            return Err(EngineError::AlreadyStarted);
        }
        self.config.validate()?;
        self.raise(EngineEvent::Starting);

        let mut builder = Server::builder()
            .io_threads(self.config.io_threads)
            .worker_threads(self.config.worker_threads)
            .buffer_size(self.config.buffer_size)
            .direct_buffers(self.config.use_direct_buffers)
            .shutdown_timeout(self.config.grace());
        for connector in &self.config.connectors {
            builder = builder.listener(connector.to_listener()?);
        }
        let mut server = builder.build()?;

        let scope = WorkerScope::new(server.worker_handle());
        let settings =
            CallSettings { buffer_size: self.config.buffer_size, channel_capacity: self.config.channel_capacity };
        let handler = DispatchHandler::new(Arc::clone(&self.pipeline), scope.clone(), settings);

        let connectors = server.start(Arc::new(handler))?;
        for connector in &connectors {
            info!(scheme = %connector.scheme, local_addr = %connector.local_addr, "connector bound");
        }

        *state = EngineState::Running { server, scope, connectors: connectors.clone() };
        self.raise(EngineEvent::Started(connectors.clone()));
        Ok(connectors)
    }

    /// Stops serving and releases every connector. Idempotent, and a no-op before `start`.
    ///
    /// In-flight calls are cancelled and given the shutdown grace period to clean up.
    pub fn stop(&self) {
        let mut state = self.lock();
        let EngineState::Running { mut server, scope, .. } = std::mem::replace(&mut *state, EngineState::Idle) else {
            debug!("engine not running, nothing to stop");
            return;
        };

        self.raise(EngineEvent::Stopping);
        if !scope.shutdown(self.config.grace()) {
            warn!("in-flight calls outlived the grace period, stopping anyway");
        }
        server.stop();
        self.raise(EngineEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), EngineState::Running { .. })
    }

    /// The bound connectors while running.
    pub fn connectors(&self) -> Vec<BoundConnector> {
        match &*self.lock() {
            EngineState::Running { connectors, .. } => connectors.clone(),
            EngineState::Idle => Vec::new(),
        }
    }

    /// Calls still in flight.
    pub fn in_flight(&self) -> usize {
        match &*self.lock() {
            EngineState::Running { scope, .. } => scope.len(),
            EngineState::Idle => 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn raise(&self, event: EngineEvent) {
        debug!(?event, "engine event");
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}
