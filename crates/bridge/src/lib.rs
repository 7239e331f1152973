//! Runs a micro pipeline on a micro-exchange server.
//!
//! The server hands every request over as an exchange, on one of its I/O threads. This crate
//! moves it to the worker pool, wraps it as an [`ApplicationCall`](micro_pipeline::ApplicationCall),
//! runs the pipeline and completes the exchange exactly once, whatever the pipeline did.
//!
//! - [`stream_adapter`]: blocking exchange streams as bounded, cancellable byte channels
//! - [`upgrade`]: hands the raw connection to a [`ProtocolUpgrade`](micro_pipeline::ProtocolUpgrade) session
//! - [`call`]: the request and response views of one exchange
//! - [`DispatchHandler`]: the server's root handler
//! - [`engine`]: configuration and lifecycle
//!
//! ```no_run
//! use futures::FutureExt;
//! use micro_bridge::engine::{BridgeEngine, ConnectorConfig, EngineConfig};
//! use micro_pipeline::{BoxError, OutgoingContent, pipeline_fn, respond};
//!
//! let pipeline = pipeline_fn(|call| {
//!     async move {
//!         respond(call, OutgoingContent::text("hello")).await?;
//!         Ok::<_, BoxError>(())
//!     }
//!     .boxed()
//! });
//!
//! let config = EngineConfig::default().connector(ConnectorConfig::http("127.0.0.1", 8080));
//! let engine = BridgeEngine::new(config, pipeline);
//! let connectors = engine.start().unwrap();
//! println!("listening on {}", connectors[0].local_addr);
//! engine.stop();
//! ```

pub mod call;
pub mod engine;
pub mod stream_adapter;
pub mod upgrade;

mod dispatch;
mod error;
mod scope;

pub use dispatch::DispatchHandler;
pub use error::BridgeError;
pub use error::EngineError;
pub use scope::WorkerScope;
