//! Contracts of the micro pipeline framework.
//!
//! A server integration turns each request into an [`ApplicationCall`] and hands it to the one
//! [`Pipeline`]. The pipeline reads the request through [`ApplicationRequest`], answers through
//! [`ApplicationResponse`] or the higher level [`respond`], and may take the connection over
//! with a [`ProtocolUpgrade`].
//!
//! Bodies travel through the bounded byte channels of [`io`].

mod call;
mod content;
mod error;
mod parameters;
mod pipeline;

pub mod io;

pub use call::ApplicationCall;
pub use call::ApplicationRequest;
pub use call::ApplicationResponse;
pub use call::ConnectionPoint;
pub use content::OutgoingContent;
pub use content::ProtocolUpgrade;
pub use content::UpgradeHandler;
pub use content::respond;
pub use error::BoxError;
pub use error::CallError;
pub use error::ChannelError;
pub use parameters::Parameters;
pub use parameters::RequestCookies;
pub use pipeline::FnPipeline;
pub use pipeline::Pipeline;
pub use pipeline::pipeline_fn;
