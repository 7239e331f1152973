//! Response head type.

use http::Response;

/// The status line plus headers of a response, before any body is attached.
pub type ResponseHead = Response<()>;
