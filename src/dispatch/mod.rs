//! Serialized request dispatch over a pluggable transport.

mod dispatcher;
mod request;
mod transport;

pub use dispatcher::RequestDispatcher;
pub use request::{Credentials, FetchOptions, OutboundRequest, DEFAULT_API_KEY_PARAM};
pub use transport::{HttpTransport, Transport, TransportResponse, STATUS_TOO_MANY_REQUESTS};
