//! Request credentials, outbound request shape, and per-call options.

use std::fmt;
use std::time::Duration;
use url::Url;

use crate::error::Result;

/// Query parameter used by [`Credentials::api_key`].
pub const DEFAULT_API_KEY_PARAM: &str = "apikey";

/// How a request authenticates against the upstream API.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// No credentials
    #[default]
    None,
    /// An API key sent as a query parameter
    ApiKey { param: String, value: String },
    /// A bearer token sent in the `Authorization` header
    Bearer(String),
}

impl Credentials {
    /// An API key sent as `?apikey=...`.
    pub fn api_key(value: impl Into<String>) -> Self {
        Credentials::ApiKey {
            param: DEFAULT_API_KEY_PARAM.to_string(),
            value: value.into(),
        }
    }

    /// Build the outbound request for `url` with these credentials applied.
    pub fn apply(&self, url: &str) -> Result<OutboundRequest> {
        let mut url = Url::parse(url)?;
        let mut bearer = None;

        match self {
            Credentials::None => {}
            Credentials::ApiKey { param, value } => {
                url.query_pairs_mut().append_pair(param, value);
            }
            Credentials::Bearer(token) => bearer = Some(token.clone()),
        }

        Ok(OutboundRequest { url, bearer })
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => write!(f, "None"),
            Credentials::ApiKey { param, .. } => write!(f, "ApiKey({param}=***)"),
            Credentials::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

/// A fully-resolved GET request, ready for the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Target URL, credentials included
    pub url: Url,
    /// Bearer token for the `Authorization` header
    pub bearer: Option<String>,
}

impl fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = self.url.clone();
        url.set_query(None);
        f.debug_struct("OutboundRequest")
            .field("url", &url.as_str())
            .field("bearer", &self.bearer.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Per-call options for [`RequestDispatcher::fetch_with`](super::RequestDispatcher::fetch_with).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Caller deadline covering queueing, admission, and retries.
    /// Falls back to the dispatcher's configured default when `None`.
    pub timeout: Option<Duration>,
    /// Retry counter to start from, for callers continuing an earlier series
    pub retry_count: u32,
}

impl FetchOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}
