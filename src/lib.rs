//! Quotagate - Rate-Limited Request Dispatcher
//!
//! This crate mediates every outbound call to a quota-constrained HTTP API.
//! A [`ratelimit::RateLimiter`] tracks the rolling request budget and backoff
//! debt, and a [`dispatch::RequestDispatcher`] serializes calls through a
//! single queue, retrying with exponential backoff when the upstream answers 429.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ratelimit;

pub use dispatch::{Credentials, FetchOptions, RequestDispatcher};
pub use error::{DispatchError, Result};
pub use ratelimit::RateLimiter;
