//! Admission - HTTP Admission Control
//!
//! This crate decides, before a request reaches its handler, whether the
//! request may proceed. Requests are partitioned by client, user agent or
//! route and counted against fixed window, sliding window, token bucket or
//! concurrency limiters composed into an ordered chain. Rejected requests
//! receive a 429 response with a retry hint.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
