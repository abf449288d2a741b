//! Gatekeeper - Admission Control
//!
//! This crate decides whether a request or a user may proceed. It has two
//! independent halves:
//!
//! - [`ratelimit`] and [`admission`]: fixed window request quotas keyed by
//!   client IP, user or a constant, with HTTP middleware that rejects
//!   over-quota requests with a 429.
//! - [`entitlement`]: subscription policies fetched from a remote service,
//!   cached with fallbacks, and evaluated to decide paywall placement and
//!   feature access.

pub mod admission;
pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod ratelimit;
