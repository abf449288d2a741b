//! HTTP admission middleware.
//!
//! Wraps request handlers with a rate limit check and translates decisions
//! into the standard `X-RateLimit-*` headers and a structured 429 body.

mod middleware;
mod response;

pub use middleware::{
    api_rate_limited, auth_rate_limited, public_rate_limited, wrap, Handler, RateLimited,
};
pub use response::{
    apply_rate_limit_headers, too_many_requests, ErrorBody, ErrorDetail, RATE_LIMIT_EXCEEDED,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
