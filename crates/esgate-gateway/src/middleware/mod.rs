//! Built-in middlewares.
//!
//! | Middleware | Commits when |
//! |------------|--------------|
//! | [`AccessLogMiddleware`] | never |
//! | [`ApiKeyMiddleware`] | the caller has no valid API key (401) |
//! | [`RateLimitMiddleware`] | the caller exceeded its window quota (429) |

mod auth;
mod logger;
mod rate_limit;

pub use auth::ApiKeyMiddleware;
pub use logger::AccessLogMiddleware;
pub use rate_limit::RateLimitMiddleware;
