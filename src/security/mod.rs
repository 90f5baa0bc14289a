//! Admission control and payload sanitization.

pub mod document;
pub mod rate_limiter;
pub mod statement;

pub use document::{DocumentPolicy, DocumentQuerySanitizer, SanitizedQuery};
pub use rate_limiter::{Admission, RateLimitConfig, RateLimiter, RateLimiterBuilder};
pub use statement::{SqlParam, StatementGuard, StatementPolicy, ValidatedStatement};
