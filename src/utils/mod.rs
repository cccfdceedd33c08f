pub mod fingerprint;
pub mod rate_limiter;
pub mod time;

pub use fingerprint::generate_fingerprint;
pub use rate_limiter::RateLimiter;
pub use time::*;
