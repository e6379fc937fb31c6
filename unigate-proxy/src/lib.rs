pub mod classify;
pub mod forward;
pub mod handler;
pub mod poller;
pub mod rate_limit;

pub use handler::ProxyContext;
pub use poller::ConfigPoller;
pub use rate_limit::{RateDecision, RateLimiter};
