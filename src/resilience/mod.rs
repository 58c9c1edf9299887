//! Resilience primitives: retry, timeout, cache, fallback, circuit
//! breaking, and saga compensation.

mod cache;
mod circuit;
mod fallback;
mod retry;
mod saga;
mod timeout;

pub use cache::{content_key, Cache, CacheConfig, CacheKeyFn, CacheStats};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fallback::Fallback;
pub use retry::{Retry, RetryConfig};
pub use saga::Saga;
pub use timeout::Timeout;
