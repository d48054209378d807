//! Rate limiting logic and state management.

mod adaptive;
mod clock;
mod decision;
mod fixed_window;
mod key;
mod policy;
mod sliding_window;
mod store;
mod strategy;

pub use adaptive::{AdaptiveLimiter, AdaptiveSettings, SystemLoad};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, RateLimitHeaders, Rejection};
pub use fixed_window::{FixedWindowLimiter, WindowEntry};
pub use key::{IpKeyResolver, KeyResolver, KeyStrategy, RequestContext, UserKeyResolver};
pub use policy::{AdaptiveBinding, Category, Policy, PolicyConfig, PolicyRegistry};
pub use sliding_window::{SlidingWindowLimiter, TimestampLog};
pub use store::{Expiring, StoreSettings, WindowStore};
pub use strategy::{Algorithm, CountingStrategy};
