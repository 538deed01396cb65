//! Subscription bookkeeping: cancellation handles and the per-connection tracker.

pub mod cancel;
pub mod tracker;

pub use cancel::CancelHandle;
pub use tracker::{Registration, SubscriptionKey, SubscriptionTracker};
