//! Tama Metrics - instrumentation for the region allocator
//!
//! Provides zero-cost abstractions for metrics collection that completely
//! vanish in production builds via feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use tama_metrics::{Counter, LatencyWindow};
//!
//! let counters = Counter::new();
//! counters.increment("faults.committed", 1);
//!
//! let mut latency = LatencyWindow::new(128);
//! latency.record(elapsed);
//! println!("avg fault: {:?}", latency.average());
//! ```
//!
//! Without the `metrics` feature every type below is a no-op stub with the
//! same API.

#[cfg(feature = "metrics")]
mod counter;
#[cfg(feature = "metrics")]
mod latency;

#[cfg(feature = "metrics")]
pub use counter::Counter;
#[cfg(feature = "metrics")]
pub use latency::LatencyWindow;

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
pub struct Counter;

#[cfg(not(feature = "metrics"))]
impl Counter {
    pub fn new() -> Self { Self }
    pub fn increment(&self, _name: &'static str, _value: u64) {}
    pub fn get(&self, _name: &str) -> u64 { 0 }
    pub fn reset_all(&self) {}
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> { Vec::new() }
}

#[cfg(not(feature = "metrics"))]
impl Default for Counter {
    fn default() -> Self { Self }
}

#[cfg(not(feature = "metrics"))]
pub struct LatencyWindow;

#[cfg(not(feature = "metrics"))]
impl LatencyWindow {
    pub fn new(_capacity: usize) -> Self { Self }
    pub fn record(&mut self, _sample: std::time::Duration) {}
    pub fn len(&self) -> usize { 0 }
    pub fn is_empty(&self) -> bool { true }
    pub fn average(&self) -> std::time::Duration { std::time::Duration::ZERO }
    pub fn max(&self) -> std::time::Duration { std::time::Duration::ZERO }
}
