//! Signal conditioning applied before values reach the aggregator

mod filter;

pub use filter::LowPassFilter;
