//! Predictive Preloading
//!
//! Learns which key tends to follow which and warms the likely next keys
//! before they are asked for.

mod preloader;
mod window;

pub use preloader::{PredictivePreloader, PreloadConfig, PreloadStats, PreloadTarget, DEFAULT_SESSION};
pub use window::UsageWindow;
