//! Trend feed
//!
//! Exposes discovered devices and point values to renderers over HTTP.

mod feed;
mod router;

pub use feed::*;
pub use router::*;
