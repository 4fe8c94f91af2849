//! Role implementations hosted by this process

pub mod aggregator;
pub mod conductor;
pub mod target;
