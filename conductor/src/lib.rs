//! Layered query conductor
//!
//! Drives a checkpointed, privacy-preserving distributed query across
//! concept, target, data and aggregation services, and hosts the
//! `conductor`, `aggregator` and `target` roles behind one HTTP surface.

pub mod actors;
pub mod aggregation;
pub mod api;
pub mod app_state;
pub mod config;
pub mod profile;
pub mod remote;
pub mod store;
pub mod tasks;
