//! `impl Conductor` split by pipeline phase.

mod finalize;
mod layers;
mod observability;
mod stages;
