//! Core composition logic: config, templates, cross-stack wiring, ordering,
//! synthesis and planning.

pub mod app;
pub mod cidr;
pub mod compose;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod synth;
pub mod template;
pub mod types;
