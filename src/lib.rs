//! median-infra: typed stack composition for the Median platform.
//!
//! Network, load balancer and fleet, deployment, database and bastion stacks
//! are composed from one `median.yaml`, wired through cross-stack exports and
//! synthesized to CloudFormation templates. BLAKE3 lock files and a JSONL
//! event log track every synthesis.

pub mod cli;
pub mod core;
pub mod error;
pub mod stacks;
pub mod tripwire;
