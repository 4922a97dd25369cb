//! Tripwire: BLAKE3 hashing, provenance events, artifact drift detection.

pub mod drift;
pub mod eventlog;
pub mod hasher;
