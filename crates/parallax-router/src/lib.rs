//! Architecture-aware dispatch pipeline for a mixed amd64/arm64 FaaS
//! fleet.
//!
//! The pipeline has three coupled pieces: a consistent-hashing,
//! architecture-segregated balancer with memory-aware fallback
//! ([`balancer`], [`ring`]); a per-function multi-armed bandit that
//! picks the architecture when a function supports more than one
//! ([`mab`]); and the live view of per-node free memory both depend on
//! ([`metrics`]). The HTTP frontend that feeds execution outcomes back
//! into the pipeline lives in the `parallax-gateway` crate.

pub mod balancer;
pub mod error;
pub mod mab;
pub mod metrics;
pub mod ring;
pub mod types;

pub use balancer::{ArchAwareBalancer, FunctionProvider, LbMode, StatusProber};
pub use error::BalanceError;
