//! `userserver-core`: building blocks shared by every aggregate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, ExpectedVersion, rehydrate};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, PrincipalId};
