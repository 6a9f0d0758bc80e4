//! Infrastructure layer: event storage and command dispatch.

pub mod command_bus;
pub mod command_handler;
pub mod event_store;

mod integration_tests;

#[cfg(test)]
mod test_support;

pub use command_bus::{CommandBus, DispatchError, Dispatched, RetryPolicy};
pub use command_handler::{AggregateHandler, CommandHandler};
