//! Commands, events and the in-process event bus.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;

pub use bus::{DeliveryReport, EventBus, RegistrationError, SubscriberError, SubscriberFailure};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::{EventHandler, HandlerFn, handler_fn};
pub use in_memory_bus::InMemoryEventBus;
pub use projection::Projection;
pub use runner::{
    EventSource, ProjectionError, ProjectionOutcome, ProjectionRunner, ProjectionSubscriber,
};
