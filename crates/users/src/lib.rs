//! User domain module (event-sourced).
//!
//! Business rules are deliberately thin: this crate exists to plug a real
//! aggregate into the command/event substrate. No IO, no HTTP, no storage.

pub mod directory;
pub mod user;

pub use directory::{UserDirectory, UserEntry};
pub use user::{
    ChangeEmailAddress, EmailAddressChanged, RegisterUser, User, UserCommand, UserEvent,
    UserRegistered,
};
