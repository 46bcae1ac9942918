//! Trapline Shared Library
//!
//! Canonical interaction model, WebSocket wire protocol, and error types
//! shared by the server crates.

pub mod error;
pub mod interaction;
pub mod protocol;

pub use error::{Error, Result};
pub use interaction::{Interaction, InteractionDetail};
