//! Ripple relay library
//!
//! This module exposes the relay components for use in integration tests.

mod connection;
mod messages;
mod state;

pub use connection::handle_connection;
pub use connection::handle_frame;
pub use messages::WireMessage;
pub use state::{room_id, RelayState};
