//! Operation inputs with garde validation.
//!
//! These structs validate caller data before it reaches the engine.

use garde::Validate;
use serde::Deserialize;

use crate::error::SyncError;

/// Validation constants
const MAX_PEER_ID_LENGTH: usize = 128;
const MAX_MESSAGE_LENGTH: usize = 10000;

/// Input for opening a thread
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct OpenThreadInput {
    #[garde(length(min = 1, max = MAX_PEER_ID_LENGTH))]
    pub peer_id: String,
}

/// Input for sending a message
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(min = 1, max = MAX_PEER_ID_LENGTH))]
    pub peer_id: String,
    #[garde(length(min = 1, max = MAX_MESSAGE_LENGTH))]
    pub content: String,
}

/// Helper trait to convert garde validation errors into the engine taxonomy
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), SyncError>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), SyncError> {
        self.validate()
            .map_err(|e| SyncError::InvalidInput(e.to_string()))
    }
}
