mod conversation;
pub mod input;
mod message;
mod peer;

pub use conversation::{ConversationSummary, Thread, ThreadPhase, ThreadView};
pub use message::{DeliveryState, Message, MessageContent};
pub use peer::Peer;
