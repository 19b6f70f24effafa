//! Message storage for Strand.
//!
//! Nodes serve resend requests from a [`MessageStore`]. The network layer
//! depends only on the trait; [`MemoryStore`] is the in-process
//! implementation used as a node's short-term buffer and in tests.

mod error;
mod memory;
mod store;

pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use store::{collect, MessageStore, MessageStream};
