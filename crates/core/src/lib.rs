//! # Kiln Core
//!
//! Domain types, traits, and error definitions for the kiln generation service.
//! This crate has **no framework dependencies**: it defines the domain model
//! that the store, inference, routing, and gateway crates implement against.
//!
//! Every subsystem boundary is a trait here:
//! - [`ConversationStore`] for persistence (SQLite or in-memory)
//! - [`ModelRuntime`] / [`LoadedModel`] for the text-generation engine
//!
//! so implementations can be swapped via configuration and replaced with
//! scripted fakes in tests.

pub mod error;
pub mod message;
pub mod params;
pub mod runtime;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use error::{
    Error, GenerationError, LoadFailureCause, Result, RoutingError, RuntimeError, StoreError,
};
pub use message::{
    ChatMessage, ContextInjection, Conversation, ConversationSummary, InjectionKind, Metadata,
    NewInjection, NewMessage, Role, StoredMessage,
};
pub use params::GenerationParams;
pub use runtime::{AvailableModel, LoadRequest, LoadedModel, ModelInfo, ModelRuntime, TokenFlow};
pub use store::{ConversationStore, StoreStats};
