//! Prompt assembly: system injections, then windowed history, then the new turn.
//!
//! [`assemble`] is pure over data already read from the store; it never
//! writes. [`assemble_for`] performs the two reads and delegates.

use kiln_core::error::StoreError;
use kiln_core::{ChatMessage, ContextInjection, ConversationStore, InjectionKind, StoredMessage};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything [`assemble`] needs, already fetched.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    /// Active injections in retrieval order (priority desc, insertion asc).
    pub injections: &'a [ContextInjection],
    /// History in ascending order, already limited to the window.
    pub history: &'a [StoredMessage],
    pub new_messages: &'a [ChatMessage],
}

/// Counts describing what went into an assembled prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextApplied {
    /// System injections merged into the prompt.
    pub injections_count: usize,
    pub history_count: usize,
    pub total_messages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub applied: ContextApplied,
}

pub fn assemble(input: AssemblyInput<'_>) -> AssembledContext {
    let mut messages =
        Vec::with_capacity(input.injections.len() + input.history.len() + input.new_messages.len());

    let mut injections_count = 0;
    for injection in input.injections {
        if injection.kind == InjectionKind::System {
            messages.push(ChatMessage::system(injection.content.clone()));
            injections_count += 1;
        } else {
            debug!(
                id = %injection.id,
                kind = injection.kind.as_str(),
                "Skipping reserved injection type"
            );
        }
    }

    messages.extend(input.history.iter().map(StoredMessage::to_chat));
    messages.extend(input.new_messages.iter().cloned());

    let applied = ContextApplied {
        injections_count,
        history_count: input.history.len(),
        total_messages: messages.len(),
    };
    AssembledContext { messages, applied }
}

/// Read injections and the last `window_size` history messages for
/// `conversation_id`, then [`assemble`].
///
/// An unknown conversation contributes no context.
pub async fn assemble_for(
    store: &dyn ConversationStore,
    conversation_id: &str,
    window_size: usize,
    new_messages: &[ChatMessage],
) -> Result<AssembledContext, StoreError> {
    let injections = store.get_active_injections(conversation_id).await?;
    let history = if window_size == 0 {
        Vec::new()
    } else {
        store.get_history(conversation_id, Some(window_size)).await?
    };

    let assembled = assemble(AssemblyInput {
        injections: &injections,
        history: &history,
        new_messages,
    });

    debug!(
        conversation_id,
        window_size,
        injections = assembled.applied.injections_count,
        history = assembled.applied.history_count,
        "Assembled context"
    );
    Ok(assembled)
}
