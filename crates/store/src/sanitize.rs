//! History sanitizer.
//!
//! Model APIs reject histories whose function_call and function_response
//! messages are not paired, or whose first turn is not the user's.
//! Truncating a history by count breaks both properties; this module
//! restores them. Sanitization is a pure function of the input slice and
//! is idempotent.
//!
//! Rules enforced on the returned window:
//! 1. every `function_response` is preceded by a matching `function_call`;
//! 2. a `function_call` is followed by all of its responses, or dropped;
//! 3. the first retained message is a `user_message` (or the window is
//!    empty);
//! 4. orphan tool turns are removed.

use std::collections::{HashMap, HashSet};

use parley_domain::message::{MessageType, Role, StoredMessage};

/// Sanitize one retrieved history slice.
///
/// Internally runs the pairing + leading-drop round to a fixpoint: the
/// final leading drop can remove a paired `function_call`, which orphans
/// its responses, so the round repeats until nothing changes. Each round
/// strictly shrinks the slice, so this terminates.
pub fn sanitize_history(mut messages: Vec<StoredMessage>) -> Vec<StoredMessage> {
    loop {
        let before = messages.len();
        messages = sanitize_round(messages);
        if messages.len() == before {
            return messages;
        }
    }
}

fn sanitize_round(messages: Vec<StoredMessage>) -> Vec<StoredMessage> {
    // Pass 1: find function ids that have a call and, later, at least one
    // response within this window.
    let mut call_pos: HashMap<&str, usize> = HashMap::new();
    let mut paired: HashSet<String> = HashSet::new();

    for (pos, msg) in messages.iter().enumerate() {
        match msg.message_type {
            MessageType::FunctionCall => {
                for id in function_ids(msg) {
                    call_pos.entry(id).or_insert(pos);
                }
            }
            MessageType::FunctionResponse => {
                for id in function_ids(msg) {
                    if call_pos.get(id).is_some_and(|&call| call < pos) {
                        paired.insert(id.to_owned());
                    }
                }
            }
            _ => {}
        }
    }

    // Pass 2: emit in order, dropping unpaired tool turns and everything
    // before the first user_message.
    let mut out: Vec<StoredMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.message_type {
            MessageType::FunctionCall | MessageType::FunctionResponse => {
                let ids = function_ids(&msg);
                let keep = !ids.is_empty() && ids.iter().all(|id| paired.contains(*id));
                if keep {
                    out.push(msg);
                }
            }
            _ => out.push(msg),
        }
    }

    while let Some(first) = out.first() {
        if first.role == Role::User && first.message_type == MessageType::UserMessage {
            break;
        }
        out.remove(0);
    }

    out
}

/// All function ids a message carries: the correlation column plus any ids
/// embedded in its call/response parts.
fn function_ids(msg: &StoredMessage) -> Vec<&str> {
    let mut ids: Vec<&str> = Vec::new();
    if let Some(fid) = msg.function_id.as_deref() {
        ids.push(fid);
    }
    for part in &msg.parts {
        let part_id = match part {
            parley_domain::message::Part::FunctionCall { function_call } => {
                function_call.id.as_deref()
            }
            parley_domain::message::Part::FunctionResponse { function_response } => {
                function_response.id.as_deref()
            }
            _ => None,
        };
        if let Some(id) = part_id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
