// ── AI orchestrator ────────────────────────────────────────────────────────
// Decides which non-human participants answer a given utterance, and in what
// order. Pure and deterministic: same (conversation, message, history) in,
// bit-equal responder list out. Responders always fire in declared
// participant order (created_at asc), one at a time.
//
// Multi-user arbitration:
//   • A message that explicitly addresses AI participants gets exactly those.
//   • Two consecutive human messages from distinct users mute the room,
//     except for the most recently mentioned character (continuation).
//   • Otherwise every AI participant responds.

use crate::atoms::types::{ChatMessage, Conversation, Participant, SenderKind};
use regex::Regex;

/// Optional semantic-relevance hook. Must be deterministic and
/// side-effect free; the default never volunteers a responder.
pub type RelevancePredicate =
    Box<dyn Fn(&Participant, &ChatMessage, &[ChatMessage]) -> bool + Send + Sync>;

pub struct Orchestrator {
    relevance: RelevancePredicate,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Orchestrator {
            relevance: Box::new(|_, _, _| false),
        }
    }
}

/// `@Name` token, case-insensitive, word-boundary.
fn is_mentioned(text: &str, name: &str) -> bool {
    let pattern = format!(r"(?i)@{}\b", regex::escape(name));
    Regex::new(&pattern).map(|re| re.is_match(text)).unwrap_or(false)
}

/// Name at the start of the utterance, flanked by punctuation, or greeted.
fn is_directly_addressed(text: &str, name: &str) -> bool {
    let escaped = regex::escape(name);
    let patterns = [
        format!(r"(?i)^\s*{escaped}\b"),
        format!(r"(?i)\b{escaped}\s*[,?!]"),
        format!(r"(?i)\b(hey|hi)[\s,]+{escaped}\b"),
    ];
    patterns
        .iter()
        .any(|p| Regex::new(p).map(|re| re.is_match(text)).unwrap_or(false))
}

fn addresses(text: &str, name: &str) -> bool {
    is_mentioned(text, name) || is_directly_addressed(text, name)
}

/// Most recently mentioned AI participant in the history window, if any.
fn continuation_target<'a>(
    ai_participants: &[&'a Participant],
    recent: &[ChatMessage],
) -> Option<&'a Participant> {
    for message in recent.iter().rev() {
        let text = message.content.as_text();
        for p in ai_participants {
            if addresses(&text, &p.display_name) {
                return Some(p);
            }
        }
    }
    None
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relevance(relevance: RelevancePredicate) -> Self {
        Orchestrator { relevance }
    }

    /// Ordered responder list for `new_message`. `participants` must be in
    /// declared order; `recent` is the trailing history window, oldest
    /// first, not including `new_message`.
    pub fn decide(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
        new_message: &ChatMessage,
        recent: &[ChatMessage],
    ) -> Vec<String> {
        let ai: Vec<&Participant> = participants.iter().filter(|p| p.is_ai()).collect();
        if ai.is_empty() {
            return vec![];
        }

        // Single-user room: every AI seat answers, declared order.
        if !conversation.is_multi_user {
            return ai.iter().map(|p| p.id.clone()).collect();
        }

        let text = new_message.content.as_text();

        // Explicitly addressed AI participants win outright.
        let addressed: Vec<String> = ai
            .iter()
            .filter(|p| addresses(&text, &p.display_name))
            .map(|p| p.id.clone())
            .collect();
        if !addressed.is_empty() {
            return dedup_preserving(addressed);
        }

        // User-to-user suppression: the two latest messages are USER
        // messages from distinct humans.
        let suppressed = new_message.sender_kind == SenderKind::User
            && recent.last().is_some_and(|prev| {
                prev.sender_kind == SenderKind::User && prev.sender_ref != new_message.sender_ref
            });

        if suppressed {
            let mut eligible: Vec<String> = vec![];
            if let Some(target) = continuation_target(&ai, recent) {
                eligible.push(target.id.clone());
            }
            for p in &ai {
                if (self.relevance)(p, new_message, recent) {
                    eligible.push(p.id.clone());
                }
            }
            return dedup_preserving(order_by_declared(eligible, &ai));
        }

        // Unaddressed, unsuppressed: the whole cast responds.
        ai.iter().map(|p| p.id.clone()).collect()
    }
}

fn dedup_preserving(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

fn order_by_declared(mut ids: Vec<String>, declared: &[&Participant]) -> Vec<String> {
    let position = |id: &String| declared.iter().position(|p| &p.id == id).unwrap_or(usize::MAX);
    ids.sort_by_key(position);
    ids
}
