//! Responder Table
//!
//! Decides whether an inbound room message deserves a response at all, before
//! any backend capacity is spent. Responders are a fixed, statically
//! registered table of variants; each one matches text it cares about and
//! carries two engagement probabilities, one for ambient chatter and one for
//! messages that mention the bot. Dispatch is a plain match, so the full set
//! of responders is visible in one place.

use rand::Rng;

/// What a responder wants done with a message
#[derive(Clone, Debug, PartialEq)]
pub enum ResponderAction {
    /// Route the message into its conversation worker for generation
    Engage,
    /// Answer immediately with a canned reply, no generation
    CannedReply(String),
}

/// The statically known responder variants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResponderKind {
    /// Short canned reaction to greetings
    Greeting,
    /// Catch-all that engages the generation pipeline
    Conversation,
}

/// One registered responder with its engagement probabilities
pub struct ResponderEntry {
    kind: ResponderKind,
    /// Chance of acting on ambient chatter
    base_chance: f64,
    /// Chance of acting when the bot is mentioned
    mentioned_chance: f64,
}

impl ResponderEntry {
    /// The engagement probability applicable to this message
    #[must_use]
    pub fn chance(&self, mentioned: bool) -> f64 {
        if mentioned {
            self.mentioned_chance
        } else {
            self.base_chance
        }
    }

    /// Whether this responder matches the text, and what it would do
    #[must_use]
    pub fn try_respond(&self, text: &str) -> Option<ResponderAction> {
        match self.kind {
            ResponderKind::Greeting => {
                let lowered = text.trim().to_lowercase();
                let greeted = ["hello", "hi ", "hey", "good morning", "good evening"]
                    .iter()
                    .any(|g| lowered.starts_with(g));
                greeted.then(|| ResponderAction::CannedReply("hello!".to_string()))
            }
            ResponderKind::Conversation => Some(ResponderAction::Engage),
        }
    }
}

/// Ordered table of responders; the first one that matches and wins its
/// chance roll acts
pub struct ResponderTable {
    entries: Vec<ResponderEntry>,
}

impl ResponderTable {
    /// The built-in table: greetings first, then the conversation catch-all
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                ResponderEntry {
                    kind: ResponderKind::Greeting,
                    base_chance: 0.25,
                    mentioned_chance: 1.0,
                },
                ResponderEntry {
                    kind: ResponderKind::Conversation,
                    base_chance: 0.05,
                    mentioned_chance: 1.0,
                },
            ],
        }
    }

    /// Decide what to do with an inbound message
    ///
    /// Walks the table in order; each matching responder rolls against the
    /// chance appropriate to whether the bot was mentioned. `None` means the
    /// message is ignored.
    pub fn decide<R: Rng>(
        &self,
        text: &str,
        mentioned: bool,
        rng: &mut R,
    ) -> Option<ResponderAction> {
        for entry in &self.entries {
            let Some(action) = entry.try_respond(text) else {
                continue;
            };
            let chance = entry.chance(mentioned);
            if rng.gen::<f64>() < chance {
                tracing::debug!(kind = ?entry.kind, mentioned, "responder engaged");
                return Some(action);
            }
        }
        None
    }
}
