//! Outbound message assembly.
//!
//! Every request is rebuilt from scratch: the persona as a system message, a tagged
//! user message naming the current emotion, then the whole conversation so far.

use crate::conversation::{ConversationHistory, Message};

/// Persona instructions with the active emotion filled in.
pub fn system_prompt(emotion: &str) -> String {
    format!(
        r#"You are an empathetic conversation partner.
The user's current emotional state: "{}"

Conversation rules:
1) First, gently restate the user's feeling in a single sentence. (e.g. "It sounds like you are feeling ... right now.")
2) Then offer warm comfort and empathy in 2-3 sentences.
3) Close with one sentence suggesting a very small thing they could actually try. (e.g. a slow breath, a short walk, a one-line journal)
Tone and style:
- Polite and respectful; poetic and literary, warm but never exaggerated
- Always offer exactly one doable action, small and concrete
- Keep it short: about 3-5 sentences, each one concise
- Use humor only very subtly, and only when the situation is light and safe
- Non-medical advice only; if a crisis or professional help seems needed, encourage the user to reach out for help
"#,
        emotion
    )
}

pub fn emotion_tag(emotion: &str) -> String {
    format!("[current emotion: {}]", emotion)
}

/// Build the message sequence for one completion request.
///
/// Callers must only invoke this once an emotion is set.
pub fn build(emotion: &str, history: &ConversationHistory) -> Vec<Message> {
    debug_assert!(!emotion.is_empty(), "prompt assembled without an emotion");
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system_prompt(emotion)));
    messages.push(Message::user(emotion_tag(emotion)));
    messages.extend(history.all().iter().cloned());
    messages
}
