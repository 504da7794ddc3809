//! Prompt rendering for student conversations and teacher queries.

use distill_abstraction::{ChatMessage, Role};

/// Renders one chat turn: `<|role|>\ncontent\n`.
#[must_use]
pub fn render_turn(role: Role, content: &str) -> String {
    format!("<|{}|>\n{}\n", role.as_str(), content)
}

/// Renders a whole conversation by concatenating its turns in order.
#[must_use]
pub fn render_conversation(messages: &[ChatMessage]) -> String {
    messages.iter().map(|m| render_turn(m.role, &m.content)).collect()
}

/// The opening tag of an assistant turn, with no content after it.
#[must_use]
pub fn assistant_header() -> String {
    format!("<|{}|>\n", Role::Assistant.as_str())
}

/// Student prompt: the question alone, ready for the assistant to answer.
#[must_use]
pub fn student_prompt(question: &str) -> String {
    let mut out = render_turn(Role::User, question);
    out.push_str(&assistant_header());
    out
}

/// Teacher prompt used at evaluation: persona, question, then the character's cue.
#[must_use]
pub fn teacher_prompt(persona: &str, question: &str, character_name: &str) -> String {
    format!("{}\n\nUser: {}\n{}:", persona, question, character_name)
}

/// Whitespace word count, used for filtering and record-keeping.
#[must_use]
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_rendering() {
        let msgs = vec![ChatMessage::user("Hi?"), ChatMessage::assistant("Hello.")];
        assert_eq!(render_conversation(&msgs), "<|user|>\nHi?\n<|assistant|>\nHello.\n");
    }

    #[test]
    fn test_student_prompt_is_prefix_of_conversation() {
        let msgs = vec![ChatMessage::user("Q"), ChatMessage::assistant("A")];
        assert!(render_conversation(&msgs).starts_with(&student_prompt("Q")));
    }

    #[test]
    fn test_teacher_prompt() {
        assert_eq!(
            teacher_prompt("You are B.", "Why?", "Beethoven"),
            "You are B.\n\nUser: Why?\nBeethoven:"
        );
    }
}
