//! Prompt preparation for chat requests.

use crate::server::backend::types::WireMessage;
use guardstream_tonic_core::proto::ChatMessage;

const SYSTEM_ROLE: &str = "system";

/// Flattens a conversation into the text the safeguard classifies:
/// `role: <role>\ncontent: <content>` per message, newline separated.
pub fn flatten_chat(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("role: {}\ncontent: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Converts the request messages for the backend, prepending `system_prompt`
/// when the conversation has no system message of its own.
///
/// The safeguard sees the conversation as the caller sent it; only the
/// backend gets the injected system message.
pub fn backend_messages(messages: &[ChatMessage], system_prompt: Option<&str>) -> Vec<WireMessage> {
    let inject = system_prompt.filter(|_| !messages.iter().any(|m| m.role == SYSTEM_ROLE));

    inject
        .map(|content| WireMessage {
            role: SYSTEM_ROLE.to_owned(),
            content: content.to_owned(),
        })
        .into_iter()
        .chain(messages.iter().map(|m| WireMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_owned(),
            content: content.to_owned(),
        }
    }

    #[test]
    fn flattens_in_order() {
        let messages = [msg("user", "hi"), msg("assistant", "hello"), msg("user", "bye")];
        assert_eq!(
            flatten_chat(&messages),
            "role: user\ncontent: hi\nrole: assistant\ncontent: hello\nrole: user\ncontent: bye"
        );
        assert_eq!(flatten_chat(&[]), "");
    }

    #[test]
    fn system_prompt_is_prepended_once() {
        let messages = [msg("user", "hi")];
        let wire = backend_messages(&messages, Some("be brief"));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[0].content, "be brief");
        assert_eq!(wire[1], WireMessage::user("hi"));
    }

    #[test]
    fn caller_system_message_wins() {
        let messages = [msg("system", "talk like a pirate"), msg("user", "hi")];
        let wire = backend_messages(&messages, Some("be brief"));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].content, "talk like a pirate");

        assert_eq!(backend_messages(&messages[1..], None).len(), 1);
    }
}
