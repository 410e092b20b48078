//! Debug rendering for messages and contexts.

use peer_sync_core::{Context, Message};

/// Pretty JSON for a context. Falls back to an empty string.
pub(crate) fn render(context: &Context) -> String {
    serde_json::to_string_pretty(context).unwrap_or_default()
}

/// Log a message at debug level under an operation name.
pub(crate) fn log_message(operation: &'static str, message: &Message) {
    tracing::debug!(
        operation,
        command = message.command_name(),
        payload = %message.payload().map(render).unwrap_or_default(),
        "message"
    );
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_render_context() {
        let mut context = Context::new();
        context.insert("a".to_string(), json!(1));
        assert_eq!(render(&context), "{\n  \"a\": 1\n}");
        assert_eq!(render(&Context::new()), "{}");
    }
}
