use mangaloom_contracts::EventWriter;
use serde_json::{Map, Value};

/// Optional per-run event sink. Write failures are logged and swallowed.
#[derive(Debug, Clone, Default)]
pub struct RunEvents {
    writer: Option<EventWriter>,
}

impl RunEvents {
    pub fn new(writer: Option<EventWriter>) -> Self {
        Self { writer }
    }

    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn emit(&self, event_type: &str, payload: Value) {
        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        if let Err(err) = writer.emit(event_type, map_object(payload)) {
            tracing::warn!(event_type, error = %err, "failed to write run event");
        }
    }
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_json::json;

    use super::{error_chain_text, truncate_text, RunEvents};

    #[test]
    fn truncate_text_appends_ellipsis_only_when_needed() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdef", 3), "abc…");
    }

    #[test]
    fn error_chain_text_joins_distinct_causes() {
        let err = Err::<(), _>(anyhow::anyhow!("socket closed"))
            .context("image request failed")
            .err()
            .unwrap_or_else(|| anyhow::anyhow!("unreachable"));
        assert_eq!(
            error_chain_text(&err, 200),
            "image request failed | caused by: socket closed"
        );
    }

    #[test]
    fn disabled_events_are_noops() {
        RunEvents::disabled().emit("anything", json!({"k": 1}));
    }
}
