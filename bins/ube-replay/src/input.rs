use serde::Deserialize;
use ube_api::Message;
use ube_engine::EngineError;

/// One line of the input file. `body` may be a JSON string (taken as is)
/// or any other JSON value (re-serialized).
#[derive(Debug, Deserialize)]
struct InputLine {
    #[serde(default)]
    id: String,
    #[serde(default)]
    reference: String,
    #[serde(default)]
    source_uri: String,
    body: serde_json::Value,
}

impl From<InputLine> for Message {
    fn from(line: InputLine) -> Self {
        let body = match line.body {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Message {
            id: line.id,
            reference: line.reference,
            source_uri: line.source_uri,
            body,
        }
    }
}

/// Parse JSON-lines input. Blank lines and `#` comments are skipped;
/// a line without an id gets `line-<n>`.
pub fn parse_lines(content: &str) -> Result<Vec<Message>, EngineError> {
    let mut messages = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed: InputLine =
            serde_json::from_str(line).map_err(|e| EngineError::Config(format!("input line {}: {e}", i + 1)))?;
        let mut message = Message::from(parsed);
        if message.id.is_empty() {
            message.id = format!("line-{}", i + 1);
        }
        messages.push(message);
    }
    Ok(messages)
}

pub async fn read_lines(path: &str) -> Result<Vec<Message>, EngineError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
    parse_lines(&content)
}
