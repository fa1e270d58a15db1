//! Payload sanitization for logging. The original payload is never
//! modified; the returned copy masks the recipient and every nested text
//! field before it reaches a log line.

use serde_json::Value;

use crate::pii::{mask_text, redact_phone};

const TEXT_PATHS: [&[&str]; 4] = [
    &["text", "body"],
    &["interactive", "body", "text"],
    &["interactive", "header", "text"],
    &["interactive", "footer", "text"],
];

fn mask_path(payload: &mut Value, path: &[&str]) {
    let mut current = payload;
    for key in &path[..path.len() - 1] {
        match current.get_mut(*key) {
            Some(next) => current = next,
            None => return,
        }
    }
    let last = path[path.len() - 1];
    if let Some(Value::String(text)) = current.get_mut(last) {
        *text = mask_text(text);
    }
}

/// Produce a log-safe copy of an outbound payload.
pub fn sanitize_payload(payload: &Value) -> Value {
    let mut sanitized = payload.clone();

    if let Some(Value::String(to)) = sanitized.get_mut("to") {
        *to = redact_phone(to);
    }

    for path in TEXT_PATHS {
        mask_path(&mut sanitized, path);
    }

    // button titles can carry user-derived text too
    if let Some(buttons) = sanitized
        .get_mut("interactive")
        .and_then(|i| i.get_mut("action"))
        .and_then(|a| a.get_mut("buttons"))
        .and_then(Value::as_array_mut)
    {
        for button in buttons {
            if let Some(Value::String(title)) = button
                .get_mut("reply")
                .and_then(|r| r.get_mut("title"))
            {
                *title = mask_text(title);
            }
        }
    }

    sanitized
}
