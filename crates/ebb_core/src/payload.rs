/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde_json::Value;

const PREVIEW_MAX_CHARS: usize = 280;

fn parse(bytes: &[u8]) -> Option<Value> {
    serde_json::from_slice(bytes).ok()
}

/// The embedded object of an activity, or the value itself when the payload
/// is a bare object.
fn object(value: &Value) -> &Value {
    match value.get("object") {
        Some(obj) if obj.is_object() => obj,
        _ => value,
    }
}

fn nonempty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Canonical URI of the post carried by an activity. Prefers the embedded
/// object's id; tolerates the `"object": "<uri>"` string form and bare
/// objects. Malformed payloads yield `None`.
pub fn object_uri(bytes: &[u8]) -> Option<String> {
    let v = parse(bytes)?;
    let uri = match v.get("object") {
        Some(Value::Object(map)) => map.get("id").and_then(|id| id.as_str()),
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    }
    .or_else(|| v.get("id").and_then(|id| id.as_str()))?;
    nonempty(uri)
}

/// The `inReplyTo` reference of the carried object, in either the string or
/// the `{ "id": … }` form.
pub fn parent_uri(bytes: &[u8]) -> Option<String> {
    let v = parse(bytes)?;
    let parent = match object(&v).get("inReplyTo")? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(|id| id.as_str()),
        _ => None,
    }?;
    nonempty(parent)
}

pub fn activity_type(bytes: &[u8]) -> Option<String> {
    let v = parse(bytes)?;
    nonempty(v.get("type")?.as_str()?)
}

pub fn actor(bytes: &[u8]) -> Option<String> {
    let v = parse(bytes)?;
    let actor = v
        .get("actor")
        .and_then(|a| a.as_str())
        .or_else(|| object(&v).get("attributedTo").and_then(|a| a.as_str()))?;
    nonempty(actor)
}

/// HTML-stripped, length-bounded preview of the carried object's content.
/// Empty when the payload is malformed or carries no content.
pub fn content_preview(bytes: &[u8]) -> String {
    let Some(v) = parse(bytes) else {
        return String::new();
    };
    let Some(content) = object(&v).get("content").and_then(|c| c.as_str()) else {
        return String::new();
    };
    let text = strip_html(content);
    let text = text.trim();
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        text.to_string()
    } else {
        text.chars().take(PREVIEW_MAX_CHARS).collect()
    }
}

pub(crate) fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ => {
                if !in_tag {
                    out.push(c);
                }
            }
        }
    }
    out
}
