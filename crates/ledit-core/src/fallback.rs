// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use ledit_model::ToolCall;

/// Result of scanning assistant prose for embedded tool calls.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub calls: Vec<ToolCall>,
    /// The original content with every parsed span excised, so the
    /// rewritten assistant message contains only prose.
    pub cleaned: String,
}

/// Recover tool calls the model wrote into its text instead of emitting
/// structured calls.  Three block shapes are recognized:
///
/// 1. fenced code blocks containing JSON (a `tool_calls` array, an array of
///    call objects, or a single call object),
/// 2. XML-ish `<function=NAME>` blocks with `<parameter=KEY>` children,
///    optionally wrapped in `<tool_call>` delimiters,
/// 3. free-form `name: NAME` followed by a balanced JSON object.
///
/// Returns `None` when no calls are found; the parser is idempotent on
/// already-clean content.
pub fn extract_tool_calls(content: &str) -> Option<Extraction> {
    let mut calls: Vec<ToolCall> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    scan_fenced_blocks(content, &mut calls, &mut spans);
    scan_function_tags(content, &mut calls, &mut spans);
    scan_freeform(content, &mut calls, &mut spans);

    dedupe(&mut calls);
    if calls.is_empty() {
        return None;
    }
    debug!(count = calls.len(), "recovered tool calls from prose");
    Some(Extraction {
        calls,
        cleaned: excise(content, &spans),
    })
}

// ─── Shape 1: fenced JSON blocks ──────────────────────────────────────────────

fn scan_fenced_blocks(content: &str, calls: &mut Vec<ToolCall>, spans: &mut Vec<(usize, usize)>) {
    let fence = Regex::new(r"(?s)```[a-zA-Z]*\n?(.*?)```").unwrap();
    for cap in fence.captures_iter(content) {
        let whole = cap.get(0).unwrap();
        let inner = cap.get(1).unwrap().as_str().trim();
        let Ok(value) = serde_json::from_str::<Value>(inner) else {
            continue;
        };
        let found = calls_from_value(&value);
        if !found.is_empty() {
            calls.extend(found);
            spans.push((whole.start(), whole.end()));
        }
    }
}

/// Accept `{"tool_calls": [...]}`, a bare array of call objects, or a single
/// call object.
fn calls_from_value(value: &Value) -> Vec<ToolCall> {
    match value {
        Value::Object(obj) => {
            if let Some(Value::Array(arr)) = obj.get("tool_calls") {
                arr.iter().filter_map(call_from_object).collect()
            } else {
                call_from_object(value).into_iter().collect()
            }
        }
        Value::Array(arr) => arr.iter().filter_map(call_from_object).collect(),
        _ => Vec::new(),
    }
}

/// Parse one call object.  Both `{"function": {"name", "arguments"}}` and
/// flat `{"name", "arguments"|"parameters"}` layouts are accepted.
fn call_from_object(value: &Value) -> Option<ToolCall> {
    let obj = value.as_object()?;
    let (name, args) = if let Some(function) = obj.get("function").and_then(Value::as_object) {
        (
            function.get("name")?.as_str()?,
            function.get("arguments").or_else(|| function.get("parameters")),
        )
    } else {
        (
            obj.get("name")?.as_str()?,
            obj.get("arguments").or_else(|| obj.get("parameters")),
        )
    };
    if name.is_empty() {
        return None;
    }
    Some(ToolCall::new(
        synthetic_id(name),
        name,
        normalize_arguments(args),
    ))
}

// ─── Shape 2: XML-ish function tags ───────────────────────────────────────────

fn scan_function_tags(content: &str, calls: &mut Vec<ToolCall>, spans: &mut Vec<(usize, usize)>) {
    let func =
        Regex::new(r"(?s)(<tool_call>\s*)?<function=([\w-]+)>(.*?)</function>(\s*</tool_call>)?")
            .unwrap();
    let param = Regex::new(r"(?s)<parameter=([\w-]+)>(.*?)</parameter>").unwrap();
    for cap in func.captures_iter(content) {
        let whole = cap.get(0).unwrap();
        if overlaps(spans, whole.start(), whole.end()) {
            continue;
        }
        let name = cap.get(2).unwrap().as_str();
        let body = cap.get(3).unwrap().as_str();
        let mut args = Map::new();
        for pcap in param.captures_iter(body) {
            let key = pcap.get(1).unwrap().as_str().to_string();
            let raw = pcap.get(2).unwrap().as_str().trim();
            args.insert(key, scalar_value(raw));
        }
        let arguments = serde_json::to_string(&Value::Object(args)).unwrap_or_else(|_| "{}".into());
        calls.push(ToolCall::new(synthetic_id(name), name, arguments));
        spans.push((whole.start(), whole.end()));
    }
}

/// Parameter values arrive as text; re-type obvious scalars so downstream
/// validation sees proper JSON numbers and booleans.
fn scalar_value(raw: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        match v {
            Value::Number(_) | Value::Bool(_) | Value::Object(_) | Value::Array(_) => return v,
            _ => {}
        }
    }
    Value::String(raw.to_string())
}

// ─── Shape 3: free-form name + JSON object ────────────────────────────────────

fn scan_freeform(content: &str, calls: &mut Vec<ToolCall>, spans: &mut Vec<(usize, usize)>) {
    let head = Regex::new(r#"\bname:\s*"?([A-Za-z_][\w-]*)"?"#).unwrap();
    for cap in head.captures_iter(content) {
        let whole = cap.get(0).unwrap();
        if overlaps(spans, whole.start(), whole.end()) {
            continue;
        }
        let name = cap.get(1).unwrap().as_str();
        let rest = &content[whole.end()..];
        let Some(open_rel) = rest.find('{') else {
            continue;
        };
        // The JSON object must follow closely, or "name:" is ordinary prose.
        if rest[..open_rel].trim().len() > 40 {
            continue;
        }
        let open = whole.end() + open_rel;
        let Some(close) = balanced_object_end(content, open) else {
            continue;
        };
        if overlaps(spans, whole.start(), close) {
            continue;
        }
        let Ok(args) = serde_json::from_str::<Value>(&content[open..close]) else {
            continue;
        };
        if !args.is_object() {
            continue;
        }
        calls.push(ToolCall::new(
            synthetic_id(name),
            name,
            normalize_arguments(Some(&args)),
        ));
        spans.push((whole.start(), close));
    }
}

/// Find the end (exclusive) of the JSON object starting at `open`
/// (which must point at `{`), honoring strings and escapes.
fn balanced_object_end(content: &str, open: usize) -> Option<usize> {
    let bytes = content.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Normalization, ids, dedupe, excision ─────────────────────────────────────

/// Canonicalize arguments to a JSON-encoded object string.
///
/// A string that itself parses as JSON is decoded first (the
/// JSON-inside-string case); anything parseable is re-marshaled to
/// canonical form; otherwise the literal string is kept.
fn normalize_arguments(args: Option<&Value>) -> String {
    match args {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => {
            if let Ok(decoded) = serde_json::from_str::<Value>(s) {
                serde_json::to_string(&decoded).unwrap_or_else(|_| s.clone())
            } else {
                s.clone()
            }
        }
        Some(other) => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
    }
}

static SEQ: AtomicU64 = AtomicU64::new(0);

/// `fallback_<sanitized_name>_<nanotime>` — the sequence counter keeps ids
/// unique even when two calls land in the same nanosecond tick.
fn synthetic_id(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("fallback_{sanitized}_{}", nanos.wrapping_add(seq))
}

fn dedupe(calls: &mut Vec<ToolCall>) {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    calls.retain(|c| seen.insert((c.function.name.clone(), c.function.arguments.clone())));
}

fn overlaps(spans: &[(usize, usize)], start: usize, end: usize) -> bool {
    spans.iter().any(|&(s, e)| start < e && s < end)
}

/// Remove the parsed spans, gluing the surrounding prose back together with
/// single newlines so no blank scars remain.
fn excise(content: &str, spans: &[(usize, usize)]) -> String {
    let mut sorted = spans.to_vec();
    sorted.sort_unstable();
    let mut parts: Vec<&str> = Vec::new();
    let mut cursor = 0usize;
    for &(start, end) in &sorted {
        if start > cursor {
            parts.push(&content[cursor..start]);
        }
        cursor = cursor.max(end);
    }
    if cursor < content.len() {
        parts.push(&content[cursor..]);
    }
    let trimmed: Vec<&str> = parts
        .iter()
        .map(|p| p.trim_matches(|c| c == '\n' || c == '\r'))
        .filter(|p| !p.trim().is_empty())
        .collect();
    trimmed.join("\n").trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Fenced JSON ───────────────────────────────────────────────────────────

    #[test]
    fn fenced_tool_calls_array_is_extracted() {
        let content = "Let me read it.\n```json\n{\"tool_calls\":[{\"function\":{\"name\":\"read_file\",\"arguments\":\"{\\\"path\\\":\\\"x.go\\\"}\"}}]}\n```\nDone.";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls.len(), 1);
        assert_eq!(ex.calls[0].function.name, "read_file");
        assert_eq!(ex.calls[0].function.arguments, r#"{"path":"x.go"}"#);
        assert_eq!(ex.cleaned, "Let me read it.\nDone.");
    }

    #[test]
    fn fenced_single_call_object() {
        let content = "```\n{\"name\":\"list_dir\",\"arguments\":{\"path\":\"src\"}}\n```";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls[0].function.name, "list_dir");
        assert_eq!(ex.calls[0].function.arguments, r#"{"path":"src"}"#);
        assert!(ex.cleaned.is_empty());
    }

    #[test]
    fn fenced_array_of_calls() {
        let content = "```json\n[{\"name\":\"a\",\"arguments\":{}},{\"name\":\"b\",\"parameters\":{\"k\":1}}]\n```";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls.len(), 2);
        assert_eq!(ex.calls[1].function.arguments, r#"{"k":1}"#);
    }

    #[test]
    fn fenced_non_call_json_is_ignored() {
        let content = "Config looks like:\n```json\n{\"version\": 3}\n```";
        assert!(extract_tool_calls(content).is_none());
    }

    #[test]
    fn fenced_code_that_is_not_json_is_ignored() {
        let content = "```rust\nfn main() {}\n```";
        assert!(extract_tool_calls(content).is_none());
    }

    // ── XML-ish tags ──────────────────────────────────────────────────────────

    #[test]
    fn function_tag_with_parameters() {
        let content = "<function=shell_command>\n<parameter=command>ls -la</parameter>\n</function>";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls[0].function.name, "shell_command");
        assert_eq!(ex.calls[0].function.arguments, r#"{"command":"ls -la"}"#);
    }

    #[test]
    fn tool_call_wrapper_is_consumed() {
        let content =
            "before\n<tool_call>\n<function=read_file>\n<parameter=path>a.rs</parameter>\n</function>\n</tool_call>\nafter";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls.len(), 1);
        assert_eq!(ex.cleaned, "before\nafter");
    }

    #[test]
    fn numeric_parameter_values_are_typed() {
        let content =
            "<function=read_file><parameter=path>f.rs</parameter><parameter=limit>10</parameter></function>";
        let ex = extract_tool_calls(content).unwrap();
        let args: Value = serde_json::from_str(&ex.calls[0].function.arguments).unwrap();
        assert_eq!(args["limit"], Value::from(10));
        assert_eq!(args["path"], Value::from("f.rs"));
    }

    // ── Free-form ─────────────────────────────────────────────────────────────

    #[test]
    fn freeform_name_and_object() {
        let content = "I'll call:\nname: search_files\n{\"pattern\": \"TODO\", \"path\": \"src\"}\nthen report.";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls[0].function.name, "search_files");
        let args: Value = serde_json::from_str(&ex.calls[0].function.arguments).unwrap();
        assert_eq!(args["pattern"], Value::from("TODO"));
        assert_eq!(ex.cleaned, "I'll call:\nthen report.");
    }

    #[test]
    fn freeform_with_nested_braces() {
        let content = "name: write_file {\"path\":\"a\",\"content\":\"{\\\"x\\\":1}\"}";
        let ex = extract_tool_calls(content).unwrap();
        let args: Value = serde_json::from_str(&ex.calls[0].function.arguments).unwrap();
        assert_eq!(args["content"], Value::from("{\"x\":1}"));
    }

    #[test]
    fn freeform_without_object_is_ignored() {
        assert!(extract_tool_calls("the name: Smith was mentioned").is_none());
    }

    #[test]
    fn freeform_distant_brace_is_ignored() {
        let content = format!("name: foo {} {{\"a\":1}}", "filler words ".repeat(10));
        assert!(extract_tool_calls(&content).is_none());
    }

    // ── Normalization ─────────────────────────────────────────────────────────

    #[test]
    fn string_encoded_arguments_are_decoded() {
        let content = "```json\n{\"name\":\"t\",\"arguments\":\"{\\\"k\\\": 1}\"}\n```";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls[0].function.arguments, r#"{"k":1}"#);
    }

    #[test]
    fn missing_arguments_become_empty_object() {
        let content = "```json\n{\"name\":\"t\"}\n```";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls[0].function.arguments, "{}");
    }

    #[test]
    fn unparseable_string_arguments_kept_literal() {
        let content = "```json\n{\"name\":\"t\",\"arguments\":\"not json\"}\n```";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls[0].function.arguments, "not json");
    }

    // ── Ids, dedupe, idempotence ──────────────────────────────────────────────

    #[test]
    fn synthetic_ids_have_fallback_prefix_and_are_unique() {
        let content = "```json\n[{\"name\":\"a\",\"arguments\":{\"x\":1}},{\"name\":\"a\",\"arguments\":{\"x\":2}}]\n```";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls.len(), 2);
        assert!(ex.calls[0].id.starts_with("fallback_a_"));
        assert_ne!(ex.calls[0].id, ex.calls[1].id);
    }

    #[test]
    fn duplicate_calls_are_deduplicated() {
        let content = "```json\n[{\"name\":\"a\",\"arguments\":{\"x\":1}},{\"name\":\"a\",\"arguments\":{\"x\":1}}]\n```";
        let ex = extract_tool_calls(content).unwrap();
        assert_eq!(ex.calls.len(), 1);
    }

    #[test]
    fn clean_content_returns_none() {
        assert!(extract_tool_calls("Just a normal reply about code.").is_none());
        assert!(extract_tool_calls("").is_none());
    }

    #[test]
    fn extraction_is_stable_across_repeated_parses() {
        let content = "x\n```json\n{\"name\":\"read_file\",\"arguments\":{\"path\":\"a\"}}\n```\ny";
        let first = extract_tool_calls(content).unwrap();
        let second = extract_tool_calls(content).unwrap();
        let sig = |ex: &Extraction| {
            ex.calls
                .iter()
                .map(|c| (c.function.name.clone(), c.function.arguments.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(sig(&first), sig(&second));
        assert_eq!(first.cleaned, second.cleaned);
    }

    #[test]
    fn cleaned_content_yields_no_further_calls() {
        let content = "a\n```json\n{\"name\":\"t\",\"arguments\":{}}\n```\nb";
        let ex = extract_tool_calls(content).unwrap();
        assert!(extract_tool_calls(&ex.cleaned).is_none());
    }

    #[test]
    fn mixed_shapes_in_one_message() {
        let content = "```json\n{\"name\":\"a\",\"arguments\":{}}\n```\n<function=b><parameter=k>v</parameter></function>";
        let ex = extract_tool_calls(content).unwrap();
        let names: Vec<&str> = ex.calls.iter().map(|c| c.function.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
