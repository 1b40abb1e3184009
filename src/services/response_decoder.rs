//! Pulls JSON out of free-form model output.
//!
//! The strict path tries, in order: the interior of the first fenced code
//! block (or the whole text), the span from the first `{` to the last `}`, and
//! the span from the first `[` to the last `]`. The lenient path adds a
//! repair pass through `llm_json` for near-valid or truncated JSON. Neither path
//! panics or errors on malformed input; exhaustion is reported as `None`.

use llm_json::RepairOptions;
use serde_json::Value;

use crate::error::AppError;
use crate::models::organize::{GeneratedNode, OrganizeSuggestion};

const FENCE: &str = "```";

/// Interior of the first closed fenced block, with any language tag removed.
fn fenced_interior(text: &str) -> Option<&str> {
    let start = text.find(FENCE)? + FENCE.len();
    let rest = &text[start..];
    let end = rest.find(FENCE)?;
    let block = &rest[..end];

    let tag_len = block
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+')))
        .map(|(idx, _)| idx)
        .unwrap_or(block.len());
    let after_tag = &block[tag_len..];
    if tag_len > 0 && (after_tag.is_empty() || after_tag.starts_with(char::is_whitespace)) {
        Some(after_tag)
    } else {
        Some(block)
    }
}

fn candidate_text(text: &str) -> &str {
    fenced_interior(text).unwrap_or(text).trim()
}

fn slice_between(text: &str, open: char, close: char) -> Option<&str> {
    let first = text.find(open)?;
    let last = text.rfind(close)?;
    (first < last).then(|| &text[first..=last])
}

fn try_parse(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

fn decode_strict(text: &str) -> Option<(String, Value)> {
    let candidate = candidate_text(text);
    if candidate.is_empty() {
        return None;
    }

    if let Some(value) = try_parse(candidate) {
        return Some((candidate.to_string(), value));
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(slice) = slice_between(candidate, open, close) {
            if let Some(value) = try_parse(slice) {
                return Some((slice.to_string(), value));
            }
        }
    }
    None
}

/// The JSON text found in a model response, exactly as it appeared.
pub fn extract_json_string(text: &str) -> Option<String> {
    decode_strict(text).map(|(raw, _)| raw)
}

pub fn decode(text: &str) -> Option<Value> {
    decode_strict(text).map(|(_, value)| value)
}

/// [`decode`], then `llm_json` repair over the most promising span: first up
/// to the last matching closer, then to the end of the text for truncated
/// output.
pub fn decode_lenient(text: &str) -> Option<Value> {
    if let Some(value) = decode(text) {
        return Some(value);
    }

    let candidate = candidate_text(text);
    let start = candidate.find(['[', '{'])?;
    let closer = if candidate[start..].starts_with('[') { ']' } else { '}' };

    let mut spans = Vec::with_capacity(2);
    if let Some(end) = candidate.rfind(closer).filter(|end| *end > start) {
        spans.push(&candidate[start..=end]);
    }
    spans.push(&candidate[start..]);

    let options = RepairOptions::default();
    for span in spans {
        let repaired = match llm_json::repair_json(span, &options) {
            Ok(repaired) => repaired,
            Err(e) => {
                tracing::debug!(error = %e, "json repair failed for span");
                continue;
            }
        };
        if let Some(value) = try_parse(&repaired).filter(|v| v.is_array() || v.is_object()) {
            tracing::debug!(
                original_len = span.len(),
                repaired_len = repaired.len(),
                "model output parsed after repair"
            );
            return Some(value);
        }
    }
    None
}

fn string_or_number(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn tags_from_value(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(text)) => return parse_tag_list(text),
        _ => Vec::new(),
    };
    normalize_tags(raw)
}

fn folder_from_value(value: Option<&Value>) -> Option<String> {
    let folder = value?.as_str()?.trim();
    if folder.is_empty() || folder.eq_ignore_ascii_case("null") || folder.eq_ignore_ascii_case("none") {
        return None;
    }
    Some(folder.to_string())
}

fn suggestion_from_value(value: &Value) -> Option<OrganizeSuggestion> {
    let object = value.as_object()?;
    Some(OrganizeSuggestion {
        id: string_or_number(object.get("id")?)?,
        tags: tags_from_value(object.get("tags")),
        folder: folder_from_value(object.get("folder")),
    })
}

/// Trims, strips `#` and quotes, drops empties and duplicates, keeps order.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.into_iter()
        .map(|tag| {
            tag.trim()
                .trim_start_matches('#')
                .trim_matches(|c| c == '"' || c == '\'' || c == '`')
                .trim()
                .to_string()
        })
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

/// Splits a plain-text tag answer such as `React, 前端开发，JavaScript`.
pub fn parse_tag_list(text: &str) -> Vec<String> {
    let body = fenced_interior(text).unwrap_or(text);
    normalize_tags(
        body.split([',', '，', '、', '\n', ';', '；'])
            .map(str::to_string)
            .collect(),
    )
}

/// Per-bookmark suggestions. Accepts an array, a single suggestion object, or
/// an object wrapping the array; entries without an id are skipped.
pub fn decode_suggestions(text: &str) -> Result<Vec<OrganizeSuggestion>, AppError> {
    let value = decode(text).ok_or_else(|| {
        AppError::Decode("model response did not contain a valid JSON payload".to_string())
    })?;

    let items: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(object) if object.contains_key("id") => vec![&value],
        Value::Object(object) => object
            .values()
            .find_map(Value::as_array)
            .map(|items| items.iter().collect())
            .ok_or_else(|| {
                AppError::Decode("model response object holds no suggestion list".to_string())
            })?,
        _ => {
            return Err(AppError::Decode(
                "model response is neither an array nor an object".to_string(),
            ))
        }
    };

    let total = items.len();
    let suggestions: Vec<OrganizeSuggestion> =
        items.into_iter().filter_map(suggestion_from_value).collect();
    if suggestions.len() < total {
        tracing::warn!(
            skipped = total - suggestions.len(),
            "ignored malformed entries in model suggestions"
        );
    }
    Ok(suggestions)
}

/// A `{tags, folder}` answer for a single bookmark.
pub fn decode_tags_and_folder(text: &str) -> Result<(Vec<String>, Option<String>), AppError> {
    let value = decode(text).ok_or_else(|| {
        AppError::Decode("model response did not contain a valid JSON payload".to_string())
    })?;
    let object = value
        .as_object()
        .ok_or_else(|| AppError::Decode("expected a JSON object".to_string()))?;
    Ok((
        tags_from_value(object.get("tags")),
        folder_from_value(object.get("folder")),
    ))
}

/// A generated folder tree, repaired if needed.
pub fn decode_generated_tree(text: &str) -> Result<Vec<GeneratedNode>, AppError> {
    let value = decode_lenient(text).ok_or_else(|| {
        AppError::Decode("failed to parse the generated bookmark tree".to_string())
    })?;
    let forest = GeneratedNode::forest_from_value(&value);
    if forest.is_empty() {
        return Err(AppError::Decode(
            "generated bookmark tree contained no usable nodes".to_string(),
        ));
    }
    Ok(forest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_json_decodes_like_bare_json() {
        let bare = r#"[{"id":"1","tags":["a"],"folder":null}]"#;
        let fenced = format!("  \n\n```json\n{bare}\n```\n   ");
        let untagged = format!("Sure!\n```\n{bare}\n```\nDone.");

        let expected: Value = serde_json::from_str(bare).unwrap();
        assert_eq!(decode(&fenced), Some(expected.clone()));
        assert_eq!(decode(&untagged), Some(expected.clone()));
        assert_eq!(decode(bare), Some(expected));
    }

    #[test]
    fn fence_without_newline_after_tag_is_kept() {
        assert_eq!(decode("```{\"a\":1}```"), Some(json!({"a": 1})));
        assert_eq!(decode("```JSON {\"a\":1}```"), Some(json!({"a": 1})));
    }

    #[test]
    fn object_span_is_found_inside_prose() {
        let text = "Here is the result: {\"tags\": [\"x\"], \"folder\": \"Dev\"} hope it helps";
        assert_eq!(
            extract_json_string(text).as_deref(),
            Some("{\"tags\": [\"x\"], \"folder\": \"Dev\"}")
        );
    }

    #[test]
    fn array_span_is_tried_after_object_span() {
        let text = "Result:\n[{\"id\":\"1\"}, {\"id\":\"2\"}]\nThanks";
        assert_eq!(decode(text), Some(json!([{"id": "1"}, {"id": "2"}])));
    }

    #[test]
    fn malformed_input_returns_none() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("no json here"), None);
        assert_eq!(decode("} backwards {"), None);
        assert_eq!(decode("[{\"id\": \"1\","), None);
    }

    #[test]
    fn repair_handles_trailing_commas() {
        let text = "[{\"title\": \"A\", \"children\": [{\"id\": \"1\"},],},]";
        assert_eq!(
            decode_lenient(text),
            Some(json!([{"title": "A", "children": [{"id": "1"}]}]))
        );
    }

    #[test]
    fn repair_closes_truncated_output() {
        let text = "[{\"title\":\"A\",\"children\":[{\"id\":\"1\"},{\"id\":\"2";
        assert_eq!(
            decode_lenient(text),
            Some(json!([{"title": "A", "children": [{"id": "1"}, {"id": "2"}]}]))
        );
    }

    #[test]
    fn repair_quotes_bare_keys_and_single_quotes() {
        let text = "[{title: 'Dev', children: [{id: '5'}, {id: 6}]}]";
        assert_eq!(
            decode_lenient(text),
            Some(json!([{"title": "Dev", "children": [{"id": "5"}, {"id": 6}]}]))
        );
    }

    #[test]
    fn repair_drops_trailing_prose() {
        let text = "[{\"id\": \"1\",},] Let me know if you need anything else!";
        assert_eq!(decode_lenient(text), Some(json!([{"id": "1"}])));
    }

    #[test]
    fn repair_keeps_multi_word_bare_titles() {
        let forest = decode_generated_tree("[{title: Dev Tools, children: [{id: \"1\"}]}]").unwrap();
        assert_eq!(
            forest,
            vec![GeneratedNode::folder("Dev Tools", vec![GeneratedNode::bookmark("1")])]
        );
    }

    #[test]
    fn repair_keeps_hyphenated_bare_titles() {
        let forest = decode_generated_tree("[{title: AI-Tools, children: [{id: \"2\"}]}]").unwrap();
        assert_eq!(
            forest,
            vec![GeneratedNode::folder("AI-Tools", vec![GeneratedNode::bookmark("2")])]
        );
    }

    #[test]
    fn repair_keeps_unescaped_inner_quotes() {
        let text = r#"[{"title": "The "Best" Sites", "children": [{"id": "3"}]}]"#;
        let forest = decode_generated_tree(text).unwrap();
        assert_eq!(
            forest,
            vec![GeneratedNode::folder("The \"Best\" Sites", vec![GeneratedNode::bookmark("3")])]
        );
    }

    #[test]
    fn decode_suggestions_tolerates_shapes() {
        let wrapped = "{\"results\": [{\"id\": 3, \"tags\": \"a, b\", \"folder\": \"null\"}]}";
        let parsed = decode_suggestions(wrapped).unwrap();
        assert_eq!(
            parsed,
            vec![OrganizeSuggestion {
                id: "3".to_string(),
                tags: vec!["a".to_string(), "b".to_string()],
                folder: None,
            }]
        );

        let single = decode_suggestions("{\"id\": \"4\", \"tags\": [\"#x\", \"x\"], \"folder\": \"Dev\"}").unwrap();
        assert_eq!(single[0].tags, vec!["x".to_string()]);
        assert_eq!(single[0].folder.as_deref(), Some("Dev"));

        let skipped = decode_suggestions("[{\"tags\": []}, {\"id\": \"1\"}]").unwrap();
        assert_eq!(skipped.len(), 1);

        assert!(matches!(decode_suggestions("nope"), Err(AppError::Decode(_))));
        assert!(matches!(decode_suggestions("42"), Err(AppError::Decode(_))));
    }

    #[test]
    fn decode_tags_and_folder_reads_object() {
        let (tags, folder) =
            decode_tags_and_folder("```json\n{\"tags\": [\"rust\"], \"folder\": null}\n```").unwrap();
        assert_eq!(tags, vec!["rust".to_string()]);
        assert!(folder.is_none());
        assert!(decode_tags_and_folder("[1]").is_err());
    }

    #[test]
    fn parse_tag_list_splits_mixed_separators() {
        assert_eq!(
            parse_tag_list("React, 前端开发，JavaScript、 官方文档\n#docs, React"),
            vec!["React", "前端开发", "JavaScript", "官方文档", "docs"]
        );
    }

    #[test]
    fn decode_generated_tree_requires_nodes() {
        let forest = decode_generated_tree("```json\n[{\"title\": \"Bookmarks bar\", \"children\": [{\"id\": \"9\"}]}]\n```").unwrap();
        assert_eq!(
            forest,
            vec![GeneratedNode::folder("Bookmarks bar", vec![GeneratedNode::bookmark("9")])]
        );
        assert!(decode_generated_tree("[]").is_err());
        assert!(decode_generated_tree("nothing").is_err());
    }
}
