//! Best-effort JSON recovery from free-form model output.
//!
//! Models asked for raw JSON still wrap it in prose, markdown fences, or
//! both. Recovery is an ordered sequence of independent tiers; each is tried
//! only when the previous one yields nothing.

use serde_json::Value;

/// One recovery strategy. Returns `None` when the strategy does not apply to
/// the text or its candidate fails to parse.
pub trait JsonTier: Send + Sync {
    fn name(&self) -> &'static str;
    fn try_extract(&self, text: &str) -> Option<Value>;
}

/// Tier 1: a fenced code block labeled as JSON (```json ... ```).
pub struct FencedJsonBlock;

impl JsonTier for FencedJsonBlock {
    fn name(&self) -> &'static str {
        "fenced-json-block"
    }

    fn try_extract(&self, text: &str) -> Option<Value> {
        // Scan for the fence and compare the label in place. Offsets from a
        // lowercased copy must not be used to slice the original: lowering
        // can change byte lengths.
        let mut search_from = 0;
        while let Some(rel) = text[search_from..].find("```") {
            let label_start = search_from + rel + 3;
            let rest = &text[label_start..];
            if rest
                .get(..4)
                .map_or(false, |label| label.eq_ignore_ascii_case("json"))
            {
                let body = &rest[4..];
                let end = body.find("```")?;
                return serde_json::from_str(body[..end].trim()).ok();
            }
            search_from = label_start;
        }
        None
    }
}

/// Tier 2: greedy outer match from the first `{` through the last `}`.
pub struct OuterBraces;

impl JsonTier for OuterBraces {
    fn name(&self) -> &'static str {
        "outer-braces"
    }

    fn try_extract(&self, text: &str) -> Option<Value> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end < start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    }
}

/// Tier 3: the whole completion, verbatim.
pub struct WholeText;

impl JsonTier for WholeText {
    fn name(&self) -> &'static str {
        "whole-text"
    }

    fn try_extract(&self, text: &str) -> Option<Value> {
        serde_json::from_str(text.trim()).ok()
    }
}

/// Run the tiers in priority order. `None` means no tier produced JSON.
pub fn recover_json(text: &str) -> Option<Value> {
    let tiers: [&dyn JsonTier; 3] = [&FencedJsonBlock, &OuterBraces, &WholeText];
    for tier in tiers {
        if let Some(value) = tier.try_extract(text) {
            tracing::debug!(tier = tier.name(), "Recovered JSON from completion");
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_block_is_preferred() {
        let text = "Sure, here you go:\n```json\n{\"a\": 1}\n```\nAnything else?";
        assert_eq!(FencedJsonBlock.try_extract(text), Some(json!({"a": 1})));
        assert_eq!(recover_json(text), Some(json!({"a": 1})));
    }

    #[test]
    fn fenced_block_label_is_case_insensitive() {
        let text = "```JSON\n{\"a\": 2}\n```";
        assert_eq!(FencedJsonBlock.try_extract(text), Some(json!({"a": 2})));
    }

    #[test]
    fn unlabeled_fence_falls_through_to_braces() {
        let text = "```\n{\"b\": true}\n```";
        assert_eq!(FencedJsonBlock.try_extract(text), None);
        assert_eq!(recover_json(text), Some(json!({"b": true})));
    }

    #[test]
    fn outer_braces_spans_prose() {
        let text = "The result is {\"x\": [1, 2]} — hope that helps!";
        assert_eq!(OuterBraces.try_extract(text), Some(json!({"x": [1, 2]})));
    }

    #[test]
    fn outer_braces_rejects_crossed_delimiters() {
        // '}' before '{': no candidate.
        assert_eq!(OuterBraces.try_extract("} nope {"), None);
    }

    #[test]
    fn whole_text_parses_bare_json() {
        let text = "  {\"clean\": true}  ";
        assert_eq!(WholeText.try_extract(text), Some(json!({"clean": true})));
    }

    #[test]
    fn no_json_anywhere_yields_none() {
        assert_eq!(recover_json("I cannot help with that"), None);
    }

    #[test]
    fn fence_after_case_shifting_characters_is_found() {
        // 'İ' grows from 2 to 3 bytes when lowercased, so any offset math
        // done on a lowered copy would slice the original out of range.
        let text = format!("{}\n```json\n{{\"a\": 3}}\n```", "İ".repeat(10));
        assert_eq!(FencedJsonBlock.try_extract(&text), Some(json!({"a": 3})));
        assert_eq!(recover_json(&text), Some(json!({"a": 3})));
    }

    #[test]
    fn json_fence_after_an_unlabeled_fence_is_found() {
        let text = "```\nnot data\n```\n```json\n{\"a\": 4}\n```";
        assert_eq!(FencedJsonBlock.try_extract(text), Some(json!({"a": 4})));
    }

    #[test]
    fn broken_fenced_json_falls_back_to_outer_braces() {
        // Fence contains trailing prose that breaks the parse; the outer
        // brace match still finds the object.
        let text = "```json\n{\"a\": 1} thanks\n```";
        assert_eq!(FencedJsonBlock.try_extract(text), None);
        assert_eq!(recover_json(text), Some(json!({"a": 1})));
    }
}
