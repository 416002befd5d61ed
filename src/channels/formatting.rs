//! Text helpers for the chat transport.

/// Split a long reply into chunks that fit the platform's message limit,
/// preferring paragraph and line boundaries over mid-sentence cuts.
pub(crate) fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Largest char boundary at or before max_len so a multi-byte UTF-8
        // character is never sliced.
        let mut boundary = max_len;
        while boundary > 0 && !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }

        let search_region = &remaining[..boundary];
        let split_at = search_region
            .rfind("\n\n")
            .map(|p| p + 1)
            .or_else(|| search_region.rfind('\n'))
            .unwrap_or(boundary);

        // Force progress for degenerate inputs (max_len smaller than one
        // character).
        let split_at = if split_at == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map_or(remaining.len(), |(i, _)| i)
        } else {
            split_at
        };

        let (chunk, rest) = remaining.split_at(split_at);
        let chunk = chunk.trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = rest.trim_start_matches('\n');
    }

    chunks
}

/// Make a model-suggested filename safe to hand to the platform: no path
/// separators, no traversal sequences, bounded length with the extension
/// preserved.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| *c != '/' && *c != '\\' && *c != '\0')
        .collect();
    let sanitized = sanitized.replace("..", "");
    if sanitized.len() <= 200 {
        return sanitized;
    }
    if let Some(dot_pos) = sanitized.rfind('.') {
        let ext = &sanitized[dot_pos..];
        if ext.len() < 20 {
            let stem_len = floor_char_boundary(&sanitized, 200 - ext.len());
            return format!("{}{}", &sanitized[..stem_len], ext);
        }
    }
    let end = floor_char_boundary(&sanitized, 200);
    sanitized[..end].to_string()
}

/// Largest char boundary at or before `max`, so truncation never slices a
/// multi-byte character.
fn floor_char_boundary(text: &str, max: usize) -> usize {
    let mut end = text.len().min(max);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Strip a `@botname` mention anywhere in the text.
pub(crate) fn remove_mention(text: &str, bot_username: &str) -> String {
    text.replace(&format!("@{}", bot_username), "")
        .trim()
        .to_string()
}
