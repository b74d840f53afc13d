//! JSON extraction from free-text model replies.
//!
//! Order: first fenced code block, else the first brace-balanced object
//! that parses. Brace matching ignores braces inside string literals.

use serde_json::Value;

pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(block) = first_fenced_block(text) {
        if let Some(value) = parse_object(block) {
            return Some(value);
        }
    }

    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        // An unbalanced brace (a stray "{" in prose) is skipped, not fatal.
        if let Some(len) = balanced_object_end(&text[start..]) {
            if let Some(value) = parse_object(&text[start..start + len]) {
                return Some(value);
            }
        }
        search_from = start + 1;
    }

    None
}

fn parse_object(candidate: &str) -> Option<Value> {
    serde_json::from_str::<Value>(candidate.trim())
        .ok()
        .filter(Value::is_object)
}

/// Contents of the first ``` fence, without its language tag.
fn first_fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // Skip the info string ("json") up to the end of the line.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// Byte length of the object starting at `text[0] == '{'`, if it closes.
fn balanced_object_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}
