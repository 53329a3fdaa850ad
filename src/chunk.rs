//! Paragraph-boundary text splitter.
//!
//! The loader runs each page (or whole text file) through [`split_text`]
//! before it becomes a [`Segment`](crate::models::Segment). Splitting prefers
//! paragraph boundaries (`\n\n`); a paragraph longer than the limit is cut at
//! the last newline or space that fits.

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into pieces of at most `max_tokens` (approximate) each.
///
/// Whitespace-only input yields no pieces.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn hard_split(mut remaining: &str, max_chars: usize, out: &mut Vec<String>) {
    while !remaining.is_empty() {
        let mut split_at = remaining.len().min(max_chars);
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            // Single char wider than the limit.
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let cut = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .filter(|&pos| pos > 0)
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[cut..];
    }
}
