use serde::{Deserialize, Serialize};

/// Chunk sizing in characters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkerConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    1200
}

fn default_chunk_overlap() -> usize {
    200
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

/// Split a document into overlapping chunks.
///
/// Paragraphs (blank-line separated) are packed greedily up to
/// `chunk_size`; a paragraph longer than that is cut on a fixed window.
/// Each chunk after the first starts with the trailing `chunk_overlap`
/// characters of its predecessor.
pub fn chunk_text(content: &str, config: &ChunkerConfig) -> Vec<String> {
    let size = config.chunk_size.max(1);
    let overlap = config.chunk_overlap.min(size.saturating_sub(1));

    let mut pieces = Vec::new();
    for paragraph in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if char_len(paragraph) <= size {
            pieces.push(paragraph.to_string());
        } else {
            pieces.extend(split_window(paragraph, size, overlap));
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        if current.is_empty() {
            current = piece;
            continue;
        }
        if char_len(&current) + 2 + char_len(&piece) <= size {
            current.push_str("\n\n");
            current.push_str(&piece);
        } else {
            let tail = char_tail(&current, overlap).to_string();
            chunks.push(std::mem::take(&mut current));
            current = if tail.is_empty() {
                piece
            } else {
                format!("{tail}\n\n{piece}")
            };
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_window(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = size - overlap;
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn char_tail(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let total = char_len(s);
    if n >= total {
        return s;
    }
    match s.char_indices().nth(total - n) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, chunk_overlap: usize) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size,
            chunk_overlap,
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", &ChunkerConfig::default()).is_empty());
        assert!(chunk_text("\n\n  \n\n", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn small_paragraphs_are_packed_together() {
        let chunks = chunk_text("alpha\n\nbeta\n\ngamma", &config(100, 0));
        assert_eq!(chunks, vec!["alpha\n\nbeta\n\ngamma"]);
    }

    #[test]
    fn chunks_carry_overlap_from_previous() {
        let chunks = chunk_text("aaaaaaaaaa\n\nbbbbbbbbbb", &config(12, 3));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "aaaaaaaaaa");
        assert_eq!(chunks[1], "aaa\n\nbbbbbbbbbb");
    }

    #[test]
    fn long_paragraph_is_windowed() {
        let text = "x".repeat(25);
        let chunks = split_window(&text, 10, 2);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(char_tail("héllo wörld", 5), "wörld");
        assert_eq!(char_tail("ab", 5), "ab");
        assert_eq!(char_tail("ab", 0), "");
    }
}
