//! Markdown chunking.
//!
//! Documents split at level-two headings (`## `). A section longer than
//! `max_chars` is split again at blank lines, packing paragraphs greedily
//! up to the limit; a single paragraph longer than the limit stays whole.
//! Fragments shorter than `min_chars` are folded into the chunk before
//! them unless they open a new heading. Lengths count characters.

/// Default upper bound on chunk length, in characters.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 2000;
/// Chunks shorter than this merge into their predecessor.
pub const DEFAULT_MIN_CHUNK_CHARS: usize = 100;

const HEADING_PREFIX: &str = "## ";
const PARAGRAPH_BREAK: &str = "\n\n";

/// Split `content` into ordered, non-empty chunks.
pub fn chunk_markdown(content: &str, max_chars: usize, min_chars: usize) -> Vec<String> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    for section in split_sections(content) {
        if char_len(&section) <= max_chars {
            chunks.push(section);
        } else {
            chunks.extend(pack_paragraphs(&section, max_chars));
        }
    }

    let mut merged: Vec<String> = Vec::new();
    for chunk in chunks {
        match merged.last_mut() {
            Some(last) if char_len(&chunk) < min_chars && !chunk.starts_with(HEADING_PREFIX) => {
                last.push_str(PARAGRAPH_BREAK);
                last.push_str(&chunk);
            }
            _ => merged.push(chunk),
        }
    }
    merged
}

/// Text of the first `# ` heading, if any.
pub fn markdown_title(content: &str) -> Option<&str> {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|title| !title.is_empty())
}

fn split_sections(content: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in content.split('\n') {
        if line.starts_with(HEADING_PREFIX) && !current.is_empty() {
            sections.push(current.join("\n"));
            current.clear();
        }
        current.push(line);
    }
    if !current.is_empty() {
        sections.push(current.join("\n"));
    }
    sections
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn pack_paragraphs(section: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buffer = String::new();
    for paragraph in section.split(PARAGRAPH_BREAK).map(str::trim) {
        if paragraph.is_empty() {
            continue;
        }
        if buffer.is_empty() {
            buffer.push_str(paragraph);
        } else if char_len(&buffer) + char_len(paragraph) + PARAGRAPH_BREAK.len() > max_chars {
            out.push(std::mem::take(&mut buffer));
            buffer.push_str(paragraph);
        } else {
            buffer.push_str(PARAGRAPH_BREAK);
            buffer.push_str(paragraph);
        }
    }
    if !buffer.is_empty() {
        out.push(buffer);
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
