//! Boundary-aware text chunking.
//!
//! Splits extracted text into overlapping chunks sized for the embedding
//! model. Split points prefer, in order: paragraph breaks, line breaks,
//! sentence terminators, whitespace, and finally a hard cut. Page-locator
//! and timestamp-locator variants keep chunks from crossing page or
//! silence boundaries.
//!
//! Sizes are measured in characters. Concatenating the produced chunks
//! always contains the input as a subsequence modulo whitespace
//! collapsing, so no content is lost at boundaries.

use crate::models::ChunkDraft;

/// Target chunk size in characters.
pub const TARGET_SIZE: usize = 800;
/// Hard upper bound; no chunk ever exceeds this.
pub const MAX_SIZE: usize = 1000;
/// Fragments below this are absorbed into the preceding chunk.
pub const MIN_SIZE: usize = 100;
/// Characters shared between consecutive chunks.
pub const OVERLAP: usize = 100;
/// Transcript chunks never span a silence longer than this (seconds).
pub const MAX_TIME_GAP: f64 = 2.0;

/// A timestamped transcript segment, as produced by the transcriber.
#[derive(Debug, Clone)]
pub struct Segment {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            size: TARGET_SIZE,
            overlap: OVERLAP,
        }
    }
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Self {
        Self { size, overlap }
    }

    /// Split plain text into overlapping chunks with dense indices from 0.
    ///
    /// Whitespace-only input produces no chunks.
    pub fn chunk_text(&self, text: &str) -> Vec<ChunkDraft> {
        self.chunk_inner(text, 0, None)
    }

    /// Chunk page texts one page at a time, attaching the 1-based `page`
    /// locator. Chunks never merge across pages; every page with visible
    /// text yields at least one chunk. Indices stay dense across the
    /// whole document.
    pub fn chunk_pages(&self, pages: &[(i64, String)]) -> Vec<ChunkDraft> {
        let mut out = Vec::new();
        for (page_no, text) in pages {
            let start_index = out.len() as i64;
            let mut chunks = self.chunk_inner(text, start_index, Some(*page_no));
            if chunks.is_empty() && !text.trim().is_empty() {
                chunks.push(ChunkDraft {
                    text: normalize(text),
                    chunk_index: start_index,
                    page: Some(*page_no),
                    start_time: None,
                    end_time: None,
                });
            }
            out.append(&mut chunks);
        }
        out
    }

    /// Chunk timestamped transcript segments.
    ///
    /// Segments accumulate greedily up to the target size. A chunk is also
    /// closed when the silence between two segments exceeds
    /// [`MAX_TIME_GAP`], so a chunk never spans a long pause.
    pub fn chunk_segments(&self, segments: &[Segment]) -> Vec<ChunkDraft> {
        let mut out: Vec<ChunkDraft> = Vec::new();
        let mut buf = String::new();
        let mut chunk_start: Option<f64> = None;
        let mut chunk_end: f64 = 0.0;

        for seg in segments {
            let text = seg.text.trim();
            if text.is_empty() {
                continue;
            }

            let gap_exceeded = chunk_start.is_some() && seg.start - chunk_end > MAX_TIME_GAP;
            let would_overflow = !buf.is_empty() && buf.chars().count() + 1 + text.chars().count() > self.size;

            if gap_exceeded || would_overflow {
                if let Some(start) = chunk_start.take() {
                    out.push(ChunkDraft {
                        text: std::mem::take(&mut buf),
                        chunk_index: out.len() as i64,
                        page: None,
                        start_time: Some(start),
                        end_time: Some(chunk_end),
                    });
                }
            }

            if chunk_start.is_none() {
                chunk_start = Some(seg.start);
            }
            if !buf.is_empty() {
                buf.push(' ');
            }
            buf.push_str(text);
            chunk_end = seg.end;
        }

        if let Some(start) = chunk_start {
            if !buf.is_empty() {
                out.push(ChunkDraft {
                    text: buf,
                    chunk_index: out.len() as i64,
                    page: None,
                    start_time: Some(start),
                    end_time: Some(chunk_end),
                });
            }
        }

        out
    }

    fn chunk_inner(&self, text: &str, first_index: i64, page: Option<i64>) -> Vec<ChunkDraft> {
        let text = normalize(text);
        if text.is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();

        if total <= self.size {
            return vec![ChunkDraft {
                text,
                chunk_index: first_index,
                page,
                start_time: None,
                end_time: None,
            }];
        }

        let mut out = Vec::new();
        let mut start = 0usize;

        while start < total {
            let mut end = (start + self.size).min(total);

            if end < total {
                let search_from = start + (self.size * 4) / 5;
                let search_to = (start + MAX_SIZE).min(total);
                end = find_split(&chars, search_from, end.max(search_from), search_to);
            }

            // A sub-minimum tail would make a useless chunk; absorb it.
            if total - end < MIN_SIZE && total - start <= MAX_SIZE {
                end = total;
            }

            let piece: String = chars[start..end].iter().collect();
            let piece = piece.trim().to_string();
            if !piece.is_empty() {
                out.push(ChunkDraft {
                    text: piece,
                    chunk_index: first_index + out.len() as i64,
                    page,
                    start_time: None,
                    end_time: None,
                });
            }

            if end >= total {
                break;
            }
            start = end.saturating_sub(self.overlap).max(start + 1);
        }

        out
    }
}

/// Find the best split position in `chars[search_from..search_to]`,
/// preferring paragraph break, then line break, then sentence end, then
/// whitespace. Falls back to `default` (a hard cut) when nothing matches.
fn find_split(chars: &[char], search_from: usize, default: usize, search_to: usize) -> usize {
    let region = &chars[search_from..search_to];

    // Paragraph boundary: "\n\n".
    let mut best = None;
    for i in (1..region.len()).rev() {
        if region[i] == '\n' && region[i - 1] == '\n' {
            best = Some(i + 1);
            break;
        }
    }
    if let Some(pos) = best {
        return search_from + pos;
    }

    if let Some(pos) = region.iter().rposition(|&c| c == '\n') {
        return search_from + pos + 1;
    }

    if let Some(pos) = region
        .iter()
        .rposition(|&c| matches!(c, '.' | '!' | '?' | '。' | '！' | '？'))
    {
        // Only treat it as a sentence end when followed by whitespace or
        // the region edge, so "3.14" does not split.
        let after = region.get(pos + 1);
        if after.is_none() || after.is_some_and(|c| c.is_whitespace()) {
            return search_from + pos + 1;
        }
    }

    if let Some(pos) = region.iter().rposition(|&c| c.is_whitespace()) {
        return search_from + pos + 1;
    }

    default
}

/// Collapse runs of spaces/tabs and excess blank lines, preserving single
/// and double newlines as split hints.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_newlines = 0usize;
    let mut pending_space = false;

    for c in text.chars() {
        match c {
            '\n' => {
                pending_newlines += 1;
                pending_space = false;
            }
            c if c.is_whitespace() => {
                if pending_newlines == 0 {
                    pending_space = true;
                }
            }
            c => {
                if pending_newlines > 0 {
                    if !out.is_empty() {
                        out.push('\n');
                        if pending_newlines > 1 {
                            out.push('\n');
                        }
                    }
                    pending_newlines = 0;
                } else if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }

    out
}
