//! Boundary-aware overlapping text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of a configurable
//! character size. Prospective cut points are nudged to the nearest
//! sentence or paragraph delimiter within a small search window so that
//! no sentence is severed across a chunk boundary, and consecutive
//! chunks overlap by a configurable amount so that knowledge straddling
//! a boundary appears in both.

use crate::models::Chunk;

/// How far (in characters) to search on either side of a prospective
/// boundary for a sentence/paragraph delimiter.
const BOUNDARY_WINDOW: usize = 200;

/// Sentence-ending characters, in search priority order. Includes the
/// CJK full-width forms since scanned corpora commonly contain them.
const SENTENCE_ENDERS: &[&[char]] = &[
    &['.', '。'],
    &['?', '？'],
    &['!', '！'],
];

/// Split `text` into overlapping chunks of roughly `chunk_size`
/// characters.
///
/// Invariants:
/// - a text of at most `chunk_size` characters yields exactly one chunk
///   covering the whole text;
/// - chunk indices are contiguous from 0;
/// - for every chunk after the first, `start == previous.end - overlap`
///   (unless the source text was exhausted);
/// - the final chunk always runs to end-of-text.
///
/// Offsets are character offsets, so the result is identical for any
/// byte encoding of the same character sequence. Callers must ensure
/// `overlap < chunk_size`; [`crate::config`] validates this.
pub fn split(text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk_size must be > 0");
    assert!(overlap < chunk_size, "overlap must be < chunk_size");

    // Byte offset of every character, plus a sentinel, so char-space
    // ranges can be sliced without re-walking the string.
    let mut offs: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    offs.push(text.len());
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();

    let slice = |a: usize, b: usize| text[offs[a]..offs[b]].to_string();

    if n <= chunk_size {
        return vec![Chunk {
            index: 0,
            text: text.to_string(),
            start: 0,
            end: n,
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let target = start + chunk_size;
        if target >= n {
            chunks.push(Chunk {
                index: chunks.len(),
                text: slice(start, n),
                start,
                end: n,
            });
            break;
        }

        let end = find_cut(&chars, start, target, n);
        chunks.push(Chunk {
            index: chunks.len(),
            text: slice(start, end),
            start,
            end,
        });

        if end >= n {
            break;
        }
        // The next chunk re-covers the last `overlap` characters of this
        // one. Guard against non-advancing starts when the boundary
        // search moved the cut far back on a tiny chunk_size.
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

/// Pick the actual cut position for a prospective boundary at `target`.
///
/// Searches ±[`BOUNDARY_WINDOW`] characters around `target` for the
/// nearest delimiter, trying each sentence ender class in priority
/// order and falling back to a paragraph break (double newline), then
/// to the raw offset. The returned position is exclusive — the
/// delimiter stays with the preceding chunk.
fn find_cut(chars: &[char], start: usize, target: usize, n: usize) -> usize {
    let lo = target.saturating_sub(BOUNDARY_WINDOW).max(start + 1);
    let hi = (target + BOUNDARY_WINDOW).min(n);

    for enders in SENTENCE_ENDERS {
        if let Some(pos) = nearest_match(lo, hi, target, |i| enders.contains(&chars[i])) {
            return pos + 1;
        }
    }

    // Paragraph break: cut after the blank line.
    if let Some(pos) = nearest_match(lo, hi.min(n - 1), target, |i| {
        chars[i] == '\n' && chars[i + 1] == '\n'
    }) {
        return (pos + 2).min(n);
    }

    target
}

/// Position in `[lo, hi)` matching `pred` with the smallest distance to
/// `target`, or `None`.
fn nearest_match<F: Fn(usize) -> bool>(
    lo: usize,
    hi: usize,
    target: usize,
    pred: F,
) -> Option<usize> {
    let mut best: Option<usize> = None;
    for i in lo..hi {
        if pred(i) {
            let better = match best {
                Some(b) => i.abs_diff(target) < b.abs_diff(target),
                None => true,
            };
            if better {
                best = Some(i);
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_single_chunk() {
        let chunks = split("Hello, world!", 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 13);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn empty_text_single_chunk() {
        let chunks = split("", 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
        assert_eq!(chunks[0].end, 0);
    }

    #[test]
    fn exact_fit_single_chunk() {
        let text = "a".repeat(1000);
        let chunks = split(&text, 1000, 100);
        assert_eq!(chunks.len(), 1);
    }

    /// 1200 characters with a sentence end near offset 1000 must produce
    /// exactly two chunks, the second starting `overlap` before the
    /// first's end.
    #[test]
    fn two_chunk_overlap_scenario() {
        let mut text = String::new();
        // Sentences of 50 chars: 49 filler + '.', so offsets 50, 100, ...
        // are all just past a sentence end.
        while text.chars().count() < 1200 {
            text.push_str(&"x".repeat(49));
            text.push('.');
        }
        let text: String = text.chars().take(1200).collect();

        let chunks = split(&text, 1000, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start, 0);
        // Cut adjusted to the sentence end nearest 1000.
        assert_eq!(chunks[0].end, 1000);
        assert_eq!(chunks[1].start, chunks[0].end - 100);
        assert_eq!(chunks[1].end, 1200);
    }

    #[test]
    fn overlap_invariant_holds_across_many_chunks() {
        let mut text = String::new();
        for i in 0..400 {
            text.push_str(&format!("Sentence number {} has some padding words. ", i));
        }
        let chunk_size = 500;
        let overlap = 80;
        let chunks = split(&text, chunk_size, overlap);
        assert!(chunks.len() > 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            if i > 0 {
                assert_eq!(c.start, chunks[i - 1].end - overlap);
            }
        }
        assert_eq!(chunks.last().unwrap().end, text.chars().count());
    }

    #[test]
    fn cut_prefers_sentence_end_over_raw_offset() {
        // One sentence end at 450, none near 500.
        let mut text = "y".repeat(449);
        text.push('.');
        text.push_str(&"z".repeat(550));
        let chunks = split(&text, 500, 50);
        assert_eq!(chunks[0].end, 450);
        assert!(chunks[0].text.ends_with('.'));
    }

    #[test]
    fn falls_back_to_raw_offset_without_delimiters() {
        let text = "q".repeat(2500);
        let chunks = split(&text, 1000, 100);
        assert_eq!(chunks[0].end, 1000);
        assert_eq!(chunks[1].start, 900);
    }

    #[test]
    fn paragraph_break_used_when_no_sentence_end() {
        let mut text = "a".repeat(480);
        text.push_str("\n\n");
        text.push_str(&"b".repeat(600));
        let chunks = split(&text, 500, 50);
        // Cut lands just after the blank line.
        assert_eq!(chunks[0].end, 482);
    }

    #[test]
    fn multibyte_text_offsets_are_char_based() {
        let mut text = String::new();
        while text.chars().count() < 900 {
            text.push_str("这是一个句子。");
        }
        let chunks = split(&text, 400, 40);
        assert!(chunks.len() >= 2);
        for (i, c) in chunks.iter().enumerate().skip(1) {
            assert_eq!(c.start, chunks[i - 1].end - 40);
        }
        // Reassembling from offsets must reproduce the chunk text.
        let chars: Vec<char> = text.chars().collect();
        for c in &chunks {
            let expect: String = chars[c.start..c.end].iter().collect();
            assert_eq!(c.text, expect);
        }
    }

    #[test]
    fn deterministic() {
        let text = "First sentence. Second sentence? Third! ".repeat(60);
        let a = split(&text, 300, 30);
        let b = split(&text, 300, 30);
        assert_eq!(a, b);
    }
}
