//! Splits long model output into Telegram-sized messages.
//!
//! Splits happen at the coarsest boundary that keeps every chunk within the
//! limit: paragraphs first, then sentences, then spaces, then a hard cut.
//! Lengths are counted in chars, not bytes.

/// Telegram's per-message character limit.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

const PARAGRAPH_JOINER: &str = "\n\n";
const LINE_JOINER: &str = "\n";

/// Split `text` into chunks of at most `limit` chars.
///
/// Always returns at least one chunk. Text that already fits (including the
/// empty string) is returned unchanged as the only chunk.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    debug_assert!(limit > 0, "split limit must be positive");
    let limit = limit.max(1);

    if char_len(text) <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Accumulator::new(limit);

    for paragraph in text.split(PARAGRAPH_JOINER) {
        if char_len(paragraph) <= limit {
            chunks.push(paragraph, PARAGRAPH_JOINER);
            continue;
        }

        let normalized = paragraph.replace(". ", ".\n");
        for sentence in normalized.split('\n') {
            if char_len(sentence) <= limit {
                chunks.push(sentence, LINE_JOINER);
            } else {
                hard_split(sentence, &mut chunks);
            }
        }
    }

    let chunks = chunks.finish();
    if chunks.is_empty() {
        // only blank-line separators, nothing to carry
        return vec![String::new()];
    }
    chunks
}

/// Cut an oversized sentence into pieces, preferring the last space inside
/// each window of `limit` chars.
fn hard_split(sentence: &str, chunks: &mut Accumulator) {
    let limit = chunks.limit;
    let mut rest = sentence;

    while !rest.is_empty() {
        let (piece, remainder) = match rest.char_indices().nth(limit) {
            None => (rest, ""),
            Some((cut, _)) => {
                let window = &rest[..cut];
                match window.rfind(' ') {
                    Some(space) if space > 0 => (&rest[..space], &rest[space..]),
                    _ => (window, &rest[cut..]),
                }
            }
        };

        chunks.push(piece, LINE_JOINER);
        rest = remainder.trim_start();
    }
}

/// Buffer for the chunk being assembled.
struct Accumulator {
    limit: usize,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
}

impl Accumulator {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    /// Append `unit` to the buffer, or flush the buffer first if the unit
    /// (plus its joiner) would push it past the limit.
    fn push(&mut self, unit: &str, joiner: &str) {
        let unit_len = char_len(unit);

        if !self.current.is_empty() && self.current_len + joiner.len() + unit_len > self.limit {
            self.chunks.push(std::mem::take(&mut self.current));
            self.current.push_str(unit);
            self.current_len = unit_len;
            return;
        }

        if !self.current.is_empty() {
            self.current.push_str(joiner);
            self.current_len += joiner.len();
        }
        self.current.push_str(unit);
        self.current_len += unit_len;
    }

    fn finish(mut self) -> Vec<String> {
        if !self.current.is_empty() {
            self.chunks.push(self.current);
        }
        self.chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
