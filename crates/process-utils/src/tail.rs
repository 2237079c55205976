//! Bounded text accumulator for process diagnostics.

/// Marker prepended to a snapshot when older text was dropped.
const TRUNCATION_MARKER: &str = "[...truncated]\n";

/// Keeps the most recent `limit` bytes of text written to it.
///
/// Diagnostic tools usually print the interesting line last, so the head of
/// the stream is what gets discarded once the limit is exceeded. Memory use
/// stays below `2 * limit`.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append a line, adding the trailing newline.
    pub fn push_line(&mut self, line: &str) {
        self.push_str(line);
        self.push_str("\n");
    }

    pub fn push_str(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.text.push_str(s);
        if self.text.len() > self.limit.saturating_mul(2).max(self.limit + 1) {
            self.compact();
        }
    }

    /// Whether any text has been dropped so far.
    pub fn is_truncated(&self) -> bool {
        self.truncated || self.text.len() > self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && !self.truncated
    }

    /// The retained text, at most `limit` bytes plus the truncation marker.
    pub fn snapshot(&self) -> String {
        let tail = &self.text[tail_start(&self.text, self.limit)..];
        if self.is_truncated() {
            let mut out = String::with_capacity(TRUNCATION_MARKER.len() + tail.len());
            out.push_str(TRUNCATION_MARKER);
            out.push_str(tail);
            out
        } else {
            tail.to_string()
        }
    }

    fn compact(&mut self) {
        let cut = tail_start(&self.text, self.limit);
        if cut > 0 {
            self.text.drain(..cut);
            self.truncated = true;
        }
    }
}

/// Byte offset at which the last `limit` bytes of `text` begin, moved forward
/// to the next char boundary.
fn tail_start(text: &str, limit: usize) -> usize {
    let mut cut = text.len().saturating_sub(limit);
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_the_limit() {
        let mut buf = TailBuffer::new(64);
        buf.push_line("first");
        buf.push_line("second");
        assert_eq!(buf.snapshot(), "first\nsecond\n");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn drops_the_head_when_over_the_limit() {
        let mut buf = TailBuffer::new(8);
        for i in 0..100 {
            buf.push_line(&format!("line {i}"));
        }
        buf.push_line("ERROR");
        let snap = buf.snapshot();
        assert!(snap.starts_with(TRUNCATION_MARKER));
        assert!(snap.ends_with("ERROR\n"));
        assert!(snap.len() <= TRUNCATION_MARKER.len() + 8);
        assert!(buf.text.len() <= 16);
    }

    #[test]
    fn never_splits_a_multibyte_char() {
        let mut buf = TailBuffer::new(5);
        buf.push_str("ééééééééé");
        let snap = buf.snapshot();
        let tail = snap.trim_start_matches(TRUNCATION_MARKER);
        assert!(tail.chars().all(|c| c == 'é'));
        assert!(tail.len() <= 5);
    }

    #[test]
    fn empty_buffer_snapshot_is_empty() {
        let buf = TailBuffer::new(16);
        assert!(buf.is_empty());
        assert_eq!(buf.snapshot(), "");
    }
}
