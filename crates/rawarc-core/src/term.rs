//! Terminal status block.
//!
//! All stderr output funnels through one sink so the three-line progress
//! block (`audio:` / `video:` / `merge:`) can be repainted in place: the
//! cursor moves up over the previous block, the optional log line is printed,
//! then the block is redrawn with erase-to-end-of-line on every line and the
//! terminal title is refreshed with an OSC 0 sequence.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

const ERASE_LINE: &str = "\x1b[K";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressCategory {
    AudioDownload,
    VideoDownload,
    Merge,
}

/// Fixed render order of the progress block.
const CATEGORY_ORDER: [ProgressCategory; 3] = [
    ProgressCategory::AudioDownload,
    ProgressCategory::VideoDownload,
    ProgressCategory::Merge,
];

impl ProgressCategory {
    fn name(self) -> &'static str {
        match self {
            ProgressCategory::AudioDownload => "audio",
            ProgressCategory::VideoDownload => "video",
            ProgressCategory::Merge => "merge",
        }
    }

    fn index(self) -> usize {
        match self {
            ProgressCategory::AudioDownload => 0,
            ProgressCategory::VideoDownload => 1,
            ProgressCategory::Merge => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct StatusEntry {
    title: String,
    message: String,
}

struct SinkState {
    wrote_status: bool,
    entries: [Option<StatusEntry>; 3],
    window_name: String,
}

/// Shared stderr sink for log lines and the progress block. Created once in
/// main and passed by reference; there is no global instance.
pub struct StatusSink {
    state: Mutex<SinkState>,
}

impl StatusSink {
    pub fn new() -> Arc<Self> {
        Arc::new(StatusSink {
            state: Mutex::new(SinkState {
                wrote_status: false,
                entries: [None, None, None],
                window_name: String::new(),
            }),
        })
    }

    /// Suffix appended to the terminal title after the progress summary.
    pub fn set_window_name(&self, name: &str) {
        self.state.lock().unwrap().window_name = name.to_string();
    }

    /// Updates one progress line and repaints the block.
    pub fn progress(&self, category: ProgressCategory, title: String, message: String) {
        let mut state = self.state.lock().unwrap();
        state.entries[category.index()] = Some(StatusEntry { title, message });
        self.render(&mut state, None);
    }

    /// Prints a log line above the progress block.
    pub fn write_log(&self, line: &[u8]) {
        let mut state = self.state.lock().unwrap();
        self.render(&mut state, Some(line));
    }

    fn render(&self, state: &mut SinkState, log_line: Option<&[u8]>) {
        let buf = compose(state, log_line);
        state.wrote_status = true;
        let _ = std::io::stderr().lock().write_all(&buf);
    }
}

fn compose(state: &SinkState, log_line: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    let mut title = String::new();

    if state.wrote_status {
        // move the cursor up over the previous three-line block
        buf.extend_from_slice(b"\x1b[3A");
    }

    if let Some(line) = log_line {
        let line = match line.last() {
            Some(b'\n') => &line[..line.len() - 1],
            _ => line,
        };
        buf.extend_from_slice(line);
        buf.extend_from_slice(ERASE_LINE.as_bytes());
        buf.push(b'\n');
    }

    for (i, category) in CATEGORY_ORDER.iter().enumerate() {
        if i > 0 {
            title.push('/');
        }
        buf.extend_from_slice(category.name().as_bytes());
        buf.extend_from_slice(b": ");
        match &state.entries[i] {
            Some(entry) => {
                buf.extend_from_slice(entry.message.as_bytes());
                title.push_str(&entry.title);
            }
            None => {
                buf.extend_from_slice(b"???");
                title.push_str("???");
            }
        }
        buf.extend_from_slice(ERASE_LINE.as_bytes());
        buf.push(b'\n');
    }

    buf.extend_from_slice(b"\x1b]0;");
    buf.extend_from_slice(title.as_bytes());
    if !state.window_name.is_empty() {
        buf.push(b' ');
        buf.extend_from_slice(state.window_name.as_bytes());
    }
    buf.push(0x07);

    buf
}

/// `MakeWriter` bridge: tracing events are buffered per event and emitted
/// through the sink so they land above the progress block.
pub struct StatusWriter(pub Arc<StatusSink>);

impl<'a> MakeWriter<'a> for StatusWriter {
    type Writer = LogLine;

    fn make_writer(&'a self) -> Self::Writer {
        LogLine {
            sink: Arc::clone(&self.0),
            buf: Vec::new(),
        }
    }
}

pub struct LogLine {
    sink: Arc<StatusSink>,
    buf: Vec<u8>,
}

impl Write for LogLine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for LogLine {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.sink.write_log(&self.buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(entries: [Option<StatusEntry>; 3], wrote: bool) -> SinkState {
        SinkState {
            wrote_status: wrote,
            entries,
            window_name: String::new(),
        }
    }

    #[test]
    fn first_render_does_not_move_the_cursor() {
        let state = state_with([None, None, None], false);
        let out = compose(&state, None);
        assert!(!out.starts_with(b"\x1b[3A"));
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("audio: ???\x1b[K\n"));
        assert!(text.contains("video: ???\x1b[K\n"));
        assert!(text.contains("merge: ???\x1b[K\n"));
    }

    #[test]
    fn subsequent_renders_repaint_in_place() {
        let state = state_with([None, None, None], true);
        let out = compose(&state, None);
        assert!(out.starts_with(b"\x1b[3A"));
    }

    #[test]
    fn log_line_is_printed_above_the_block() {
        let state = state_with([None, None, None], false);
        let out = compose(&state, Some(b"hello\n"));
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("hello\x1b[K\n"));
    }

    #[test]
    fn title_sequence_joins_category_titles() {
        let entry = |t: &str| {
            Some(StatusEntry {
                title: t.to_string(),
                message: "msg".to_string(),
            })
        };
        let state = state_with([entry("10.0%"), entry("20.0%"), entry("0.0%")], false);
        let out = compose(&state, None);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("\x1b]0;10.0%/20.0%/0.0%\u{7}"));
    }
}
