//! Merge progress line.

use std::sync::{Arc, Mutex};

use crate::progress::{StreamKind, COLOR_GREEN, COLOR_RESET, COLOR_YELLOW};
use crate::term::{ProgressCategory, StatusSink};

struct Inner {
    ended: bool,
    total: Option<usize>,
    audio: usize,
    video: usize,
}

/// Counts merged segments across both streams and renders the `merge:` line.
/// `total` is per stream, so a fully merged pipeline reaches 2×total.
pub(crate) struct MergeProgress {
    term: Arc<StatusSink>,
    inner: Mutex<Inner>,
}

impl MergeProgress {
    pub fn new(term: Arc<StatusSink>) -> Arc<Self> {
        Arc::new(MergeProgress {
            term,
            inner: Mutex::new(Inner {
                ended: false,
                total: None,
                audio: 0,
                video: 0,
            }),
        })
    }

    /// First stream to learn its segment count sets the total.
    pub fn init_total(&self, total: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.total.is_none() {
            inner.total = Some(total);
            self.render(&mut inner);
        }
    }

    pub fn merged(&self, which: StreamKind) {
        let mut inner = self.inner.lock().unwrap();
        match which {
            StreamKind::Audio => inner.audio += 1,
            StreamKind::Video => inner.video += 1,
        }
        self.render(&mut inner);
    }

    pub fn done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ended = true;
        self.render(&mut inner);
    }

    fn render(&self, inner: &mut Inner) {
        let done = inner.audio + inner.video;

        let mut pct = 0.0;
        match inner.total {
            Some(0) => inner.ended = true,
            Some(total) => pct = done as f64 / total as f64 * 50.0,
            None => {}
        }

        let color = if inner.ended {
            pct = 100.0;
            COLOR_GREEN
        } else {
            COLOR_YELLOW
        };

        let title = format!("{pct:.1}%");
        let message = format!(
            "{}{:.2}% ({} audio, {} video){}",
            color, pct, inner.audio, inner.video, COLOR_RESET
        );
        self.term.progress(ProgressCategory::Merge, title, message);
    }
}
