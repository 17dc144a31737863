//! Download progress accounting.
//!
//! One mutex covers both streams; every update repaints the audio and video
//! lines through the status sink. ETA is only extrapolated once enough
//! segments came over the network (cached segments say nothing about
//! throughput), and the line turns red when the projected finish time runs
//! past the URL expiry.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::term::{ProgressCategory, StatusSink};

pub(crate) const COLOR_GREEN: &str = "\x1b[32m";
pub(crate) const COLOR_MAGENTA: &str = "\x1b[35m";
pub(crate) const COLOR_RED: &str = "\x1b[91m";
pub(crate) const COLOR_RESET: &str = "\x1b[0m";
pub(crate) const COLOR_YELLOW: &str = "\x1b[93m";

/// Segments downloaded before an ETA is shown.
const ETA_MIN_DOWNLOADED: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    fn category(self) -> ProgressCategory {
        match self {
            StreamKind::Audio => ProgressCategory::AudioDownload,
            StreamKind::Video => ProgressCategory::VideoDownload,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Video => write!(f, "video"),
        }
    }
}

/// Counters visible to callers (final report, tests).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: Option<usize>,
    pub cached: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub requeued: usize,
}

struct Clock {
    instant: Instant,
    wall: DateTime<Utc>,
}

struct StreamProgress {
    total: Option<usize>,
    cached: usize,
    downloaded: usize,
    failed: usize,
    requeues: HashSet<usize>,
    started: Option<Clock>,
    finished_in: Option<Duration>,
    expire: Option<DateTime<Utc>>,
}

impl StreamProgress {
    fn new() -> Self {
        StreamProgress {
            total: None,
            cached: 0,
            downloaded: 0,
            failed: 0,
            requeues: HashSet::new(),
            started: None,
            finished_in: None,
            expire: None,
        }
    }

    fn finished(&self) -> usize {
        self.cached + self.downloaded + self.failed
    }

    fn note_completion(&mut self) {
        if self.finished_in.is_none() && Some(self.finished()) == self.total {
            self.finished_in = Some(
                self.started
                    .as_ref()
                    .map(|c| c.instant.elapsed())
                    .unwrap_or_default(),
            );
        }
    }

    fn pct(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => self.finished() as f64 / total as f64 * 100.0,
            Some(_) => 100.0,
            None => 0.0,
        }
    }

    fn lost_part(&self, color: &str) -> String {
        if self.failed == 0 {
            return String::new();
        }
        format!(", {}lost {}{}", COLOR_RED, self.failed, color)
    }

    fn requeued_part(&self, color: &str) -> String {
        if self.requeues.is_empty() {
            return String::new();
        }
        format!(", {}requeued {}{}", COLOR_MAGENTA, self.requeues.len(), color)
    }

    fn render(&self) -> String {
        let Some(total) = self.total else {
            return format!("{COLOR_YELLOW}0% (0/???, not started yet){COLOR_RESET}");
        };

        let successful = self.cached + self.downloaded;
        let finished = self.finished();

        if finished == total {
            let color = if self.failed > 0 { COLOR_YELLOW } else { COLOR_GREEN };
            let took = self.finished_in.unwrap_or_default();
            return format!(
                "{}100% ({}/{}{} in {}){}",
                color,
                successful,
                total,
                self.lost_part(color),
                format_duration(took),
                COLOR_RESET,
            );
        }

        let progress = finished as f64 / total as f64;

        if let Some(clock) = self
            .started
            .as_ref()
            .filter(|_| self.downloaded > ETA_MIN_DOWNLOADED)
        {
            let elapsed = clock.instant.elapsed();
            let eta_progress = (self.downloaded + self.failed) as f64 / (total - self.cached) as f64;
            let eta_seconds = (1.0 / eta_progress) * elapsed.as_secs_f64();
            let remaining = Duration::from_secs_f64((eta_seconds - elapsed.as_secs_f64()).max(0.0));

            let projected_finish = clock.wall + chrono::Duration::seconds(eta_seconds as i64);
            let color = match self.expire {
                Some(expire) if projected_finish > expire => COLOR_RED,
                _ => COLOR_YELLOW,
            };
            format!(
                "{}{:.2}% ({}/{}{}{}, eta {}){}",
                color,
                progress * 100.0,
                successful,
                total,
                self.requeued_part(color),
                self.lost_part(color),
                format_duration(remaining),
                COLOR_RESET,
            )
        } else {
            format!(
                "{}{:.2}% ({}/{}{}{}, eta unknown){}",
                COLOR_YELLOW,
                progress * 100.0,
                successful,
                total,
                self.requeued_part(COLOR_YELLOW),
                self.lost_part(COLOR_YELLOW),
                COLOR_RESET,
            )
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            cached: self.cached,
            downloaded: self.downloaded,
            failed: self.failed,
            requeued: self.requeues.len(),
        }
    }
}

struct Streams {
    audio: StreamProgress,
    video: StreamProgress,
}

impl Streams {
    fn get_mut(&mut self, which: StreamKind) -> &mut StreamProgress {
        match which {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
        }
    }
}

/// Progress for both download pipelines, rendered as the `audio:` and
/// `video:` lines of the status block.
pub struct TotalProgress {
    term: Arc<StatusSink>,
    streams: Mutex<Streams>,
}

impl TotalProgress {
    pub fn new(term: Arc<StatusSink>) -> Arc<Self> {
        Arc::new(TotalProgress {
            term,
            streams: Mutex::new(Streams {
                audio: StreamProgress::new(),
                video: StreamProgress::new(),
            }),
        })
    }

    pub fn handle(self: &Arc<Self>, which: StreamKind) -> ProgressHandle {
        ProgressHandle {
            parent: Arc::clone(self),
            which,
        }
    }

    fn update(&self, which: StreamKind, f: impl FnOnce(&mut StreamProgress)) {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.get_mut(which);
        f(stream);
        stream.note_completion();

        let audio = (format!("{:.1}%", streams.audio.pct()), streams.audio.render());
        let video = (format!("{:.1}%", streams.video.pct()), streams.video.render());
        drop(streams);

        self.term
            .progress(ProgressCategory::AudioDownload, audio.0, audio.1);
        self.term
            .progress(ProgressCategory::VideoDownload, video.0, video.1);
    }
}

/// One stream's view of the shared progress state; handed to a download task.
#[derive(Clone)]
pub struct ProgressHandle {
    parent: Arc<TotalProgress>,
    which: StreamKind,
}

impl ProgressHandle {
    pub fn which(&self) -> StreamKind {
        self.which
    }

    pub fn init(&self, total: usize, expire: Option<DateTime<Utc>>) {
        self.parent.update(self.which, |p| {
            p.total = Some(total);
            p.expire = expire;
            p.started = Some(Clock {
                instant: Instant::now(),
                wall: Utc::now(),
            });
        });
    }

    /// A segment finished, either over the network or from a `.done` file of
    /// a previous run.
    pub fn done(&self, segment: usize, cached: bool) {
        self.parent.update(self.which, |p| {
            p.requeues.remove(&segment);
            if cached {
                p.cached += 1;
            } else {
                p.downloaded += 1;
            }
        });
    }

    pub fn requeued(&self, segment: usize) {
        self.parent.update(self.which, |p| {
            p.requeues.insert(segment);
        });
    }

    pub fn lost(&self, segment: usize) {
        self.parent.update(self.which, |p| {
            p.requeues.remove(&segment);
            p.failed += 1;
        });
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut streams = self.parent.streams.lock().unwrap();
        streams.get_mut(self.which).snapshot()
    }
}

pub(crate) fn format_duration(d: Duration) -> String {
    let secs = significant_figures(d.as_secs_f64(), 3) as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else {
        format!("{m:02}m{s:02}s")
    }
}

fn significant_figures(v: f64, n: i32) -> f64 {
    if v <= 0.0 {
        return 0.0;
    }
    let exp = 10f64.powf(v.abs().log10().floor() - (n - 1) as f64);
    exp * (v / exp).round()
}
