#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use novel_translate::store::{ChapterRecord, VolumeProgress};
use novel_translate::translate::segmentor::LengthSegmentor;
use novel_translate::translate::{Segment, SegmentContext};
use novel_translate::{SegmentTranslator, TaskCallback, TaskLog, TranslateError, TranslatorId};

pub fn lines(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

pub fn chapter(id: &str, source: &[&str]) -> ChapterRecord {
    ChapterRecord::new(id, lines(source))
}

/// Prefixes every line with `译:` after applying the segment glossary.
pub struct EchoBackend {
    segmentor: LengthSegmentor,
    calls: AtomicUsize,
    delays: HashMap<String, Duration>,
    short: Vec<String>,
}

impl EchoBackend {
    pub fn new(max_lines: usize) -> Self {
        Self {
            segmentor: LengthSegmentor::new(10_000).with_max_lines(max_lines),
            calls: AtomicUsize::new(0),
            delays: HashMap::new(),
            short: Vec::new(),
        }
    }

    pub fn with_delay(mut self, first_line: &str, delay: Duration) -> Self {
        self.delays.insert(first_line.to_string(), delay);
        self
    }

    /// Segments starting with `first_line` come back one line short.
    pub fn short_on(mut self, first_line: &str) -> Self {
        self.short.push(first_line.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentTranslator for EchoBackend {
    fn id(&self) -> TranslatorId {
        TranslatorId::LocalLlm
    }

    fn identity(&self) -> String {
        "echo|v1".into()
    }

    fn segmentor(&self, lines: &[String], prior: Option<&[String]>) -> Vec<Segment> {
        self.segmentor.split(lines, prior)
    }

    async fn translate(
        &self,
        seg: &[String],
        ctx: &SegmentContext<'_>,
    ) -> Result<Vec<String>, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = seg.first().map(|l| l.trim()).unwrap_or_default();
        if let Some(delay) = self.delays.get(first) {
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = ctx.cancel.cancelled() => return Err(TranslateError::Cancelled),
            }
        }
        let mut out: Vec<String> = seg
            .iter()
            .map(|line| format!("译:{}", ctx.glossary.apply(line.trim_start())))
            .collect();
        if self.short.iter().any(|s| s == first) {
            out.pop();
        }
        Ok(out)
    }
}

/// Records callback events; optionally cancels a token once `cancel_after`
/// chapters were saved.
#[derive(Default)]
pub struct RecordingCallback {
    pub messages: Mutex<Vec<String>>,
    pub total: Mutex<Option<usize>>,
    pub saved: Mutex<Vec<VolumeProgress>>,
    pub failures: AtomicUsize,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancelling_after(saved: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel_after: Some((saved, token)),
            ..Self::default()
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl TaskLog for RecordingCallback {
    fn log(&self, message: &str, _detail: Option<&[String]>) {
        self.messages.lock().push(message.to_string());
    }
}

impl TaskCallback for RecordingCallback {
    fn on_start(&self, total: usize) {
        *self.total.lock() = Some(total);
    }

    fn on_chapter_success(&self, progress: &VolumeProgress) {
        let saved = {
            let mut saved = self.saved.lock();
            saved.push(*progress);
            saved.len()
        };
        if let Some((after, token)) = &self.cancel_after {
            if saved >= *after {
                token.cancel();
            }
        }
    }

    fn on_chapter_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}
