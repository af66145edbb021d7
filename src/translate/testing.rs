//! Scripted fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::normalize::SourceLang;
use super::openai::{ChatBackend, ChatCompletion, ChatRequest};
use super::remote_mt::MtBackend;
use super::segmentor::LengthSegmentor;
use super::{Segment, SegmentContext, SegmentTranslator, TaskLog, TranslateError, TranslatorId};

pub fn lines(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[derive(Default)]
pub struct RecordingLog {
    entries: Mutex<Vec<(String, Option<Vec<String>>)>>,
}

impl RecordingLog {
    pub fn messages(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(m, _)| m.clone()).collect()
    }
}

impl TaskLog for RecordingLog {
    fn log(&self, message: &str, detail: Option<&[String]>) {
        self.entries
            .lock()
            .push((message.to_string(), detail.map(<[String]>::to_vec)));
    }
}

pub struct ScriptedChat {
    models: Option<Vec<String>>,
    replies: Mutex<VecDeque<ChatCompletion>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            models: Some(models),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            models: None,
            ..Self::new(Vec::new())
        }
    }

    pub fn push_reply(&self, text: &str, completion_tokens: u32) {
        self.replies.lock().push_back(ChatCompletion {
            text: text.to_string(),
            completion_tokens: Some(completion_tokens),
        });
    }

    pub fn push_reply_without_usage(&self, text: &str) {
        self.replies.lock().push_back(ChatCompletion {
            text: text.to_string(),
            completion_tokens: None,
        });
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn list_models(&self) -> Result<Vec<String>, TranslateError> {
        self.models
            .clone()
            .ok_or_else(|| TranslateError::ApiError("connection refused".into()))
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        _cancel: &CancellationToken,
    ) -> Result<ChatCompletion, TranslateError> {
        self.requests.lock().push(request.clone());
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| TranslateError::ApiError("no scripted reply".into()))
    }
}

pub struct ScriptedMt {
    key_ok: bool,
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<(String, SourceLang)>>,
}

impl ScriptedMt {
    pub fn new(key_ok: bool) -> Self {
        Self {
            key_ok,
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, raw: &str) {
        self.replies.lock().push_back(raw.to_string());
    }

    pub fn calls(&self) -> Vec<(String, SourceLang)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MtBackend for ScriptedMt {
    async fn refresh_key(&self) -> Result<(), TranslateError> {
        if self.key_ok {
            Ok(())
        } else {
            Err(TranslateError::ApiError("key endpoint down".into()))
        }
    }

    async fn translate_raw(
        &self,
        text: &str,
        from: SourceLang,
        _cancel: &CancellationToken,
    ) -> Result<String, TranslateError> {
        self.calls.lock().push((text.to_string(), from));
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| TranslateError::ApiError("no scripted reply".into()))
    }
}

/// Deterministic backend: every line becomes `zh:<line>`.
pub struct FakeTranslator {
    id: TranslatorId,
    identity: String,
    segmentor: LengthSegmentor,
    calls: AtomicUsize,
    /// Per-call delay indexed by the first line of the segment.
    delays: HashMap<String, Duration>,
    /// Segments starting with one of these lines come back one line short.
    drop_last_line: Vec<String>,
    /// Segments starting with one of these lines fail with the given error.
    fail_on: Mutex<HashMap<String, TranslateError>>,
    context: usize,
    /// `prev_segs` seen by each call, keyed by the segment's first line.
    seen_context: Mutex<Vec<(String, Vec<Vec<String>>)>>,
}

impl FakeTranslator {
    pub fn new(max_lines: usize) -> Self {
        Self {
            id: TranslatorId::LocalLlm,
            identity: "fake|1".into(),
            segmentor: LengthSegmentor::new(10_000).with_max_lines(max_lines),
            calls: AtomicUsize::new(0),
            delays: HashMap::new(),
            drop_last_line: Vec::new(),
            fail_on: Mutex::new(HashMap::new()),
            context: 0,
            seen_context: Mutex::new(Vec::new()),
        }
    }

    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_delay(mut self, first_line: &str, delay: Duration) -> Self {
        self.delays.insert(first_line.into(), delay);
        self
    }

    pub fn dropping_last_line_of(mut self, first_line: &str) -> Self {
        self.drop_last_line.push(first_line.into());
        self
    }

    pub fn failing_on(self, first_line: &str, error: TranslateError) -> Self {
        self.fail_on.lock().insert(first_line.into(), error);
        self
    }

    pub fn with_context(mut self, segments: usize) -> Self {
        self.context = segments;
        self
    }

    pub fn seen_context(&self) -> Vec<(String, Vec<Vec<String>>)> {
        self.seen_context.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentTranslator for FakeTranslator {
    fn id(&self) -> TranslatorId {
        self.id
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn segmentor(&self, lines: &[String], prior: Option<&[String]>) -> Vec<Segment> {
        self.segmentor.split(lines, prior)
    }

    fn context_segments(&self) -> usize {
        self.context
    }

    async fn translate(
        &self,
        seg: &[String],
        ctx: &SegmentContext<'_>,
    ) -> Result<Vec<String>, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = seg.first().cloned().unwrap_or_default();
        self.seen_context.lock().push((first.clone(), ctx.prev_segs.to_vec()));
        if let Some(delay) = self.delays.get(&first) {
            tokio::time::sleep(*delay).await;
        }
        if ctx.cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }
        if let Some(error) = self.fail_on.lock().remove(&first) {
            return Err(error);
        }
        let mut out: Vec<String> = seg
            .iter()
            .map(|l| format!("zh:{}", ctx.glossary.apply(l.trim_start())))
            .collect();
        if self.drop_last_line.contains(&first) {
            out.pop();
        }
        Ok(out)
    }
}
