//! Segment translation: shared types, the backend capability trait and the
//! backend factory.
//!
//! A backend splits a chapter into segments and translates one segment at a
//! time. The orchestrator in [`translator`] owns everything around that call:
//! glossary skip logic, caching, whitespace repair, progress.

pub mod cache;
pub mod glossary;
pub mod local_llm;
pub mod normalize;
pub mod openai;
pub mod remote_mt;
pub mod segmentor;
pub mod sqlite_cache;
pub mod translator;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BackendConfig;
pub use glossary::Glossary;

/// Backend identity. Prior translations and cache namespaces are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranslatorId {
    /// Self-hosted LLM behind an OpenAI-compatible endpoint, length-windowed segments.
    LocalLlm,
    /// Remote general-purpose machine translation service.
    RemoteMt,
}

impl TranslatorId {
    pub fn as_str(self) -> &'static str {
        match self {
            TranslatorId::LocalLlm => "local-llm",
            TranslatorId::RemoteMt => "remote-mt",
        }
    }
}

impl fmt::Display for TranslatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("API error: {0}")]
    ApiError(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("translation timeout")]
    Timeout,
    #[error("translation cancelled")]
    Cancelled,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("line count mismatch: expected {expected}, got {actual}")]
    LineCountMismatch { expected: usize, actual: usize },
    /// The backend saw something that makes every further call pointless.
    #[error("job aborted: {0}")]
    Abort(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl TranslateError {
    /// Fatal errors end the whole batch; everything else only fails the
    /// current chapter.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TranslateError::Abort(_) | TranslateError::Cancelled)
    }
}

/// Human-readable task log. Fire-and-forget: implementations must not block
/// or fail the pipeline.
pub trait TaskLog: Send + Sync {
    fn log(&self, message: &str, detail: Option<&[String]>);
}

/// Forwards task log lines to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl TaskLog for TracingLog {
    fn log(&self, message: &str, detail: Option<&[String]>) {
        info!(target: "novel_translate::task", "{message}");
        if let Some(detail) = detail {
            for line in detail {
                debug!(target: "novel_translate::task", "  {line}");
            }
        }
    }
}

/// Prefixes every message, e.g. with `chapter 2/5 segment 3/8`.
pub struct LabeledLog {
    label: String,
    inner: Arc<dyn TaskLog>,
}

impl LabeledLog {
    pub fn new(label: impl Into<String>, inner: Arc<dyn TaskLog>) -> Self {
        Self {
            label: label.into(),
            inner,
        }
    }
}

impl TaskLog for LabeledLog {
    fn log(&self, message: &str, detail: Option<&[String]>) {
        self.inner.log(&format!("{}{message}", self.label), detail);
    }
}

/// A bounded run of source lines submitted to a backend as one unit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Segment {
    pub lines: Vec<String>,
    /// Older translation of exactly these lines, if the chapter had one.
    pub prior: Option<Vec<String>>,
}

/// Per-call context handed to [`SegmentTranslator::translate`].
pub struct SegmentContext<'a> {
    /// Only the glossary entries whose source term occurs in the segment.
    pub glossary: &'a Glossary,
    /// Output of already-completed preceding segments, in document order.
    /// At most [`SegmentTranslator::context_segments`] entries.
    pub prev_segs: &'a [Vec<String>],
    pub cancel: &'a CancellationToken,
    pub log: &'a dyn TaskLog,
}

/// The capability every backend implements.
#[async_trait]
pub trait SegmentTranslator: Send + Sync {
    fn id(&self) -> TranslatorId;

    /// Fingerprint folded into cache keys (prompt version, model). Empty when
    /// the backend has no versioned identity.
    fn identity(&self) -> String;

    /// Split lines into segments. `prior` is an index-aligned older translation.
    fn segmentor(&self, lines: &[String], prior: Option<&[String]>) -> Vec<Segment>;

    /// Number of preceding translated segments `translate` reads from
    /// [`SegmentContext::prev_segs`].
    fn context_segments(&self) -> usize {
        0
    }

    /// Translate one segment. Must return exactly `seg.len()` lines.
    async fn translate(
        &self,
        seg: &[String],
        ctx: &SegmentContext<'_>,
    ) -> Result<Vec<String>, TranslateError>;
}

/// Build and initialize the backend selected by `config`.
pub async fn create_segment_translator(
    config: &BackendConfig,
    log: Arc<dyn TaskLog>,
) -> Result<Arc<dyn SegmentTranslator>, TranslateError> {
    match config {
        BackendConfig::LocalLlm {
            endpoint,
            api_key,
            seg_length,
            prev_seg_length,
        } => {
            let client = openai::OpenAiCompatClient::new(endpoint, api_key.clone())?;
            let translator = local_llm::LocalLlmTranslator::create(
                Arc::new(client),
                local_llm::LocalLlmOptions {
                    seg_length: *seg_length,
                    prev_seg_length: *prev_seg_length,
                },
                log,
            )
            .await?;
            Ok(Arc::new(translator))
        }
        BackendConfig::RemoteMt { endpoint } => {
            let client = remote_mt::HttpMtClient::new(endpoint)?;
            let translator = remote_mt::RemoteMtTranslator::create(Arc::new(client), log).await;
            Ok(Arc::new(translator))
        }
    }
}
