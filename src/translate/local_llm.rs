//! Length-windowed backend for self-hosted light-novel translation models.
//!
//! The prompt template depends on the model version, detected once from the
//! served model id. Degradation (completion hitting `max_tokens`) and line
//! count mismatches are retried twice on the whole segment, then the segment
//! falls back to line-by-line translation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::glossary::Glossary;
use super::normalize::to_halfwidth_digits;
use super::openai::{ChatBackend, ChatMessage, ChatRequest, Role};
use super::segmentor::LengthSegmentor;
use super::{Segment, SegmentContext, SegmentTranslator, TaskLog, TranslateError, TranslatorId};

const END_MARKER: &str = "<|im_end|>";

const SYSTEM_PROMPT: &str = "你是一个轻小说翻译模型，可以流畅通顺地以日本轻小说的风格将日文翻译成简体中文，并联系上下文正确使用人称代词，不擅自添加原文中没有的代词。";
const SYSTEM_PROMPT_V0_10: &str = "你是一个轻小说翻译模型，可以流畅通顺地使用给定的术语表以日本轻小说的风格将日文翻译成简体中文，并联系上下文正确使用人称代词，注意不要混淆使役态和被动态的主语和宾语，不要擅自添加原文中没有的代词，也不要擅自增加或减少换行。";

/// Full-segment attempts before falling back to line-by-line.
const SEGMENT_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVersion {
    V0_8,
    V0_9,
    V0_10,
    V1_0,
}

impl PromptVersion {
    /// Unknown or missing model ids fall back to 0.9.
    pub fn detect(model_id: Option<&str>) -> Self {
        match model_id {
            Some(id) if id.contains("0.8") => PromptVersion::V0_8,
            Some(id) if id.contains("0.9") => PromptVersion::V0_9,
            Some(id) if id.contains("0.10") => PromptVersion::V0_10,
            Some(id) if id.contains("1.0") => PromptVersion::V1_0,
            _ => PromptVersion::V0_9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PromptVersion::V0_8 => "0.8",
            PromptVersion::V0_9 => "0.9",
            PromptVersion::V0_10 => "0.10",
            PromptVersion::V1_0 => "1.0",
        }
    }

    /// Build the conversation. Returns the messages and the text length the
    /// token budget is derived from.
    fn messages(self, text: &str, glossary: &Glossary, prev_text: &str) -> (Vec<ChatMessage>, usize) {
        let mut messages = Vec::with_capacity(3);
        let system = match self {
            PromptVersion::V0_10 => SYSTEM_PROMPT_V0_10,
            _ => SYSTEM_PROMPT,
        };
        messages.push(ChatMessage::new(Role::System, system));
        if !prev_text.is_empty() {
            messages.push(ChatMessage::new(Role::Assistant, prev_text));
        }

        let (user, text_len) = match self {
            PromptVersion::V1_0 if glossary.is_empty() => {
                (format!("将下面的日文文本翻译成中文：{text}"), text.chars().count())
            }
            PromptVersion::V1_0 => (
                format!(
                    "根据以下术语表（可以为空）：\n{}\n将下面的日文文本根据对应关系和备注翻译成中文：{text}",
                    glossary.hint()
                ),
                text.chars().count(),
            ),
            PromptVersion::V0_10 => (
                format!(
                    "根据以下术语表（可以为空）：\n{}\n\n将下面的日文文本根据上述术语表的对应关系和备注翻译成中文：{text}",
                    glossary.hint()
                ),
                text.chars().count(),
            ),
            PromptVersion::V0_8 | PromptVersion::V0_9 => {
                let substituted = glossary.apply(text);
                let len = substituted.chars().count();
                (format!("将下面的日文文本翻译成中文：{substituted}"), len)
            }
        };
        messages.push(ChatMessage::new(Role::User, user));
        (messages, text_len)
    }
}

/// `max(ceil(len * 1.7), 100)`
pub fn max_new_tokens(text_len: usize) -> u32 {
    let budget = (text_len as f64 * 1.7).ceil() as u32;
    budget.max(100)
}

#[derive(Debug, Clone, Copy)]
pub struct LocalLlmOptions {
    pub seg_length: usize,
    pub prev_seg_length: usize,
}

impl Default for LocalLlmOptions {
    fn default() -> Self {
        Self {
            seg_length: 500,
            prev_seg_length: 500,
        }
    }
}

struct Completion {
    text: String,
    degraded: bool,
}

pub struct LocalLlmTranslator {
    client: Arc<dyn ChatBackend>,
    version: PromptVersion,
    model: Option<String>,
    segmentor: LengthSegmentor,
    seg_length: usize,
    prev_seg_length: usize,
}

impl LocalLlmTranslator {
    /// Detect the served model and pick the prompt version. An unreachable
    /// endpoint fails creation; an empty model list keeps the default version.
    pub async fn create(
        client: Arc<dyn ChatBackend>,
        options: LocalLlmOptions,
        log: Arc<dyn TaskLog>,
    ) -> Result<Self, TranslateError> {
        let models = match client.list_models().await {
            Ok(models) => models,
            Err(e) => {
                log.log(&format!("failed to fetch model info: {e}"), None);
                return Err(e);
            }
        };
        let model = models
            .into_iter()
            .next()
            .map(|id| id.strip_suffix(".gguf").map(str::to_string).unwrap_or(id));
        let version = PromptVersion::detect(model.as_deref());
        info!(model = ?model, version = version.as_str(), "local model detected");

        let seg_length = options.seg_length.max(1);
        Ok(Self {
            client,
            version,
            model,
            segmentor: LengthSegmentor::new(seg_length),
            seg_length,
            prev_seg_length: options.prev_seg_length,
        })
    }

    pub fn version(&self) -> PromptVersion {
        self.version
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Translated lines of the last `ceil(prev_seg_length / seg_length)`
    /// segments. Empty until an earlier segment has been translated.
    fn context_text(&self, ctx: &SegmentContext<'_>) -> String {
        let count = self.context_segments();
        let skip = ctx.prev_segs.len().saturating_sub(count);
        ctx.prev_segs[skip..].concat().join("\n")
    }

    async fn complete(
        &self,
        text: &str,
        glossary: &Glossary,
        prev_text: &str,
        cancel: &CancellationToken,
        penalize: bool,
        log: &dyn TaskLog,
    ) -> Result<Completion, TranslateError> {
        let text = to_halfwidth_digits(text);
        let (messages, text_len) = self.version.messages(&text, glossary, prev_text);
        let max_tokens = max_new_tokens(text_len);
        let request = ChatRequest {
            model: String::new(),
            messages,
            temperature: 0.1,
            top_p: 0.3,
            max_tokens,
            frequency_penalty: if penalize { 0.2 } else { 0.0 },
        };
        let completion = self.client.complete(&request, cancel).await?;
        let degraded = match completion.completion_tokens {
            Some(tokens) => tokens >= max_tokens,
            None => {
                warn!(max_tokens, "completion without token usage, degradation check skipped");
                log.log("server reported no token usage, cannot detect degradation", None);
                false
            }
        };
        Ok(Completion {
            degraded,
            text: completion.text,
        })
    }
}

#[async_trait]
impl SegmentTranslator for LocalLlmTranslator {
    fn id(&self) -> TranslatorId {
        TranslatorId::LocalLlm
    }

    fn identity(&self) -> String {
        format!("{}|{}", self.version.as_str(), self.model.as_deref().unwrap_or(""))
    }

    fn segmentor(&self, lines: &[String], prior: Option<&[String]>) -> Vec<Segment> {
        self.segmentor.split(lines, prior)
    }

    fn context_segments(&self) -> usize {
        self.prev_seg_length.div_ceil(self.seg_length)
    }

    async fn translate(
        &self,
        seg: &[String],
        ctx: &SegmentContext<'_>,
    ) -> Result<Vec<String>, TranslateError> {
        let joined = seg.join("\n");
        let prev_text = self.context_text(ctx);

        for attempt in 1..=SEGMENT_ATTEMPTS {
            if ctx.cancel.is_cancelled() {
                return Err(TranslateError::Cancelled);
            }
            let completion = self
                .complete(&joined, ctx.glossary, &prev_text, ctx.cancel, attempt > 1, ctx.log)
                .await?;
            let output: Vec<String> = completion
                .text
                .replace(END_MARKER, "")
                .split('\n')
                .map(str::to_string)
                .collect();

            let mismatched = output.len() != seg.len();
            let outcome = if completion.degraded {
                "degraded"
            } else if mismatched {
                "line count mismatch"
            } else {
                "success"
            };
            ctx.log.log(
                &format!("attempt {attempt}: {outcome}"),
                Some(&[joined.clone(), completion.text]),
            );
            if !completion.degraded && !mismatched {
                return Ok(output);
            }
        }

        ctx.log.log("falling back to line-by-line translation", None);
        let mut degraded_lines = 0;
        let mut output: Vec<String> = Vec::with_capacity(seg.len());
        for line in seg {
            if ctx.cancel.is_cancelled() {
                return Err(TranslateError::Cancelled);
            }
            let context = std::iter::once(prev_text.as_str())
                .chain(output.iter().map(String::as_str))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            let completion = self
                .complete(line, ctx.glossary, &context, ctx.cancel, true, ctx.log)
                .await?;
            if completion.degraded {
                degraded_lines += 1;
                ctx.log.log(
                    &format!("line degraded ({degraded_lines})"),
                    Some(&[line.clone(), completion.text]),
                );
                if degraded_lines >= 2 {
                    return Err(TranslateError::Abort(
                        "two lines degraded in one segment, the local model is likely malfunctioning"
                            .into(),
                    ));
                }
                output.push(line.clone());
            } else {
                output.push(completion.text.replace(END_MARKER, ""));
            }
        }
        Ok(output)
    }
}
