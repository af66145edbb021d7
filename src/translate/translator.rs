//! Chapter orchestrator: filters non-text lines, segments, runs segments under
//! the bounded runner, and reassembles output by index.
//!
//! Per segment: reuse the prior translation when the relevant glossary subset
//! is unchanged, else try the cache, else call the backend. Backend output is
//! checked for line count and gets its leading whitespace repaired before it
//! is cached.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::{segment_cache_key, SegmentCache};
use super::glossary::Glossary;
use super::normalize::{restore_leading_whitespace, LineFilter};
use super::{
    create_segment_translator, LabeledLog, Segment, SegmentContext, SegmentTranslator, TaskLog,
    TranslateError, TranslatorId,
};
use crate::concurrency::{run_with_concurrency, RunError};
use crate::config::PipelineConfig;
use crate::metrics::{metric_names, MetricsRegistry};

/// Inputs describing one chapter's translation state.
#[derive(Clone, Copy)]
pub struct ChapterContext<'a> {
    pub glossary: &'a Glossary,
    /// Glossary snapshot the previous translation was made with.
    pub old_glossary: Option<&'a Glossary>,
    /// Previous translation, index-aligned with the source lines.
    pub old_lines: Option<&'a [String]>,
    /// Retranslate even when the glossary subset is unchanged.
    pub force: bool,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterPosition {
    /// 1-based.
    pub index: usize,
    pub total: usize,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Start,
    Success,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentProgress {
    pub chapter: Option<ChapterPosition>,
    pub segment_index: usize,
    pub segment_total: usize,
    pub status: SegmentStatus,
}

pub type ProgressFn = Arc<dyn Fn(SegmentProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RunOptions {
    /// Segments in flight at once. Zero is treated as one.
    pub concurrency: usize,
    pub chapter: Option<ChapterPosition>,
    pub on_progress: Option<ProgressFn>,
}

impl RunOptions {
    fn emit(&self, segment_index: usize, segment_total: usize, status: SegmentStatus) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(SegmentProgress {
                chapter: self.chapter.clone(),
                segment_index,
                segment_total,
                status,
            });
        }
    }
}

fn log_label(chapter: Option<&ChapterPosition>, segment_index: usize, segment_total: usize) -> String {
    match chapter {
        Some(c) => format!("chapter {}/{} segment {segment_index}/{segment_total} ", c.index, c.total),
        None => format!("chapter ?/? segment {segment_index}/{segment_total} "),
    }
}

pub struct Translator {
    segment_translator: Arc<dyn SegmentTranslator>,
    cache: Option<Arc<dyn SegmentCache>>,
    log: Arc<dyn TaskLog>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Translator {
    pub fn new(
        segment_translator: Arc<dyn SegmentTranslator>,
        cache: Option<Arc<dyn SegmentCache>>,
        log: Arc<dyn TaskLog>,
    ) -> Self {
        Self {
            segment_translator,
            cache,
            log,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the configured backend and, for backends with a versioned
    /// identity, its segment cache. A cache that fails to open is skipped.
    pub async fn create(config: &PipelineConfig, log: Arc<dyn TaskLog>) -> Result<Self, TranslateError> {
        let backend_log: Arc<dyn TaskLog> = Arc::new(LabeledLog::new("  ", log.clone()));
        let segment_translator = create_segment_translator(&config.backend, backend_log).await?;

        let cache = match config.build_cache(segment_translator.id()) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(error = %e, "segment cache unavailable, continuing without it");
                None
            }
        };
        Ok(Self::new(segment_translator, cache, log))
    }

    pub fn id(&self) -> TranslatorId {
        self.segment_translator.id()
    }

    /// Newline-separated text in, newline-separated translation out.
    pub async fn translate_plain(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, TranslateError> {
        let lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let glossary = Glossary::new();
        let ctx = ChapterContext {
            glossary: &glossary,
            old_glossary: None,
            old_lines: None,
            force: false,
            cancel,
        };
        let output = self.translate(&lines, &ctx, &RunOptions::default()).await?;
        Ok(output.join("\n"))
    }

    /// Translate a chapter. The output always has exactly `lines.len()` lines.
    pub async fn translate(
        &self,
        lines: &[String],
        ctx: &ChapterContext<'_>,
        options: &RunOptions,
    ) -> Result<Vec<String>, TranslateError> {
        let started = Instant::now();
        let (filter, kept) = LineFilter::new(lines);
        if kept.is_empty() {
            return filter.splice(lines, Vec::new());
        }
        let old_kept = ctx
            .old_lines
            .filter(|old| old.len() == lines.len())
            .map(|old| filter.select(old));

        let segments = self.segment_translator.segmentor(&kept, old_kept.as_deref());
        let total = segments.len();
        options.emit(0, total, SegmentStatus::Start);

        let outputs: Mutex<Vec<Option<Vec<String>>>> = Mutex::new(vec![None; total]);
        let slots = &outputs;
        let window = self.segment_translator.context_segments();

        let run = run_with_concurrency(&segments, options.concurrency, ctx.cancel, move |seg, index| async move {
            let log = LabeledLog::new(log_label(options.chapter.as_ref(), index + 1, total), self.log.clone());
            let prev_segs = recent_outputs(&slots.lock()[..index], window);

            let output = self.translate_segment(seg, &prev_segs, ctx, &log).await?;
            if output.len() != seg.lines.len() {
                return Err(TranslateError::LineCountMismatch {
                    expected: seg.lines.len(),
                    actual: output.len(),
                });
            }
            slots.lock()[index] = Some(output);
            options.emit(index + 1, total, SegmentStatus::Success);
            Ok::<(), TranslateError>(())
        })
        .await;

        match run {
            Ok(()) => {}
            Err(RunError::Cancelled) => return Err(TranslateError::Cancelled),
            Err(RunError::Failed(e)) => return Err(e),
        }

        let translated = outputs
            .into_inner()
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.ok_or_else(|| TranslateError::InvalidInput(format!("segment {i} produced no output")))
            })
            .collect::<Result<Vec<_>, _>>()?
            .concat();

        if let Some(metrics) = &self.metrics {
            metrics.record(metric_names::CHAPTER_TRANSLATE, started.elapsed().as_micros() as f64);
        }
        filter.splice(lines, translated)
    }

    async fn translate_segment(
        &self,
        seg: &Segment,
        prev_segs: &[Vec<String>],
        ctx: &ChapterContext<'_>,
        log: &dyn TaskLog,
    ) -> Result<Vec<String>, TranslateError> {
        let seg_glossary = ctx.glossary.filter_for(&seg.lines);

        if !ctx.force {
            if let Some(prior) = &seg.prior {
                let old_seg_glossary = ctx
                    .old_glossary
                    .map(|g| g.filter_for(&seg.lines))
                    .unwrap_or_default();
                if seg_glossary == old_seg_glossary {
                    log.log("glossary unchanged, reusing previous translation", None);
                    return Ok(prior.clone());
                }
            }
        }

        let cache_key = self.cache.as_ref().map(|_| {
            segment_cache_key(&seg.lines, &seg_glossary, &self.segment_translator.identity())
        });
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            let lookup = Instant::now();
            match cache.get(key) {
                Ok(Some(cached)) if cached.len() == seg.lines.len() => {
                    log.log("restored from cache", None);
                    if let Some(metrics) = &self.metrics {
                        metrics.record(metric_names::SEGMENT_CACHE_HIT, lookup.elapsed().as_micros() as f64);
                    }
                    return Ok(cached);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "segment cache read failed"),
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }

        let span = self.metrics.as_ref().map(|m| m.span(metric_names::SEGMENT_BACKEND));
        let seg_ctx = SegmentContext {
            glossary: &seg_glossary,
            prev_segs,
            cancel: ctx.cancel,
            log,
        };
        let mut output = self.segment_translator.translate(&seg.lines, &seg_ctx).await?;
        if let Some(span) = span {
            span.finish();
        }
        if output.len() != seg.lines.len() {
            return Err(TranslateError::LineCountMismatch {
                expected: seg.lines.len(),
                actual: output.len(),
            });
        }

        restore_leading_whitespace(&seg.lines, &mut output);

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Err(e) = cache.save(key, &output) {
                warn!(error = %e, "segment cache write failed");
            } else {
                debug!("segment cached");
            }
        }
        Ok(output)
    }
}

/// The last `window` finished outputs before a segment, in document order.
fn recent_outputs(done: &[Option<Vec<String>>], window: usize) -> Vec<Vec<String>> {
    let mut recent: Vec<Vec<String>> = done.iter().rev().flatten().take(window).cloned().collect();
    recent.reverse();
    recent
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::translate::cache::{CacheError, MemorySegmentCache};
    use crate::translate::testing::{lines, FakeTranslator, RecordingLog};

    fn translator(fake: Arc<FakeTranslator>, cache: Option<Arc<dyn SegmentCache>>) -> Translator {
        Translator::new(fake, cache, Arc::new(RecordingLog::default()))
    }

    fn fresh<'a>(glossary: &'a Glossary, cancel: &'a CancellationToken) -> ChapterContext<'a> {
        ChapterContext {
            glossary,
            old_glossary: None,
            old_lines: None,
            force: false,
            cancel,
        }
    }

    #[tokio::test]
    async fn non_text_lines_are_kept_in_place() {
        let fake = Arc::new(FakeTranslator::new(2));
        let t = translator(fake.clone(), None);
        let source = lines(&["一", "", "<图片>a.png", "二", "  ", "三"]);
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());

        let out = t.translate(&source, &fresh(&glossary, &cancel), &RunOptions::default()).await.unwrap();
        assert_eq!(out, lines(&["zh:一", "", "<图片>a.png", "zh:二", "  ", "zh:三"]));
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn all_blank_chapter_needs_no_backend() {
        let fake = Arc::new(FakeTranslator::new(2));
        let t = translator(fake.clone(), None);
        let source = lines(&["", "<图片>x"]);
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());

        let out = t.translate(&source, &fresh(&glossary, &cancel), &RunOptions::default()).await.unwrap();
        assert_eq!(out, source);
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn unchanged_glossary_subset_reuses_prior_translation() {
        let fake = Arc::new(FakeTranslator::new(1));
        let t = translator(fake.clone(), None);
        let source = lines(&["竜が飛んだ", "剣を抜いた"]);
        let old = lines(&["旧:龙飞了", "旧:拔剑"]);
        let old_glossary: Glossary = [("竜", "龙")].into_iter().collect();
        // 剣 is new and only touches the second segment; 魔王 touches none.
        let glossary: Glossary = [("竜", "龙"), ("剣", "剑"), ("魔王", "魔王")].into_iter().collect();
        let cancel = CancellationToken::new();
        let ctx = ChapterContext {
            glossary: &glossary,
            old_glossary: Some(&old_glossary),
            old_lines: Some(&old),
            force: false,
            cancel: &cancel,
        };

        let out = t.translate(&source, &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(out, lines(&["旧:龙飞了", "zh:剑を抜いた"]));
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn force_ignores_prior_translation() {
        let fake = Arc::new(FakeTranslator::new(1));
        let t = translator(fake.clone(), None);
        let source = lines(&["竜"]);
        let old = lines(&["旧"]);
        let glossary = Glossary::new();
        let cancel = CancellationToken::new();
        let ctx = ChapterContext {
            glossary: &glossary,
            old_glossary: Some(&glossary),
            old_lines: Some(&old),
            force: true,
            cancel: &cancel,
        };

        let out = t.translate(&source, &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(out, lines(&["zh:竜"]));
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn misaligned_prior_is_not_reused() {
        let fake = Arc::new(FakeTranslator::new(1));
        let t = translator(fake.clone(), None);
        let source = lines(&["一", "二"]);
        let old = lines(&["旧"]);
        let glossary = Glossary::new();
        let cancel = CancellationToken::new();
        let ctx = ChapterContext {
            glossary: &glossary,
            old_glossary: Some(&glossary),
            old_lines: Some(&old),
            force: false,
            cancel: &cancel,
        };

        t.translate(&source, &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let fake = Arc::new(FakeTranslator::new(1));
        let cache: Arc<dyn SegmentCache> = Arc::new(MemorySegmentCache::new(16));
        let t = translator(fake.clone(), Some(cache.clone()));
        let source = lines(&["一", "二"]);
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());

        let first = t.translate(&source, &fresh(&glossary, &cancel), &RunOptions::default()).await.unwrap();
        let second = t.translate(&source, &fresh(&glossary, &cancel), &RunOptions::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.calls(), 2);

        // A different backend identity does not see these entries.
        let other = Arc::new(FakeTranslator::new(1).with_identity("fake|2"));
        translator(other.clone(), Some(cache))
            .translate(&source, &fresh(&glossary, &cancel), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(other.calls(), 2);
    }

    struct BrokenCache;

    impl SegmentCache for BrokenCache {
        fn get(&self, _key: &str) -> Result<Option<Vec<String>>, CacheError> {
            Err(CacheError::Storage("disk gone".into()))
        }
        fn save(&self, _key: &str, _lines: &[String]) -> Result<(), CacheError> {
            Err(CacheError::Storage("disk gone".into()))
        }
    }

    #[tokio::test]
    async fn cache_failures_are_treated_as_misses() {
        let fake = Arc::new(FakeTranslator::new(1));
        let t = translator(fake.clone(), Some(Arc::new(BrokenCache)));
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());

        let out = t
            .translate(&lines(&["一"]), &fresh(&glossary, &cancel), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out, lines(&["zh:一"]));
    }

    #[tokio::test]
    async fn short_backend_output_fails_the_chapter() {
        let fake = Arc::new(FakeTranslator::new(5).dropping_last_line_of("a"));
        let t = translator(fake, None);
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());

        let err = t
            .translate(&lines(&["a", "b", "c", "d", "e"]), &fresh(&glossary, &cancel), &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::LineCountMismatch { expected: 5, actual: 4 }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn output_order_survives_shuffled_completion() {
        let source: Vec<String> = (0..6).map(|i| format!("line{i}")).collect();
        let mut fake = FakeTranslator::new(1);
        for (i, line) in source.iter().enumerate() {
            fake = fake.with_delay(line, Duration::from_millis(10 * (6 - i as u64)));
        }
        let fake = Arc::new(fake);
        let t = translator(fake.clone(), None);
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());
        let options = RunOptions {
            concurrency: 6,
            ..RunOptions::default()
        };

        let out = t.translate(&source, &fresh(&glossary, &cancel), &options).await.unwrap();
        let expected: Vec<String> = source.iter().map(|l| format!("zh:{l}")).collect();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn leading_whitespace_is_restored() {
        let fake = Arc::new(FakeTranslator::new(4));
        let t = translator(fake, None);
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());

        let out = t
            .translate(&lines(&["　「はい」", "  x"]), &fresh(&glossary, &cancel), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out, lines(&["　zh:「はい」", "  zh:x"]));
    }

    #[tokio::test]
    async fn progress_reports_start_then_each_segment() {
        let fake = Arc::new(FakeTranslator::new(1));
        let t = translator(fake, None);
        let events: Arc<Mutex<Vec<SegmentProgress>>> = Arc::default();
        let sink = events.clone();
        let options = RunOptions {
            concurrency: 1,
            chapter: Some(ChapterPosition {
                index: 1,
                total: 3,
                id: Some("c1".into()),
            }),
            on_progress: Some(Arc::new(move |p: SegmentProgress| sink.lock().push(p))),
        };
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());

        t.translate(&lines(&["一", "二"]), &fresh(&glossary, &cancel), &options).await.unwrap();
        let got: Vec<(usize, SegmentStatus)> =
            events.lock().iter().map(|p| (p.segment_index, p.status)).collect();
        assert_eq!(
            got,
            vec![(0, SegmentStatus::Start), (1, SegmentStatus::Success), (2, SegmentStatus::Success)]
        );
        assert!(events.lock().iter().all(|p| p.segment_total == 2));
    }

    #[tokio::test]
    async fn cancelled_chapter_reports_cancellation() {
        let fake = Arc::new(FakeTranslator::new(1));
        let t = translator(fake.clone(), None);
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());
        cancel.cancel();

        let err = t
            .translate(&lines(&["一"]), &fresh(&glossary, &cancel), &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::Cancelled));
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn plain_text_round_trips_lines() {
        let t = translator(Arc::new(FakeTranslator::new(2)), None);
        let out = t.translate_plain("一\n\n二", &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "zh:一\n\nzh:二");
    }

    #[tokio::test]
    async fn segment_log_lines_are_labeled() {
        let log = Arc::new(RecordingLog::default());
        let t = Translator::new(Arc::new(FakeTranslator::new(1)), None, log.clone());
        let source = lines(&["竜"]);
        let old = lines(&["旧"]);
        let glossary = Glossary::new();
        let cancel = CancellationToken::new();
        let ctx = ChapterContext {
            glossary: &glossary,
            old_glossary: None,
            old_lines: Some(&old),
            force: false,
            cancel: &cancel,
        };
        let options = RunOptions {
            chapter: Some(ChapterPosition {
                index: 2,
                total: 5,
                id: None,
            }),
            ..RunOptions::default()
        };

        t.translate(&source, &ctx, &options).await.unwrap();
        assert_eq!(
            log.messages(),
            vec!["chapter 2/5 segment 1/1 glossary unchanged, reusing previous translation".to_string()]
        );
    }

    #[tokio::test]
    async fn backends_see_only_their_context_window() {
        let fake = Arc::new(FakeTranslator::new(1).with_context(2));
        let t = translator(fake.clone(), None);
        let (glossary, cancel) = (Glossary::new(), CancellationToken::new());

        t.translate(&lines(&["一", "二", "三", "四"]), &fresh(&glossary, &cancel), &RunOptions::default())
            .await
            .unwrap();

        let seen = fake.seen_context();
        assert_eq!(seen[0], ("一".to_string(), vec![]));
        assert_eq!(seen[3], ("四".to_string(), vec![lines(&["zh:二"]), lines(&["zh:三"])]));
        assert!(seen.iter().all(|(_, prev)| prev.len() <= 2));

        let blind = Arc::new(FakeTranslator::new(1));
        translator(blind.clone(), None)
            .translate(&lines(&["一", "二"]), &fresh(&glossary, &cancel), &RunOptions::default())
            .await
            .unwrap();
        assert!(blind.seen_context().iter().all(|(_, prev)| prev.is_empty()));
    }
}
