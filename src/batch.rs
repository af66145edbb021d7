//! Batch driver: picks the chapters a task needs, translates them under the
//! bounded runner and persists each finished chapter.
//!
//! Recoverable chapter errors are logged and counted; fatal ones (backend
//! abort, cancellation) stop the whole batch with [`JobOutcome::Aborted`].

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::concurrency::run_with_concurrency;
use crate::store::{ChapterTranslation, VolumeMetadata, VolumeProgress, VolumeStore};
use crate::task::{TranslateLevel, TranslateTaskParams};
use crate::translate::translator::{
    ChapterContext, ChapterPosition, ProgressFn, RunOptions, SegmentProgress, SegmentStatus, Translator,
};
use crate::translate::{TaskLog, TranslateError, TranslatorId};

/// Receives batch lifecycle events. Also the batch's task log.
pub trait TaskCallback: TaskLog {
    fn on_start(&self, total: usize);
    fn on_chapter_success(&self, progress: &VolumeProgress);
    fn on_chapter_failure(&self);
}

#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Applied to chapters in flight and to segments within each chapter.
    pub concurrency: usize,
    pub on_progress: Option<ProgressFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    /// Cancelled, or a backend signalled that further calls are pointless.
    Aborted,
    /// Nothing could be attempted (backend setup failed, volume missing).
    Uncomplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedChapter {
    pub chapter_id: String,
    /// Position in the sorted selection, 0-based.
    pub index: usize,
}

/// Chapters in `[start_index, end_index)` that `params.level` asks for, sorted
/// by chapter id.
pub fn select_chapters(
    metadata: &VolumeMetadata,
    translator: TranslatorId,
    params: &TranslateTaskParams,
) -> Vec<SelectedChapter> {
    let len = metadata.toc.len();
    let start = params.start_index.min(len);
    let end = params.end_index.clamp(start, len);

    let mut ids: Vec<&str> = metadata.toc[start..end]
        .iter()
        .filter(|entry| match (params.level, entry.glossary_id(translator)) {
            (TranslateLevel::All, _) => true,
            (_, None) => true,
            (TranslateLevel::Expire, Some(glossary_id)) => glossary_id != metadata.glossary_id,
            (TranslateLevel::Normal, Some(_)) => false,
        })
        .map(|entry| entry.chapter_id.as_str())
        .collect();
    ids.sort_unstable();
    ids.dedup();

    ids.into_iter()
        .enumerate()
        .map(|(index, id)| SelectedChapter {
            chapter_id: id.to_string(),
            index,
        })
        .collect()
}

struct BatchRun<'a> {
    volume_id: &'a str,
    metadata: &'a VolumeMetadata,
    store: &'a dyn VolumeStore,
    translator: &'a Translator,
    callback: &'a dyn TaskCallback,
    cancel: &'a CancellationToken,
    options: &'a BatchOptions,
    force: bool,
    total: usize,
}

impl BatchRun<'_> {
    /// `Err` only for fatal errors; recoverable ones are reported and swallowed.
    async fn translate_chapter(&self, chapter: &SelectedChapter) -> Result<(), TranslateError> {
        let position = ChapterPosition {
            index: chapter.index + 1,
            total: self.total,
            id: Some(chapter.chapter_id.clone()),
        };
        self.callback.log(
            &format!("[{}] {}/{}", chapter.index, self.volume_id, chapter.chapter_id),
            None,
        );

        match self.run_chapter(&chapter.chapter_id, &position).await {
            Ok(progress) => {
                self.callback.on_chapter_success(&progress);
                self.emit(&position, SegmentStatus::Complete);
                Ok(())
            }
            Err(TranslateError::Cancelled) => {
                self.callback.log("translation task aborted", None);
                Err(TranslateError::Cancelled)
            }
            Err(e) if e.is_fatal() => {
                self.callback.log(&format!("error, ending translation task: {e}"), None);
                Err(e)
            }
            Err(e) => {
                warn!(chapter_id = %chapter.chapter_id, error = %e, "chapter failed");
                self.callback.log(&format!("error, skipping chapter: {e}"), None);
                self.callback.on_chapter_failure();
                self.emit(&position, SegmentStatus::Failed);
                Ok(())
            }
        }
    }

    async fn run_chapter(
        &self,
        chapter_id: &str,
        position: &ChapterPosition,
    ) -> Result<VolumeProgress, TranslateError> {
        let record = self
            .store
            .get_chapter(self.volume_id, chapter_id)
            .await?
            .ok_or_else(|| TranslateError::Storage(format!("chapter {chapter_id} does not exist")))?;

        let translator_id = self.translator.id();
        let prior = record.translation(translator_id);
        let ctx = ChapterContext {
            glossary: &self.metadata.glossary,
            old_glossary: prior.map(|p| &p.glossary),
            old_lines: prior.map(|p| p.lines.as_slice()),
            force: self.force,
            cancel: self.cancel,
        };
        let run_options = RunOptions {
            concurrency: self.options.concurrency.max(1),
            chapter: Some(position.clone()),
            on_progress: self.options.on_progress.clone(),
        };
        let lines = self.translator.translate(&record.lines, &ctx, &run_options).await?;

        self.callback.log("saving chapter", None);
        let progress = self
            .store
            .update_translation(
                self.volume_id,
                chapter_id,
                translator_id,
                ChapterTranslation {
                    glossary_id: self.metadata.glossary_id.clone(),
                    glossary: self.metadata.glossary.clone(),
                    lines,
                },
            )
            .await?;
        Ok(progress)
    }

    fn emit(&self, position: &ChapterPosition, status: SegmentStatus) {
        if let Some(on_progress) = &self.options.on_progress {
            on_progress(SegmentProgress {
                chapter: Some(position.clone()),
                segment_index: 0,
                segment_total: 0,
                status,
            });
        }
    }
}

/// Translate the chapters of `volume_id` selected by `params`.
pub async fn translate_volume(
    volume_id: &str,
    params: &TranslateTaskParams,
    store: &dyn VolumeStore,
    translator: &Translator,
    callback: &dyn TaskCallback,
    cancel: &CancellationToken,
    options: &BatchOptions,
) -> JobOutcome {
    callback.log(&format!("loading untranslated chapters of {volume_id}"), None);
    let metadata = match store.get_volume(volume_id).await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            callback.log("error, ending translation task: volume does not exist", None);
            return JobOutcome::Uncomplete;
        }
        Err(e) => {
            callback.log(&format!("error, ending translation task: {e}"), None);
            return JobOutcome::Uncomplete;
        }
    };

    let chapters = select_chapters(&metadata, translator.id(), params);
    callback.on_start(chapters.len());
    if chapters.is_empty() {
        callback.log("no chapters need updating", None);
    }
    info!(volume_id, level = %params.level, chapters = chapters.len(), "batch started");

    let run = BatchRun {
        volume_id,
        metadata: &metadata,
        store,
        translator,
        callback,
        cancel,
        options,
        force: params.level == TranslateLevel::All,
        total: chapters.len(),
    };
    let run = &run;

    let result = run_with_concurrency(&chapters, options.concurrency.max(1), cancel, move |chapter, _| async move {
        run.translate_chapter(chapter).await
    })
    .await;

    match result {
        Ok(()) => JobOutcome::Completed,
        Err(e) => {
            info!(volume_id, error = %e, "batch aborted");
            JobOutcome::Aborted
        }
    }
}
