//! novel-translate: segment-based batch chapter translation.
//!
//! Chapters are split into backend-sized segments, translated under a bounded
//! concurrency limit with a content-addressed segment cache, and persisted
//! chapter by chapter. A job queue and worker loop drive whole-volume tasks.

pub mod batch;
pub mod cancellation;
pub mod concurrency;
pub mod config;
pub mod metrics;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod task;
pub mod translate;

pub use batch::{select_chapters, translate_volume, BatchOptions, JobOutcome, TaskCallback};
pub use config::{BackendConfig, CacheConfig, ConfigError, PipelineConfig};
pub use scheduler::{
    run_job_loop, ConfiguredFactory, JobQueue, JobWorker, QueueHandle, Scheduler, TranslateJob,
    TranslateJobRecord, TranslatorFactory,
};
pub use store::{MemoryVolumeStore, StoreError, VolumeStore};
pub use task::{split_task_range, TaskDescriptor, TranslateLevel, TranslateTaskParams};
pub use translate::translator::{ChapterContext, ChapterPosition, RunOptions, Translator};
pub use translate::{Glossary, SegmentTranslator, TaskLog, TracingLog, TranslateError, TranslatorId};

/// Set to `json` for JSON log lines.
pub const ENV_LOG_FORMAT: &str = "NOVEL_TRANSLATE_LOG_FORMAT";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("novel_translate=info"));
    let json = std::env::var(ENV_LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
