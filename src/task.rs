//! Task descriptors: `local/<volumeId>?level=..&forceMetadata=..&startIndex=..&endIndex=..`.
//! The descriptor string doubles as the job identity in the queue.

use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::form_urlencoded;

/// Upper index bound used when a task covers the whole volume.
pub const WHOLE_VOLUME_END: usize = 65535;

/// Which chapters of a volume need (re)translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslateLevel {
    /// Chapters never translated by this backend.
    Normal,
    /// `Normal` plus chapters translated under a different glossary.
    Expire,
    /// Every chapter, retranslating every segment.
    All,
}

impl TranslateLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TranslateLevel::Normal => "normal",
            TranslateLevel::Expire => "expire",
            TranslateLevel::All => "all",
        }
    }
}

impl fmt::Display for TranslateLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TranslateLevel {
    type Err = TaskParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(TranslateLevel::Normal),
            "expire" => Ok(TranslateLevel::Expire),
            "all" => Ok(TranslateLevel::All),
            other => Err(TaskParseError::InvalidValue {
                key: "level",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateTaskParams {
    pub level: TranslateLevel,
    pub force_metadata: bool,
    pub start_index: usize,
    pub end_index: usize,
}

impl TranslateTaskParams {
    pub fn whole_volume(level: TranslateLevel) -> Self {
        Self {
            level,
            force_metadata: false,
            start_index: 0,
            end_index: WHOLE_VOLUME_END,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskParseError {
    #[error("unsupported task type: {0}")]
    UnsupportedType(String),
    #[error("missing volume id")]
    MissingVolume,
    #[error("missing parameter: {0}")]
    MissingParam(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Unreserved characters (`A-Z a-z 0-9 - _ . ~`) stay as they are in the
/// volume id path segment.
const VOLUME_ID_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

pub struct TaskDescriptor;

impl TaskDescriptor {
    pub fn local(volume_id: &str, params: &TranslateTaskParams) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("level", params.level.as_str())
            .append_pair("forceMetadata", &params.force_metadata.to_string())
            .append_pair("startIndex", &params.start_index.to_string())
            .append_pair("endIndex", &params.end_index.to_string())
            .finish();
        format!("local/{}?{query}", utf8_percent_encode(volume_id, VOLUME_ID_SET))
    }

    pub fn parse(task: &str) -> Result<(String, TranslateTaskParams), TaskParseError> {
        let (path, query) = task.split_once('?').unwrap_or((task, ""));
        let (kind, volume) = path
            .split_once('/')
            .ok_or_else(|| TaskParseError::UnsupportedType(path.to_string()))?;
        if kind != "local" {
            return Err(TaskParseError::UnsupportedType(kind.to_string()));
        }
        let volume_id = percent_decode_str(volume).decode_utf8_lossy().into_owned();
        if volume_id.is_empty() {
            return Err(TaskParseError::MissingVolume);
        }

        let mut level = None;
        let mut force_metadata = false;
        let mut start_index = None;
        let mut end_index = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "level" => level = Some(value.parse()?),
                "forceMetadata" => force_metadata = parse_value("forceMetadata", &value)?,
                "startIndex" => start_index = Some(parse_value("startIndex", &value)?),
                "endIndex" => end_index = Some(parse_value("endIndex", &value)?),
                _ => {}
            }
        }

        Ok((
            volume_id,
            TranslateTaskParams {
                level: level.ok_or(TaskParseError::MissingParam("level"))?,
                force_metadata,
                start_index: start_index.unwrap_or(0),
                end_index: end_index.unwrap_or(WHOLE_VOLUME_END),
            },
        ))
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, TaskParseError> {
    value.parse().map_err(|_| TaskParseError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Split `[start, min(end, total))` into `task_number` contiguous tasks.
/// Bounds are rounded; empty ranges are dropped. With `task_number <= 1` the
/// whole volume becomes one task.
pub fn split_task_range(
    volume_id: &str,
    level: TranslateLevel,
    start: usize,
    end: usize,
    task_number: usize,
    total: usize,
) -> Vec<String> {
    if task_number <= 1 {
        return vec![TaskDescriptor::local(volume_id, &TranslateTaskParams::whole_volume(level))];
    }
    let span = end.min(total) as f64 - start as f64;
    let size = span / task_number as f64;
    (0..task_number)
        .filter_map(|i| {
            let lo = round_half_up(start as f64 + i as f64 * size);
            let hi = round_half_up(start as f64 + (i + 1) as f64 * size);
            (hi > lo).then(|| {
                TaskDescriptor::local(
                    volume_id,
                    &TranslateTaskParams {
                        level,
                        force_metadata: false,
                        start_index: lo as usize,
                        end_index: hi as usize,
                    },
                )
            })
        })
        .collect()
}

fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}
