//! Volume storage: metadata with per-translator TOC stamps, chapter records,
//! and the in-process `MemoryVolumeStore`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::translate::{Glossary, TranslateError, TranslatorId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("volume not found: {0}")]
    VolumeNotFound(String),
    #[error("chapter not found: {volume_id}/{chapter_id}")]
    ChapterNotFound { volume_id: String, chapter_id: String },
    #[error("invalid translation: {0}")]
    Invalid(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for TranslateError {
    fn from(e: StoreError) -> Self {
        TranslateError::Storage(e.to_string())
    }
}

/// One translator's output for a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterTranslation {
    pub glossary_id: String,
    pub glossary: Glossary,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub id: String,
    pub lines: Vec<String>,
    #[serde(default)]
    pub translations: BTreeMap<TranslatorId, ChapterTranslation>,
}

impl ChapterRecord {
    pub fn new(id: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            id: id.into(),
            lines,
            translations: BTreeMap::new(),
        }
    }

    pub fn translation(&self, translator: TranslatorId) -> Option<&ChapterTranslation> {
        self.translations.get(&translator)
    }
}

/// TOC entry. `translations` maps each translator that has translated the
/// chapter to the glossary id it used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub chapter_id: String,
    #[serde(default)]
    pub translations: BTreeMap<TranslatorId, String>,
}

impl TocEntry {
    pub fn new(chapter_id: impl Into<String>) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            translations: BTreeMap::new(),
        }
    }

    pub fn glossary_id(&self, translator: TranslatorId) -> Option<&str> {
        self.translations.get(&translator).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub id: String,
    pub toc: Vec<TocEntry>,
    pub glossary: Glossary,
    pub glossary_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeProgress {
    pub translator: TranslatorId,
    pub translated: usize,
    pub total: usize,
}

#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn get_volume(&self, volume_id: &str) -> Result<Option<VolumeMetadata>, StoreError>;

    async fn get_chapter(
        &self,
        volume_id: &str,
        chapter_id: &str,
    ) -> Result<Option<ChapterRecord>, StoreError>;

    /// Store a translation and stamp its TOC entry in one step. Rejects a
    /// translation whose line count differs from the source.
    async fn update_translation(
        &self,
        volume_id: &str,
        chapter_id: &str,
        translator: TranslatorId,
        translation: ChapterTranslation,
    ) -> Result<VolumeProgress, StoreError>;
}

struct StoredVolume {
    metadata: VolumeMetadata,
    chapters: HashMap<String, ChapterRecord>,
}

#[derive(Default)]
pub struct MemoryVolumeStore {
    volumes: RwLock<HashMap<String, StoredVolume>>,
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a volume. The TOC lists the chapters in the given order.
    pub fn insert_volume(
        &self,
        id: impl Into<String>,
        glossary: Glossary,
        glossary_id: impl Into<String>,
        chapters: Vec<ChapterRecord>,
    ) {
        let id = id.into();
        let toc = chapters
            .iter()
            .map(|c| TocEntry {
                chapter_id: c.id.clone(),
                translations: c
                    .translations
                    .iter()
                    .map(|(t, tr)| (*t, tr.glossary_id.clone()))
                    .collect(),
            })
            .collect();
        let metadata = VolumeMetadata {
            id: id.clone(),
            toc,
            glossary,
            glossary_id: glossary_id.into(),
        };
        let chapters = chapters.into_iter().map(|c| (c.id.clone(), c)).collect();
        self.volumes
            .write()
            .insert(id, StoredVolume { metadata, chapters });
    }

    pub fn set_glossary(
        &self,
        volume_id: &str,
        glossary: Glossary,
        glossary_id: impl Into<String>,
    ) -> Result<(), StoreError> {
        let mut volumes = self.volumes.write();
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| StoreError::VolumeNotFound(volume_id.to_string()))?;
        volume.metadata.glossary = glossary;
        volume.metadata.glossary_id = glossary_id.into();
        Ok(())
    }
}

#[async_trait]
impl VolumeStore for MemoryVolumeStore {
    async fn get_volume(&self, volume_id: &str) -> Result<Option<VolumeMetadata>, StoreError> {
        Ok(self
            .volumes
            .read()
            .get(volume_id)
            .map(|v| v.metadata.clone()))
    }

    async fn get_chapter(
        &self,
        volume_id: &str,
        chapter_id: &str,
    ) -> Result<Option<ChapterRecord>, StoreError> {
        Ok(self
            .volumes
            .read()
            .get(volume_id)
            .and_then(|v| v.chapters.get(chapter_id).cloned()))
    }

    async fn update_translation(
        &self,
        volume_id: &str,
        chapter_id: &str,
        translator: TranslatorId,
        translation: ChapterTranslation,
    ) -> Result<VolumeProgress, StoreError> {
        let mut volumes = self.volumes.write();
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| StoreError::VolumeNotFound(volume_id.to_string()))?;
        let chapter = volume
            .chapters
            .get_mut(chapter_id)
            .ok_or_else(|| StoreError::ChapterNotFound {
                volume_id: volume_id.to_string(),
                chapter_id: chapter_id.to_string(),
            })?;
        if translation.lines.len() != chapter.lines.len() {
            return Err(StoreError::Invalid(format!(
                "{} translated lines for {} source lines",
                translation.lines.len(),
                chapter.lines.len()
            )));
        }

        let glossary_id = translation.glossary_id.clone();
        chapter.translations.insert(translator, translation);
        if let Some(entry) = volume
            .metadata
            .toc
            .iter_mut()
            .find(|e| e.chapter_id == chapter_id)
        {
            entry.translations.insert(translator, glossary_id);
        }

        let translated = volume
            .metadata
            .toc
            .iter()
            .filter(|e| e.translations.contains_key(&translator))
            .count();
        debug!(volume_id, chapter_id, %translator, translated, "translation stored");
        Ok(VolumeProgress {
            translator,
            translated,
            total: volume.metadata.toc.len(),
        })
    }
}
