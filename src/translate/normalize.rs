//! Line-level normalization around backend calls: non-text line filtering,
//! source language detection, digit width folding, leading-whitespace repair,
//! and glossary placeholder protection.

use std::sync::LazyLock;

use regex::Regex;

use super::glossary::Glossary;
use super::TranslateError;

/// Marker prefix of image placeholder lines. Such lines are never translated.
pub const IMAGE_MARKER: &str = "<图片>";

static HANGUL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Hangul}").expect("valid hangul pattern"));
static KANA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Hiragana}\p{Katakana}]").expect("valid kana pattern")
});
static HAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\p{Han}").expect("valid han pattern"));
static LATIN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zA-Z]").expect("valid latin pattern"));

/// Source language guessed from character classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLang {
    Korean,
    Japanese,
    English,
    Auto,
}

impl SourceLang {
    pub fn code(self) -> &'static str {
        match self {
            SourceLang::Korean => "ko",
            SourceLang::Japanese => "ja",
            SourceLang::English => "en",
            SourceLang::Auto => "auto",
        }
    }
}

/// Hangul wins over kana/han, which win over latin letters.
pub fn detect_source_lang(text: &str) -> SourceLang {
    if HANGUL.is_match(text) {
        SourceLang::Korean
    } else if KANA.is_match(text) || HAN.is_match(text) {
        SourceLang::Japanese
    } else if LATIN.is_match(text) {
        SourceLang::English
    } else {
        SourceLang::Auto
    }
}

/// Full-width digits (U+FF10..U+FF19) to ASCII digits.
pub fn to_halfwidth_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{ff10}'..='\u{ff19}' => char::from_u32(c as u32 - 0xfee0).unwrap_or(c),
            c => c,
        })
        .collect()
}

fn strip_line_breaks(line: &str) -> String {
    line.replace(['\r', '\n'], "")
}

/// Blank lines and image placeholders carry no translatable text.
pub fn is_untranslatable(line: &str) -> bool {
    let line = strip_line_breaks(line);
    line.trim().is_empty() || line.starts_with(IMAGE_MARKER)
}

pub fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Reinstate each non-blank source line's indentation on the matching output
/// line. `output` must be index-aligned with `source`.
pub fn restore_leading_whitespace(source: &[String], output: &mut [String]) {
    for (src, out) in source.iter().zip(output.iter_mut()) {
        if src.trim().is_empty() {
            continue;
        }
        let indent = leading_whitespace(src);
        *out = format!("{indent}{}", out.trim_start());
    }
}

/// Remembers which lines of a chapter were handed to the backend so the
/// translated text can be spliced back between the untouched lines.
#[derive(Debug, Clone)]
pub struct LineFilter {
    translatable: Vec<bool>,
}

impl LineFilter {
    /// Returns the filter and the translatable lines (line breaks stripped).
    pub fn new(lines: &[String]) -> (Self, Vec<String>) {
        let translatable: Vec<bool> = lines.iter().map(|l| !is_untranslatable(l)).collect();
        let kept = lines
            .iter()
            .zip(&translatable)
            .filter(|(_, keep)| **keep)
            .map(|(line, _)| strip_line_breaks(line))
            .collect();
        (Self { translatable }, kept)
    }

    pub fn kept_count(&self) -> usize {
        self.translatable.iter().filter(|k| **k).count()
    }

    /// Pick the lines of an index-aligned companion (e.g. an older translation).
    pub fn select(&self, companion: &[String]) -> Vec<String> {
        companion
            .iter()
            .zip(&self.translatable)
            .filter(|(_, keep)| **keep)
            .map(|(line, _)| line.clone())
            .collect()
    }

    /// Rebuild a full-length output: untranslatable source lines verbatim,
    /// translated lines in order everywhere else.
    pub fn splice(
        &self,
        source: &[String],
        translated: Vec<String>,
    ) -> Result<Vec<String>, TranslateError> {
        if translated.len() != self.kept_count() {
            return Err(TranslateError::LineCountMismatch {
                expected: self.kept_count(),
                actual: translated.len(),
            });
        }
        let mut translated = translated.into_iter();
        let mut out = Vec::with_capacity(source.len());
        for (line, keep) in source.iter().zip(&self.translatable) {
            if *keep {
                // Length checked above.
                out.push(translated.next().unwrap_or_default());
            } else {
                out.push(line.clone());
            }
        }
        Ok(out)
    }
}

/// A placeholder substitution that must be restored after translation.
#[derive(Debug, Clone)]
pub struct PlaceholderEntry {
    pub tag: String,
    pub target: String,
}

/// Hides glossary terms from backends that cannot take glossary hints.
/// Source terms become `<<G0>>`-style tags and come back as target terms.
pub struct GlossaryProtector<'a> {
    glossary: &'a Glossary,
}

impl<'a> GlossaryProtector<'a> {
    pub fn new(glossary: &'a Glossary) -> Self {
        Self { glossary }
    }

    pub fn protect(&self, lines: &[String]) -> (Vec<String>, Vec<PlaceholderEntry>) {
        let mut terms: Vec<(&str, &str)> = self.glossary.iter().filter(|(s, _)| !s.is_empty()).collect();
        terms.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

        let mut entries = Vec::new();
        let mut protected: Vec<String> = lines.to_vec();
        for (source, target) in terms {
            if !protected.iter().any(|line| line.contains(source)) {
                continue;
            }
            let tag = format!("<<G{}>>", entries.len());
            for line in protected.iter_mut() {
                if line.contains(source) {
                    *line = line.replace(source, &tag);
                }
            }
            entries.push(PlaceholderEntry {
                tag,
                target: target.to_string(),
            });
        }
        (protected, entries)
    }

    pub fn restore(&self, lines: Vec<String>, entries: &[PlaceholderEntry]) -> Vec<String> {
        lines
            .into_iter()
            .map(|mut line| {
                for entry in entries {
                    line = line.replace(&entry.tag, &entry.target);
                }
                line
            })
            .collect()
    }
}
