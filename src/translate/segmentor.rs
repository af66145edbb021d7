//! Character-budget segmentation.

use super::Segment;

/// Splits lines into segments whose combined character count stays within
/// `max_length`. A single line longer than the budget becomes its own segment.
#[derive(Debug, Clone, Copy)]
pub struct LengthSegmentor {
    max_length: usize,
    max_lines: Option<usize>,
}

impl LengthSegmentor {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            max_lines: None,
        }
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = Some(max_lines.max(1));
        self
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// `prior` is an older translation index-aligned with `lines`; when given,
    /// each segment carries the matching slice of it.
    pub fn split(&self, lines: &[String], prior: Option<&[String]>) -> Vec<Segment> {
        let prior = prior.filter(|p| p.len() == lines.len());

        let mut bounds: Vec<(usize, usize)> = Vec::new();
        let mut start = 0;
        let mut size = 0;
        for (i, line) in lines.iter().enumerate() {
            let line_size = line.chars().count();
            let count = i - start;
            let over_length = size + line_size > self.max_length;
            let over_lines = self.max_lines.is_some_and(|max| count >= max);
            if count > 0 && (over_length || over_lines) {
                bounds.push((start, i));
                start = i;
                size = 0;
            }
            size += line_size;
        }
        if start < lines.len() {
            bounds.push((start, lines.len()));
        }

        bounds
            .into_iter()
            .map(|(start, end)| Segment {
                lines: lines[start..end].to_vec(),
                prior: prior.map(|p| p[start..end].to_vec()),
            })
            .collect()
    }
}
