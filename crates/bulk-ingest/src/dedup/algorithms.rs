//! Pairwise similarity algorithms
//!
//! Every scorer returns `None` when it cannot say anything about the pair
//! (missing hash, no extracted text, different type families) and a score in
//! `[0, 1]` otherwise. Scores are symmetric in their arguments.

use std::collections::BTreeMap;
use unicode_segmentation::UnicodeSegmentation;

use crate::config::{ConfidenceThresholds, DedupConfig};
use crate::types::{BatchFile, Confidence, DetectionAlgorithm, FileFamily};

use super::domain::DomainSignals;

/// Everything the detector knows about one file
#[derive(Debug, Clone)]
pub struct Candidate {
    pub file: BatchFile,
    /// Normalised extracted text
    pub text: Option<String>,
    pub perceptual_hash: Option<u64>,
    pub signals: DomainSignals,
}

impl Candidate {
    pub fn new(file: BatchFile) -> Self {
        let signals = DomainSignals::from_filename(&file.sanitized_filename);
        Self {
            file,
            text: None,
            perceptual_hash: None,
            signals,
        }
    }

    /// Attach extracted text, truncated to `max_chars` after normalisation
    pub fn with_text(mut self, raw: &str, max_chars: usize) -> Self {
        self.signals.absorb(DomainSignals::from_text(raw));
        let normalized = normalize_text(raw, max_chars);
        if !normalized.is_empty() {
            self.text = Some(normalized);
        }
        self
    }
}

/// Score one algorithm for a pair
pub fn score(
    algorithm: DetectionAlgorithm,
    a: &Candidate,
    b: &Candidate,
    config: &DedupConfig,
) -> Option<f64> {
    if algorithm == DetectionAlgorithm::ContentHash {
        return content_hash(&a.file, &b.file);
    }

    // Cheap pre-filters for the fuzzy algorithms
    if a.file.family() != b.file.family() || size_ratio(&a.file, &b.file) < config.min_size_ratio {
        return None;
    }

    match algorithm {
        DetectionAlgorithm::ContentHash => None,
        DetectionAlgorithm::Perceptual => {
            if a.file.family() != FileFamily::Image {
                return None;
            }
            Some(perceptual(a.perceptual_hash?, b.perceptual_hash?))
        }
        DetectionAlgorithm::Text => Some(text_similarity(a.text.as_deref()?, b.text.as_deref()?)),
        DetectionAlgorithm::Metadata => metadata_overlap(&a.file.metadata, &b.file.metadata),
        DetectionAlgorithm::FuzzyFilename => Some(fuzzy_filename(&a.file, &b.file)),
    }
}

/// Map a score onto a confidence tier; `None` below the low threshold
pub fn classify(score: f64, thresholds: ConfidenceThresholds) -> Option<Confidence> {
    if score >= thresholds.high {
        Some(Confidence::High)
    } else if score >= thresholds.medium {
        Some(Confidence::Medium)
    } else if score >= thresholds.low {
        Some(Confidence::Low)
    } else {
        None
    }
}

pub fn content_hash(a: &BatchFile, b: &BatchFile) -> Option<f64> {
    let (ha, hb) = (a.content_hash.as_deref()?, b.content_hash.as_deref()?);
    Some(if ha == hb { 1.0 } else { 0.0 })
}

/// 1 - hamming distance / 64
pub fn perceptual(a: u64, b: u64) -> f64 {
    1.0 - (a ^ b).count_ones() as f64 / 64.0
}

/// Normalised Levenshtein similarity over characters
pub fn text_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

/// Fraction of metadata fields, over both files, that carry the same value
pub fn metadata_overlap(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let normalize = |map: &BTreeMap<String, String>| -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_lowercase()))
            .filter(|(_, v)| !v.is_empty())
            .collect()
    };
    let (a, b) = (normalize(a), normalize(b));

    let keys: std::collections::BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    if keys.is_empty() {
        return None;
    }
    let matching = keys
        .iter()
        .filter(|k| matches!((a.get(k.as_str()), b.get(k.as_str())), (Some(x), Some(y)) if x == y))
        .count();
    Some(matching as f64 / keys.len() as f64)
}

/// Filename stem similarity weighted with size closeness
pub fn fuzzy_filename(a: &BatchFile, b: &BatchFile) -> f64 {
    0.8 * filename_similarity(&a.sanitized_filename, &b.sanitized_filename)
        + 0.2 * size_ratio(a, b)
}

/// Similarity of two filenames ignoring extension, case, separators and copy markers
pub fn filename_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (name_tokens(a), name_tokens(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    text_similarity(&a.join(" "), &b.join(" "))
}

/// smaller / larger
pub fn size_ratio(a: &BatchFile, b: &BatchFile) -> f64 {
    let (small, large) = if a.size_bytes <= b.size_bytes {
        (a.size_bytes, b.size_bytes)
    } else {
        (b.size_bytes, a.size_bytes)
    };
    if large == 0 {
        return 1.0;
    }
    small as f64 / large as f64
}

/// Words of a filename stem, lowercased, without copy markers
pub(crate) fn name_tokens(filename: &str) -> Vec<String> {
    let stem = match filename.rfind('.') {
        Some(pos) if pos > 0 => &filename[..pos],
        _ => filename,
    };
    let spaced = stem.replace(['_', '-', '.'], " ");
    spaced
        .unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| !COPY_MARKERS.contains(&w.as_str()))
        .collect()
}

const COPY_MARKERS: &[&str] = &["copy", "kopia", "kopie", "final", "ny", "new"];

fn normalize_text(raw: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut count = 0;
    for word in raw.unicode_words() {
        let word = word.to_lowercase();
        let len = word.chars().count();
        if count + len + 1 > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&word);
        count += len + 1;
    }
    out
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use uuid::Uuid;

    fn file(name: &str, size: u64, hash: Option<&str>) -> BatchFile {
        let mut file = testing::file(Uuid::new_v4(), name, size);
        file.content_hash = hash.map(|h| h.to_string());
        file
    }

    #[test]
    fn test_hash_score_is_symmetric() {
        let a = file("a.pdf", 10, Some("aa"));
        let b = file("b.pdf", 10, Some("aa"));
        let c = file("c.pdf", 10, Some("cc"));
        assert_eq!(content_hash(&a, &b), Some(1.0));
        assert_eq!(content_hash(&b, &a), Some(1.0));
        assert_eq!(content_hash(&a, &c), content_hash(&c, &a));
        assert_eq!(content_hash(&a, &file("d.pdf", 10, None)), None);
    }

    #[test]
    fn test_levenshtein_similarity() {
        assert_eq!(text_similarity("kitten", "kitten"), 1.0);
        let s = text_similarity("kitten", "sitting");
        assert!((s - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
        assert_eq!(text_similarity("abc", ""), 0.0);
    }

    #[test]
    fn test_perceptual_hamming() {
        assert_eq!(perceptual(0xFF, 0xFF), 1.0);
        assert_eq!(perceptual(0, 0b1111), 1.0 - 4.0 / 64.0);
    }

    #[test]
    fn test_filename_ignores_copy_markers_and_case() {
        assert_eq!(
            filename_similarity("Stämmoprotokoll_2023.pdf", "stämmoprotokoll 2023 (kopia).PDF"),
            1.0
        );
        assert!(filename_similarity("budget.xlsx", "protokoll.pdf") < 0.5);
    }

    #[test]
    fn test_metadata_overlap() {
        let mut a = BTreeMap::new();
        a.insert("title".to_string(), "Årsredovisning".to_string());
        a.insert("author".to_string(), "Styrelsen".to_string());
        let mut b = a.clone();
        assert_eq!(metadata_overlap(&a, &b), Some(1.0));
        b.insert("author".to_string(), "Revisor".to_string());
        assert_eq!(metadata_overlap(&a, &b), Some(0.5));
        assert_eq!(metadata_overlap(&a, &BTreeMap::new()), None);
    }

    #[test]
    fn test_prefilters_skip_fuzzy_algorithms() {
        let config = DedupConfig::default();
        let a = Candidate::new(file("protokoll.pdf", 1000, Some("aa")));
        let b = Candidate::new(file("protokoll.jpg", 1000, Some("aa")));
        let tiny = Candidate::new(file("protokoll.pdf", 10, Some("bb")));

        // Different families: only the hash is compared
        assert_eq!(score(DetectionAlgorithm::ContentHash, &a, &b, &config), Some(1.0));
        assert_eq!(score(DetectionAlgorithm::FuzzyFilename, &a, &b, &config), None);
        // Size ratio below the minimum
        assert_eq!(score(DetectionAlgorithm::FuzzyFilename, &a, &tiny, &config), None);
    }

    #[test]
    fn test_classify_thresholds() {
        let t = ConfidenceThresholds::new(0.95, 0.85, 0.75);
        assert_eq!(classify(0.99, t), Some(Confidence::High));
        assert_eq!(classify(0.9, t), Some(Confidence::Medium));
        assert_eq!(classify(0.75, t), Some(Confidence::Low));
        assert_eq!(classify(0.5, t), None);
    }
}
