//! Housing-cooperative document identifiers
//!
//! Reference numbers, meeting dates and apartment references found in a
//! filename or extracted text. Two files that share one of these are more
//! likely the same document; two files that carry different values of the
//! same kind are likely different documents that merely look alike.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::types::{DomainSignal, DomainSignalKind};

/// Bytes between a date and a meeting keyword for the date to count
const MEETING_WINDOW: usize = 60;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:ref[-\s]?(\d{2,})|ärende\s+(\d{4}-\d+)|dnr\s+(\d+/\d{4}))")
            .expect("Invalid regex")
    })
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").expect("Invalid regex"))
}

fn meeting_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(protokoll|stämma|stamma|stämmo|möte|mote|meeting)").expect("Invalid regex")
    })
}

fn apartment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:lgh|lägenhet|lagenhet|apt|apartment)\.?\s*(?:nr\.?\s*)?(\d{1,4}[a-z]?)\b")
            .expect("Invalid regex")
    })
}

/// Identifiers extracted from one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainSignals {
    pub references: BTreeSet<String>,
    pub meeting_dates: BTreeSet<String>,
    pub apartments: BTreeSet<String>,
}

impl DomainSignals {
    /// Filenames use `_` as a word separator
    pub fn from_filename(filename: &str) -> Self {
        Self::from_text(&filename.replace('_', " "))
    }

    pub fn from_text(text: &str) -> Self {
        let mut signals = Self::default();

        for caps in reference_pattern().captures_iter(text) {
            let value = if let Some(m) = caps.get(1) {
                format!("ref:{}", m.as_str())
            } else if let Some(m) = caps.get(2) {
                format!("arende:{}", m.as_str())
            } else if let Some(m) = caps.get(3) {
                format!("dnr:{}", m.as_str())
            } else {
                continue;
            };
            signals.references.insert(value);
        }

        let keywords: Vec<(usize, usize)> = meeting_pattern()
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect();
        if !keywords.is_empty() {
            for m in date_pattern().find_iter(text) {
                let near = keywords.iter().any(|&(start, end)| {
                    start.abs_diff(m.end()) <= MEETING_WINDOW || end.abs_diff(m.start()) <= MEETING_WINDOW
                });
                if near {
                    signals.meeting_dates.insert(m.as_str().to_string());
                }
            }
        }

        for caps in apartment_pattern().captures_iter(text) {
            if let Some(m) = caps.get(1) {
                signals.apartments.insert(m.as_str().to_uppercase());
            }
        }

        signals
    }

    pub fn absorb(&mut self, other: DomainSignals) {
        self.references.extend(other.references);
        self.meeting_dates.extend(other.meeting_dates);
        self.apartments.extend(other.apartments);
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty() && self.meeting_dates.is_empty() && self.apartments.is_empty()
    }

    /// One signal per kind present on both sides
    pub fn compare(&self, other: &DomainSignals) -> Vec<DomainSignal> {
        let kinds = [
            (DomainSignalKind::ReferenceNumber, &self.references, &other.references),
            (DomainSignalKind::MeetingDate, &self.meeting_dates, &other.meeting_dates),
            (DomainSignalKind::ApartmentReference, &self.apartments, &other.apartments),
        ];

        kinds
            .into_iter()
            .filter_map(|(kind, a, b)| compare_sets(kind, a, b))
            .collect()
    }
}

fn compare_sets(
    kind: DomainSignalKind,
    a: &BTreeSet<String>,
    b: &BTreeSet<String>,
) -> Option<DomainSignal> {
    let (first_a, first_b) = (a.iter().next()?, b.iter().next()?);

    match a.intersection(b).next() {
        Some(shared) => Some(DomainSignal {
            kind,
            value_a: shared.clone(),
            value_b: shared.clone(),
            agrees: true,
        }),
        None => Some(DomainSignal {
            kind,
            value_a: first_a.clone(),
            value_b: first_b.clone(),
            agrees: false,
        }),
    }
}
