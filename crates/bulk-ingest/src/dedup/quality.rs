//! Master selection for duplicate groups

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::algorithms::name_tokens;

const SIZE_WEIGHT: f64 = 0.4;
const NAME_WEIGHT: f64 = 0.3;
const RECENCY_WEIGHT: f64 = 0.3;

/// Tokens that say nothing about a document
const GENERIC_TOKENS: &[&str] = &[
    "scan", "skanning", "img", "image", "bild", "dokument", "document", "doc", "file", "fil",
    "untitled", "namnlös", "namnlos", "nytt", "tmp", "temp",
];

/// Input for quality scoring
#[derive(Debug, Clone)]
pub struct QualityInput {
    pub file_id: Uuid,
    pub size_bytes: u64,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

/// Quality score per member plus the chosen master
#[derive(Debug, Clone)]
pub struct MasterChoice {
    /// Same order as the input
    pub scores: Vec<f64>,
    pub master: Uuid,
    /// Best minus second-best score; 1.0 for a single member
    pub margin: f64,
}

/// How descriptive a filename is, in `[0, 1]`
pub fn filename_descriptiveness(filename: &str) -> f64 {
    let tokens = name_tokens(filename);
    // "scan0001" is as generic as "scan"
    let meaningful = tokens
        .iter()
        .map(|t| t.trim_matches(|c: char| c.is_ascii_digit()))
        .filter(|core| core.chars().count() >= 3)
        .filter(|core| !GENERIC_TOKENS.contains(core))
        .count();
    let dated = tokens.iter().any(|t| t.len() == 4 && t.chars().all(|c| c.is_ascii_digit()));

    let base = (meaningful as f64 / 4.0).min(1.0);
    if dated {
        (base + 0.1).min(1.0)
    } else {
        base
    }
}

/// Score members and pick the master; ties go to the smallest file id
pub fn choose_master(members: &[QualityInput]) -> Option<MasterChoice> {
    if members.is_empty() {
        return None;
    }

    let sizes: Vec<u64> = members.iter().map(|m| m.size_bytes).collect();
    let times: Vec<DateTime<Utc>> = members.iter().map(|m| m.created_at).collect();

    let scores: Vec<f64> = members
        .iter()
        .map(|m| {
            SIZE_WEIGHT * rank(&sizes, &m.size_bytes)
                + NAME_WEIGHT * filename_descriptiveness(&m.filename)
                + RECENCY_WEIGHT * rank(&times, &m.created_at)
        })
        .collect();

    let mut order: Vec<usize> = (0..members.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .total_cmp(&scores[a])
            .then_with(|| members[a].file_id.cmp(&members[b].file_id))
    });

    let margin = match order.get(1) {
        Some(&second) => scores[order[0]] - scores[second],
        None => 1.0,
    };

    Some(MasterChoice {
        master: members[order[0]].file_id,
        scores,
        margin,
    })
}

/// Share of other values strictly below `value`; equal values share a rank
fn rank<T: PartialOrd>(values: &[T], value: &T) -> f64 {
    if values.len() < 2 {
        return 1.0;
    }
    let below = values.iter().filter(|v| *v < value).count();
    below as f64 / (values.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn member(size: u64, name: &str, age_days: i64) -> QualityInput {
        QualityInput {
            file_id: Uuid::new_v4(),
            size_bytes: size,
            filename: name.to_string(),
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn test_descriptiveness() {
        assert_eq!(filename_descriptiveness("scan0001.pdf"), 0.0);
        assert!(
            filename_descriptiveness("Stämmoprotokoll ordinarie föreningsstämma 2023.pdf")
                > filename_descriptiveness("protokoll.pdf")
        );
    }

    #[test]
    fn test_largest_newest_descriptive_wins() {
        let members = vec![
            member(100, "scan.pdf", 10),
            member(500, "Årsredovisning brf solgläntan 2023.pdf", 1),
            member(300, "arsredovisning.pdf", 5),
        ];
        let choice = choose_master(&members).unwrap();
        assert_eq!(choice.master, members[1].file_id);
        assert!(choice.margin > 0.05);
        assert_eq!(choice.scores.len(), 3);
    }

    #[test]
    fn test_tie_breaks_on_smallest_id() {
        let now = Utc::now();
        let mut a = member(100, "protokoll.pdf", 0);
        let mut b = member(100, "protokoll.pdf", 0);
        a.created_at = now;
        b.created_at = now;
        let expected = a.file_id.min(b.file_id);

        let choice = choose_master(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(choice.master, expected);
        assert_eq!(choice.margin, 0.0);

        let reversed = choose_master(&[b, a]).unwrap();
        assert_eq!(reversed.master, expected);
    }
}
