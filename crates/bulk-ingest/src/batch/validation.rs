//! Filename, extension and hash validation for submitted files

use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Error, Result};

/// Longest stored filename in bytes
pub const MAX_FILENAME_BYTES: usize = 255;

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Clean a client filename for storage.
///
/// Directory components are dropped, control and reserved characters become
/// `_`, whitespace runs collapse to one space, and names longer than 255
/// bytes are shortened on grapheme boundaries keeping the extension.
pub fn sanitize_filename(raw: &str) -> Result<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);

    let replaced: String = base
        .chars()
        .map(|c| if c.is_control() || FORBIDDEN.contains(&c) { '_' } else { c })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = collapsed.trim_matches(|c: char| c == ' ' || c == '.').to_string();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        return Err(Error::validation(format!("Invalid filename '{}'", raw)));
    }

    Ok(truncate_preserving_extension(&cleaned, MAX_FILENAME_BYTES))
}

fn truncate_preserving_extension(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }

    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= 16 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };

    let budget = max_bytes.saturating_sub(ext.len());
    let mut kept = String::with_capacity(budget);
    for grapheme in stem.graphemes(true) {
        if kept.len() + grapheme.len() > budget {
            break;
        }
        kept.push_str(grapheme);
    }
    kept.push_str(ext);
    kept
}

/// Lowercase extension without the dot, empty when there is none
pub fn extension_of(filename: &str) -> String {
    match filename.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < filename.len() => filename[dot + 1..].to_lowercase(),
        _ => String::new(),
    }
}

/// Normalise an allow-list entry (`.PDF` -> `pdf`)
pub fn normalize_extension(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_lowercase()
}

/// Check a SHA-256 hex digest, returning it lowercased
pub fn validate_sha256(raw: &str) -> Result<String> {
    let hash = raw.trim().to_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::validation(format!(
            "'{}' is not a SHA-256 hex digest",
            raw
        )));
    }
    Ok(hash)
}
