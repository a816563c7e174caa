// Candidate selector - deterministic pick among scraped download URLs

use crate::plugins::catalog::ForcedSelection;
use crate::plugins::error::PluginError;

/// Which kind of scraped link is being selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Attachment,
    Compiler,
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Attachment => "attachment",
            CandidateKind::Compiler => "compiler",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy<'a> {
    pub kind: CandidateKind,
    pub forced: Option<ForcedSelection>,
    /// Page the candidates were scraped from, reported in errors
    pub source_url: &'a str,
}

impl<'a> SelectionPolicy<'a> {
    pub fn new(kind: CandidateKind, forced: Option<ForcedSelection>, source_url: &'a str) -> Self {
        Self {
            kind,
            forced,
            source_url,
        }
    }
}

/// Pick exactly one candidate or fail.
///
/// Without an override exactly one candidate is expected. With an override
/// `(index, expected_count)` the page must still have `expected_count`
/// candidates, otherwise the index may no longer point at the right file.
pub fn select<'c>(candidates: &'c [String], policy: &SelectionPolicy<'_>) -> Result<&'c str, PluginError> {
    let kind = policy.kind.as_str();

    // Callers fall back to the next strategy on this one
    if candidates.is_empty() {
        return Err(PluginError::NoCandidates { kind });
    }

    let ForcedSelection {
        index,
        expected_count,
    } = policy.forced.unwrap_or(ForcedSelection {
        index: 0,
        expected_count: 1,
    });

    if index >= candidates.len() {
        return Err(PluginError::IndexOutOfRange {
            kind,
            index,
            len: candidates.len(),
            source_url: policy.source_url.to_string(),
        });
    }

    if candidates.len() != expected_count {
        let hint = if candidates.len() > 1 {
            format!(
                "\nNote: You can select a specific plugin {kind} URL index by setting the field \"force_{kind}_selection\" in plugins.json.\nThe format should be: \"force_{kind}_selection\": [selected_index, number_of_URLs]"
            )
        } else {
            String::new()
        };
        return Err(PluginError::CandidateCountMismatch {
            kind,
            expected: expected_count,
            actual: candidates.len(),
            candidates: candidates.to_vec(),
            source_url: policy.source_url.to_string(),
            hint,
        });
    }

    Ok(&candidates[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREAD: &str = "https://forums.alliedmods.net/showthread.php?t=1";

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn default_policy() -> SelectionPolicy<'static> {
        SelectionPolicy::new(CandidateKind::Attachment, None, THREAD)
    }

    fn forced(index: usize, expected_count: usize) -> SelectionPolicy<'static> {
        SelectionPolicy::new(
            CandidateKind::Compiler,
            Some(ForcedSelection { index, expected_count }),
            THREAD,
        )
    }

    #[test]
    fn test_empty_always_fails() {
        for policy in [default_policy(), forced(0, 1), forced(3, 5)] {
            assert!(matches!(
                select(&[], &policy),
                Err(PluginError::NoCandidates { .. })
            ));
        }
    }

    #[test]
    fn test_single_default() {
        let candidates = urls(&["u1"]);
        assert_eq!(select(&candidates, &default_policy()).unwrap(), "u1");
    }

    #[test]
    fn test_two_default_is_mismatch() {
        let candidates = urls(&["u1", "u2"]);
        match select(&candidates, &default_policy()) {
            Err(err @ PluginError::CandidateCountMismatch { .. }) => {
                let message = err.to_string();
                assert!(message.contains("u1") && message.contains("u2"));
                assert!(message.contains(THREAD));
                assert!(message.contains("force_attachment_selection"));
            }
            other => panic!("expected a count mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_forced_selection() {
        let candidates = urls(&["u1", "u2"]);
        assert_eq!(select(&candidates, &forced(1, 2)).unwrap(), "u2");
    }

    #[test]
    fn test_out_of_range_beats_count_check() {
        let candidates = urls(&["u1", "u2", "u3"]);
        assert!(matches!(
            select(&candidates, &forced(5, 2)),
            Err(PluginError::IndexOutOfRange { index: 5, len: 3, .. })
        ));
    }

    #[test]
    fn test_forced_count_drift() {
        // Page grew a third attachment since the override was written
        let candidates = urls(&["u1", "u2", "u3"]);
        assert!(matches!(
            select(&candidates, &forced(1, 2)),
            Err(PluginError::CandidateCountMismatch { expected: 2, actual: 3, .. })
        ));
    }
}
