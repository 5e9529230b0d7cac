//! Completion verification for implementation work.
//!
//! A turn classified as implementation work may only finish once its tool
//! results show a successful workspace change, or once the assistant names a
//! concrete blocker. Anything else earns a corrective retry.

use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;

/// Message appended to the turn when a completion claim is rejected.
pub const CORRECTIVE_INSTRUCTION: &str = "Your last reply claimed progress without evidence. \
This task requires changes in the workspace. Either make the changes now with the file or shell \
tools and report what changed, or state the specific blocker that prevents it (the exact missing \
permission, missing dependency, or unreachable resource).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskIntent {
    Implementation,
    Discussion,
}

/// Decides whether a user request asks for implementation work.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, request: &str) -> TaskIntent;
}

/// Default classifier: an action verb anywhere in the request, unless the
/// request reads as a question.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    verbs: Vec<String>,
}

const DEFAULT_IMPLEMENTATION_VERBS: &[&str] = &[
    "add", "build", "change", "create", "delete", "edit", "fix", "implement", "migrate",
    "modify", "patch", "refactor", "remove", "rename", "replace", "rewrite", "update", "write",
];

const QUESTION_OPENERS: &[&str] = &[
    "what", "why", "how", "when", "where", "which", "who", "explain", "describe", "is", "are",
    "does", "do", "can", "could", "should",
];

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_IMPLEMENTATION_VERBS.iter().copied())
    }
}

impl KeywordClassifier {
    pub fn new<'a>(verbs: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            verbs: verbs
                .into_iter()
                .map(|verb| verb.trim().to_ascii_lowercase())
                .filter(|verb| !verb.is_empty())
                .collect(),
        }
    }

    fn is_question(words: &[String], request: &str) -> bool {
        request.trim_end().ends_with('?')
            && words
                .first()
                .is_some_and(|first| QUESTION_OPENERS.contains(&first.as_str()))
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, request: &str) -> TaskIntent {
        let words: Vec<String> = request
            .split(|ch: char| !ch.is_alphanumeric() && ch != '_')
            .filter(|word| !word.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();

        if Self::is_question(&words, request) {
            return TaskIntent::Discussion;
        }

        let has_verb = words.iter().any(|word| {
            self.verbs.iter().any(|verb| {
                word == verb
                    || word
                        .strip_prefix(verb.as_str())
                        .is_some_and(|rest| matches!(rest, "s" | "es" | "ed" | "ing" | "d"))
            })
        });

        if has_verb {
            TaskIntent::Implementation
        } else {
            TaskIntent::Discussion
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceKind {
    /// A workspace-mutating tool reported success in this turn.
    WorkspaceChange { tool: String },
    /// The request was not implementation work.
    NotRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockerKind {
    MissingPermission,
    MissingDependency,
    UnreachableResource,
}

impl BlockerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingPermission => "missing permission",
            Self::MissingDependency => "missing dependency",
            Self::UnreachableResource => "unreachable resource",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictReason {
    Evidence(EvidenceKind),
    Blocker(BlockerKind),
    NoEvidence,
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evidence(EvidenceKind::WorkspaceChange { tool }) => {
                write!(f, "workspace changed by {tool}")
            }
            Self::Evidence(EvidenceKind::NotRequired) => f.write_str("no implementation requested"),
            Self::Blocker(kind) => write!(f, "blocker stated: {}", kind.as_str()),
            Self::NoEvidence => {
                f.write_str("no successful workspace change and no specific blocker stated")
            }
        }
    }
}

/// Outcome of one reliability check. Drives the loop; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliabilityVerdict {
    pub accepted: bool,
    pub reason: VerdictReason,
}

impl ReliabilityVerdict {
    fn accept(reason: VerdictReason) -> Self {
        Self {
            accepted: true,
            reason,
        }
    }

    fn reject() -> Self {
        Self {
            accepted: false,
            reason: VerdictReason::NoEvidence,
        }
    }
}

/// Tool activity of one turn as seen by the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEvidence {
    pub tool_name: String,
    pub changed_workspace: bool,
    pub succeeded: bool,
}

#[derive(Clone)]
pub struct ReliabilityContract {
    classifier: Arc<dyn IntentClassifier>,
}

impl fmt::Debug for ReliabilityContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliabilityContract").finish_non_exhaustive()
    }
}

impl Default for ReliabilityContract {
    fn default() -> Self {
        Self::new(Arc::new(KeywordClassifier::default()))
    }
}

impl ReliabilityContract {
    pub fn new(classifier: Arc<dyn IntentClassifier>) -> Self {
        Self { classifier }
    }

    pub fn classify(&self, request: &str) -> TaskIntent {
        self.classifier.classify(request)
    }

    pub fn evaluate(
        &self,
        intent: TaskIntent,
        final_text: &str,
        evidence: &[ToolEvidence],
    ) -> ReliabilityVerdict {
        if intent == TaskIntent::Discussion {
            return ReliabilityVerdict::accept(VerdictReason::Evidence(EvidenceKind::NotRequired));
        }

        if let Some(change) = evidence
            .iter()
            .find(|item| item.changed_workspace && item.succeeded)
        {
            return ReliabilityVerdict::accept(VerdictReason::Evidence(
                EvidenceKind::WorkspaceChange {
                    tool: change.tool_name.clone(),
                },
            ));
        }

        match detect_blocker(final_text) {
            Some(kind) => ReliabilityVerdict::accept(VerdictReason::Blocker(kind)),
            None => ReliabilityVerdict::reject(),
        }
    }
}

fn blocker_patterns() -> &'static [(BlockerKind, Regex)] {
    static CACHED: OnceLock<Vec<(BlockerKind, Regex)>> = OnceLock::new();
    CACHED.get_or_init(|| {
        [
            (
                BlockerKind::MissingPermission,
                r"(?i)permission denied|access (is )?denied|not permitted|read-only file ?system|insufficient (permissions?|privileges)|\bEACCES\b|requires? (root|sudo|admin)",
            ),
            (
                BlockerKind::MissingDependency,
                r"(?i)command not found|not installed|no module named|modulenotfounderror|cannot find (module|package|crate|library)|missing (dependency|package|module|library|crate|binary|toolchain)|unresolved import",
            ),
            (
                BlockerKind::UnreachableResource,
                r"(?i)connection refused|could not resolve host|network is unreachable|name or service not known|host unreachable|no route to host|\b(404|503)\b.*(not found|unavailable)",
            ),
        ]
        .into_iter()
        .map(|(kind, pattern)| {
            (
                kind,
                Regex::new(pattern).expect("blocker regex must compile"),
            )
        })
        .collect()
    })
}

/// Specific, actionable blocker named in `text`, if any. Vague deferrals
/// ("I'll get to it") match nothing.
pub fn detect_blocker(text: &str) -> Option<BlockerKind> {
    blocker_patterns()
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(kind, _)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_evidence(succeeded: bool) -> ToolEvidence {
        ToolEvidence {
            tool_name: "write_file".to_string(),
            changed_workspace: true,
            succeeded,
        }
    }

    #[test]
    fn classifier_detects_implementation_verbs() {
        let classifier = KeywordClassifier::default();
        assert_eq!(classifier.classify("add function X"), TaskIntent::Implementation);
        assert_eq!(classifier.classify("Fixing the parser bug"), TaskIntent::Implementation);
        assert_eq!(classifier.classify("Please refactor utils.rs"), TaskIntent::Implementation);
        assert_eq!(classifier.classify("summarize this repo"), TaskIntent::Discussion);
        assert_eq!(classifier.classify("how would I fix this?"), TaskIntent::Discussion);
        assert_eq!(classifier.classify("address the review"), TaskIntent::Discussion);
    }

    #[test]
    fn vague_deferral_without_evidence_is_rejected() {
        let contract = ReliabilityContract::default();
        let verdict = contract.evaluate(TaskIntent::Implementation, "I'll get started soon", &[]);

        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::NoEvidence);
    }

    #[test]
    fn successful_write_is_accepted_as_evidence() {
        let contract = ReliabilityContract::default();
        let verdict = contract.evaluate(
            TaskIntent::Implementation,
            "Done, function X added",
            &[write_evidence(true)],
        );

        assert!(verdict.accepted);
        assert_eq!(
            verdict.reason,
            VerdictReason::Evidence(EvidenceKind::WorkspaceChange {
                tool: "write_file".to_string()
            })
        );
    }

    #[test]
    fn failed_write_is_not_evidence() {
        let contract = ReliabilityContract::default();
        let verdict =
            contract.evaluate(TaskIntent::Implementation, "Done", &[write_evidence(false)]);
        assert!(!verdict.accepted);
    }

    #[test]
    fn specific_blocker_is_accepted() {
        let contract = ReliabilityContract::default();
        let verdict = contract.evaluate(
            TaskIntent::Implementation,
            "I cannot proceed: `cargo` is not installed in this environment.",
            &[],
        );
        assert!(verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::Blocker(BlockerKind::MissingDependency));

        assert_eq!(
            detect_blocker("write failed: Permission denied (os error 13)"),
            Some(BlockerKind::MissingPermission)
        );
        assert_eq!(
            detect_blocker("curl: (7) Failed to connect: Connection refused"),
            Some(BlockerKind::UnreachableResource)
        );
        assert_eq!(detect_blocker("I will look into it later"), None);
    }

    #[test]
    fn discussion_needs_no_evidence() {
        let contract = ReliabilityContract::default();
        let verdict = contract.evaluate(TaskIntent::Discussion, "It parses JSON.", &[]);
        assert!(verdict.accepted);
    }

    #[test]
    fn custom_classifier_plugs_in() {
        struct Always;
        impl IntentClassifier for Always {
            fn classify(&self, _request: &str) -> TaskIntent {
                TaskIntent::Implementation
            }
        }

        let contract = ReliabilityContract::new(Arc::new(Always));
        assert_eq!(contract.classify("hello"), TaskIntent::Implementation);
    }
}
