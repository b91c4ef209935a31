//! Review stage: RECEIVED → REVIEWING → APPROVED | REJECTED.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::gate::{self, Commit};
use crate::model::{Review, Status};
use crate::store::{Store, StoreError};

/// Policy decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub approved: bool,
    pub reason: String,
    pub scores: BTreeMap<String, u8>,
    pub recommended_approach: Option<String>,
}

/// Decides whether a request may enter the build stage. Must be pure and
/// fast; the stage re-runs it when it finds a half-reviewed item.
pub trait ReviewPolicy: Send + Sync {
    fn review(&self, request: &str) -> Verdict;
}

const RISK_KEYWORDS: &[&str] = &[
    "xss",
    "attack",
    "sql injection",
    "trojan",
    "virus",
    "malware",
    "shell",
    "exec(",
    "rm -rf",
    "eval(",
    "document.write",
    "innerhtml",
    "cookie",
    "localstorage",
    "fetch(",
    "drop table",
    "delete database",
];

const SCRIPT_MARKERS: &[&str] = &["javascript:", "<script", "onerror=", "onload=", "onmouseover="];

const INTENT_WORDS: &[&str] = &[
    "want", "need", "add", "make", "create", "feature", "widget", "show", "build",
];

/// Keyword heuristics: a clarity score and a safety score.
#[derive(Debug, Clone)]
pub struct HeuristicPolicy {
    pub max_chars: usize,
    pub min_safety: u8,
    pub min_clarity: u8,
}

impl Default for HeuristicPolicy {
    fn default() -> Self {
        Self {
            max_chars: 500,
            min_safety: 60,
            min_clarity: 40,
        }
    }
}

impl HeuristicPolicy {
    fn clarity(&self, text: &str) -> u8 {
        let len = text.chars().count();
        if len == 0 {
            return 0;
        }
        if len < 3 {
            return 20;
        }
        if len > self.max_chars {
            return 30;
        }
        let lower = text.to_lowercase();
        let mut score: i32 = 50;
        if len >= 8 {
            score += 20;
        }
        if INTENT_WORDS.iter().any(|w| lower.contains(w)) {
            score += 10;
        }
        score.clamp(0, 100) as u8
    }

    fn safety(&self, text: &str) -> u8 {
        let lower = text.to_lowercase();
        let mut score: i32 = 100;
        for risk in RISK_KEYWORDS {
            if lower.contains(risk) {
                score -= 40;
            }
        }
        if SCRIPT_MARKERS.iter().any(|m| lower.contains(m)) {
            score -= 50;
        }
        score.clamp(0, 100) as u8
    }
}

impl ReviewPolicy for HeuristicPolicy {
    fn review(&self, request: &str) -> Verdict {
        let text = request.trim();
        let clarity = self.clarity(text);
        let safety = self.safety(text);
        let scores = BTreeMap::from([
            ("clarity".to_string(), clarity),
            ("safety".to_string(), safety),
        ]);
        let rejected = |reason: &str, hint: Option<&str>| Verdict {
            approved: false,
            reason: reason.to_string(),
            scores: scores.clone(),
            recommended_approach: hint.map(str::to_string),
        };

        if text.is_empty() {
            return Verdict {
                scores: BTreeMap::from([
                    ("clarity".to_string(), 0),
                    ("safety".to_string(), 100),
                ]),
                ..rejected("Request is empty; describe the feature you want added.", None)
            };
        }
        if text.chars().count() > self.max_chars {
            return rejected(
                &format!("Request is too long; keep it under {} characters.", self.max_chars),
                None,
            );
        }
        if safety < self.min_safety {
            return rejected(
                "Potential security risk detected (XSS, code injection or similar); request rejected.",
                None,
            );
        }
        if clarity < self.min_clarity {
            return rejected(
                "Request is not clear enough; describe the interaction you want in more detail.",
                Some("Describe the feature name, the main action and what it should display."),
            );
        }

        let preview: String = text.chars().take(50).collect();
        let ellipsis = if text.chars().count() > 50 { "..." } else { "" };
        let brief: String = text.chars().take(100).collect();
        Verdict {
            approved: true,
            reason: format!("approved: {preview}{ellipsis}"),
            scores,
            recommended_approach: Some(format!(
                "Generate an interactive component for \"{brief}\" with the inputs, actions and display the request describes."
            )),
        }
    }
}

pub struct ReviewStage {
    store: Arc<Store>,
    policy: Arc<dyn ReviewPolicy>,
}

impl ReviewStage {
    pub fn new(store: Arc<Store>, policy: Arc<dyn ReviewPolicy>) -> Self {
        Self { store, policy }
    }

    /// Review every pending item. Returns how many were touched.
    pub fn run(&self) -> Result<usize, StoreError> {
        let pending = self
            .store
            .list_by_status(&[Status::Received, Status::Reviewing])?;
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = pending.len(), "Reviewing pending submissions");

        let mut touched = 0;
        for submission in pending {
            let id = submission.id;
            // Re-entering REVIEWING after a crash is fine: the policy is pure.
            match gate::commit(&self.store, id, &[Status::Received, Status::Reviewing], |s| {
                s.advance(Status::Reviewing)
            })? {
                Commit::Applied(_) => {}
                Commit::Cancelled => {
                    tracing::info!(submission_id = id, "Cancelled before review, skipping");
                    continue;
                }
                Commit::Moved(status) => {
                    tracing::debug!(submission_id = id, %status, "No longer pending review");
                    continue;
                }
            }
            touched += 1;

            let verdict = self.policy.review(&submission.request);
            let next = if verdict.approved {
                Status::Approved
            } else {
                Status::Rejected
            };
            let review = Review {
                approved: verdict.approved,
                reason: verdict.reason.clone(),
                scores: verdict.scores,
                recommended_approach: verdict.recommended_approach,
                reviewed_at: Utc::now(),
            };

            match gate::commit(&self.store, id, &[Status::Reviewing], |s| {
                s.review = Some(review.clone());
                s.advance(next);
            })? {
                Commit::Applied(_) => {
                    tracing::info!(submission_id = id, status = %next, reason = %verdict.reason, "Review complete");
                }
                Commit::Cancelled => {
                    tracing::info!(submission_id = id, "Cancelled during review, verdict dropped");
                }
                Commit::Moved(status) => {
                    tracing::warn!(submission_id = id, %status, "Submission moved during review");
                }
            }
        }
        Ok(touched)
    }
}
