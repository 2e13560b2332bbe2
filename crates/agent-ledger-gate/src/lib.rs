#![forbid(unsafe_code)]

//! Evidence extraction and the completion gate.
//!
//! Nothing in here trusts agent narration. Evidence is derived mechanically
//! from closed spans in the ledger, and claims are validated by querying for
//! spans that actually back them. A rejection is structured data naming the
//! pattern and time window that was searched, so callers can branch on it
//! without parsing prose.

use agent_ledger_core::{Ledger, SpanFilter};
use agent_ledger_domain::{
    attr, AttrValue, Claim, ClaimType, CoreError, DateTimeUtc, EvidenceRecord, EvidenceRejection,
    EvidenceType, SpanKind, SpanRow, SpanStatus, TraceId, REASON_NO_EVIDENCE,
    REASON_STALE_EVIDENCE,
};
use anyhow::Result;
use tracing::debug;

/// Extract an evidence fact from a closed span, if its attributes describe
/// one. Open spans never yield evidence.
#[must_use]
pub fn extract_evidence(row: &SpanRow) -> Option<EvidenceRecord> {
    let span = &row.span;
    if span.kind != SpanKind::ToolCall || span.status == SpanStatus::Open {
        return None;
    }
    let category = span.attributes.get(attr::TOOL_CATEGORY)?.as_text()?;
    let exit_code = span
        .attributes
        .get(attr::TOOL_EXIT_CODE)
        .and_then(AttrValue::as_int);
    let raw_command = span
        .attributes
        .get(attr::TOOL_COMMAND)
        .and_then(AttrValue::as_text)
        .map(ToString::to_string);

    match category {
        "edit" if span.status == SpanStatus::Ok => Some(EvidenceRecord {
            evidence_type: EvidenceType::FileEdit,
            span_id: span.span_id,
            timestamp: span.started_at,
            raw_command,
            exit_code,
            matched_pattern: None,
            paths: span
                .attributes
                .get(attr::TOOL_PATHS)
                .and_then(AttrValue::as_text)
                .map(|paths| paths.lines().map(ToString::to_string).collect())
                .unwrap_or_default(),
        }),
        "shell" => match exit_code {
            Some(0) if span.status == SpanStatus::Ok => Some(EvidenceRecord {
                evidence_type: EvidenceType::CommandSuccess,
                span_id: span.span_id,
                timestamp: span.started_at,
                raw_command,
                exit_code,
                matched_pattern: None,
                paths: Vec::new(),
            }),
            Some(_) => Some(EvidenceRecord {
                evidence_type: EvidenceType::TestFail,
                span_id: span.span_id,
                timestamp: span.started_at,
                raw_command,
                exit_code,
                matched_pattern: None,
                paths: Vec::new(),
            }),
            None => None,
        },
        _ => None,
    }
}

/// Gate verdict. `Rejected` carries the full search description.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Accepted(Vec<EvidenceRecord>),
    Rejected(EvidenceRejection),
}

impl ClaimOutcome {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Convert into a typed result so callers can propagate the rejection
    /// with its stable exit code.
    ///
    /// # Errors
    /// `CoreError::NoMatchingEvidence` when the claim was rejected.
    pub fn into_result(self) -> Result<Vec<EvidenceRecord>, CoreError> {
        match self {
            Self::Accepted(records) => Ok(records),
            Self::Rejected(rejection) => Err(CoreError::NoMatchingEvidence(rejection)),
        }
    }
}

/// Validates structured claims against one trace's lineage.
pub struct EvidenceGate<'a> {
    ledger: &'a dyn Ledger,
    trace_id: TraceId,
}

impl<'a> EvidenceGate<'a> {
    #[must_use]
    pub fn new(ledger: &'a dyn Ledger, trace_id: TraceId) -> Self {
        Self { ledger, trace_id }
    }

    /// All evidence facts in this lineage, oldest first.
    ///
    /// # Errors
    /// Returns an error on ledger query failure.
    pub fn scan_evidence(&self) -> Result<Vec<EvidenceRecord>> {
        let rows = self.closed_tool_calls()?;
        Ok(rows.iter().filter_map(extract_evidence).collect())
    }

    /// Timestamp of the most recent `file_edit` evidence in the lineage.
    ///
    /// # Errors
    /// Returns an error on ledger query failure.
    pub fn latest_file_edit(&self) -> Result<Option<DateTimeUtc>> {
        Ok(self
            .scan_evidence()?
            .into_iter()
            .filter(|record| record.evidence_type == EvidenceType::FileEdit)
            .map(|record| record.timestamp)
            .max())
    }

    /// Validate a claim against recorded evidence. Every pattern in the
    /// claim must be backed by at least one successful command span whose
    /// command or captured output matches it and whose start strictly
    /// postdates the latest file edit; the first unbacked pattern rejects
    /// the whole claim.
    ///
    /// # Errors
    /// Returns an error on ledger query failure. A rejection is a normal
    /// `ClaimOutcome::Rejected`, not an `Err`.
    pub fn validate_claim(&self, claim: &Claim) -> Result<ClaimOutcome> {
        let latest_edit = self.latest_file_edit()?;
        let candidates = self.successful_commands()?;

        let mut accepted = Vec::with_capacity(claim.patterns.len());
        for pattern in &claim.patterns {
            let mut matched_any = false;
            let mut best: Option<&SpanRow> = None;
            for row in &candidates {
                if !self.span_matches_pattern(row, pattern)? {
                    continue;
                }
                matched_any = true;
                if latest_edit.map_or(true, |edit| row.span.started_at > edit) {
                    best = Some(row);
                }
            }
            let Some(row) = best else {
                let reason_code = if matched_any {
                    REASON_STALE_EVIDENCE
                } else {
                    REASON_NO_EVIDENCE
                };
                debug!(
                    pattern = pattern.as_str(),
                    reason = reason_code,
                    "claim rejected"
                );
                return Ok(ClaimOutcome::Rejected(EvidenceRejection {
                    claim_type: claim.claim_type,
                    patterns: claim.patterns.clone(),
                    unsatisfied_pattern: pattern.clone(),
                    searched_kinds: vec![EvidenceType::TestPass, EvidenceType::CommandSuccess],
                    searched_after: latest_edit,
                    reason_code: reason_code.to_string(),
                }));
            };
            let Some(mut record) = extract_evidence(row) else {
                continue;
            };
            record.evidence_type = match claim.claim_type {
                ClaimType::TestPass | ClaimType::RegressionClean => EvidenceType::TestPass,
            };
            record.matched_pattern = Some(pattern.clone());
            accepted.push(record);
        }
        Ok(ClaimOutcome::Accepted(accepted))
    }

    fn closed_tool_calls(&self) -> Result<Vec<SpanRow>> {
        self.ledger.query_spans(&SpanFilter {
            lineage_of: Some(self.trace_id),
            kinds: vec![SpanKind::ToolCall],
            statuses: vec![SpanStatus::Ok, SpanStatus::Error],
            ..SpanFilter::default()
        })
    }

    fn successful_commands(&self) -> Result<Vec<SpanRow>> {
        let rows = self.ledger.query_spans(&SpanFilter {
            lineage_of: Some(self.trace_id),
            kinds: vec![SpanKind::ToolCall],
            statuses: vec![SpanStatus::Ok],
            attr_text_equals: vec![(attr::TOOL_CATEGORY.to_string(), "shell".to_string())],
            ..SpanFilter::default()
        })?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                row.span
                    .attributes
                    .get(attr::TOOL_EXIT_CODE)
                    .and_then(AttrValue::as_int)
                    == Some(0)
            })
            .collect())
    }

    /// Pattern match against the recorded command line and the captured
    /// stdout. Output stored as an artifact is resolved through the ledger.
    fn span_matches_pattern(&self, row: &SpanRow, pattern: &str) -> Result<bool> {
        if let Some(command) = row
            .span
            .attributes
            .get(attr::TOOL_COMMAND)
            .and_then(AttrValue::as_text)
        {
            if command.contains(pattern) {
                return Ok(true);
            }
        }
        match row.span.attributes.get(attr::TOOL_STDOUT) {
            Some(AttrValue::Text(stdout)) => Ok(stdout.contains(pattern)),
            Some(AttrValue::Artifact(artifact_id)) => {
                match self.ledger.get_artifact(artifact_id)? {
                    Some(bytes) => Ok(String::from_utf8_lossy(&bytes).contains(pattern)),
                    None => Ok(false),
                }
            }
            _ => Ok(false),
        }
    }
}
