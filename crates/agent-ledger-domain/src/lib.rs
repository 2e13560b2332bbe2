#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TraceId(pub Ulid);

impl TraceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SpanId(pub Ulid);

impl SpanId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CheckpointId(pub Ulid);

impl CheckpointId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content address of an artifact: lowercase hex SHA-256 of its bytes.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArtifactId(pub String);

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ArtifactId {
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hash_bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Turn,
    ModelCall,
    ToolCall,
    Reasoning,
    BrowserSession,
    MemoryOp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Open,
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRelation {
    Used,
    WasGeneratedBy,
    WasDerivedFrom,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityRef {
    Span(SpanId),
    Artifact(ArtifactId),
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Span(id) => write!(f, "span:{id}"),
            Self::Artifact(id) => write!(f, "artifact:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    TestPass,
    TestFail,
    FileEdit,
    CommandSuccess,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Shell,
    Edit,
    Read,
    Browser,
    VersionControl,
    Memory,
}

impl ToolCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Edit => "edit",
            Self::Read => "read",
            Self::Browser => "browser",
            Self::VersionControl => "version_control",
            Self::Memory => "memory",
        }
    }
}

/// Attribute values are scalars or references to content-addressed artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Artifact(ArtifactId),
}

impl AttrValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }
}

pub type AttrMap = BTreeMap<String, AttrValue>;

/// Well-known span attribute keys written by the dispatcher and consumed by
/// the evidence gate. String-keyed so plans and tools can add their own, but
/// the core never invents variants outside this module.
pub mod attr {
    pub const TOOL_CATEGORY: &str = "tool.category";
    pub const TOOL_COMMAND: &str = "tool.command";
    pub const TOOL_EXIT_CODE: &str = "tool.exit_code";
    pub const TOOL_SUCCESS: &str = "tool.success";
    pub const TOOL_STDOUT: &str = "tool.stdout";
    pub const TOOL_STDERR: &str = "tool.stderr";
    pub const TOOL_DURATION_MS: &str = "tool.duration_ms";
    pub const TOOL_RESOURCES: &str = "tool.resources_touched";
    pub const TOOL_PATHS: &str = "tool.paths";
    pub const ERROR_KIND: &str = "error.kind";
    pub const PHASE: &str = "phase";
    pub const TURN_SLOT: &str = "turn.slot";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanRecord {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    pub kind: SpanKind,
    pub started_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
    pub status: SpanStatus,
    pub attributes: AttrMap,
}

/// A span plus its ledger-assigned ordering key. `seq` is allocated by the
/// store on append and is the total order within one lineage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanRow {
    pub seq: i64,
    pub span: SpanRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvenanceEdge {
    pub relation: EdgeRelation,
    pub from: EntityRef,
    pub to: EntityRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeRow {
    pub edge_seq: i64,
    pub trace_id: TraceId,
    pub recorded_at: DateTimeUtc,
    pub edge: ProvenanceEdge,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArtifactRecord {
    pub artifact_id: ArtifactId,
    pub byte_len: u64,
    pub created_at: DateTimeUtc,
}

/// A fact extracted mechanically from a closed span. Never asserted by the
/// agent; the extraction rules live in `agent-ledger-gate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceRecord {
    pub evidence_type: EvidenceType,
    pub span_id: SpanId,
    pub timestamp: DateTimeUtc,
    pub raw_command: Option<String>,
    pub exit_code: Option<i64>,
    pub matched_pattern: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Workflow position of one session/task attempt. Owned by the phase engine,
/// serialized whole into checkpoints so resume/fork is a value copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseState {
    pub plan_hash: String,
    pub current_phase: String,
    /// Monotonic per phase. A back-edge never resets an entry.
    pub calls_used: BTreeMap<String, u32>,
    pub budget_ceilings: BTreeMap<String, u32>,
    pub required_outputs: BTreeMap<String, Vec<String>>,
    pub recorded_outputs: BTreeMap<String, Value>,
    pub evidence_records: Vec<EvidenceRecord>,
    pub back_edges_taken: BTreeMap<String, u32>,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    pub checkpoint_id: CheckpointId,
    pub trace_id: TraceId,
    pub last_span_seq: i64,
    pub phase_state: PhaseState,
    pub open_span_ids: Vec<SpanId>,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceRecord {
    pub trace_id: TraceId,
    pub parent_trace_id: Option<TraceId>,
    pub forked_at_seq: Option<i64>,
    pub created_at: DateTimeUtc,
    pub label: Option<String>,
}

/// One tool-call request issued by the model client within a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub category: ToolCategory,
    pub arguments: Value,
    pub declared_phase: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Structured outcome record every external tool executor must return.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub resources_touched: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    TestPass,
    RegressionClean,
}

/// Structured claim payload. The gate never accepts free text.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Claim {
    pub claim_type: ClaimType,
    pub patterns: Vec<String>,
}

/// Machine-checkable rejection emitted by the evidence gate. Carries exactly
/// what was searched for so a caller can act without re-deriving the cause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceRejection {
    pub claim_type: ClaimType,
    pub patterns: Vec<String>,
    pub unsatisfied_pattern: String,
    pub searched_kinds: Vec<EvidenceType>,
    pub searched_after: Option<DateTimeUtc>,
    pub reason_code: String,
}

pub const REASON_NO_EVIDENCE: &str = "no_matching_evidence";
pub const REASON_STALE_EVIDENCE: &str = "evidence_predates_last_edit";

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CoreError {
    #[error("ledger corruption: {0}")]
    LedgerCorruption(String),
    #[error("provenance edge rejected: cycle from {from} to {to}")]
    CycleRejected { from: String, to: String },
    #[error("tool {tool} is not allowed in phase {phase}")]
    PhaseViolation { phase: String, tool: String },
    #[error("budget exhausted in phase {phase}: {used}/{ceiling} calls")]
    BudgetExhausted { phase: String, used: u32, ceiling: u32 },
    #[error("missing required output {output} for phase {phase}")]
    MissingRequiredOutput { phase: String, output: String },
    #[error("no matching evidence for pattern {}", .0.unsatisfied_pattern)]
    NoMatchingEvidence(EvidenceRejection),
    #[error("tool call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("tool execution failed: {0}")]
    ToolExecutionFailure(String),
    #[error("{0}")]
    Validation(String),
}

/// Stable process exit codes so calling automation can branch on failure
/// class without parsing output.
pub mod exit_codes {
    /// Command succeeded.
    pub const OK: i32 = 0;
    /// Invalid arguments, unreadable input, or any unclassified error.
    pub const INVALID: i32 = 1;
    /// A provenance edge would have created a cycle.
    pub const CYCLE_REJECTED: i32 = 2;
    /// The current phase has no calls remaining.
    pub const BUDGET_EXHAUSTED: i32 = 3;
    /// The evidence gate found no record backing the claim.
    pub const NO_MATCHING_EVIDENCE: i32 = 4;
    /// A tool call exceeded its deadline.
    pub const TIMEOUT: i32 = 5;
    /// Unclosed spans with no matching checkpoint, or immutability violated.
    pub const LEDGER_CORRUPTION: i32 = 6;
    /// A tool category outside the current phase allow-list.
    pub const PHASE_VIOLATION: i32 = 7;
}

impl CoreError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LedgerCorruption(_) => exit_codes::LEDGER_CORRUPTION,
            Self::CycleRejected { .. } => exit_codes::CYCLE_REJECTED,
            Self::PhaseViolation { .. } => exit_codes::PHASE_VIOLATION,
            Self::BudgetExhausted { .. } => exit_codes::BUDGET_EXHAUSTED,
            Self::NoMatchingEvidence(_) => exit_codes::NO_MATCHING_EVIDENCE,
            Self::Timeout { .. } => exit_codes::TIMEOUT,
            Self::ToolExecutionFailure(_)
            | Self::MissingRequiredOutput { .. }
            | Self::Validation(_) => exit_codes::INVALID,
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Format a timestamp as RFC 3339 for persistence and display.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
/// Returns an error when the input is not valid RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

impl PhaseState {
    /// Number of calls consumed so far in `phase`. Zero if never entered.
    #[must_use]
    pub fn calls_used_in(&self, phase: &str) -> u32 {
        self.calls_used.get(phase).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn ceiling_for(&self, phase: &str) -> Option<u32> {
        self.budget_ceilings.get(phase).copied()
    }

    /// Latest `file_edit` evidence timestamp, if any edits were recorded.
    #[must_use]
    pub fn latest_file_edit(&self) -> Option<DateTimeUtc> {
        self.evidence_records
            .iter()
            .filter(|record| record.evidence_type == EvidenceType::FileEdit)
            .map(|record| record.timestamp)
            .max()
    }
}
