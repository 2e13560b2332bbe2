#![forbid(unsafe_code)]

use agent_ledger_domain::{
    ArtifactId, AttrMap, CheckpointId, CheckpointRecord, DateTimeUtc, EdgeRow, PhaseState,
    ProvenanceEdge, SpanId, SpanKind, SpanRow, SpanStatus, TraceId, TraceRecord,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Position in a trace lineage. Holding one is the only permission to append
/// child spans under it; code without a context cannot write to the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// An open span. Returned by `open_span`, consumed by `close_span`.
/// The embedded context is what gets forked for concurrent children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanHandle {
    pub context: SpanContext,
    pub seq: i64,
}

/// One segment of a lineage: a trace plus the sequence bound visible from a
/// descendant (ancestors are readable only up to their fork point).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct LineageSlice {
    pub trace_id: TraceId,
    pub up_to_seq: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanFilter {
    /// Resolve this trace's ancestry and include ancestor spans up to each
    /// fork point. `None` means no lineage restriction.
    pub lineage_of: Option<TraceId>,
    pub kinds: Vec<SpanKind>,
    pub statuses: Vec<SpanStatus>,
    pub started_after: Option<DateTimeUtc>,
    pub started_before: Option<DateTimeUtc>,
    pub seq_after: Option<i64>,
    /// Attribute predicates: key must be present with exactly this text value.
    pub attr_text_equals: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeState {
    pub checkpoint: CheckpointRecord,
    /// Spans the checkpoint recorded as legitimately open (the enclosing stack).
    pub expected_open: Vec<SpanRow>,
    /// Spans opened after the checkpoint and never closed: an interruption,
    /// surfaced as such, never reinterpreted as success.
    pub interrupted: Vec<SpanRow>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct GcReport {
    pub artifacts_removed: u64,
    pub bytes_removed: u64,
}

pub trait Ledger: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn create_trace(&self, label: Option<&str>) -> Result<TraceRecord>;

    #[allow(clippy::missing_errors_doc)]
    fn get_trace(&self, trace_id: TraceId) -> Result<Option<TraceRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_traces(&self) -> Result<Vec<TraceRecord>>;

    /// Ancestry chain for a trace, root first, ending with the trace itself.
    #[allow(clippy::missing_errors_doc)]
    fn lineage(&self, trace_id: TraceId) -> Result<Vec<LineageSlice>>;

    /// Open the root span of a trace. Fails if the trace already has one.
    #[allow(clippy::missing_errors_doc)]
    fn open_root_span(&self, trace_id: TraceId, kind: SpanKind, attributes: &AttrMap)
        -> Result<SpanHandle>;

    #[allow(clippy::missing_errors_doc)]
    fn open_span(
        &self,
        parent: &SpanContext,
        kind: SpanKind,
        attributes: &AttrMap,
    ) -> Result<SpanHandle>;

    /// Close an open span. `status` must be `Ok` or `Error`; closing is the
    /// single permitted mutation and only while the span is still open.
    #[allow(clippy::missing_errors_doc)]
    fn close_span(
        &self,
        handle: &SpanHandle,
        status: SpanStatus,
        result_attributes: &AttrMap,
    ) -> Result<()>;

    /// Close a still-open span as `error` with an `interrupted` marker.
    /// Used by drivers after `resume` reports interruption. `trace_id` names
    /// the lineage claiming the write; only the span's owning trace may close
    /// it.
    #[allow(clippy::missing_errors_doc)]
    fn mark_interrupted(&self, trace_id: TraceId, span_id: SpanId) -> Result<()>;

    /// Idempotent content-addressed insert: identical bytes return the
    /// existing id without duplicating storage.
    #[allow(clippy::missing_errors_doc)]
    fn add_artifact(&self, bytes: &[u8]) -> Result<ArtifactId>;

    #[allow(clippy::missing_errors_doc)]
    fn get_artifact(&self, artifact_id: &ArtifactId) -> Result<Option<Vec<u8>>>;

    /// Append a provenance edge. Rejects with `CoreError::CycleRejected`
    /// (and writes nothing) if the edge would close a cycle.
    #[allow(clippy::missing_errors_doc)]
    fn add_edge(&self, trace_id: TraceId, edge: &ProvenanceEdge) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn query_spans(&self, filter: &SpanFilter) -> Result<Vec<SpanRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn query_edges(&self, trace_id: TraceId) -> Result<Vec<EdgeRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn open_spans(&self, trace_id: TraceId) -> Result<Vec<SpanRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn checkpoint(&self, trace_id: TraceId, phase_state: &PhaseState) -> Result<CheckpointRecord>;

    #[allow(clippy::missing_errors_doc)]
    fn get_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Option<CheckpointRecord>>;

    /// Reload a checkpoint into the same lineage, reporting interrupted spans.
    /// Open spans at or before the checkpoint that the checkpoint did not
    /// record as open are `CoreError::LedgerCorruption`.
    #[allow(clippy::missing_errors_doc)]
    fn resume(&self, checkpoint_id: CheckpointId) -> Result<ResumeState>;

    /// New trace identity sharing history up to the checkpoint. Child writes
    /// never touch parent rows; ancestry is a pointer, not a copy.
    #[allow(clippy::missing_errors_doc)]
    fn fork(&self, checkpoint_id: CheckpointId) -> Result<TraceRecord>;

    /// Remove artifacts unreferenced by any live lineage.
    #[allow(clippy::missing_errors_doc)]
    fn gc(&self) -> Result<GcReport>;
}

impl SpanHandle {
    /// Fork this span's context for a concurrent child branch. The fork is a
    /// value copy; merging back happens through provenance edges.
    #[must_use]
    pub fn fork_context(&self) -> SpanContext {
        self.context
    }
}
