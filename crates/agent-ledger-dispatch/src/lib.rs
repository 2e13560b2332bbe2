#![forbid(unsafe_code)]

//! Concurrent tool-call dispatch over the ledger.
//!
//! A turn yields a batch of tool-call requests. Each admitted request runs
//! under its own forked span context; requests touching overlapping declared
//! resources are serialized against each other, everything else runs in
//! parallel on a bounded worker pool. Results come back in request order no
//! matter how the scheduler interleaved execution.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use agent_ledger_core::{Ledger, SpanFilter, SpanHandle};
use agent_ledger_domain::{
    attr, AttrMap, AttrValue, Claim, ClaimType, CoreError, EdgeRelation, EntityRef,
    ProvenanceEdge, SpanId, SpanKind, SpanStatus, ToolCallRequest, ToolCategory, ToolOutcome,
    TraceId,
};
use agent_ledger_gate::{extract_evidence, ClaimOutcome, EvidenceGate};
use agent_ledger_phase::{CompletionCheck, PhaseEngine, PhasePlanEnvelope};
use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, warn};

/// External tool runner. Implementations block until the tool finishes; the
/// dispatcher owns timeouts and span bookkeeping around each call.
pub trait ToolExecutor: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, request: &ToolCallRequest) -> Result<ToolOutcome>;
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Upper bound on concurrently running requests.
    pub max_workers: usize,
    /// Applied when a request carries no timeout of its own.
    pub default_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            default_timeout_ms: 120_000,
        }
    }
}

/// Per-request result, returned in the original request order. `span_id` is
/// `None` only when the request was rejected before a span was opened.
#[derive(Debug)]
pub struct ToolCallResult {
    pub slot: usize,
    pub span_id: Option<SpanId>,
    pub outcome: Result<ToolOutcome>,
}

/// Resources a request claims it will touch, derived from its arguments:
/// every entry of `paths` plus an optional explicit `resource`. Shell calls
/// with nothing declared share one implicit session resource, so they
/// serialize against each other by default.
#[must_use]
pub fn declared_resources(request: &ToolCallRequest) -> Vec<String> {
    let mut resources = Vec::new();
    if let Some(paths) = request.arguments.get("paths").and_then(Value::as_array) {
        for path in paths.iter().filter_map(Value::as_str) {
            resources.push(format!("path:{path}"));
        }
    }
    if let Some(resource) = request.arguments.get("resource").and_then(Value::as_str) {
        resources.push(resource.to_string());
    }
    if resources.is_empty() && request.category == ToolCategory::Shell {
        resources.push("shell:default".to_string());
    }
    resources.sort();
    resources.dedup();
    resources
}

/// Group request slots so that any two requests sharing a declared resource
/// land in the same group. Groups preserve request order internally.
fn conflict_groups(requests: &[Option<&ToolCallRequest>]) -> Vec<Vec<usize>> {
    let mut group_of: Vec<Option<usize>> = vec![None; requests.len()];
    let mut resource_group: BTreeMap<String, usize> = BTreeMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for (slot, request) in requests.iter().enumerate() {
        let Some(request) = request else { continue };
        let mut target: Option<usize> = None;
        for resource in declared_resources(request) {
            if let Some(&existing) = resource_group.get(&resource) {
                target = Some(match target {
                    Some(current) if current != existing => {
                        // Merge: move the later group's slots into the earlier.
                        let (keep, drain) = if current < existing {
                            (current, existing)
                        } else {
                            (existing, current)
                        };
                        let moved = std::mem::take(&mut groups[drain]);
                        for moved_slot in &moved {
                            group_of[*moved_slot] = Some(keep);
                        }
                        groups[keep].extend(moved);
                        for group in resource_group.values_mut() {
                            if *group == drain {
                                *group = keep;
                            }
                        }
                        keep
                    }
                    Some(current) => current,
                    None => existing,
                });
            }
        }
        let group = target.unwrap_or_else(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[group].push(slot);
        group_of[slot] = Some(group);
        for resource in declared_resources(request) {
            resource_group.insert(resource, group);
        }
    }

    let mut out: Vec<Vec<usize>> = groups.into_iter().filter(|g| !g.is_empty()).collect();
    for group in &mut out {
        group.sort_unstable();
    }
    out
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Dispatcher<'a> {
    ledger: &'a dyn Ledger,
    executor: Arc<dyn ToolExecutor>,
    config: DispatcherConfig,
}

impl<'a> Dispatcher<'a> {
    #[must_use]
    pub fn new(
        ledger: &'a dyn Ledger,
        executor: Arc<dyn ToolExecutor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            ledger,
            executor,
            config,
        }
    }

    /// Execute one turn's batch. Admission (declared phase, allow-list,
    /// budget) happens up front in request order on the calling thread, so a
    /// rejected request consumes no budget and opens no span. Admitted
    /// requests run on the worker pool; one request's failure never aborts
    /// its siblings.
    ///
    /// # Errors
    /// Returns an error when ledger bookkeeping for the batch as a whole
    /// fails. Per-request failures are carried inside each slot's `outcome`.
    pub fn dispatch_batch(
        &self,
        engine: &mut PhaseEngine,
        turn: &SpanHandle,
        requests: &[ToolCallRequest],
    ) -> Result<Vec<ToolCallResult>> {
        let phase = engine.state().current_phase.clone();
        let mut admitted: Vec<Option<&ToolCallRequest>> = vec![None; requests.len()];
        let mut rejected: Vec<Option<CoreError>> = Vec::with_capacity(requests.len());

        for (slot, request) in requests.iter().enumerate() {
            if request.declared_phase != phase {
                rejected.push(Some(CoreError::Validation(format!(
                    "request declared phase {} but session is in {phase}",
                    request.declared_phase
                ))));
                continue;
            }
            match engine.begin_call(request.category) {
                Ok(()) => {
                    admitted[slot] = Some(request);
                    rejected.push(None);
                }
                Err(err) => rejected.push(Some(err)),
            }
        }

        let groups = conflict_groups(&admitted);
        let slot_results: Mutex<Vec<Option<(Option<SpanId>, Result<ToolOutcome>)>>> =
            Mutex::new((0..requests.len()).map(|_| None).collect());
        let queue: Mutex<VecDeque<Vec<usize>>> = Mutex::new(groups.iter().cloned().collect());
        let workers = self.config.max_workers.max(1).min(groups.len().max(1));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let group = lock_recovering(&queue).pop_front();
                    let Some(group) = group else { break };
                    for slot in group {
                        let Some(request) = admitted[slot] else { continue };
                        let done = self.run_one(turn, &phase, slot, request);
                        lock_recovering(&slot_results)[slot] = Some(done);
                    }
                });
            }
        });

        let mut finished = lock_recovering(&slot_results);
        let mut results = Vec::with_capacity(requests.len());
        for (slot, rejection) in rejected.into_iter().enumerate() {
            if let Some(err) = rejection {
                results.push(ToolCallResult {
                    slot,
                    span_id: None,
                    outcome: Err(err.into()),
                });
            } else if let Some((span_id, outcome)) = finished[slot].take() {
                results.push(ToolCallResult {
                    slot,
                    span_id,
                    outcome,
                });
            } else {
                results.push(ToolCallResult {
                    slot,
                    span_id: None,
                    outcome: Err(anyhow!("request slot {slot} was never scheduled")),
                });
            }
        }
        drop(finished);

        self.collect_evidence(engine, turn, &results)?;
        warn_on_undeclared_overlap(requests, &results);
        Ok(results)
    }

    /// One request, start to finish: open span, execute under timeout, close
    /// span with the recorded outcome, attach artifacts and provenance.
    fn run_one(
        &self,
        turn: &SpanHandle,
        phase: &str,
        slot: usize,
        request: &ToolCallRequest,
    ) -> (Option<SpanId>, Result<ToolOutcome>) {
        let mut attrs = AttrMap::new();
        attrs.insert(
            attr::TOOL_CATEGORY.to_string(),
            AttrValue::Text(request.category.as_str().to_string()),
        );
        attrs.insert(
            attr::PHASE.to_string(),
            AttrValue::Text(phase.to_string()),
        );
        attrs.insert(
            attr::TURN_SLOT.to_string(),
            AttrValue::Int(i64::try_from(slot).unwrap_or(i64::MAX)),
        );
        if let Some(command) = request.arguments.get("command").and_then(Value::as_str) {
            attrs.insert(
                attr::TOOL_COMMAND.to_string(),
                AttrValue::Text(command.to_string()),
            );
        }
        if let Some(paths) = request.arguments.get("paths").and_then(Value::as_array) {
            let joined: Vec<&str> = paths.iter().filter_map(Value::as_str).collect();
            if !joined.is_empty() {
                attrs.insert(
                    attr::TOOL_PATHS.to_string(),
                    AttrValue::Text(joined.join("\n")),
                );
            }
        }

        let span = match self
            .ledger
            .open_span(&turn.fork_context(), SpanKind::ToolCall, &attrs)
        {
            Ok(span) => span,
            Err(err) => return (None, Err(err)),
        };
        let span_id = span.context.span_id;

        match self.execute_with_timeout(request.clone()) {
            Ok(outcome) => {
                let close = self.close_with_outcome(turn, &span, &outcome);
                match close {
                    Ok(()) => (Some(span_id), Ok(outcome)),
                    Err(err) => (Some(span_id), Err(err)),
                }
            }
            Err(core_err) => {
                let error_kind = match &core_err {
                    CoreError::Timeout { .. } => "timeout",
                    _ => "tool_failure",
                };
                let mut results = AttrMap::new();
                results.insert(
                    attr::ERROR_KIND.to_string(),
                    AttrValue::Text(error_kind.to_string()),
                );
                if let Err(close_err) =
                    self.ledger.close_span(&span, SpanStatus::Error, &results)
                {
                    warn!(%span_id, error = %close_err, "failed to close errored span");
                }
                (Some(span_id), Err(core_err.into()))
            }
        }
    }

    /// Run the executor on a helper thread so an expired deadline cannot
    /// stall the worker. On timeout the helper is abandoned; its eventual
    /// result is dropped, never recorded.
    fn execute_with_timeout(&self, request: ToolCallRequest) -> Result<ToolOutcome, CoreError> {
        let timeout_ms = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let (sender, receiver) = mpsc::channel();
        let executor = Arc::clone(&self.executor);
        thread::spawn(move || {
            let _ = sender.send(executor.execute(&request));
        });
        match receiver.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(CoreError::ToolExecutionFailure(err.to_string())),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CoreError::Timeout { timeout_ms }),
            // The helper dropped the sender without a result: the executor
            // panicked, which is a failure, not a missed deadline.
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CoreError::ToolExecutionFailure(
                "tool executor terminated without a result".to_string(),
            )),
        }
    }

    fn close_with_outcome(
        &self,
        turn: &SpanHandle,
        span: &SpanHandle,
        outcome: &ToolOutcome,
    ) -> Result<()> {
        let mut results = AttrMap::new();
        results.insert(attr::TOOL_SUCCESS.to_string(), AttrValue::Bool(outcome.success));
        if let Some(exit_code) = outcome.exit_code {
            results.insert(attr::TOOL_EXIT_CODE.to_string(), AttrValue::Int(exit_code));
        }
        results.insert(
            attr::TOOL_DURATION_MS.to_string(),
            AttrValue::Int(i64::try_from(outcome.duration_ms).unwrap_or(i64::MAX)),
        );
        if !outcome.resources_touched.is_empty() {
            results.insert(
                attr::TOOL_RESOURCES.to_string(),
                AttrValue::Text(outcome.resources_touched.join("\n")),
            );
        }

        let trace_id = span.context.trace_id;
        for (key, bytes) in [
            (attr::TOOL_STDOUT, outcome.stdout.as_bytes()),
            (attr::TOOL_STDERR, outcome.stderr.as_bytes()),
        ] {
            if bytes.is_empty() {
                continue;
            }
            let artifact_id = self.ledger.add_artifact(bytes)?;
            self.ledger.add_edge(
                trace_id,
                &ProvenanceEdge {
                    relation: EdgeRelation::WasGeneratedBy,
                    from: EntityRef::Artifact(artifact_id.clone()),
                    to: EntityRef::Span(span.context.span_id),
                },
            )?;
            results.insert(key.to_string(), AttrValue::Artifact(artifact_id));
        }

        let status = if outcome.success {
            SpanStatus::Ok
        } else {
            SpanStatus::Error
        };
        self.ledger.close_span(span, status, &results)?;

        // Merge the forked subtree back into the turn's lineage.
        self.ledger.add_edge(
            trace_id,
            &ProvenanceEdge {
                relation: EdgeRelation::WasGeneratedBy,
                from: EntityRef::Span(span.context.span_id),
                to: EntityRef::Span(turn.context.span_id),
            },
        )?;
        Ok(())
    }

    /// Pull evidence out of this batch's closed spans into the phase state.
    fn collect_evidence(
        &self,
        engine: &mut PhaseEngine,
        turn: &SpanHandle,
        results: &[ToolCallResult],
    ) -> Result<()> {
        let rows = self.ledger.query_spans(&SpanFilter {
            lineage_of: Some(turn.context.trace_id),
            kinds: vec![SpanKind::ToolCall],
            seq_after: Some(turn.seq),
            ..SpanFilter::default()
        })?;
        for result in results {
            let Some(span_id) = result.span_id else { continue };
            let Some(row) = rows.iter().find(|row| row.span.span_id == span_id) else {
                continue;
            };
            if let Some(record) = extract_evidence(row) {
                debug!(%span_id, kind = ?record.evidence_type, "evidence recorded");
                engine.push_evidence(record);
            }
        }
        Ok(())
    }
}

/// A touched-but-undeclared resource shared by two requests means the
/// conflict classifier ran on bad declarations. Recorded, not fatal.
fn warn_on_undeclared_overlap(requests: &[ToolCallRequest], results: &[ToolCallResult]) {
    let mut touched_by: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for result in results {
        if let Ok(outcome) = &result.outcome {
            for resource in &outcome.resources_touched {
                touched_by.entry(resource.as_str()).or_default().push(result.slot);
            }
        }
    }
    for (resource, slots) in touched_by {
        if slots.len() < 2 {
            continue;
        }
        let undeclared: Vec<usize> = slots
            .iter()
            .copied()
            .filter(|&slot| {
                requests.get(slot).is_some_and(|request| {
                    !declared_resources(request).contains(&resource.to_string())
                        && !declared_resources(request)
                            .contains(&format!("path:{resource}"))
                })
            })
            .collect();
        if !undeclared.is_empty() {
            warn!(resource, ?slots, ?undeclared, "undeclared resource overlap");
        }
    }
}

/// One agent session: a trace, its phase engine, and the checkpoint cadence.
/// Mutated only by its own single-threaded transition logic; all shared
/// mutation happens inside the ledger.
pub struct Session<'a> {
    ledger: &'a dyn Ledger,
    engine: PhaseEngine,
    trace_id: TraceId,
    root: SpanHandle,
}

impl<'a> Session<'a> {
    /// Create a fresh trace with a root span and a phase engine at the
    /// plan's first phase.
    ///
    /// # Errors
    /// Returns an error when the ledger rejects trace or span creation.
    pub fn start(
        ledger: &'a dyn Ledger,
        envelope: &PhasePlanEnvelope,
        label: Option<&str>,
    ) -> Result<Self> {
        let trace = ledger.create_trace(label)?;
        let engine = PhaseEngine::new(envelope);
        let mut attrs = AttrMap::new();
        attrs.insert(
            attr::PHASE.to_string(),
            AttrValue::Text(engine.state().current_phase.clone()),
        );
        let root = ledger.open_root_span(trace.trace_id, SpanKind::Turn, &attrs)?;
        Ok(Self {
            ledger,
            engine,
            trace_id: trace.trace_id,
            root,
        })
    }

    #[must_use]
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    #[must_use]
    pub fn engine(&self) -> &PhaseEngine {
        &self.engine
    }

    #[must_use]
    pub fn engine_mut(&mut self) -> &mut PhaseEngine {
        &mut self.engine
    }

    /// Open the next turn span under the session root.
    ///
    /// # Errors
    /// Returns an error when the ledger rejects the span.
    pub fn begin_turn(&self) -> Result<SpanHandle> {
        let mut attrs = AttrMap::new();
        attrs.insert(
            attr::PHASE.to_string(),
            AttrValue::Text(self.engine.state().current_phase.clone()),
        );
        self.ledger
            .open_span(&self.root.fork_context(), SpanKind::Turn, &attrs)
    }

    /// Close a turn span opened by `begin_turn`.
    ///
    /// # Errors
    /// Returns an error when the span is unknown or already closed.
    pub fn end_turn(&self, turn: &SpanHandle) -> Result<()> {
        self.ledger.close_span(turn, SpanStatus::Ok, &AttrMap::new())
    }

    /// Run one turn's batch through a dispatcher.
    ///
    /// # Errors
    /// See [`Dispatcher::dispatch_batch`].
    pub fn dispatch(
        &mut self,
        dispatcher: &Dispatcher<'_>,
        turn: &SpanHandle,
        requests: &[ToolCallRequest],
    ) -> Result<Vec<ToolCallResult>> {
        dispatcher.dispatch_batch(&mut self.engine, turn, requests)
    }

    /// Advance the phase engine and checkpoint the new state. The
    /// checkpoint is the durable phase boundary: resume and fork both start
    /// from it.
    ///
    /// # Errors
    /// Propagates phase-engine rejections and ledger failures.
    pub fn advance(
        &mut self,
        outputs: &BTreeMap<String, Value>,
    ) -> Result<agent_ledger_domain::CheckpointRecord> {
        self.engine.advance(outputs)?;
        Ok(self.ledger.checkpoint(self.trace_id, self.engine.state())?)
    }

    /// Take the back-edge out of the current phase and checkpoint.
    ///
    /// # Errors
    /// Propagates phase-engine rejections and ledger failures.
    pub fn regress(&mut self) -> Result<agent_ledger_domain::CheckpointRecord> {
        self.engine.regress()?;
        Ok(self.ledger.checkpoint(self.trace_id, self.engine.state())?)
    }

    /// Completion gate. Builds the plan's completion claims, validates each
    /// against ledger evidence, and only then archives the phase state. An
    /// agent assertion alone can never get here past a missing test run.
    ///
    /// # Errors
    /// `CoreError::NoMatchingEvidence` (inside the returned error) when any
    /// completion pattern lacks fresh backing evidence; phase-engine errors
    /// outside the terminal phase.
    pub fn complete(&mut self) -> Result<agent_ledger_domain::CheckpointRecord> {
        let gate = EvidenceGate::new(self.ledger, self.trace_id);
        let completion = self.engine.plan().completion.clone();
        let mut checks = Vec::new();
        for (claim_type, patterns) in [
            (ClaimType::TestPass, &completion.target_patterns),
            (ClaimType::RegressionClean, &completion.baseline_patterns),
        ] {
            if patterns.is_empty() {
                continue;
            }
            let claim = Claim {
                claim_type,
                patterns: patterns.clone(),
            };
            match gate.validate_claim(&claim)? {
                ClaimOutcome::Accepted(records) => {
                    for record in records {
                        checks.push(CompletionCheck {
                            pattern: record
                                .matched_pattern
                                .clone()
                                .unwrap_or_default(),
                            accepted: true,
                        });
                        self.engine.push_evidence(record);
                    }
                }
                ClaimOutcome::Rejected(rejection) => {
                    return Err(CoreError::NoMatchingEvidence(rejection).into());
                }
            }
        }
        self.engine.complete(&checks)?;
        self.ledger
            .close_span(&self.root, SpanStatus::Ok, &AttrMap::new())?;
        Ok(self.ledger.checkpoint(self.trace_id, self.engine.state())?)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        conflict_groups, declared_resources, Dispatcher, DispatcherConfig, Session, ToolExecutor,
    };
    use agent_ledger_core::{Ledger, SpanFilter};
    use agent_ledger_domain::{
        attr, AttrValue, CoreError, EvidenceType, SpanKind, SpanStatus, ToolCallRequest,
        ToolCategory, ToolOutcome,
    };
    use agent_ledger_phase::{default_bugfix_plan, envelope_for_plan, PhasePlanEnvelope};
    use agent_ledger_sqlite::SqliteLedger;
    use anyhow::anyhow;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    struct ScriptedExecutor {
        log: Mutex<Vec<String>>,
        delays_ms: BTreeMap<String, u64>,
        failures: BTreeSet<String>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                delays_ms: BTreeMap::new(),
                failures: BTreeSet::new(),
            }
        }

        fn log_snapshot(&self) -> Vec<String> {
            self.log.lock().unwrap_or_else(|_| unreachable!()).clone()
        }
    }

    impl ToolExecutor for ScriptedExecutor {
        fn execute(&self, request: &ToolCallRequest) -> anyhow::Result<ToolOutcome> {
            let command = request
                .arguments
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            self.log
                .lock()
                .unwrap_or_else(|_| unreachable!())
                .push(format!("start:{command}"));
            if let Some(delay) = self.delays_ms.get(&command) {
                thread::sleep(Duration::from_millis(*delay));
            }
            self.log
                .lock()
                .unwrap_or_else(|_| unreachable!())
                .push(format!("end:{command}"));
            if self.failures.contains(&command) {
                return Err(anyhow!("executor refused {command}"));
            }
            Ok(ToolOutcome {
                success: true,
                exit_code: Some(0),
                stdout: format!("ran {command}"),
                stderr: String::new(),
                payload: Value::Null,
                resources_touched: declared_resources(request),
                duration_ms: 1,
            })
        }
    }

    fn test_ledger() -> SqliteLedger {
        let path = std::env::temp_dir().join(format!("dispatch-{}.sqlite3", ulid::Ulid::new()));
        let ledger = SqliteLedger::open(&path);
        assert!(ledger.is_ok());
        let ledger = ledger.unwrap_or_else(|_| unreachable!());
        assert!(ledger.migrate().is_ok());
        ledger
    }

    fn envelope() -> PhasePlanEnvelope {
        envelope_for_plan(default_bugfix_plan()).unwrap_or_else(|_| unreachable!())
    }

    fn shell_request(command: &str, resource: Option<&str>) -> ToolCallRequest {
        let mut arguments = json!({ "command": command });
        if let Some(resource) = resource {
            arguments["resource"] = json!(resource);
        }
        ToolCallRequest {
            category: ToolCategory::Shell,
            arguments,
            declared_phase: "localize".to_string(),
            timeout_ms: None,
        }
    }

    #[test]
    fn declared_resources_cover_paths_and_shell_default() {
        let edit = ToolCallRequest {
            category: ToolCategory::Edit,
            arguments: json!({ "paths": ["a.rs", "b.rs"] }),
            declared_phase: "fix".to_string(),
            timeout_ms: None,
        };
        assert_eq!(
            declared_resources(&edit),
            vec!["path:a.rs".to_string(), "path:b.rs".to_string()]
        );
        let shell = shell_request("ls", None);
        assert_eq!(declared_resources(&shell), vec!["shell:default".to_string()]);
        let isolated = shell_request("ls", Some("shell:worker-1"));
        assert_eq!(
            declared_resources(&isolated),
            vec!["shell:worker-1".to_string()]
        );
    }

    #[test]
    fn conflict_grouping_merges_transitive_overlaps() {
        let a = ToolCallRequest {
            category: ToolCategory::Edit,
            arguments: json!({ "paths": ["x.rs"] }),
            declared_phase: "fix".to_string(),
            timeout_ms: None,
        };
        let b = ToolCallRequest {
            category: ToolCategory::Edit,
            arguments: json!({ "paths": ["x.rs", "y.rs"] }),
            declared_phase: "fix".to_string(),
            timeout_ms: None,
        };
        let c = ToolCallRequest {
            category: ToolCategory::Edit,
            arguments: json!({ "paths": ["y.rs"] }),
            declared_phase: "fix".to_string(),
            timeout_ms: None,
        };
        let d = ToolCallRequest {
            category: ToolCategory::Read,
            arguments: json!({ "paths": ["z.rs"] }),
            declared_phase: "fix".to_string(),
            timeout_ms: None,
        };
        let slots = [Some(&a), Some(&b), Some(&c), Some(&d)];
        let groups = conflict_groups(&slots);
        assert_eq!(groups.len(), 2);
        assert!(groups.contains(&vec![0, 1, 2]));
        assert!(groups.contains(&vec![3]));
    }

    #[test]
    fn results_preserve_request_order() {
        let ledger = test_ledger();
        let mut executor = ScriptedExecutor::new();
        // The first request is the slowest; order must still hold.
        executor.delays_ms.insert("slow".to_string(), 80);
        let executor = Arc::new(executor);
        let dispatcher = Dispatcher::new(&ledger, executor, DispatcherConfig::default());

        let mut session = Session::start(&ledger, &envelope(), None)
            .unwrap_or_else(|_| unreachable!());
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());

        let requests = vec![
            shell_request("slow", Some("shell:a")),
            shell_request("mid", Some("shell:b")),
            shell_request("fast", Some("shell:c")),
        ];
        let results = session.dispatch(&dispatcher, &turn, &requests);
        assert!(results.is_ok());
        let results = results.unwrap_or_else(|_| unreachable!());
        assert_eq!(results.len(), 3);
        for (slot, (result, command)) in results
            .iter()
            .zip(["slow", "mid", "fast"])
            .enumerate()
        {
            assert_eq!(result.slot, slot);
            let outcome = result.outcome.as_ref();
            assert!(outcome.is_ok());
            assert_eq!(
                outcome.unwrap_or_else(|_| unreachable!()).stdout,
                format!("ran {command}")
            );
        }
    }

    #[test]
    fn same_resource_requests_never_interleave() {
        let ledger = test_ledger();
        let mut executor = ScriptedExecutor::new();
        executor.delays_ms.insert("first".to_string(), 40);
        executor.delays_ms.insert("second".to_string(), 10);
        let executor = Arc::new(executor);
        let dispatcher = Dispatcher::new(
            &ledger,
            Arc::clone(&executor) as Arc<dyn ToolExecutor>,
            DispatcherConfig::default(),
        );

        let mut session = Session::start(&ledger, &envelope(), None)
            .unwrap_or_else(|_| unreachable!());
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());

        // Both implicitly share shell:default.
        let requests = vec![shell_request("first", None), shell_request("second", None)];
        let results = session.dispatch(&dispatcher, &turn, &requests);
        assert!(results.is_ok());

        let log = executor.log_snapshot();
        assert_eq!(
            log,
            vec![
                "start:first".to_string(),
                "end:first".to_string(),
                "start:second".to_string(),
                "end:second".to_string(),
            ]
        );
    }

    #[test]
    fn one_failure_does_not_abort_siblings() {
        let ledger = test_ledger();
        let mut executor = ScriptedExecutor::new();
        executor.failures.insert("broken".to_string());
        let executor = Arc::new(executor);
        let dispatcher = Dispatcher::new(&ledger, executor, DispatcherConfig::default());

        let mut session = Session::start(&ledger, &envelope(), None)
            .unwrap_or_else(|_| unreachable!());
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());

        let requests = vec![
            shell_request("broken", Some("shell:a")),
            shell_request("fine", Some("shell:b")),
        ];
        let results = session.dispatch(&dispatcher, &turn, &requests);
        assert!(results.is_ok());
        let results = results.unwrap_or_else(|_| unreachable!());

        let failure = results[0].outcome.as_ref();
        assert!(failure.is_err());
        let err = failure.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::ToolExecutionFailure(_))
        ));
        assert!(results[1].outcome.is_ok());

        // The failed request's span is closed as error, not left open.
        let rows = ledger
            .query_spans(&SpanFilter {
                lineage_of: Some(session.trace_id()),
                kinds: vec![SpanKind::ToolCall],
                statuses: vec![SpanStatus::Error],
                ..SpanFilter::default()
            })
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn expired_timeout_closes_the_span_as_error() {
        let ledger = test_ledger();
        let mut executor = ScriptedExecutor::new();
        executor.delays_ms.insert("hang".to_string(), 500);
        let executor = Arc::new(executor);
        let dispatcher = Dispatcher::new(&ledger, executor, DispatcherConfig::default());

        let mut session = Session::start(&ledger, &envelope(), None)
            .unwrap_or_else(|_| unreachable!());
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());

        let mut request = shell_request("hang", None);
        request.timeout_ms = Some(30);
        let results = session.dispatch(&dispatcher, &turn, &[request]);
        assert!(results.is_ok());
        let results = results.unwrap_or_else(|_| unreachable!());
        let err = results[0].outcome.as_ref().err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::Timeout { timeout_ms: 30 })
        ));

        let rows = ledger
            .query_spans(&SpanFilter {
                lineage_of: Some(session.trace_id()),
                kinds: vec![SpanKind::ToolCall],
                statuses: vec![SpanStatus::Error],
                ..SpanFilter::default()
            })
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0]
                .span
                .attributes
                .get(attr::ERROR_KIND)
                .and_then(AttrValue::as_text),
            Some("timeout")
        );
    }

    #[test]
    fn panicking_executor_is_a_failure_not_a_timeout() {
        struct PanickingExecutor;

        impl ToolExecutor for PanickingExecutor {
            fn execute(&self, _request: &ToolCallRequest) -> anyhow::Result<ToolOutcome> {
                panic!("executor crashed");
            }
        }

        let ledger = test_ledger();
        let dispatcher = Dispatcher::new(
            &ledger,
            Arc::new(PanickingExecutor),
            DispatcherConfig::default(),
        );

        let mut session = Session::start(&ledger, &envelope(), None)
            .unwrap_or_else(|_| unreachable!());
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());

        let results = session.dispatch(&dispatcher, &turn, &[shell_request("doomed", None)]);
        assert!(results.is_ok());
        let results = results.unwrap_or_else(|_| unreachable!());
        let err = results[0].outcome.as_ref().err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::ToolExecutionFailure(_))
        ));

        let rows = ledger
            .query_spans(&SpanFilter {
                lineage_of: Some(session.trace_id()),
                kinds: vec![SpanKind::ToolCall],
                statuses: vec![SpanStatus::Error],
                ..SpanFilter::default()
            })
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0]
                .span
                .attributes
                .get(attr::ERROR_KIND)
                .and_then(AttrValue::as_text),
            Some("tool_failure")
        );
    }

    #[test]
    fn disallowed_tool_is_rejected_without_opening_a_span() {
        let ledger = test_ledger();
        let executor = Arc::new(ScriptedExecutor::new());
        let dispatcher = Dispatcher::new(&ledger, executor, DispatcherConfig::default());

        let mut session = Session::start(&ledger, &envelope(), None)
            .unwrap_or_else(|_| unreachable!());
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());

        // localize does not allow edit.
        let request = ToolCallRequest {
            category: ToolCategory::Edit,
            arguments: json!({ "paths": ["foo.py"] }),
            declared_phase: "localize".to_string(),
            timeout_ms: None,
        };
        let results = session.dispatch(&dispatcher, &turn, &[request]);
        assert!(results.is_ok());
        let results = results.unwrap_or_else(|_| unreachable!());
        assert!(results[0].span_id.is_none());
        let err = results[0].outcome.as_ref().err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::PhaseViolation { .. })
        ));
        assert_eq!(session.engine().state().calls_used_in("localize"), 0);

        let rows = ledger
            .query_spans(&SpanFilter {
                lineage_of: Some(session.trace_id()),
                kinds: vec![SpanKind::ToolCall],
                ..SpanFilter::default()
            })
            .unwrap_or_else(|_| unreachable!());
        assert!(rows.is_empty());
    }

    #[test]
    fn batch_evidence_lands_in_phase_state() {
        let ledger = test_ledger();
        let executor = Arc::new(ScriptedExecutor::new());
        let dispatcher = Dispatcher::new(&ledger, executor, DispatcherConfig::default());

        let mut session = Session::start(&ledger, &envelope(), None)
            .unwrap_or_else(|_| unreachable!());
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());

        let results = session.dispatch(&dispatcher, &turn, &[shell_request("pytest", None)]);
        assert!(results.is_ok());
        let evidence = &session.engine().state().evidence_records;
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].evidence_type, EvidenceType::CommandSuccess);
        assert_eq!(evidence[0].raw_command.as_deref(), Some("pytest"));
    }

    #[test]
    fn session_completes_only_with_fresh_evidence() {
        let ledger = test_ledger();
        let executor = Arc::new(ScriptedExecutor::new());
        let dispatcher = Dispatcher::new(&ledger, executor, DispatcherConfig::default());

        let mut session = Session::start(&ledger, &envelope(), None)
            .unwrap_or_else(|_| unreachable!());

        let advance = |session: &mut Session<'_>, outputs: &[(&str, Value)]| {
            let outputs: BTreeMap<String, Value> = outputs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect();
            assert!(session.advance(&outputs).is_ok());
        };

        advance(&mut session, &[("suspect_files", json!(["foo.py"]))]);
        advance(&mut session, &[("root_cause", json!("off by one"))]);

        // fix: edit the file so later evidence has to postdate it.
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());
        let edit = ToolCallRequest {
            category: ToolCategory::Edit,
            arguments: json!({ "paths": ["foo.py"] }),
            declared_phase: "fix".to_string(),
            timeout_ms: None,
        };
        assert!(session.dispatch(&dispatcher, &turn, &[edit]).is_ok());
        assert!(session.end_turn(&turn).is_ok());
        advance(&mut session, &[("modified_files", json!(["foo.py"]))]);
        advance(&mut session, &[]);

        // Terminal phase with no test runs recorded: completion must fail.
        let premature = session.complete();
        assert!(premature.is_err());
        let err = premature.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::NoMatchingEvidence(_))
        ));

        // Run both suites, then completion goes through.
        let turn = session.begin_turn().unwrap_or_else(|_| unreachable!());
        let mut target = shell_request("pytest -k fail_to_pass", Some("shell:a"));
        target.declared_phase = "verify_target_fix".to_string();
        let mut baseline = shell_request("pytest -k pass_to_pass", Some("shell:b"));
        baseline.declared_phase = "verify_target_fix".to_string();
        assert!(session
            .dispatch(&dispatcher, &turn, &[target, baseline])
            .is_ok());
        assert!(session.end_turn(&turn).is_ok());

        let done = session.complete();
        assert!(done.is_ok());
        assert!(session.engine().state().archived);
    }
}
