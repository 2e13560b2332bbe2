use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use agent_ledger_core::{Ledger, SpanContext, SpanHandle};
use agent_ledger_domain::{
    attr, AttrMap, AttrValue, CheckpointRecord, EdgeRelation, EntityRef, PhaseState,
    ProvenanceEdge, SpanKind, SpanStatus, TraceId,
};
use agent_ledger_sqlite::SqliteLedger;
use ulid::Ulid;

fn temp_path(name: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ledger-cli-test-{}-{}.{}", name, Ulid::new(), ext))
}

fn seeded_ledger(db: &PathBuf) -> (SqliteLedger, TraceId, SpanHandle) {
    let ledger = SqliteLedger::open(db);
    assert!(ledger.is_ok());
    let ledger = ledger.unwrap_or_else(|_| unreachable!());
    assert!(ledger.migrate().is_ok());
    let trace = ledger.create_trace(Some("cli-test"));
    assert!(trace.is_ok());
    let trace_id = trace.unwrap_or_else(|_| unreachable!()).trace_id;
    let root = ledger.open_root_span(trace_id, SpanKind::Turn, &AttrMap::new());
    assert!(root.is_ok());
    (ledger, trace_id, root.unwrap_or_else(|_| unreachable!()))
}

fn record_edit(ledger: &SqliteLedger, root: &SpanHandle, path: &str) {
    let mut attrs = AttrMap::new();
    attrs.insert(
        attr::TOOL_CATEGORY.to_string(),
        AttrValue::Text("edit".to_string()),
    );
    attrs.insert(
        attr::TOOL_PATHS.to_string(),
        AttrValue::Text(path.to_string()),
    );
    let span = ledger.open_span(&root.fork_context(), SpanKind::ToolCall, &attrs);
    assert!(span.is_ok());
    let span = span.unwrap_or_else(|_| unreachable!());
    assert!(ledger
        .close_span(&span, SpanStatus::Ok, &AttrMap::new())
        .is_ok());
}

fn record_passing_shell(ledger: &SqliteLedger, root: &SpanHandle, command: &str) {
    let mut attrs = AttrMap::new();
    attrs.insert(
        attr::TOOL_CATEGORY.to_string(),
        AttrValue::Text("shell".to_string()),
    );
    attrs.insert(
        attr::TOOL_COMMAND.to_string(),
        AttrValue::Text(command.to_string()),
    );
    let span = ledger.open_span(&root.fork_context(), SpanKind::ToolCall, &attrs);
    assert!(span.is_ok());
    let span = span.unwrap_or_else(|_| unreachable!());
    let mut results = AttrMap::new();
    results.insert(attr::TOOL_EXIT_CODE.to_string(), AttrValue::Int(0));
    assert!(ledger.close_span(&span, SpanStatus::Ok, &results).is_ok());
}

fn minimal_phase_state(phase: &str) -> PhaseState {
    PhaseState {
        plan_hash: "cli-test-plan".to_string(),
        current_phase: phase.to_string(),
        calls_used: BTreeMap::new(),
        budget_ceilings: BTreeMap::new(),
        required_outputs: BTreeMap::new(),
        recorded_outputs: BTreeMap::new(),
        evidence_records: Vec::new(),
        back_edges_taken: BTreeMap::new(),
        archived: false,
    }
}

fn checkpoint(ledger: &SqliteLedger, trace_id: TraceId) -> CheckpointRecord {
    let record = ledger.checkpoint(trace_id, &minimal_phase_state("fix"));
    assert!(record.is_ok());
    record.unwrap_or_else(|_| unreachable!())
}

fn extract_token(stdout: &str, prefix: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .find_map(|token| token.strip_prefix(prefix).map(ToString::to_string))
}

fn run_cli(args: &[&str]) -> std::process::Output {
    let output = Command::new(env!("CARGO_BIN_EXE_agent-ledger-cli"))
        .args(args)
        .output();
    assert!(output.is_ok());
    output.unwrap_or_else(|_| unreachable!())
}

#[test]
fn replay_streams_json_lines_and_validates_the_chain() {
    let db = temp_path("replay", "sqlite3");
    let (ledger, trace_id, root) = seeded_ledger(&db);
    record_edit(&ledger, &root, "foo.py");
    record_passing_shell(&ledger, &root, "pytest -k fail_to_pass");
    assert!(ledger
        .close_span(&root, SpanStatus::Ok, &AttrMap::new())
        .is_ok());

    let db_str = db.display().to_string();
    let trace = trace_id.to_string();
    let output = run_cli(&["replay", "--db", &db_str, "--trace-id", &trace]);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(stdout.contains("chain_valid=true"));
    assert!(stdout.contains("interrupted=0"));

    let json_lines: Vec<&str> = stdout
        .lines()
        .filter(|line| line.starts_with('{'))
        .collect();
    // root + edit + shell spans; no edges were recorded.
    assert_eq!(json_lines.len(), 3);
    for line in json_lines {
        assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
    }
}

#[test]
fn replay_reports_interrupted_spans() {
    let db = temp_path("replay-interrupted", "sqlite3");
    let (ledger, trace_id, root) = seeded_ledger(&db);
    // Open and never close: a simulated crash mid-call.
    let span = ledger.open_span(&root.fork_context(), SpanKind::ToolCall, &AttrMap::new());
    assert!(span.is_ok());

    let db_str = db.display().to_string();
    let trace = trace_id.to_string();
    let output = run_cli(&["replay", "--db", &db_str, "--trace-id", &trace]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    // The root span is also still open.
    assert!(stdout.contains("interrupted=2"));
}

#[test]
fn replay_validates_parent_links_across_a_fork() {
    let db = temp_path("replay-fork", "sqlite3");
    let (ledger, trace_id, root) = seeded_ledger(&db);
    record_edit(&ledger, &root, "foo.py");
    let checkpoint = checkpoint(&ledger, trace_id);
    let child = ledger.fork(checkpoint.checkpoint_id);
    assert!(child.is_ok());
    let child = child.unwrap_or_else(|_| unreachable!());

    // A child span whose parent lives in the shared history.
    let span = ledger.open_span(
        &SpanContext {
            trace_id: child.trace_id,
            span_id: root.context.span_id,
        },
        SpanKind::ToolCall,
        &AttrMap::new(),
    );
    assert!(span.is_ok());
    let span = span.unwrap_or_else(|_| unreachable!());
    assert!(ledger
        .close_span(&span, SpanStatus::Ok, &AttrMap::new())
        .is_ok());

    let db_str = db.display().to_string();
    let trace = child.trace_id.to_string();
    let output = run_cli(&["replay", "--db", &db_str, "--trace-id", &trace]);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    // Shared history (root + edit) plus the child's own span, all linked.
    assert!(stdout.contains("spans=3"));
    assert!(stdout.contains("chain_valid=true"));
}

#[test]
fn fork_creates_a_child_trace_sharing_history() {
    let db = temp_path("fork", "sqlite3");
    let (ledger, trace_id, root) = seeded_ledger(&db);
    record_edit(&ledger, &root, "foo.py");
    let checkpoint = checkpoint(&ledger, trace_id);

    let db_str = db.display().to_string();
    let output = run_cli(&[
        "fork",
        "--db",
        &db_str,
        "--checkpoint-id",
        &checkpoint.checkpoint_id.to_string(),
    ]);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let forked = extract_token(&stdout, "forked_trace_id=");
    assert!(forked.is_some());
    let forked = forked.unwrap_or_else(|| unreachable!());
    let forked_id = Ulid::from_string(&forked);
    assert!(forked_id.is_ok());

    let child = ledger.get_trace(TraceId(forked_id.unwrap_or_else(|_| unreachable!())));
    assert!(child.is_ok());
    let child = child.unwrap_or_else(|_| unreachable!());
    assert!(child.is_some());
    assert_eq!(
        child.unwrap_or_else(|| unreachable!()).parent_trace_id,
        Some(trace_id)
    );
}

#[test]
fn resume_surfaces_and_optionally_closes_interrupted_spans() {
    let db = temp_path("resume", "sqlite3");
    let (ledger, trace_id, root) = seeded_ledger(&db);
    let checkpoint = checkpoint(&ledger, trace_id);
    // Interrupted after the checkpoint: opened, never closed.
    let span = ledger.open_span(&root.fork_context(), SpanKind::ToolCall, &AttrMap::new());
    assert!(span.is_ok());
    let span = span.unwrap_or_else(|_| unreachable!());

    let db_str = db.display().to_string();
    let checkpoint_str = checkpoint.checkpoint_id.to_string();
    let output = run_cli(&["resume", "--db", &db_str, "--checkpoint-id", &checkpoint_str]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(stdout.contains("interrupted=1"));

    let marked = run_cli(&[
        "resume",
        "--db",
        &db_str,
        "--checkpoint-id",
        &checkpoint_str,
        "--mark-interrupted",
    ]);
    assert!(marked.status.success());

    let open = ledger.open_spans(trace_id);
    assert!(open.is_ok());
    let open = open.unwrap_or_else(|_| unreachable!());
    assert!(open.iter().all(|row| row.span.span_id != span.context.span_id));
}

#[test]
fn gc_removes_only_unreferenced_artifacts() {
    let db = temp_path("gc", "sqlite3");
    let (ledger, trace_id, root) = seeded_ledger(&db);

    let kept = ledger.add_artifact(b"kept output");
    assert!(kept.is_ok());
    let kept = kept.unwrap_or_else(|_| unreachable!());
    assert!(ledger
        .add_edge(
            trace_id,
            &ProvenanceEdge {
                relation: EdgeRelation::WasGeneratedBy,
                from: EntityRef::Artifact(kept.clone()),
                to: EntityRef::Span(root.context.span_id),
            },
        )
        .is_ok());
    let dropped = ledger.add_artifact(b"orphaned output");
    assert!(dropped.is_ok());
    let dropped = dropped.unwrap_or_else(|_| unreachable!());

    let db_str = db.display().to_string();
    let output = run_cli(&["gc", "--db", &db_str]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(stdout.contains("artifacts_removed=1"));

    let kept_bytes = ledger.get_artifact(&kept);
    assert!(kept_bytes.is_ok());
    assert!(kept_bytes.unwrap_or_else(|_| unreachable!()).is_some());
    let dropped_bytes = ledger.get_artifact(&dropped);
    assert!(dropped_bytes.is_ok());
    assert!(dropped_bytes.unwrap_or_else(|_| unreachable!()).is_none());
}

#[test]
fn verify_rejects_unbacked_claims_with_a_stable_exit_code() {
    let db = temp_path("verify-reject", "sqlite3");
    let (ledger, trace_id, root) = seeded_ledger(&db);
    record_edit(&ledger, &root, "foo.py");

    let db_str = db.display().to_string();
    let trace = trace_id.to_string();
    let output = run_cli(&[
        "verify",
        "--db",
        &db_str,
        "--trace-id",
        &trace,
        "--pattern",
        "fail_to_pass",
    ]);
    assert_eq!(output.status.code(), Some(4));
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(stdout.contains("no_matching_evidence"));
    assert!(stdout.contains("fail_to_pass"));
}

#[test]
fn verify_accepts_claims_backed_by_fresh_evidence() {
    let db = temp_path("verify-accept", "sqlite3");
    let (ledger, trace_id, root) = seeded_ledger(&db);
    record_edit(&ledger, &root, "foo.py");
    record_passing_shell(&ledger, &root, "pytest -k fail_to_pass");

    let db_str = db.display().to_string();
    let trace = trace_id.to_string();
    let output = run_cli(&[
        "verify",
        "--db",
        &db_str,
        "--trace-id",
        &trace,
        "--pattern",
        "fail_to_pass",
    ]);
    assert!(
        output.status.success(),
        "stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(stdout.contains("accepted=true"));
}

#[test]
fn export_writes_json_lines_to_a_file() {
    let db = temp_path("export", "sqlite3");
    let out = temp_path("export-out", "jsonl");
    let (ledger, trace_id, root) = seeded_ledger(&db);
    record_passing_shell(&ledger, &root, "cargo test");

    let db_str = db.display().to_string();
    let trace = trace_id.to_string();
    let out_str = out.display().to_string();
    let output = run_cli(&[
        "export",
        "--db",
        &db_str,
        "--trace-id",
        &trace,
        "--out",
        &out_str,
    ]);
    assert!(output.status.success());

    let body = std::fs::read_to_string(&out);
    assert!(body.is_ok());
    let body = body.unwrap_or_else(|_| unreachable!());
    // root span + shell span.
    assert_eq!(body.lines().count(), 2);
    for line in body.lines() {
        assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
    }
}

#[test]
fn trace_runs_lists_created_traces() {
    let db = temp_path("trace-runs", "sqlite3");
    let (_ledger, trace_id, _root) = seeded_ledger(&db);

    let db_str = db.display().to_string();
    let output = run_cli(&["trace", "runs", "--db", &db_str]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(stdout.contains(&trace_id.to_string()));
    assert!(stdout.contains("cli-test"));
}
