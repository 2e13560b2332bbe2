#![forbid(unsafe_code)]

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use agent_ledger_core::{
    GcReport, Ledger, LineageSlice, ResumeState, SpanContext, SpanFilter, SpanHandle,
};
use agent_ledger_domain::{
    attr, format_rfc3339, now_utc, parse_rfc3339, ArtifactId, AttrMap, AttrValue, CheckpointId,
    CheckpointRecord, CoreError, EdgeRelation, EdgeRow, EntityRef, PhaseState, ProvenanceEdge,
    SpanId, SpanKind, SpanRecord, SpanRow, SpanStatus, TraceId, TraceRecord,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

const LEDGER_SCHEMA_VERSION: i64 = 2;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS traces (
  trace_id TEXT PRIMARY KEY,
  parent_trace_id TEXT,
  forked_at_seq INTEGER,
  created_at TEXT NOT NULL,
  FOREIGN KEY (parent_trace_id) REFERENCES traces(trace_id)
);

CREATE TABLE IF NOT EXISTS spans (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  span_id TEXT NOT NULL UNIQUE,
  trace_id TEXT NOT NULL,
  parent_span_id TEXT,
  kind TEXT NOT NULL CHECK (kind IN (
    'turn','model_call','tool_call','reasoning','browser_session','memory_op'
  )),
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('open','ok','error')),
  attributes_json TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id),
  FOREIGN KEY (parent_span_id) REFERENCES spans(span_id)
);

CREATE TABLE IF NOT EXISTS provenance_edges (
  edge_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  trace_id TEXT NOT NULL,
  relation TEXT NOT NULL CHECK (relation IN ('used','was_generated_by','was_derived_from')),
  from_kind TEXT NOT NULL CHECK (from_kind IN ('span','artifact')),
  from_id TEXT NOT NULL,
  to_kind TEXT NOT NULL CHECK (to_kind IN ('span','artifact')),
  to_id TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE TABLE IF NOT EXISTS artifacts (
  artifact_id TEXT PRIMARY KEY,
  byte_len INTEGER NOT NULL,
  bytes BLOB NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
  checkpoint_id TEXT PRIMARY KEY,
  trace_id TEXT NOT NULL,
  last_span_seq INTEGER NOT NULL,
  phase_state_json TEXT NOT NULL,
  open_span_ids_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE INDEX IF NOT EXISTS idx_spans_trace_seq ON spans(trace_id, seq);
CREATE INDEX IF NOT EXISTS idx_spans_trace_status ON spans(trace_id, status);
CREATE INDEX IF NOT EXISTS idx_spans_parent ON spans(parent_span_id);
CREATE INDEX IF NOT EXISTS idx_edges_trace_seq ON provenance_edges(trace_id, edge_seq);
CREATE INDEX IF NOT EXISTS idx_edges_from ON provenance_edges(from_kind, from_id);
CREATE INDEX IF NOT EXISTS idx_edges_to ON provenance_edges(to_kind, to_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_trace ON checkpoints(trace_id, created_at);

CREATE TRIGGER IF NOT EXISTS trg_spans_no_delete
BEFORE DELETE ON spans
BEGIN
  SELECT RAISE(FAIL, 'spans are append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_spans_closed_immutable
BEFORE UPDATE ON spans
WHEN OLD.status <> 'open'
BEGIN
  SELECT RAISE(FAIL, 'closed spans are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_spans_identity_frozen
BEFORE UPDATE OF seq, span_id, trace_id, parent_span_id, kind, started_at ON spans
BEGIN
  SELECT RAISE(FAIL, 'span identity fields are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_edges_no_update
BEFORE UPDATE ON provenance_edges
BEGIN
  SELECT RAISE(FAIL, 'provenance_edges is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_edges_no_delete
BEFORE DELETE ON provenance_edges
BEGIN
  SELECT RAISE(FAIL, 'provenance_edges is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_artifacts_no_update
BEFORE UPDATE ON artifacts
BEGIN
  SELECT RAISE(FAIL, 'artifacts are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_checkpoints_no_update
BEFORE UPDATE ON checkpoints
BEGIN
  SELECT RAISE(FAIL, 'checkpoints are append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_checkpoints_no_delete
BEFORE DELETE ON checkpoints
BEGIN
  SELECT RAISE(FAIL, 'checkpoints are append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_traces_no_delete
BEFORE DELETE ON traces
BEGIN
  SELECT RAISE(FAIL, 'traces are append-only');
END;
";

/// Durable ledger backed by one SQLite database. The connection sits behind a
/// mutex: the append path is single-writer while dispatcher workers call in
/// concurrently; `seq` assignment by SQLite resolves write interleaving.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create a ledger database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("ledger connection mutex poisoned"))
    }

    #[cfg(test)]
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|_| unreachable!("mutex poisoned in test"));
        f(&guard)
    }
}

fn lineage_of(conn: &Connection, trace_id: TraceId) -> Result<Vec<LineageSlice>> {
    let mut chain = Vec::new();
    let mut current = trace_id;
    let mut bound: Option<i64> = None;
    let mut seen = BTreeSet::new();

    loop {
        if !seen.insert(current) {
            return Err(CoreError::LedgerCorruption(format!(
                "trace ancestry cycle at {current}"
            ))
            .into());
        }
        let row: Option<(Option<String>, Option<i64>)> = conn
            .query_row(
                "SELECT parent_trace_id, forked_at_seq FROM traces WHERE trace_id = ?1",
                params![current.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((parent_raw, forked_at_seq)) = row else {
            return Err(anyhow!("unknown trace: {current}"));
        };

        chain.push(LineageSlice {
            trace_id: current,
            up_to_seq: bound,
        });

        match parent_raw {
            Some(parent_raw) => {
                current = parse_trace_id(&parent_raw)?;
                bound = forked_at_seq;
            }
            None => break,
        }
    }

    chain.reverse();
    Ok(chain)
}

fn span_exists_in_lineage(
    conn: &Connection,
    lineage: &[LineageSlice],
    span_id: SpanId,
) -> Result<bool> {
    let row: Option<(String, i64, String)> = conn
        .query_row(
            "SELECT trace_id, seq, status FROM spans WHERE span_id = ?1",
            params![span_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((trace_raw, seq, _status)) = row else {
        return Ok(false);
    };
    let span_trace = parse_trace_id(&trace_raw)?;
    Ok(lineage.iter().any(|slice| {
        slice.trace_id == span_trace && slice.up_to_seq.map_or(true, |bound| seq <= bound)
    }))
}

fn insert_span(
    conn: &Connection,
    trace_id: TraceId,
    parent_span_id: Option<SpanId>,
    kind: SpanKind,
    attributes: &AttrMap,
) -> Result<SpanHandle> {
    let span_id = SpanId::new();
    let started_at = now_utc();
    conn.execute(
        "INSERT INTO spans(
            span_id, trace_id, parent_span_id, kind,
            started_at, ended_at, status, attributes_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'open', ?6)",
        params![
            span_id.to_string(),
            trace_id.to_string(),
            parent_span_id.map(|id| id.to_string()),
            kind_to_str(kind),
            format_rfc3339(started_at)?,
            serde_json::to_string(attributes)?,
        ],
    )
    .context("failed to insert span")?;

    Ok(SpanHandle {
        context: SpanContext { trace_id, span_id },
        seq: conn.last_insert_rowid(),
    })
}

fn load_span_row(conn: &Connection, span_id: SpanId) -> Result<Option<SpanRow>> {
    let mut stmt = conn.prepare(
        "SELECT seq, span_id, trace_id, parent_span_id, kind,
                started_at, ended_at, status, attributes_json
         FROM spans WHERE span_id = ?1",
    )?;
    let mut rows = stmt.query(params![span_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_span(row)?)),
        None => Ok(None),
    }
}

fn row_to_span(row: &rusqlite::Row<'_>) -> Result<SpanRow> {
    let span_id_raw: String = row.get(1)?;
    let trace_raw: String = row.get(2)?;
    let parent_raw: Option<String> = row.get(3)?;
    let attributes_json: String = row.get(8)?;
    Ok(SpanRow {
        seq: row.get(0)?,
        span: SpanRecord {
            span_id: parse_span_id(&span_id_raw)?,
            trace_id: parse_trace_id(&trace_raw)?,
            parent_span_id: parent_raw.map(|value| parse_span_id(&value)).transpose()?,
            kind: parse_kind(&row.get::<_, String>(4)?)?,
            started_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            ended_at: row
                .get::<_, Option<String>>(6)?
                .map(|value| parse_rfc3339(&value))
                .transpose()?,
            status: parse_status(&row.get::<_, String>(7)?)?,
            attributes: serde_json::from_str(&attributes_json)
                .context("invalid span attributes_json")?,
        },
    })
}

fn entity_parts(entity: &EntityRef) -> (&'static str, String) {
    match entity {
        EntityRef::Span(id) => ("span", id.to_string()),
        EntityRef::Artifact(id) => ("artifact", id.to_string()),
    }
}

fn entity_exists(conn: &Connection, entity: &EntityRef) -> Result<bool> {
    let count: i64 = match entity {
        EntityRef::Span(id) => conn.query_row(
            "SELECT COUNT(*) FROM spans WHERE span_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?,
        EntityRef::Artifact(id) => conn.query_row(
            "SELECT COUNT(*) FROM artifacts WHERE artifact_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?,
    };
    Ok(count > 0)
}

/// Reachability check from `to` back to `from` over the already-committed
/// edge set. A hit means the new edge would close a cycle.
fn would_create_cycle(conn: &Connection, from: &EntityRef, to: &EntityRef) -> Result<bool> {
    if from == to {
        return Ok(true);
    }
    let (from_kind, from_id) = entity_parts(from);
    let mut stmt = conn.prepare(
        "SELECT to_kind, to_id FROM provenance_edges WHERE from_kind = ?1 AND from_id = ?2",
    )?;

    let mut queue: VecDeque<(String, String)> = VecDeque::new();
    let mut visited: BTreeSet<(String, String)> = BTreeSet::new();
    let (to_kind, to_id) = entity_parts(to);
    queue.push_back((to_kind.to_string(), to_id));

    while let Some((kind, id)) = queue.pop_front() {
        if kind == from_kind && id == from_id {
            return Ok(true);
        }
        if !visited.insert((kind.clone(), id.clone())) {
            continue;
        }
        let mut rows = stmt.query(params![kind, id])?;
        while let Some(row) = rows.next()? {
            let next_kind: String = row.get(0)?;
            let next_id: String = row.get(1)?;
            queue.push_back((next_kind, next_id));
        }
    }
    Ok(false)
}

impl Ledger for SqliteLedger {
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply ledger schema")?;

        ensure_column(&conn, "traces", "label", "TEXT")?;

        let now = format_rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![LEDGER_SCHEMA_VERSION, now],
        )
        .context("failed to record ledger migration")?;
        Ok(())
    }

    fn create_trace(&self, label: Option<&str>) -> Result<TraceRecord> {
        let conn = self.lock()?;
        let record = TraceRecord {
            trace_id: TraceId::new(),
            parent_trace_id: None,
            forked_at_seq: None,
            created_at: now_utc(),
            label: label.map(ToString::to_string),
        };
        conn.execute(
            "INSERT INTO traces(trace_id, parent_trace_id, forked_at_seq, created_at, label)
             VALUES (?1, NULL, NULL, ?2, ?3)",
            params![
                record.trace_id.to_string(),
                format_rfc3339(record.created_at)?,
                record.label,
            ],
        )
        .context("failed to insert trace")?;
        Ok(record)
    }

    fn get_trace(&self, trace_id: TraceId) -> Result<Option<TraceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT trace_id, parent_trace_id, forked_at_seq, created_at, label
             FROM traces WHERE trace_id = ?1",
        )?;
        let mut rows = stmt.query(params![trace_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_trace(row)?)),
            None => Ok(None),
        }
    }

    fn list_traces(&self) -> Result<Vec<TraceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT trace_id, parent_trace_id, forked_at_seq, created_at, label
             FROM traces ORDER BY created_at ASC, trace_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_trace(row)?);
        }
        Ok(out)
    }

    fn lineage(&self, trace_id: TraceId) -> Result<Vec<LineageSlice>> {
        let conn = self.lock()?;
        lineage_of(&conn, trace_id)
    }

    fn open_root_span(
        &self,
        trace_id: TraceId,
        kind: SpanKind,
        attributes: &AttrMap,
    ) -> Result<SpanHandle> {
        let conn = self.lock()?;
        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM spans WHERE trace_id = ?1 AND parent_span_id IS NULL",
            params![trace_id.to_string()],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(CoreError::Validation(format!(
                "trace {trace_id} already has a root span"
            ))
            .into());
        }
        insert_span(&conn, trace_id, None, kind, attributes)
    }

    fn open_span(
        &self,
        parent: &SpanContext,
        kind: SpanKind,
        attributes: &AttrMap,
    ) -> Result<SpanHandle> {
        let conn = self.lock()?;
        let lineage = lineage_of(&conn, parent.trace_id)?;
        if !span_exists_in_lineage(&conn, &lineage, parent.span_id)? {
            return Err(CoreError::Validation(format!(
                "parent span {} is not visible from trace {}",
                parent.span_id, parent.trace_id
            ))
            .into());
        }
        insert_span(&conn, parent.trace_id, Some(parent.span_id), kind, attributes)
    }

    fn close_span(
        &self,
        handle: &SpanHandle,
        status: SpanStatus,
        result_attributes: &AttrMap,
    ) -> Result<()> {
        if status == SpanStatus::Open {
            return Err(
                CoreError::Validation("close_span requires a terminal status".to_string()).into(),
            );
        }
        let conn = self.lock()?;
        let Some(existing) = load_span_row(&conn, handle.context.span_id)? else {
            return Err(CoreError::Validation(format!(
                "unknown span: {}",
                handle.context.span_id
            ))
            .into());
        };
        if existing.span.trace_id != handle.context.trace_id {
            return Err(CoreError::Validation(format!(
                "span {} belongs to trace {}, not {}",
                handle.context.span_id, existing.span.trace_id, handle.context.trace_id
            ))
            .into());
        }
        if existing.span.status != SpanStatus::Open {
            return Err(CoreError::Validation(format!(
                "span {} is already closed",
                handle.context.span_id
            ))
            .into());
        }

        let mut attributes = existing.span.attributes;
        for (key, value) in result_attributes {
            attributes.insert(key.clone(), value.clone());
        }

        conn.execute(
            "UPDATE spans SET ended_at = ?2, status = ?3, attributes_json = ?4
             WHERE span_id = ?1 AND status = 'open'",
            params![
                handle.context.span_id.to_string(),
                format_rfc3339(now_utc())?,
                status_to_str(status),
                serde_json::to_string(&attributes)?,
            ],
        )
        .context("failed to close span")?;
        Ok(())
    }

    fn mark_interrupted(&self, trace_id: TraceId, span_id: SpanId) -> Result<()> {
        let conn = self.lock()?;
        let Some(existing) = load_span_row(&conn, span_id)? else {
            return Err(CoreError::Validation(format!("unknown span: {span_id}")).into());
        };
        if existing.span.trace_id != trace_id {
            return Err(CoreError::Validation(format!(
                "span {span_id} belongs to trace {}, not {trace_id}",
                existing.span.trace_id
            ))
            .into());
        }
        if existing.span.status != SpanStatus::Open {
            return Err(
                CoreError::Validation(format!("span {span_id} is not open")).into(),
            );
        }
        let mut attributes = existing.span.attributes;
        attributes.insert(
            attr::ERROR_KIND.to_string(),
            AttrValue::Text("interrupted".to_string()),
        );
        conn.execute(
            "UPDATE spans SET ended_at = ?2, status = 'error', attributes_json = ?3
             WHERE span_id = ?1 AND status = 'open'",
            params![
                span_id.to_string(),
                format_rfc3339(now_utc())?,
                serde_json::to_string(&attributes)?,
            ],
        )
        .context("failed to mark span interrupted")?;
        Ok(())
    }

    fn add_artifact(&self, bytes: &[u8]) -> Result<ArtifactId> {
        let conn = self.lock()?;
        let artifact_id = ArtifactId::from_bytes(bytes);
        conn.execute(
            "INSERT OR IGNORE INTO artifacts(artifact_id, byte_len, bytes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                artifact_id.to_string(),
                i64::try_from(bytes.len()).map_err(|_| anyhow!("artifact too large"))?,
                bytes,
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to insert artifact")?;
        Ok(artifact_id)
    }

    fn get_artifact(&self, artifact_id: &ArtifactId) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT bytes FROM artifacts WHERE artifact_id = ?1",
            params![artifact_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read artifact")
    }

    fn add_edge(&self, trace_id: TraceId, edge: &ProvenanceEdge) -> Result<i64> {
        let conn = self.lock()?;
        for entity in [&edge.from, &edge.to] {
            if !entity_exists(&conn, entity)? {
                return Err(
                    CoreError::Validation(format!("unknown edge endpoint: {entity}")).into(),
                );
            }
        }
        if would_create_cycle(&conn, &edge.from, &edge.to)? {
            return Err(CoreError::CycleRejected {
                from: edge.from.to_string(),
                to: edge.to.to_string(),
            }
            .into());
        }

        let (from_kind, from_id) = entity_parts(&edge.from);
        let (to_kind, to_id) = entity_parts(&edge.to);
        conn.execute(
            "INSERT INTO provenance_edges(
                trace_id, relation, from_kind, from_id, to_kind, to_id, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                trace_id.to_string(),
                relation_to_str(edge.relation),
                from_kind,
                from_id,
                to_kind,
                to_id,
                format_rfc3339(now_utc())?,
            ],
        )
        .context("failed to append provenance edge")?;
        Ok(conn.last_insert_rowid())
    }

    fn query_spans(&self, filter: &SpanFilter) -> Result<Vec<SpanRow>> {
        let conn = self.lock()?;
        let slices = match filter.lineage_of {
            Some(trace_id) => Some(lineage_of(&conn, trace_id)?),
            None => None,
        };

        let mut stmt = conn.prepare(
            "SELECT seq, span_id, trace_id, parent_span_id, kind,
                    started_at, ended_at, status, attributes_json
             FROM spans ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let span_row = row_to_span(row)?;
            if let Some(slices) = &slices {
                let visible = slices.iter().any(|slice| {
                    slice.trace_id == span_row.span.trace_id
                        && slice.up_to_seq.map_or(true, |bound| span_row.seq <= bound)
                });
                if !visible {
                    continue;
                }
            }
            if !filter.kinds.is_empty() && !filter.kinds.contains(&span_row.span.kind) {
                continue;
            }
            if !filter.statuses.is_empty() && !filter.statuses.contains(&span_row.span.status) {
                continue;
            }
            if let Some(after) = filter.started_after {
                if span_row.span.started_at <= after {
                    continue;
                }
            }
            if let Some(before) = filter.started_before {
                if span_row.span.started_at >= before {
                    continue;
                }
            }
            if let Some(seq_after) = filter.seq_after {
                if span_row.seq <= seq_after {
                    continue;
                }
            }
            let attrs_match = filter.attr_text_equals.iter().all(|(key, expected)| {
                span_row
                    .span
                    .attributes
                    .get(key)
                    .and_then(AttrValue::as_text)
                    == Some(expected.as_str())
            });
            if !attrs_match {
                continue;
            }
            out.push(span_row);
        }
        Ok(out)
    }

    fn query_edges(&self, trace_id: TraceId) -> Result<Vec<EdgeRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT edge_seq, trace_id, relation, from_kind, from_id, to_kind, to_id, recorded_at
             FROM provenance_edges WHERE trace_id = ?1 ORDER BY edge_seq ASC",
        )?;
        let mut rows = stmt.query(params![trace_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let trace_raw: String = row.get(1)?;
            out.push(EdgeRow {
                edge_seq: row.get(0)?,
                trace_id: parse_trace_id(&trace_raw)?,
                recorded_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
                edge: ProvenanceEdge {
                    relation: parse_relation(&row.get::<_, String>(2)?)?,
                    from: parse_entity(&row.get::<_, String>(3)?, &row.get::<_, String>(4)?)?,
                    to: parse_entity(&row.get::<_, String>(5)?, &row.get::<_, String>(6)?)?,
                },
            });
        }
        Ok(out)
    }

    fn open_spans(&self, trace_id: TraceId) -> Result<Vec<SpanRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, span_id, trace_id, parent_span_id, kind,
                    started_at, ended_at, status, attributes_json
             FROM spans WHERE trace_id = ?1 AND status = 'open' ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![trace_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_span(row)?);
        }
        Ok(out)
    }

    fn checkpoint(&self, trace_id: TraceId, phase_state: &PhaseState) -> Result<CheckpointRecord> {
        let conn = self.lock()?;
        let last_span_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM spans WHERE trace_id = ?1",
            params![trace_id.to_string()],
            |row| row.get(0),
        )?;
        let mut open_stmt = conn.prepare(
            "SELECT span_id FROM spans WHERE trace_id = ?1 AND status = 'open' ORDER BY seq ASC",
        )?;
        let mut rows = open_stmt.query(params![trace_id.to_string()])?;
        let mut open_span_ids = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            open_span_ids.push(parse_span_id(&raw)?);
        }

        let record = CheckpointRecord {
            checkpoint_id: CheckpointId::new(),
            trace_id,
            last_span_seq,
            phase_state: phase_state.clone(),
            open_span_ids,
            created_at: now_utc(),
        };
        conn.execute(
            "INSERT INTO checkpoints(
                checkpoint_id, trace_id, last_span_seq,
                phase_state_json, open_span_ids_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.checkpoint_id.to_string(),
                record.trace_id.to_string(),
                record.last_span_seq,
                serde_json::to_string(&record.phase_state)?,
                serde_json::to_string(&record.open_span_ids)?,
                format_rfc3339(record.created_at)?,
            ],
        )
        .context("failed to insert checkpoint")?;
        Ok(record)
    }

    fn get_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Option<CheckpointRecord>> {
        let conn = self.lock()?;
        load_checkpoint(&conn, checkpoint_id)
    }

    fn resume(&self, checkpoint_id: CheckpointId) -> Result<ResumeState> {
        let conn = self.lock()?;
        let Some(checkpoint) = load_checkpoint(&conn, checkpoint_id)? else {
            return Err(
                CoreError::Validation(format!("unknown checkpoint: {checkpoint_id}")).into(),
            );
        };

        let mut stmt = conn.prepare(
            "SELECT seq, span_id, trace_id, parent_span_id, kind,
                    started_at, ended_at, status, attributes_json
             FROM spans WHERE trace_id = ?1 AND status = 'open' ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![checkpoint.trace_id.to_string()])?;
        let mut expected_open = Vec::new();
        let mut interrupted = Vec::new();
        while let Some(row) = rows.next()? {
            let span_row = row_to_span(row)?;
            if span_row.seq <= checkpoint.last_span_seq {
                if checkpoint.open_span_ids.contains(&span_row.span.span_id) {
                    expected_open.push(span_row);
                } else {
                    return Err(CoreError::LedgerCorruption(format!(
                        "span {} is open but absent from checkpoint {}",
                        span_row.span.span_id, checkpoint.checkpoint_id
                    ))
                    .into());
                }
            } else {
                interrupted.push(span_row);
            }
        }

        Ok(ResumeState {
            checkpoint,
            expected_open,
            interrupted,
        })
    }

    fn fork(&self, checkpoint_id: CheckpointId) -> Result<TraceRecord> {
        let conn = self.lock()?;
        let Some(checkpoint) = load_checkpoint(&conn, checkpoint_id)? else {
            return Err(
                CoreError::Validation(format!("unknown checkpoint: {checkpoint_id}")).into(),
            );
        };

        let record = TraceRecord {
            trace_id: TraceId::new(),
            parent_trace_id: Some(checkpoint.trace_id),
            forked_at_seq: Some(checkpoint.last_span_seq),
            created_at: now_utc(),
            label: None,
        };
        conn.execute(
            "INSERT INTO traces(trace_id, parent_trace_id, forked_at_seq, created_at, label)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![
                record.trace_id.to_string(),
                checkpoint.trace_id.to_string(),
                checkpoint.last_span_seq,
                format_rfc3339(record.created_at)?,
            ],
        )
        .context("failed to insert forked trace")?;
        Ok(record)
    }

    fn gc(&self) -> Result<GcReport> {
        let conn = self.lock()?;

        let mut referenced: BTreeSet<String> = BTreeSet::new();
        let mut edge_stmt = conn.prepare(
            "SELECT from_kind, from_id, to_kind, to_id FROM provenance_edges",
        )?;
        let mut rows = edge_stmt.query([])?;
        while let Some(row) = rows.next()? {
            for (kind_idx, id_idx) in [(0, 1), (2, 3)] {
                let kind: String = row.get(kind_idx)?;
                if kind == "artifact" {
                    referenced.insert(row.get(id_idx)?);
                }
            }
        }

        let mut attr_stmt = conn.prepare("SELECT attributes_json FROM spans")?;
        let mut rows = attr_stmt.query([])?;
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            let attributes: AttrMap =
                serde_json::from_str(&raw).context("invalid span attributes_json")?;
            for value in attributes.values() {
                if let AttrValue::Artifact(id) = value {
                    referenced.insert(id.to_string());
                }
            }
        }

        let mut candidates = Vec::new();
        let mut artifact_stmt = conn.prepare("SELECT artifact_id, byte_len FROM artifacts")?;
        let mut rows = artifact_stmt.query([])?;
        while let Some(row) = rows.next()? {
            let artifact_id: String = row.get(0)?;
            let byte_len: i64 = row.get(1)?;
            if !referenced.contains(&artifact_id) {
                candidates.push((artifact_id, byte_len));
            }
        }

        let mut report = GcReport::default();
        for (artifact_id, byte_len) in candidates {
            conn.execute(
                "DELETE FROM artifacts WHERE artifact_id = ?1",
                params![artifact_id],
            )
            .context("failed to delete unreferenced artifact")?;
            report.artifacts_removed += 1;
            report.bytes_removed += u64::try_from(byte_len).unwrap_or(0);
        }
        Ok(report)
    }
}

fn load_checkpoint(
    conn: &Connection,
    checkpoint_id: CheckpointId,
) -> Result<Option<CheckpointRecord>> {
    let mut stmt = conn.prepare(
        "SELECT checkpoint_id, trace_id, last_span_seq,
                phase_state_json, open_span_ids_json, created_at
         FROM checkpoints WHERE checkpoint_id = ?1",
    )?;
    let mut rows = stmt.query(params![checkpoint_id.to_string()])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let checkpoint_raw: String = row.get(0)?;
    let trace_raw: String = row.get(1)?;
    let phase_state_json: String = row.get(3)?;
    let open_span_ids_json: String = row.get(4)?;
    Ok(Some(CheckpointRecord {
        checkpoint_id: parse_checkpoint_id(&checkpoint_raw)?,
        trace_id: parse_trace_id(&trace_raw)?,
        last_span_seq: row.get(2)?,
        phase_state: serde_json::from_str(&phase_state_json)
            .context("invalid checkpoint phase_state_json")?,
        open_span_ids: serde_json::from_str(&open_span_ids_json)
            .context("invalid checkpoint open_span_ids_json")?,
        created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
    }))
}

fn row_to_trace(row: &rusqlite::Row<'_>) -> Result<TraceRecord> {
    let trace_raw: String = row.get(0)?;
    let parent_raw: Option<String> = row.get(1)?;
    Ok(TraceRecord {
        trace_id: parse_trace_id(&trace_raw)?,
        parent_trace_id: parent_raw.map(|value| parse_trace_id(&value)).transpose()?,
        forked_at_seq: row.get(2)?,
        created_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
        label: row.get(4)?,
    })
}

fn kind_to_str(kind: SpanKind) -> &'static str {
    match kind {
        SpanKind::Turn => "turn",
        SpanKind::ModelCall => "model_call",
        SpanKind::ToolCall => "tool_call",
        SpanKind::Reasoning => "reasoning",
        SpanKind::BrowserSession => "browser_session",
        SpanKind::MemoryOp => "memory_op",
    }
}

fn parse_kind(value: &str) -> Result<SpanKind> {
    match value {
        "turn" => Ok(SpanKind::Turn),
        "model_call" => Ok(SpanKind::ModelCall),
        "tool_call" => Ok(SpanKind::ToolCall),
        "reasoning" => Ok(SpanKind::Reasoning),
        "browser_session" => Ok(SpanKind::BrowserSession),
        "memory_op" => Ok(SpanKind::MemoryOp),
        _ => Err(anyhow!("unknown span kind: {value}")),
    }
}

fn status_to_str(status: SpanStatus) -> &'static str {
    match status {
        SpanStatus::Open => "open",
        SpanStatus::Ok => "ok",
        SpanStatus::Error => "error",
    }
}

fn parse_status(value: &str) -> Result<SpanStatus> {
    match value {
        "open" => Ok(SpanStatus::Open),
        "ok" => Ok(SpanStatus::Ok),
        "error" => Ok(SpanStatus::Error),
        _ => Err(anyhow!("unknown span status: {value}")),
    }
}

fn relation_to_str(relation: EdgeRelation) -> &'static str {
    match relation {
        EdgeRelation::Used => "used",
        EdgeRelation::WasGeneratedBy => "was_generated_by",
        EdgeRelation::WasDerivedFrom => "was_derived_from",
    }
}

fn parse_relation(value: &str) -> Result<EdgeRelation> {
    match value {
        "used" => Ok(EdgeRelation::Used),
        "was_generated_by" => Ok(EdgeRelation::WasGeneratedBy),
        "was_derived_from" => Ok(EdgeRelation::WasDerivedFrom),
        _ => Err(anyhow!("unknown edge relation: {value}")),
    }
}

fn parse_entity(kind: &str, id: &str) -> Result<EntityRef> {
    match kind {
        "span" => Ok(EntityRef::Span(parse_span_id(id)?)),
        "artifact" => Ok(EntityRef::Artifact(ArtifactId(id.to_string()))),
        _ => Err(anyhow!("unknown entity kind: {kind}")),
    }
}

fn parse_trace_id(value: &str) -> Result<TraceId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid trace_id ULID: {err}"))?;
    Ok(TraceId(ulid))
}

fn parse_span_id(value: &str) -> Result<SpanId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid span_id ULID: {err}"))?;
    Ok(SpanId(ulid))
}

fn parse_checkpoint_id(value: &str) -> Result<CheckpointId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid checkpoint_id ULID: {err}"))?;
    Ok(CheckpointId(ulid))
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
        [],
    )
    .with_context(|| format!("failed to add missing column {table}.{column}"))?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
