use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use agent_ledger_core::{Ledger, SpanFilter};
use agent_ledger_domain::{
    exit_codes, Claim, ClaimType, CheckpointId, CoreError, SpanStatus, TraceId,
};
use agent_ledger_gate::{ClaimOutcome, EvidenceGate};
use agent_ledger_sqlite::SqliteLedger;
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "agent-ledger")]
#[command(about = "Append-only execution ledger with evidence-gated completion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stream a trace's spans and edges as JSON lines and check its chain.
    Replay(ReplayArgs),
    /// Create a new trace sharing history up to a checkpoint.
    Fork(ForkArgs),
    /// Reload a checkpoint and report spans interrupted after it.
    Resume(ResumeArgs),
    /// Remove artifacts unreferenced by any live lineage.
    Gc(GcArgs),
    /// Inspect stored traces.
    Trace(TraceArgs),
    /// Validate a claim against recorded evidence.
    Verify(VerifyArgs),
    /// Write a trace's spans and edges to a JSON-lines file.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    trace_id: String,
}

#[derive(Debug, Args)]
struct ForkArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    checkpoint_id: String,
}

#[derive(Debug, Args)]
struct ResumeArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    checkpoint_id: String,
    /// Close interrupted spans as errors instead of only reporting them.
    #[arg(long, default_value_t = false)]
    mark_interrupted: bool,
}

#[derive(Debug, Args)]
struct GcArgs {
    #[arg(long)]
    db: PathBuf,
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[command(subcommand)]
    command: TraceSubcommand,
}

#[derive(Debug, Subcommand)]
enum TraceSubcommand {
    Runs {
        #[arg(long)]
        db: PathBuf,
    },
    Spans {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        trace_id: String,
    },
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    trace_id: String,
    #[arg(long, default_value = "test_pass")]
    claim: String,
    /// May be given multiple times; every pattern must be backed.
    #[arg(long = "pattern", required = true)]
    patterns: Vec<String>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    trace_id: String,
    #[arg(long)]
    out: PathBuf,
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        let code = err
            .downcast_ref::<CoreError>()
            .map_or(exit_codes::INVALID, CoreError::exit_code);
        std::process::exit(code);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Replay(args) => replay_command(&args),
        Commands::Fork(args) => fork_command(&args),
        Commands::Resume(args) => resume_command(&args),
        Commands::Gc(args) => gc_command(&args),
        Commands::Trace(args) => trace_command(args),
        Commands::Verify(args) => verify_command(&args),
        Commands::Export(args) => export_command(&args),
    }
}

fn open_ledger(db: &Path) -> Result<SqliteLedger> {
    let ledger = SqliteLedger::open(db)?;
    ledger.migrate()?;
    Ok(ledger)
}

fn replay_command(args: &ReplayArgs) -> Result<()> {
    let ledger = open_ledger(&args.db)?;
    let trace_id = parse_trace_id(&args.trace_id)?;
    require_trace(&ledger, trace_id)?;

    let spans = ledger.query_spans(&SpanFilter {
        lineage_of: Some(trace_id),
        ..SpanFilter::default()
    })?;
    let edges = ledger.query_edges(trace_id)?;

    let mut chain_valid = true;
    let mut last_seq = 0;
    let mut interrupted = 0;
    let mut seen = HashSet::new();
    for row in &spans {
        if row.seq <= last_seq {
            chain_valid = false;
        }
        last_seq = row.seq;
        // Every parent link must resolve to an earlier span in the lineage.
        if let Some(parent) = row.span.parent_span_id {
            if !seen.contains(&parent) {
                chain_valid = false;
            }
        }
        seen.insert(row.span.span_id);
        if row.span.status == SpanStatus::Open {
            interrupted += 1;
        } else if row.span.ended_at.is_none() {
            chain_valid = false;
        }
        println!("{}", serde_json::to_string(row)?);
    }
    for edge in &edges {
        println!("{}", serde_json::to_string(edge)?);
    }

    println!(
        "trace_id={trace_id} spans={} edges={} chain_valid={chain_valid} interrupted={interrupted}",
        spans.len(),
        edges.len()
    );
    Ok(())
}

fn fork_command(args: &ForkArgs) -> Result<()> {
    let ledger = open_ledger(&args.db)?;
    let checkpoint_id = parse_checkpoint_id(&args.checkpoint_id)?;
    let forked = ledger.fork(checkpoint_id)?;
    println!(
        "forked_trace_id={} parent_trace_id={} forked_at_seq={}",
        forked.trace_id,
        forked
            .parent_trace_id
            .map_or_else(|| "none".to_string(), |id| id.to_string()),
        forked
            .forked_at_seq
            .map_or_else(|| "none".to_string(), |seq| seq.to_string())
    );
    Ok(())
}

fn resume_command(args: &ResumeArgs) -> Result<()> {
    let ledger = open_ledger(&args.db)?;
    let checkpoint_id = parse_checkpoint_id(&args.checkpoint_id)?;
    let state = ledger.resume(checkpoint_id)?;

    for row in &state.interrupted {
        println!("{}", serde_json::to_string(row)?);
        if args.mark_interrupted {
            ledger.mark_interrupted(row.span.trace_id, row.span.span_id)?;
        }
    }
    println!(
        "trace_id={} checkpoint_id={} phase={} expected_open={} interrupted={} marked={}",
        state.checkpoint.trace_id,
        state.checkpoint.checkpoint_id,
        state.checkpoint.phase_state.current_phase,
        state.expected_open.len(),
        state.interrupted.len(),
        args.mark_interrupted && !state.interrupted.is_empty()
    );
    Ok(())
}

fn gc_command(args: &GcArgs) -> Result<()> {
    let ledger = open_ledger(&args.db)?;
    let report = ledger.gc()?;
    println!(
        "artifacts_removed={} bytes_removed={}",
        report.artifacts_removed, report.bytes_removed
    );
    Ok(())
}

fn trace_command(args: TraceArgs) -> Result<()> {
    match args.command {
        TraceSubcommand::Runs { db } => {
            let ledger = open_ledger(&db)?;
            for trace in ledger.list_traces()? {
                println!("{}", serde_json::to_string(&trace)?);
            }
        }
        TraceSubcommand::Spans { db, trace_id } => {
            let ledger = open_ledger(&db)?;
            let trace_id = parse_trace_id(&trace_id)?;
            require_trace(&ledger, trace_id)?;
            let spans = ledger.query_spans(&SpanFilter {
                lineage_of: Some(trace_id),
                ..SpanFilter::default()
            })?;
            for row in spans {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
    }
    Ok(())
}

fn verify_command(args: &VerifyArgs) -> Result<()> {
    let ledger = open_ledger(&args.db)?;
    let trace_id = parse_trace_id(&args.trace_id)?;
    require_trace(&ledger, trace_id)?;

    let claim = Claim {
        claim_type: parse_claim_type(&args.claim)?,
        patterns: args.patterns.clone(),
    };
    let gate = EvidenceGate::new(&ledger, trace_id);
    match gate.validate_claim(&claim)? {
        ClaimOutcome::Accepted(records) => {
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
            println!("accepted=true patterns={}", claim.patterns.len());
            Ok(())
        }
        ClaimOutcome::Rejected(rejection) => {
            println!("{}", serde_json::to_string(&rejection)?);
            Err(CoreError::NoMatchingEvidence(rejection).into())
        }
    }
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let ledger = open_ledger(&args.db)?;
    let trace_id = parse_trace_id(&args.trace_id)?;
    require_trace(&ledger, trace_id)?;

    let spans = ledger.query_spans(&SpanFilter {
        lineage_of: Some(trace_id),
        ..SpanFilter::default()
    })?;
    let edges = ledger.query_edges(trace_id)?;

    let output = File::create(&args.out)?;
    let mut writer = BufWriter::new(output);
    for row in &spans {
        writeln!(writer, "{}", serde_json::to_string(row)?)?;
    }
    for edge in &edges {
        writeln!(writer, "{}", serde_json::to_string(edge)?)?;
    }
    writer.flush()?;

    println!(
        "exported spans={} edges={} to {}",
        spans.len(),
        edges.len(),
        args.out.display()
    );
    Ok(())
}

fn require_trace(ledger: &SqliteLedger, trace_id: TraceId) -> Result<()> {
    ledger
        .get_trace(trace_id)?
        .ok_or_else(|| anyhow!("trace_id {trace_id} not found"))?;
    Ok(())
}

fn parse_trace_id(input: &str) -> Result<TraceId> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid trace_id ULID: {err}"))?;
    Ok(TraceId(value))
}

fn parse_checkpoint_id(input: &str) -> Result<CheckpointId> {
    let value =
        Ulid::from_str(input).map_err(|err| anyhow!("invalid checkpoint_id ULID: {err}"))?;
    Ok(CheckpointId(value))
}

fn parse_claim_type(input: &str) -> Result<ClaimType> {
    match input {
        "test_pass" => Ok(ClaimType::TestPass),
        "regression_clean" => Ok(ClaimType::RegressionClean),
        other => Err(anyhow!(
            "invalid claim '{other}'; use 'test_pass' or 'regression_clean'"
        )),
    }
}
