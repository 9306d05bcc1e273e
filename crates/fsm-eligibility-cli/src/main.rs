use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fsm_eligibility_core::{iso_date, CheckId, CheckStatus, QueueDestination, RawIdentity};
use fsm_eligibility_engine::{drain, AuditContext, EligibilityEngine, EngineConfig, SqliteQueue};
use fsm_eligibility_store_sqlite::{ReferenceDataset, ReferenceRecord, SqliteStore};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_ACTOR: &str = "fsm-cli";

#[derive(Debug, Parser)]
#[command(name = "fsm")]
#[command(about = "Free school meals eligibility check engine")]
struct Cli {
    #[arg(long, default_value = "./fsm_eligibility.sqlite3")]
    db: PathBuf,

    /// Optional YAML engine configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Dataset {
        #[command(subcommand)]
        command: DatasetCommand,
    },
    Check {
        #[command(subcommand)]
        command: Box<CheckCommand>,
    },
    Bulk {
        #[command(subcommand)]
        command: BulkCommand,
    },
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DatasetCommand {
    /// Load `identifier,surname,date_of_birth` lines into a reference dataset.
    Load(DatasetLoadArgs),
}

#[derive(Debug, Args)]
struct DatasetLoadArgs {
    #[arg(long, value_enum)]
    dataset: DatasetArg,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CheckCommand {
    Submit(CheckSubmitArgs),
    Process(CheckIdArgs),
    Status(CheckIdArgs),
    Show(CheckShowArgs),
    Override(CheckOverrideArgs),
}

#[derive(Debug, Args)]
struct CheckSubmitArgs {
    #[arg(long)]
    surname: String,
    #[arg(long)]
    date_of_birth: String,
    #[arg(long)]
    nino: Option<String>,
    #[arg(long)]
    asylum_reference: Option<String>,
    #[arg(long, default_value = DEFAULT_ACTOR)]
    actor: String,
}

#[derive(Debug, Args)]
struct CheckIdArgs {
    #[arg(long)]
    check_id: String,
    #[arg(long, default_value = DEFAULT_ACTOR)]
    actor: String,
}

#[derive(Debug, Args)]
struct CheckShowArgs {
    #[arg(long)]
    check_id: String,
    #[arg(long, default_value_t = false)]
    audit: bool,
}

#[derive(Debug, Args)]
struct CheckOverrideArgs {
    #[arg(long)]
    check_id: String,
    #[arg(long, value_enum)]
    status: StatusArg,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    reason: Option<String>,
}

#[derive(Debug, Subcommand)]
enum BulkCommand {
    /// Submit a JSON array of identities as one batch.
    Submit(BulkSubmitArgs),
    Status(GroupArgs),
    Results(GroupArgs),
}

#[derive(Debug, Args)]
struct BulkSubmitArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    group_id: Option<String>,
    #[arg(long, default_value = DEFAULT_ACTOR)]
    actor: String,
}

#[derive(Debug, Args)]
struct GroupArgs {
    #[arg(long)]
    group_id: String,
}

#[derive(Debug, Subcommand)]
enum WorkerCommand {
    Drain(WorkerDrainArgs),
}

#[derive(Debug, Args)]
struct WorkerDrainArgs {
    #[arg(long, value_enum, default_value_t = DestinationArg::Standard)]
    destination: DestinationArg,
    #[arg(long, default_value_t = 100)]
    limit: usize,
    #[arg(long, default_value = DEFAULT_ACTOR)]
    actor: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DatasetArg {
    TaxAuthority,
    ImmigrationSupport,
}

impl From<DatasetArg> for ReferenceDataset {
    fn from(value: DatasetArg) -> Self {
        match value {
            DatasetArg::TaxAuthority => Self::TaxAuthority,
            DatasetArg::ImmigrationSupport => Self::ImmigrationSupport,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Eligible,
    NotEligible,
    ParentNotFound,
}

impl From<StatusArg> for CheckStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Eligible => Self::Eligible,
            StatusArg::NotEligible => Self::NotEligible,
            StatusArg::ParentNotFound => Self::ParentNotFound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DestinationArg {
    Standard,
    Bulk,
}

impl From<DestinationArg> for QueueDestination {
    fn from(value: DestinationArg) -> Self {
        match value {
            DestinationArg::Standard => Self::Standard,
            DestinationArg::Bulk => Self::Bulk,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Dataset { command } => {
            let engine = build_engine(&cli.db, cli.config.as_deref())?;
            run_dataset(command, &engine)
        }
        Command::Check { command } => {
            let engine = build_engine(&cli.db, cli.config.as_deref())?;
            run_check(*command, &engine)
        }
        Command::Bulk { command } => {
            let engine = build_engine(&cli.db, cli.config.as_deref())?;
            run_bulk(command, &engine)
        }
        Command::Worker { command } => {
            let engine = build_engine(&cli.db, cli.config.as_deref())?;
            run_worker(command, &engine)
        }
    }
}

fn build_engine(db: &Path, config: Option<&Path>) -> Result<EligibilityEngine> {
    let config = EngineConfig::load(config)?;
    Ok(EligibilityEngine::with_sqlite_collaborators(db.to_path_buf(), config)?)
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_dataset(command: DatasetCommand, engine: &EligibilityEngine) -> Result<()> {
    match command {
        DatasetCommand::Load(args) => {
            let raw = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read dataset file {}", args.file.display()))?;
            let records = parse_reference_lines(&raw)?;
            let dataset = ReferenceDataset::from(args.dataset);
            let loaded = engine.load_reference_records(dataset, &records)?;
            emit_json(serde_json::json!({
                "dataset": dataset,
                "loaded": loaded
            }))
        }
    }
}

/// Parse `identifier,surname,date_of_birth` lines. Blank lines, `#` comments, and
/// a leading header row are skipped.
fn parse_reference_lines(raw: &str) -> Result<Vec<ReferenceRecord>> {
    let mut records = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = line.split(',').map(str::trim).collect::<Vec<_>>();
        let [identifier, surname, date_of_birth] = fields.as_slice() else {
            return Err(anyhow!(
                "line {}: expected identifier,surname,date_of_birth",
                index + 1
            ));
        };
        if records.is_empty() && date_of_birth.eq_ignore_ascii_case("date_of_birth") {
            continue;
        }
        if identifier.is_empty() || surname.is_empty() {
            return Err(anyhow!("line {}: identifier and surname are required", index + 1));
        }
        records.push(ReferenceRecord {
            identifier: (*identifier).to_string(),
            surname: (*surname).to_string(),
            date_of_birth: iso_date::parse(date_of_birth)
                .map_err(|err| anyhow!("line {}: {err}", index + 1))?,
        });
    }
    Ok(records)
}

fn run_check(command: CheckCommand, engine: &EligibilityEngine) -> Result<()> {
    match command {
        CheckCommand::Submit(args) => {
            let identity = RawIdentity {
                surname: args.surname,
                date_of_birth: iso_date::parse(&args.date_of_birth).map_err(|err| anyhow!(err))?,
                national_insurance_number: args.nino,
                asylum_support_reference: args.asylum_reference,
            };
            let receipt = engine.submit(&identity, &AuditContext::new(args.actor))?;
            emit_json(serde_json::to_value(receipt)?)
        }
        CheckCommand::Process(args) => {
            let check_id = CheckId::parse(&args.check_id)?;
            let status = engine.resolve(check_id, &AuditContext::new(args.actor))?;
            emit_json(serde_json::json!({
                "check_id": check_id,
                "status": status
            }))
        }
        CheckCommand::Status(args) => {
            let check_id = CheckId::parse(&args.check_id)?;
            let status = engine.status(check_id)?;
            emit_json(serde_json::json!({
                "check_id": check_id,
                "status": status
            }))
        }
        CheckCommand::Show(args) => {
            let check_id = CheckId::parse(&args.check_id)?;
            let check = engine.get_check(check_id)?;
            let mut value = serde_json::json!({ "check": check });
            if args.audit {
                value["audit"] = serde_json::to_value(engine.audit_trail(check_id)?)?;
            }
            emit_json(value)
        }
        CheckCommand::Override(args) => {
            let check_id = CheckId::parse(&args.check_id)?;
            let mut audit = AuditContext::new(args.actor);
            if let Some(reason) = args.reason {
                audit = audit.with_reason(reason);
            }
            let check = engine.override_status(check_id, args.status.into(), &audit)?;
            emit_json(serde_json::json!({ "check": check }))
        }
    }
}

fn run_bulk(command: BulkCommand, engine: &EligibilityEngine) -> Result<()> {
    match command {
        BulkCommand::Submit(args) => {
            let raw = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read batch file {}", args.file.display()))?;
            let identities: Vec<RawIdentity> = serde_json::from_str(&raw)
                .with_context(|| format!("invalid batch file {}", args.file.display()))?;
            let receipt =
                engine.submit_batch(&identities, args.group_id, &AuditContext::new(args.actor))?;
            emit_json(serde_json::to_value(receipt)?)
        }
        BulkCommand::Status(args) => {
            let status = engine.bulk_status(&args.group_id)?;
            emit_json(serde_json::json!({
                "group_id": args.group_id,
                "total": status.total,
                "complete": status.complete,
                "finished": status.is_finished()
            }))
        }
        BulkCommand::Results(args) => {
            let results = engine.bulk_results(&args.group_id)?;
            emit_json(serde_json::json!({
                "group_id": args.group_id,
                "results": results
            }))
        }
    }
}

fn run_worker(command: WorkerCommand, engine: &EligibilityEngine) -> Result<()> {
    match command {
        WorkerCommand::Drain(args) => {
            let queue = SqliteQueue::new(engine.db_path().to_path_buf());
            let destination = QueueDestination::from(args.destination);
            let report =
                drain(engine, &queue, destination, args.limit, &AuditContext::new(args.actor))?;
            emit_json(serde_json::json!({
                "destination": destination,
                "report": report,
                "remaining": queue.depth(destination)?
            }))
        }
    }
}
