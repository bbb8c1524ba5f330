//! Command surface for installing entity kinds, converting them to versioned
//! storage and working with converted records.
//!
//! Embedders can call [`run_cli`] with a parsed [`Cli`], or [`run_command`]
//! against an already opened [`SqliteMultiversionStore`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use multiversion_core::{
    ConversionConfig, DefinitionRegistry, EntityKindDescriptor, EntityRecord, FieldDescriptor,
    FixedWorkspace, RevisionToken, SettingsStore, DEFAULT_BATCH_SIZE,
};
use multiversion_store_sqlite::{
    ConversionOrchestrator, EntityQuery, SqliteMultiversionStore, StepOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mv")]
#[command(about = "Multiversion storage conversion CLI")]
pub struct Cli {
    #[arg(long, default_value = "./multiversion.sqlite3")]
    db: PathBuf,

    /// Used when `RUST_LOG` is not set.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Kinds {
        #[command(subcommand)]
        command: KindsCommand,
    },
    Legacy {
        #[command(subcommand)]
        command: LegacyCommand,
    },
    Enable(EnableArgs),
    Convert {
        #[command(subcommand)]
        command: ConvertCommand,
    },
    Status,
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    Entity {
        #[command(subcommand)]
        command: Box<EntityCommand>,
    },
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum KindsCommand {
    Install(KindsInstallArgs),
    List,
}

#[derive(Debug, Args)]
pub struct KindsInstallArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum LegacyCommand {
    Insert(LegacyInsertArgs),
}

#[derive(Debug, Args)]
pub struct LegacyInsertArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    values_json: String,
}

#[derive(Debug, Args)]
pub struct EnableArgs {
    #[arg(long = "kind")]
    kinds: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[derive(Debug, Subcommand)]
pub enum ConvertCommand {
    Step(ConvertStepArgs),
}

#[derive(Debug, Args)]
pub struct ConvertStepArgs {
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long = "kind")]
    kinds: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[derive(Debug, Subcommand)]
pub enum WorkspaceCommand {
    Create(WorkspaceCreateArgs),
    List,
}

#[derive(Debug, Args)]
pub struct WorkspaceCreateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    label: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum EntityCommand {
    Save(EntitySaveArgs),
    Delete(EntityTargetArgs),
    Load(EntityLoadArgs),
    History(EntityTargetArgs),
    Query(EntityQueryArgs),
}

#[derive(Debug, Args)]
pub struct EntitySaveArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    values_json: String,
    #[arg(long)]
    workspace: Option<String>,
}

#[derive(Debug, Args)]
pub struct EntityTargetArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    id: i64,
    #[arg(long)]
    workspace: Option<String>,
}

#[derive(Debug, Args)]
pub struct EntityLoadArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    id: i64,
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long)]
    include_deleted: bool,
}

#[derive(Debug, Args)]
pub struct EntityQueryArgs {
    /// An `EntityQuery` document.
    #[arg(long)]
    query_json: String,
    #[arg(long)]
    workspace: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TokenCommand {
    Compute(TokenComputeArgs),
}

#[derive(Debug, Args)]
pub struct TokenComputeArgs {
    #[arg(long)]
    entity_id: String,
    #[arg(long)]
    previous: Option<String>,
    #[arg(long)]
    deleted: bool,
    /// Sequence index of the save; defaults to the previous token's index.
    #[arg(long)]
    index: Option<u64>,
}

/// One entity kind with its legacy field definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindDefinition {
    pub kind: EntityKindDescriptor,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KindDefinitionFile {
    Many { kinds: Vec<KindDefinition> },
    One(KindDefinition),
}

#[derive(Debug, Serialize)]
struct StepReport {
    step: Option<StepOutcome>,
    finished: f64,
    done: bool,
    failed: Vec<String>,
    fixed_keys: Vec<String>,
}

/// Installs the log subscriber on stderr; stdout carries JSON only.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid --log-level value: {level}"))?,
    };
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(err) = installed {
        // Embedders may have installed their own subscriber; keep it.
        debug!(error = %err, "log subscriber already installed");
    }
    Ok(())
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when logging setup, store open/migrate, or the command
/// itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(&cli.log_level)?;
    match cli.command {
        Command::Token { command } => run_token(command),
        command => {
            let store = SqliteMultiversionStore::open(&cli.db)?;
            store.migrate()?;
            run_command(command, &store)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation, conversion, or persistence fails.
pub fn run_command(command: Command, store: &SqliteMultiversionStore) -> Result<()> {
    match command {
        Command::Kinds { command } => run_kinds(command, store),
        Command::Legacy { command } => match command {
            LegacyCommand::Insert(args) => {
                let mut record = record_from_json(&args.kind, &args.values_json)?;
                let id = store.insert_legacy(&mut record)?;
                print_json(&serde_json::json!({ "kind": args.kind, "id": id }))
            }
        },
        Command::Enable(args) => {
            let requested = requested_kinds(&args.kinds);
            let config = conversion_config(args.batch_size);
            let schema = store.schema();
            let registry = store.registry();
            let settings = store.settings();
            let orchestrator = ConversionOrchestrator::new(
                store.connection(),
                &schema,
                &registry,
                &settings,
                config,
            );
            let report = orchestrator.enable_versioning(requested)?;
            print_json(&report)
        }
        Command::Convert { command } => match command {
            ConvertCommand::Step(args) => run_convert_step(&args, store),
        },
        Command::Status => print_json(&store.status()?),
        Command::Workspace { command } => match command {
            WorkspaceCommand::Create(args) => {
                let label = args.label.unwrap_or_else(|| args.id.clone());
                let workspace = store.create_workspace(&args.id, &label)?;
                print_json(&workspace)
            }
            WorkspaceCommand::List => print_json(&store.list_workspaces()?),
        },
        Command::Entity { command } => run_entity(*command, store),
        Command::Token { command } => run_token(command),
    }
}

fn run_kinds(command: KindsCommand, store: &SqliteMultiversionStore) -> Result<()> {
    match command {
        KindsCommand::Install(args) => {
            let definitions = read_kind_definitions(&args.file)?;
            let mut installed = Vec::new();
            for definition in &definitions {
                store
                    .install_entity_kind(&definition.kind, &definition.fields)
                    .with_context(|| format!("failed to install entity kind {}", definition.kind.id))?;
                installed.push(definition.kind.id.clone());
            }
            print_json(&serde_json::json!({ "installed": installed }))
        }
        KindsCommand::List => {
            let registry = store.registry();
            let mut kinds = Vec::new();
            for kind in registry.entity_kinds()? {
                let fields = registry.field_definitions(&kind.id)?;
                kinds.push(KindDefinition { kind, fields });
            }
            print_json(&kinds)
        }
    }
}

fn run_convert_step(args: &ConvertStepArgs, store: &SqliteMultiversionStore) -> Result<()> {
    let schema = store.schema();
    let registry = store.registry();
    let settings = store.settings();
    let orchestrator = ConversionOrchestrator::new(
        store.connection(),
        &schema,
        &registry,
        &settings,
        conversion_config(args.batch_size),
    );

    let mut progress = if args.checkpoint.exists() {
        let raw = fs::read_to_string(&args.checkpoint).with_context(|| {
            format!("failed to read checkpoint {}", args.checkpoint.display())
        })?;
        serde_json::from_str(&raw).with_context(|| {
            format!("failed to decode checkpoint {}", args.checkpoint.display())
        })?
    } else {
        info!(checkpoint = %args.checkpoint.display(), "starting new conversion run");
        orchestrator.plan(requested_kinds(&args.kinds))?
    };

    let step = orchestrator.step(&mut progress)?;
    let done = progress.is_finished();
    let fixed_keys = if done {
        orchestrator.finalize(&progress)?
    } else {
        Vec::new()
    };

    let body = serde_json::to_string_pretty(&progress)?;
    fs::write(&args.checkpoint, body).with_context(|| {
        format!("failed to write checkpoint {}", args.checkpoint.display())
    })?;
    debug!(checkpoint = %args.checkpoint.display(), done, "checkpoint written");

    print_json(&StepReport {
        step,
        finished: progress.finished(),
        done,
        failed: settings.failed_kinds()?,
        fixed_keys,
    })
}

fn run_entity(command: EntityCommand, store: &SqliteMultiversionStore) -> Result<()> {
    match command {
        EntityCommand::Save(args) => {
            let storage = store.storage(&FixedWorkspace::new(args.workspace.as_deref()))?;
            let overrides = parse_values(&args.values_json)?;
            let existing = match overrides.get("id").and_then(Value::as_i64) {
                Some(id) => storage.load(&args.kind, id)?,
                None => None,
            };
            let base = existing.unwrap_or_else(|| EntityRecord::new(&args.kind));
            let mut record = merge_record(base, overrides)?;
            storage.save(&mut record)?;
            print_json(&record)
        }
        EntityCommand::Delete(args) => {
            let storage = store.storage(&FixedWorkspace::new(args.workspace.as_deref()))?;
            let Some(mut record) = storage.load(&args.kind, args.id)? else {
                return Err(anyhow!("entity not found: {}:{}", args.kind, args.id));
            };
            storage.delete(&mut record)?;
            print_json(&record)
        }
        EntityCommand::Load(args) => {
            let storage = store.storage(&FixedWorkspace::new(args.workspace.as_deref()))?;
            let record = if args.include_deleted {
                storage.load_deleted(&args.kind, args.id)?
            } else {
                storage.load(&args.kind, args.id)?
            };
            let Some(record) = record else {
                return Err(anyhow!("entity not found: {}:{}", args.kind, args.id));
            };
            print_json(&record)
        }
        EntityCommand::History(args) => {
            let storage = store.storage(&FixedWorkspace::new(args.workspace.as_deref()))?;
            let mut revisions = Vec::new();
            for revision_id in storage.revision_ids(&args.kind, args.id)? {
                if let Some(record) = storage.load_revision(&args.kind, revision_id)? {
                    revisions.push(serde_json::json!({
                        "revision_id": revision_id,
                        "token": record.revision.token,
                        "deleted": record.revision.deleted,
                    }));
                }
            }
            print_json(&revisions)
        }
        EntityCommand::Query(args) => {
            let storage = store.storage(&FixedWorkspace::new(args.workspace.as_deref()))?;
            let query: EntityQuery = serde_json::from_str(&args.query_json)
                .with_context(|| format!("query_json must be a valid query: {}", args.query_json))?;
            let rows = storage.query(&query)?;
            let matches: Vec<Value> = rows
                .into_iter()
                .map(|(revision_id, id)| serde_json::json!({ "id": id, "revision_id": revision_id }))
                .collect();
            print_json(&matches)
        }
    }
}

fn run_token(command: TokenCommand) -> Result<()> {
    match command {
        TokenCommand::Compute(args) => {
            let previous = args
                .previous
                .as_deref()
                .map(RevisionToken::parse)
                .transpose()
                .map_err(|err| anyhow!("invalid --previous value: {err}"))?;
            let index = args
                .index
                .or_else(|| previous.as_ref().map(RevisionToken::index))
                .unwrap_or(0);
            let previous = previous.map(|token| token.to_string());
            let token =
                RevisionToken::compute(previous.as_deref(), args.deleted, &args.entity_id, index);
            print_json(&serde_json::json!({
                "token": token,
                "index": token.index(),
                "digest": token.digest(),
            }))
        }
    }
}

fn read_kind_definitions(path: &Path) -> Result<Vec<KindDefinition>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read kind definition file {}", path.display()))?;
    let parsed: KindDefinitionFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to decode kind definition file {}", path.display()))?;
    Ok(match parsed {
        KindDefinitionFile::Many { kinds } => kinds,
        KindDefinitionFile::One(definition) => vec![definition],
    })
}

fn parse_values(raw: &str) -> Result<serde_json::Map<String, Value>> {
    let parsed: Value = serde_json::from_str(raw)
        .with_context(|| format!("values_json must be valid JSON: {raw}"))?;
    match parsed {
        Value::Object(values) => Ok(values),
        _ => Err(anyhow!("values_json must be a JSON object: {raw}")),
    }
}

/// Builds a fresh record of `kind` from a partial JSON object.
fn record_from_json(kind: &str, raw: &str) -> Result<EntityRecord> {
    merge_record(EntityRecord::new(kind), parse_values(raw)?)
}

/// Overlays `overrides` on `base`. Nested objects (`fields`, `translations`,
/// `multi_values`, `revision`) are merged one level deep.
fn merge_record(base: EntityRecord, overrides: serde_json::Map<String, Value>) -> Result<EntityRecord> {
    let kind = base.kind.clone();
    let mut merged = serde_json::to_value(base)?;
    if let Value::Object(target) = &mut merged {
        for (key, value) in overrides {
            match value {
                Value::Object(incoming) if target.get(&key).is_some_and(Value::is_object) => {
                    if let Some(Value::Object(existing)) = target.get_mut(&key) {
                        existing.extend(incoming);
                    }
                }
                value => {
                    target.insert(key, value);
                }
            }
        }
        target.insert("kind".to_string(), Value::String(kind.clone()));
    }
    serde_json::from_value(merged).with_context(|| format!("invalid record for {kind}"))
}

fn requested_kinds(kinds: &[String]) -> Option<&[String]> {
    if kinds.is_empty() {
        None
    } else {
        Some(kinds)
    }
}

fn conversion_config(batch_size: usize) -> ConversionConfig {
    ConversionConfig { batch_size }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
