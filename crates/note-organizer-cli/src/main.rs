use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use note_organizer_core::{NoteId, OrganizerConfig, Rearranger, StoreError};
use note_organizer_store_sqlite::SqliteCollection;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "norg")]
#[command(about = "Note Organizer CLI")]
struct Cli {
    #[arg(long, default_value = "./collection.sqlite3")]
    db: PathBuf,

    /// Note field preserving a note's pre-rearrange id.
    #[arg(long, default_value = "onid")]
    backup_field: String,

    /// Disable the backup-field write entirely.
    #[arg(long, default_value_t = false)]
    no_backup: bool,

    /// Note type seeded on init and used as the fallback for New tokens.
    #[arg(long, default_value = "Basic")]
    default_note_type: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or migrate the collection and seed the default note type.
    Init,
    Note {
        #[command(subcommand)]
        command: NoteCommand,
    },
    /// Renumber the collection against a user-edited token list.
    Rearrange(RearrangeArgs),
}

#[derive(Debug, Subcommand)]
enum NoteCommand {
    Add(NoteAddArgs),
    List,
}

#[derive(Debug, Args)]
struct NoteAddArgs {
    #[arg(long = "type")]
    note_type: Option<String>,
    /// Field assignment, NAME=VALUE; repeatable.
    #[arg(long = "field")]
    fields: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Debug, Args)]
struct RearrangeArgs {
    /// One token of the edited list, in order; repeatable. A plain integer
    /// keeps that note; "New: <type>", "Dupe: <id>", "Dupe (sched): <id>"
    /// and "Del: <id>" are action markers.
    #[arg(long = "token", required = true)]
    tokens: Vec<String>,

    /// Anchor id for the first surviving note; forces reassignment when its
    /// day differs from the note's.
    #[arg(long)]
    start: Option<i64>,

    /// Checkpoint the collection to this file before mutating.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
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

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = OrganizerConfig {
        backup_field: (!cli.no_backup).then(|| cli.backup_field.clone()),
        default_note_type: cli.default_note_type.clone(),
    };
    let mut store = SqliteCollection::open(&cli.db, config)?;

    match cli.command {
        Command::Init => run_init(&cli.db, &mut store, &cli.default_note_type),
        Command::Note { command } => {
            store.migrate()?;
            match command {
                NoteCommand::Add(args) => {
                    run_note_add(&args, &mut store, &cli.default_note_type)
                }
                NoteCommand::List => run_note_list(&store),
            }
        }
        Command::Rearrange(args) => {
            store.migrate()?;
            run_rearrange(&args, &mut store)
        }
    }
}

fn run_init(db: &Path, store: &mut SqliteCollection, default_note_type: &str) -> Result<()> {
    store.migrate()?;
    emit_json(serde_json::json!({
        "db": db.display().to_string(),
        "schema_version": store.schema_version()?,
        "default_note_type": default_note_type,
    }))
}

fn run_note_add(
    args: &NoteAddArgs,
    store: &mut SqliteCollection,
    default_note_type: &str,
) -> Result<()> {
    let note_type = args.note_type.as_deref().unwrap_or(default_note_type);
    let fields = args
        .fields
        .iter()
        .map(|raw| {
            raw.split_once('=')
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .ok_or_else(|| anyhow!("field assignment must be NAME=VALUE, got: {raw}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let id = store.add_note(note_type, &fields, &args.tags)?;
    emit_json(serde_json::json!({
        "id": id.0,
        "note_type": note_type,
    }))
}

fn run_note_list(store: &SqliteCollection) -> Result<()> {
    let notes = store
        .list_notes()?
        .into_iter()
        .map(|note| {
            serde_json::json!({
                "id": note.id.0,
                "note_type": note.note_type,
                "fields": note.fields,
                "tags": note.tags,
            })
        })
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({ "notes": notes }))
}

fn run_rearrange(args: &RearrangeArgs, store: &mut SqliteCollection) -> Result<()> {
    if let Some(checkpoint) = args.checkpoint.as_ref() {
        store.checkpoint(checkpoint).context("failed to checkpoint before rearranging")?;
    }

    let start = args.start.map(NoteId);
    let outcome = match Rearranger::new(store).rearrange(&args.tokens, start) {
        Ok(outcome) => outcome,
        Err(StoreError::LockUnavailable(reason)) => {
            // Clean failure, zero mutations: report and exit nonzero.
            emit_json(serde_json::json!({
                "aborted": true,
                "reason": reason,
            }))?;
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    };

    let selection = outcome.selection_to_restore();
    tracing::info!(
        modified = outcome.modified.len(),
        deleted = outcome.deleted.len(),
        created = outcome.created.len(),
        skipped = outcome.skipped.len(),
        "rearrange finished"
    );
    emit_json(serde_json::json!({
        "modified": outcome.modified,
        "deleted": outcome.deleted,
        "created": outcome.created,
        "skipped": outcome.skipped,
        "selection": selection,
        "reorganized": selection.len(),
    }))
}
