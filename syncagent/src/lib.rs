use std::{
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bulksync::{
    blob::LocalBlobStore,
    config::{ImportConfig, UpsertMode},
    errors::SyncError,
    importer::ImportResults,
    service::{BlobStore, Condition, SearchRequest},
    BulkSync,
};
use catalogfetcher::{ClientSettings, HttpBlobStore, HttpCatalogClient};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_NO_INPUT: u8 = 2;
pub const EXIT_INVALID_SCHEMA: u8 = 3;
pub const EXIT_IMPORT_FAILED: u8 = 4;
pub const EXIT_UNRESOLVED_IDENTITY: u8 = 5;

/// Failure bucket used by the importer for references that could not be resolved.
const UNRESOLVED_BUCKET: &str = "unresolved reference";

/// Runs the command line interface of the sync agent.
pub async fn run_cli() -> anyhow::Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    let work = async {
        match cli.command {
            Some(Command::Import(args)) => run_import(args).await,
            Some(Command::Export(args)) => run_export(args).await,
            None => {
                println!("No subcommand provided. Use --help to see available commands.");
                Ok(EXIT_OK)
            }
        }
    };
    let code = tokio::select! {
        code = work => code?,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, stopping before the run completed");
            EXIT_FAILURE
        }
    };
    Ok(ExitCode::from(code))
}

/// Maps an error that ended the run to the process exit code.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    ExitCode::from(error_code(err))
}

fn error_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::Schema { .. }) => EXIT_INVALID_SCHEMA,
        Some(SyncError::IdentityNotFound { .. }) => EXIT_UNRESOLVED_IDENTITY,
        _ => EXIT_FAILURE,
    }
}

/// Exit code for a run that completed, given its failures.
pub fn exit_code_for_results(results: &ImportResults, fail_on_errors: bool) -> u8 {
    if !fail_on_errors || !results.has_failures() {
        return EXIT_OK;
    }
    if results.failure_buckets().contains_key(UNRESOLVED_BUCKET) {
        EXIT_UNRESOLVED_IDENTITY
    } else {
        EXIT_IMPORT_FAILED
    }
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Imports a tabular file into the catalog
    Import(ImportArgs),
    /// Exports catalog entities into a tabular file
    Export(ExportArgs),
}

#[derive(Args)]
struct CatalogArgs {
    /// Base URL of the catalog REST API
    #[arg(long, env = "CATALOG_URL")]
    catalog_url: String,
    /// Bearer token for the catalog
    #[arg(long, env = "CATALOG_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,
    /// Request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    /// Optional JSON file with import settings
    #[arg(long, env = "SYNC_CONFIG")]
    config: Option<PathBuf>,
}

impl CatalogArgs {
    fn client(&self) -> anyhow::Result<HttpCatalogClient> {
        let mut settings =
            ClientSettings::new(&self.catalog_url).with_token(self.api_token.clone());
        settings.timeout = Duration::from_secs(self.timeout_secs);
        HttpCatalogClient::new(settings).context("failed to build catalog client")
    }

    fn import_config(&self) -> anyhow::Result<ImportConfig> {
        match &self.config {
            Some(path) => ImportConfig::from_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display())),
            None => Ok(ImportConfig::default()),
        }
    }
}

#[derive(Args)]
struct BlobArgs {
    /// Base URL of an HTTP blob store
    #[arg(long, env = "BLOB_STORE_URL")]
    blob_url: Option<String>,
    /// Directory used as blob store when no URL is given
    #[arg(long, env = "BLOB_STORE_DIR")]
    blob_dir: Option<PathBuf>,
    /// Bearer token for the HTTP blob store
    #[arg(long, env = "BLOB_STORE_TOKEN", hide_env_values = true)]
    blob_token: Option<String>,
}

impl BlobArgs {
    fn store(&self) -> Option<Box<dyn BlobStore>> {
        if let Some(url) = &self.blob_url {
            return Some(Box::new(HttpBlobStore::new(url, self.blob_token.clone())));
        }
        self.blob_dir
            .as_ref()
            .map(|dir| Box::new(LocalBlobStore::new(dir)) as Box<dyn BlobStore>)
    }
}

#[derive(Args)]
struct ImportArgs {
    #[command(flatten)]
    catalog: CatalogArgs,
    #[command(flatten)]
    blob: BlobArgs,
    /// File to import
    #[arg(long)]
    input: PathBuf,
    /// File of the previous run; enables delta processing
    #[arg(long)]
    previous: Option<PathBuf>,
    /// Blob key holding the previous run's file; the input is stored there afterwards
    #[arg(long)]
    previous_key: Option<String>,
    /// Blob key of the side-cache to update after the import
    #[arg(long)]
    inventory_key: Option<String>,
    /// Only update existing entities
    #[arg(long, default_value_t = false)]
    update_only: bool,
    /// Exit non-zero when any row or entity failed
    #[arg(long, default_value_t = false)]
    fail_on_errors: bool,
}

#[derive(Args)]
struct ExportArgs {
    #[command(flatten)]
    catalog: CatalogArgs,
    /// File to write
    #[arg(long)]
    output: PathBuf,
    /// Types to export
    #[arg(long, value_delimiter = ',', required = true)]
    types: Vec<String>,
    /// Only export entities whose qualified name starts with this prefix
    #[arg(long)]
    prefix: Option<String>,
    /// Columns to write, in order
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "typeName,qualifiedName,name,description,ownerUsers,certificateStatus,readme,links"
    )]
    columns: Vec<String>,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

async fn run_import(args: ImportArgs) -> anyhow::Result<u8> {
    if !args.input.is_file() {
        warn!("input file {} does not exist", args.input.display());
        return Ok(EXIT_NO_INPUT);
    }

    let mut config = args.catalog.import_config()?;
    if args.update_only {
        config.upsert_mode = UpsertMode::UpdateOnly;
    }
    let fail_on_errors = args.fail_on_errors || config.fail_on_errors;
    let client = Arc::new(args.catalog.client()?);
    let sync = BulkSync::new(config, client)?;
    let store = args.blob.store();
    let workdir = tempfile::tempdir().context("failed to create working directory")?;

    let previous = match (&args.previous, &args.previous_key, &store) {
        (Some(path), _, _) => Some(path.clone()),
        (None, Some(key), Some(store)) => {
            let local = workdir.path().join("previous.csv");
            store.download(key, &local).await?.then_some(local)
        }
        (None, Some(_), None) => {
            anyhow::bail!("--previous-key needs --blob-url or --blob-dir")
        }
        (None, None, _) => None,
    };

    let results = match &previous {
        Some(previous) => sync.import_delta(&args.input, Some(previous)).await?,
        None => sync.import(&args.input).await?,
    };

    if let Some(store) = &store {
        if let Some(key) = &args.previous_key {
            store.upload(&args.input, key).await?;
            info!("Stored {} as the previous file for the next run", args.input.display());
        }
        if let Some(key) = &args.inventory_key {
            let local = workdir.path().join("inventory.sqlite");
            let inventory = sync
                .sync_inventory(&**store, key, &local, &results)
                .await?;
            info!("Side-cache now tracks {} assets", inventory.len()?);
        }
    } else if args.inventory_key.is_some() {
        warn!("--inventory-key ignored without a blob store");
    }

    print_summary(&results);
    Ok(exit_code_for_results(&results, fail_on_errors))
}

async fn run_export(args: ExportArgs) -> anyhow::Result<u8> {
    let config = args.catalog.import_config()?;
    let client = Arc::new(args.catalog.client()?);
    let sync = BulkSync::new(config, client)?;

    let mut request = SearchRequest {
        type_names: args.types.clone(),
        ..Default::default()
    };
    if let Some(prefix) = &args.prefix {
        request = request.with(Condition::prefix("qualifiedName", prefix.clone()));
    }
    let written = sync
        .export(&args.output, &request, &args.columns)
        .await
        .with_context(|| format!("failed to export to {}", args.output.display()))?;
    info!("Exported {} rows to {}", written, args.output.display());
    Ok(EXIT_OK)
}

fn print_summary(results: &ImportResults) {
    let summary = serde_json::json!({
        "created": results.created(),
        "updated": results.updated(),
        "restored": results.restored(),
        "skipped": results.skipped(),
        "failed": results.failed(),
        "deleted": results.deletions.as_ref().map(|d| d.deleted.len()).unwrap_or_default(),
        "failures": results
            .failure_buckets()
            .into_iter()
            .map(|(reason, keys)| (reason, keys.iter().map(ToString::to_string).collect::<Vec<_>>()))
            .collect::<std::collections::BTreeMap<_, _>>(),
    });
    println!("{summary:#}");
}
