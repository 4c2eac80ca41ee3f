use anyhow::{anyhow, bail, Context, Result};
use chunkvault::config::{ConfigResolver, ResolvedConfig};
use chunkvault::metadata::MetadataDatabase;
use chunkvault::secret::{SecretError, SecretStore, DEFAULT_STORE_FILE};
use chunkvault::transfer::FileStatus;
use chunkvault::{logging, metrics};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "vaultctl")]
#[command(version, about = "Operator tool for the chunkvault secret and metadata stores", long_about = None)]
struct Cli {
    /// Encrypted configuration file
    #[arg(long, global = true, default_value = DEFAULT_STORE_FILE)]
    env: PathBuf,

    /// Open the metadata store even if the linked SQLite cannot encrypt it
    #[arg(long, global = true)]
    allow_unencrypted: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a plaintext KEY=VALUE file into the encrypted store
    Import {
        plaintext: PathBuf,
    },

    /// Write the decrypted configuration to a plaintext file
    Export {
        path: PathBuf,
    },

    /// Validate the resolved configuration
    Check,

    /// Print file and upload statistics from the metadata store
    Stats {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Return chunks left in flight by a crashed worker to pending
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    metrics::init_metrics();

    match &cli.command {
        Commands::Import { plaintext } => {
            let store = SecretStore::new(&cli.env).with_plaintext_fallbacks(Vec::new());
            match store.load() {
                Ok(()) => {}
                Err(e) if e.is_missing() => {}
                Err(e) => bail!(e.user_message()),
            }
            init_logging(&resolve(&store)?)?;

            store
                .initialize_from_plaintext(plaintext)
                .with_context(|| format!("importing {}", plaintext.display()))?;
            println!(
                "Imported {} into {} ({} keys)",
                plaintext.display(),
                cli.env.display(),
                store.keys().len()
            );
        }
        Commands::Export { path } => {
            let store = open_store(&cli.env)?;
            init_logging(&resolve(&store)?)?;

            store.export_to_plaintext(path)?;
            println!("Exported {} keys to {}", store.keys().len(), path.display());
        }
        Commands::Check => {
            let store = open_store(&cli.env)?;
            let config = resolve(&store)?;
            init_logging(&config)?;

            let errors = config.validation_errors();
            if !errors.is_empty() {
                for err in &errors {
                    eprintln!("  ✗ {err}");
                }
                bail!("configuration is invalid ({} problems)", errors.len());
            }
            println!("✓ Configuration is valid");
            println!("  Tokens:      {}", config.all_tokens().len());
            println!("  Chunk size:  {} bytes", config.chunk_size());
            println!("  Threshold:   {} bytes", config.chunk_threshold());
            println!("  Max retries: {}", config.max_retries());
            println!("  Database:    {}", config.db_path().display());
        }
        Commands::Stats { json } => {
            let (config, db) = open_database(&cli).await?;

            let stats = db.storage_stats().await?;
            metrics::set_storage_used(stats.total_bytes);
            let uploads = db.list_chunked_files(None).await?;
            let count = |status: FileStatus| uploads.iter().filter(|f| f.status == status).count();

            if *json {
                let by_status: BTreeMap<&str, usize> = FileStatus::ALL
                    .iter()
                    .map(|&status| (status.as_str(), count(status)))
                    .collect();
                let report = serde_json::json!({
                    "store": config.db_path(),
                    "storage": stats,
                    "uploads": by_status,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
                db.close().await;
                return Ok(());
            }

            println!("Store: {}", config.db_path().display());
            println!("  Files:       {}", stats.total_files);
            println!("  Bytes:       {}", stats.total_bytes);
            println!("  Uploads:     {}", uploads.len());
            for status in FileStatus::ALL {
                println!("    {:<10} {}", status.as_str(), count(status));
            }
            db.close().await;
        }
        Commands::Recover => {
            let (_config, db) = open_database(&cli).await?;
            let recovered = db.recover_interrupted().await?;
            println!("Recovered {recovered} interrupted chunk transfers");
            db.close().await;
        }
    }

    Ok(())
}

fn open_store(path: &Path) -> Result<SecretStore> {
    SecretStore::open(path).map_err(|e: SecretError| anyhow!(e.user_message()))
}

fn resolve(store: &SecretStore) -> Result<ResolvedConfig> {
    Ok(ConfigResolver::new(store).resolve()?)
}

fn init_logging(config: &ResolvedConfig) -> Result<()> {
    logging::init(config.log_level(), config.log_path().as_deref())
        .context("initialising logging")
}

async fn open_database(cli: &Cli) -> Result<(ResolvedConfig, MetadataDatabase)> {
    let store = Arc::new(open_store(&cli.env)?);
    let config = resolve(&store)?;
    init_logging(&config)?;
    config.validate()?;

    let mut db = MetadataDatabase::new(store);
    if cli.allow_unencrypted {
        db = db.allow_unencrypted();
    }
    db.initialize(config.db_path())
        .await
        .with_context(|| format!("opening {}", config.db_path().display()))?;
    Ok((config, db))
}
