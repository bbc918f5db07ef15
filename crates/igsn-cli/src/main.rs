//! IGSN registry operator CLI
//!
//! Validates, transforms and inspects metadata against the configured schema
//! store, and runs batches through an in-memory pipeline.
//!
//! # Usage
//!
//! ```bash
//! # Validate a document
//! igsn validate --schema ardc-igsn-desc-1.0 --file resources.xml
//!
//! # Transform to registration metadata
//! igsn transform --schema ardc-igsn-desc-1.0 --target igsn-registration-metadata-1.1 \
//!     --registrant "ARDC" --file resources.xml
//!
//! # List identifiers in a payload
//! cat list.txt | igsn extract --schema igsn-list
//!
//! # Reserve a batch against an allocation from the config file
//! igsn run reserve --allocation ardc-test --file list.txt
//! ```

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use igsn_core::{
    attributes, AllowAll, IgsnService, MdsClientFactory, MemoryStore, RegistryConfig,
    RequestStatus, RequestType, ServiceDeps, TransformParams, User,
};

#[derive(Parser)]
#[command(name = "igsn")]
#[command(version)]
#[command(about = "IGSN registry pipeline: validate, transform, extract and run batches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to config/igsn.yaml when present)
    #[arg(long, short, global = true, env = "IGSN_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum BatchType {
    Mint,
    Update,
    Reserve,
    Transfer,
}

impl From<BatchType> for RequestType {
    fn from(value: BatchType) -> Self {
        match value {
            BatchType::Mint => RequestType::Mint,
            BatchType::Update => RequestType::Update,
            BatchType::Reserve => RequestType::Reserve,
            BatchType::Transfer => RequestType::Transfer,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate content against a schema
    Validate {
        #[arg(short, long)]
        schema: String,

        /// Input file (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Transform content into another schema and print the result
    Transform {
        #[arg(short, long)]
        schema: String,

        #[arg(short, long)]
        target: String,

        #[arg(long)]
        registrant: Option<String>,

        /// Event written to registration metadata logs
        #[arg(long, default_value = "submitted")]
        event: String,

        /// Input file (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Print the identifiers found in a payload, one per line
    Extract {
        #[arg(short, long)]
        schema: String,

        /// Input file (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Run a batch through an in-memory pipeline and print the report as JSON
    Run {
        #[arg(value_enum)]
        request_type: BatchType,

        #[arg(short, long)]
        allocation: String,

        /// Content schema (MINT and UPDATE)
        #[arg(short, long)]
        schema: Option<String>,

        #[arg(long)]
        registrant: Option<String>,

        /// New owner id (TRANSFER)
        #[arg(long)]
        target_owner: Option<String>,

        /// USER or GROUP
        #[arg(long, default_value = "GROUP")]
        target_owner_type: String,

        #[arg(long, default_value = "operator")]
        user: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Input file (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "igsn_core=warn,igsn_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = load_config(cli.config.as_deref())?;
    let service = IgsnService::start(
        config.clone(),
        ServiceDeps {
            store: Arc::new(MemoryStore::new()),
            registrars: Arc::new(MdsClientFactory::new(config.registrar.timeout())),
            access: Arc::new(AllowAll),
        },
    )?;

    match cli.command {
        Commands::Validate { schema, file } => {
            let content = read_input(file.as_deref())?;
            match service.validate(&schema, &content) {
                Ok(()) => {
                    println!("valid");
                    Ok(true)
                }
                Err(e) => {
                    println!("invalid: {e}");
                    Ok(false)
                }
            }
        }
        Commands::Transform {
            schema,
            target,
            registrant,
            event,
            file,
        } => {
            let content = read_input(file.as_deref())?;
            let params = TransformParams {
                registrant_name: registrant,
                event_type: Some(event),
                timestamp: None,
            };
            let output = service.transform(&schema, &content, &target, &params)?;
            print!("{}", output.content_str()?);
            Ok(true)
        }
        Commands::Extract { schema, file } => {
            let content = read_input(file.as_deref())?;
            for value in service.extract_identifiers(&schema, &content)? {
                println!("{value}");
            }
            Ok(true)
        }
        Commands::Run {
            request_type,
            allocation,
            schema,
            registrant,
            target_owner,
            target_owner_type,
            user,
            timeout_secs,
            file,
        } => {
            let payload = read_input(file.as_deref())?;
            let mut attrs = BTreeMap::new();
            attrs.insert(attributes::ALLOCATION_ID.to_string(), allocation);
            if let Some(schema) = schema {
                attrs.insert(attributes::SCHEMA_ID.to_string(), schema);
            }
            if let Some(registrant) = registrant {
                attrs.insert(attributes::REGISTRANT_NAME.to_string(), registrant);
            }
            if let Some(owner) = target_owner {
                attrs.insert(attributes::TARGET_OWNER_ID.to_string(), owner);
                attrs.insert(attributes::TARGET_OWNER_TYPE.to_string(), target_owner_type);
            }

            let request = service
                .submit(&User::new(user), request_type.into(), attrs, &payload, false)
                .await?;
            tracing::info!(request_id = %request.id, "Batch submitted");

            let report = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                service.wait_for_completion(request.id),
            )
            .await
            .with_context(|| format!("request {} did not finish in {timeout_secs}s", request.id))??;

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.request.status == RequestStatus::Completed)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RegistryConfig> {
    let mut config = match path {
        Some(path) => RegistryConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RegistryConfig::load()?,
    };
    config.apply_env_overrides();
    Ok(config)
}

fn read_input(file: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match file {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display())),
        None => {
            let mut buffer = Vec::new();
            io::stdin().read_to_end(&mut buffer)?;
            if buffer.is_empty() {
                bail!("no input: pass --file or pipe content on stdin");
            }
            Ok(buffer)
        }
    }
}
