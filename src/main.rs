//! Querygate CLI Entry Point
//!
//! Subcommands:
//! - `keygen` - Generate a vault key (optionally saved to a config file)
//! - `connection add|list|show|update|remove` - Manage encrypted connections
//! - `prompt add` - Store a prompt for a connection
//! - `generate` - Validate SQL for a prompt through the generation pipeline
//! - `generation list` - List stored generation records
//!
//! All output to stdout is JSON-only. Logs go to stderr.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use querygate::config::{self, ConfigLayer};
use querygate::{
    create_prompt, list_generations, AppConfig, ConnectionService, ConnectionSummary,
    ConnectionUpdate, CredentialVault, EnginePoolCache, ErrorEnvelope, FixedSqlAgent,
    JsonFileRepository, LlmConfig, Meta, Metadata, QueryGateError, Repository,
    SqlGenerationPipeline, SqlGenerationRequest, SuccessEnvelope,
};

/// Querygate - encrypted connections and execution-validated SQL generation
#[derive(Parser)]
#[command(name = "querygate")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that take precedence over environment and config files
#[derive(Args)]
struct Overrides {
    /// Base64-encoded 32-byte vault key
    #[arg(long, global = true)]
    encrypt_key: Option<String>,

    /// Path of the JSON record store
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Statement timeout in milliseconds
    #[arg(long, global = true)]
    statement_timeout_ms: Option<u64>,

    /// Maximum rows fetched per statement
    #[arg(long, global = true)]
    max_rows: Option<usize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,
}

impl Overrides {
    fn into_layer(self) -> ConfigLayer {
        ConfigLayer {
            encryption_key: self.encrypt_key,
            statement_timeout_ms: self.statement_timeout_ms,
            max_rows: self.max_rows,
            store_path: self.store,
            log_level: self.log_level,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new vault key
    Keygen {
        /// Also write the key into a config file
        #[arg(long, value_enum)]
        save: Option<SaveLocation>,
    },

    /// Manage database connections
    #[command(subcommand)]
    Connection(ConnectionCommand),

    /// Manage prompts
    #[command(subcommand)]
    Prompt(PromptCommand),

    /// Validate SQL for a prompt through the pipeline and store the record
    Generate {
        #[arg(long)]
        prompt_id: String,

        /// Candidate SQL to validate
        #[arg(long)]
        sql: String,

        /// Model name recorded on the generation
        #[arg(long)]
        model: Option<String>,

        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Inspect generation records
    #[command(subcommand)]
    Generation(GenerationCommand),
}

#[derive(Subcommand)]
enum ConnectionCommand {
    /// Register a connection (URI is encrypted before it is stored)
    Add {
        #[arg(long)]
        alias: String,

        #[arg(long)]
        uri: String,

        /// Accessible schema (repeatable)
        #[arg(long = "schema")]
        schemas: Vec<String>,

        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// List connections
    List,

    /// Show one connection
    Show { id: String },

    /// Update a connection
    Update {
        id: String,

        #[arg(long)]
        alias: Option<String>,

        #[arg(long)]
        uri: Option<String>,

        /// Replace the schema list (repeatable)
        #[arg(long = "schema")]
        schemas: Option<Vec<String>>,

        #[arg(long)]
        metadata: Option<String>,
    },

    /// Remove a connection
    Remove { id: String },
}

#[derive(Subcommand)]
enum PromptCommand {
    /// Store a prompt for a connection
    Add {
        #[arg(long)]
        connection_id: String,

        #[arg(long)]
        text: String,

        /// Schema override (repeatable)
        #[arg(long = "schema")]
        schemas: Vec<String>,

        #[arg(long)]
        metadata: Option<String>,
    },
}

#[derive(Subcommand)]
enum GenerationCommand {
    /// List generations, optionally for one prompt
    List {
        #[arg(long)]
        prompt_id: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SaveLocation {
    Local,
    Global,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Keygen { .. } => "keygen",
            Self::Connection(ConnectionCommand::Add { .. }) => "connection add",
            Self::Connection(ConnectionCommand::List) => "connection list",
            Self::Connection(ConnectionCommand::Show { .. }) => "connection show",
            Self::Connection(ConnectionCommand::Update { .. }) => "connection update",
            Self::Connection(ConnectionCommand::Remove { .. }) => "connection remove",
            Self::Prompt(PromptCommand::Add { .. }) => "prompt add",
            Self::Generate { .. } => "generate",
            Self::Generation(GenerationCommand::List { .. }) => "generation list",
        }
    }
}

/// Command result before it is wrapped in an envelope
struct Output {
    data: serde_json::Value,
    count: Option<usize>,
}

impl Output {
    fn one(data: impl serde::Serialize) -> querygate::Result<Self> {
        Ok(Self { data: to_json(data)?, count: None })
    }

    fn many<T: serde::Serialize>(items: &[T]) -> querygate::Result<Self> {
        Ok(Self { data: to_json(items)?, count: Some(items.len()) })
    }
}

fn to_json(data: impl serde::Serialize) -> querygate::Result<serde_json::Value> {
    serde_json::to_value(data)
        .map_err(|e| QueryGateError::invalid_input(format!("Could not serialize output: {e}")))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.name();
    let start = Instant::now();

    let outcome = run(cli).await;
    let execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let failed = outcome.is_err();
    let rendered = match outcome {
        Ok(output) => serde_json::to_string(&SuccessEnvelope::new(
            command,
            output.data,
            Meta { execution_ms, count: output.count },
        ))?,
        Err(e) => serde_json::to_string(&ErrorEnvelope::from_error(command, &e))?,
    };
    println!("{rendered}");

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_LEVEL));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> querygate::Result<Output> {
    let config = AppConfig::load(cli.overrides.into_layer())?;
    init_tracing(&config);

    let repository: Arc<dyn Repository> = Arc::new(JsonFileRepository::new(&config.store_path));

    match cli.command {
        Commands::Keygen { save } => keygen(save),
        Commands::Connection(command) => connection(&config, repository, command).await,
        Commands::Prompt(PromptCommand::Add { connection_id, text, schemas, metadata }) => {
            let prompt =
                create_prompt(repository.as_ref(), &text, &connection_id, schemas, parse_metadata(metadata)?)
                    .await?;
            Output::one(prompt)
        }
        Commands::Generate { prompt_id, sql, model, metadata } => {
            let service = Arc::new(connection_service(&config, repository.clone())?);
            let pipeline =
                SqlGenerationPipeline::new(repository, service.clone(), Arc::new(FixedSqlAgent::new(sql)))
                    .with_limits(config.limits());

            let request = SqlGenerationRequest {
                llm_config: LlmConfig {
                    model_name: model.unwrap_or_else(|| LlmConfig::default().model_name),
                    ..LlmConfig::default()
                },
                metadata: parse_metadata(metadata)?,
            };

            let generation = pipeline.generate_and_store(&prompt_id, request).await;
            service.cache().invalidate_all().await;
            Output::one(generation?)
        }
        Commands::Generation(GenerationCommand::List { prompt_id }) => {
            Output::many(&list_generations(repository.as_ref(), prompt_id.as_deref()).await?)
        }
    }
}

fn keygen(save: Option<SaveLocation>) -> querygate::Result<Output> {
    let key = CredentialVault::generate_key()?;

    let saved_to = match save {
        Some(location) => {
            let path = match location {
                SaveLocation::Local => config::local_config_path()?,
                SaveLocation::Global => config::global_config_path()?,
            };
            let mut layer = config::load_layer(&path)?;
            layer.encryption_key = Some(key.clone());
            config::save_layer(&path, &layer)?;
            Some(path)
        }
        None => None,
    };

    Output::one(serde_json::json!({ "key": key, "saved_to": saved_to }))
}

async fn connection(
    config: &AppConfig,
    repository: Arc<dyn Repository>,
    command: ConnectionCommand,
) -> querygate::Result<Output> {
    let service = connection_service(config, repository)?;

    match command {
        ConnectionCommand::Add { alias, uri, schemas, metadata } => {
            let connection = service.register(&alias, &uri, schemas, parse_metadata(metadata)?).await?;
            Output::one(ConnectionSummary::from(&connection))
        }
        ConnectionCommand::List => {
            let summaries: Vec<ConnectionSummary> =
                service.list().await?.iter().map(ConnectionSummary::from).collect();
            Output::many(&summaries)
        }
        ConnectionCommand::Show { id } => Output::one(ConnectionSummary::from(&service.get(&id).await?)),
        ConnectionCommand::Update { id, alias, uri, schemas, metadata } => {
            let update = ConnectionUpdate {
                alias,
                connection_uri: uri,
                schemas,
                metadata: metadata.map(|raw| parse_metadata(Some(raw))).transpose()?,
            };
            let connection = service.update(&id, update).await?;
            Output::one(ConnectionSummary::from(&connection))
        }
        ConnectionCommand::Remove { id } => {
            service.delete(&id).await?;
            Output::one(serde_json::json!({ "id": id, "removed": true }))
        }
    }
}

fn connection_service(config: &AppConfig, repository: Arc<dyn Repository>) -> querygate::Result<ConnectionService> {
    Ok(ConnectionService::new(repository, Arc::new(config.vault()?), Arc::new(EnginePoolCache::new())))
}

fn parse_metadata(raw: Option<String>) -> querygate::Result<Metadata> {
    let Some(raw) = raw else {
        return Ok(Metadata::new());
    };

    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(QueryGateError::invalid_input("--metadata must be a JSON object")),
        Err(e) => Err(QueryGateError::invalid_input(format!("--metadata is not valid JSON: {e}"))),
    }
}
