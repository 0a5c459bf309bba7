use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use recmux_core::session::StoreError;
use recmux_core::{
    load_recmux_config, ChunkInput, ChunkValidator, FfprobeProbe, JobExecutor, MergeEngine,
    MergeError, MergeReport, MergeRequest, RecmuxConfig, SessionMirror, SessionSnapshot,
    SessionStatus, SqliteSessionStore, ValidationResult,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] recmux_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Recording chunk validation and merge tool", long_about = None)]
pub struct Cli {
    /// Path to recmux.toml
    #[arg(long, default_value = "configs/recmux.toml")]
    pub config: PathBuf,
    /// Overrides paths.sessions_db
    #[arg(long)]
    pub sessions_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Classifies chunk files by signature and probe
    Validate(ValidateArgs),
    /// Merges every chunk file in a directory, in file-name order
    Merge(MergeArgs),
    /// Inspects mirrored recording sessions
    #[command(subcommand)]
    Sessions(SessionCommands),
    /// Prints shell completions
    Completions(CompletionArgs),
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Directory holding the chunk files
    pub dir: PathBuf,
    /// Expected chunk count, if more were recorded than are present
    #[arg(long)]
    pub expected: Option<usize>,
    /// Name of the merged artifact (without extension)
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Lists mirrored sessions
    List(SessionListArgs),
    /// Shows one session
    Show(SessionShowArgs),
}

#[derive(Args, Debug)]
pub struct SessionListArgs {
    /// Filter by status
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct SessionShowArgs {
    pub session_id: String,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(
            args.shell,
            &mut Cli::command(),
            "recmuxctl",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Validate(args) => {
            let report = context.validate(args).await;
            render(&report, cli.format)?;
        }
        Commands::Merge(args) => {
            let report = context.merge(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Sessions(SessionCommands::List(args)) => {
            let sessions = context.session_list(args)?;
            render(&sessions, cli.format)?;
        }
        Commands::Sessions(SessionCommands::Show(args)) => {
            let session = context.session_show(&args.session_id)?;
            render(&session, cli.format)?;
        }
        Commands::Completions(_) => {}
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: RecmuxConfig,
    sessions_db: Option<PathBuf>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_recmux_config(&cli.config)?;
        let sessions_db = cli
            .sessions_db
            .clone()
            .or_else(|| config.paths.sessions_db.clone())
            .map(|path| config.resolve_path(path));
        Ok(Self {
            config,
            sessions_db,
        })
    }

    fn validator(&self) -> Arc<ChunkValidator> {
        let probe = FfprobeProbe::new(&self.config.encoder.ffprobe, self.config.encoder.probe_timeout());
        Arc::new(ChunkValidator::new(
            Arc::new(probe),
            self.config.validation.clone(),
        ))
    }

    async fn validate(&self, args: &ValidateArgs) -> ValidationReport {
        let validator = self.validator();
        let mut rows = Vec::with_capacity(args.files.len());
        for path in &args.files {
            let result = validator.validate_file(path).await;
            debug!(path = %path.display(), valid = result.is_valid, format = %result.format, "validated");
            rows.push(ValidationRow {
                path: path.clone(),
                result,
            });
        }
        ValidationReport { rows }
    }

    /// Merges copies of the chunk files so recovery never rewrites the
    /// caller's originals.
    async fn merge(&self, args: &MergeArgs) -> Result<MergeReport> {
        let session_id = match &args.session {
            Some(session_id) => session_id.clone(),
            None => format!("cli-{}", Utc::now().format("%Y%m%d%H%M%S")),
        };
        recmux_core::storage::validate_session_id(&session_id)
            .map_err(|err| AppError::InvalidArgument(err.to_string()))?;

        let sources = chunk_files(&args.dir)?;
        if sources.is_empty() {
            return Err(AppError::MissingResource(format!(
                "no chunk files in {}",
                args.dir.display()
            )));
        }
        let temp_dir = self.config.resolve_path(&self.config.paths.temp_dir);
        let staging = temp_dir.join(format!("stage-{session_id}"));
        tokio::fs::create_dir_all(&staging).await?;
        let mut inputs = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let staged = staging.join(format!("chunk_{index:06}.bin"));
            tokio::fs::copy(source, &staged).await?;
            inputs.push(ChunkInput {
                index: index as u32,
                path: staged,
            });
        }
        info!(session_id = %session_id, chunks = inputs.len(), dir = %args.dir.display(), "merging directory");

        let engine = MergeEngine::new(
            JobExecutor::system(self.config.executor.max_concurrent_jobs),
            self.validator(),
            self.config.encoder.clone(),
            self.config.merge.clone(),
            self.config.resolve_path(&self.config.paths.output_dir),
            temp_dir,
        );
        let outcome = engine
            .merge(MergeRequest::new(&session_id, inputs).with_expected(args.expected))
            .await;
        if let Err(error) = tokio::fs::remove_dir_all(&staging).await {
            debug!(path = %staging.display(), %error, "failed to remove staging directory");
        }
        Ok(outcome?)
    }

    fn store(&self) -> Result<SqliteSessionStore> {
        let path = self
            .sessions_db
            .clone()
            .ok_or_else(|| AppError::MissingResource("paths.sessions_db is not configured".into()))?;
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "session database missing: {}",
                path.display()
            )));
        }
        Ok(SqliteSessionStore::builder()
            .path(&path)
            .read_only(true)
            .build()?)
    }

    fn session_list(&self, args: &SessionListArgs) -> Result<SessionList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<SessionStatus>)
            .transpose()
            .map_err(AppError::InvalidArgument)?;
        let mut rows: Vec<SessionSnapshot> = self
            .store()?
            .list()?
            .iter()
            .filter(|session| status.map_or(true, |wanted| session.status == wanted))
            .map(|session| session.snapshot())
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(args.limit);
        Ok(SessionList { rows })
    }

    fn session_show(&self, session_id: &str) -> Result<SessionSnapshot> {
        self.store()?
            .load(session_id)?
            .map(|session| session.snapshot())
            .ok_or_else(|| AppError::MissingResource(format!("session {session_id} not found")))
    }
}

/// Regular files directly under `dir`, sorted by file name.
fn chunk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Serialize)]
struct ValidationRow {
    path: PathBuf,
    #[serde(flatten)]
    result: ValidationResult,
}

#[derive(Debug, Serialize)]
struct ValidationReport {
    rows: Vec<ValidationRow>,
}

#[derive(Debug, Serialize)]
struct SessionList {
    rows: Vec<SessionSnapshot>,
}

impl DisplayFallback for ValidationReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for row in &self.rows {
            let verdict = if row.result.is_valid { "ok" } else { "invalid" };
            let strategy = row
                .result
                .recovery_strategy
                .map(|strategy| strategy.to_string())
                .unwrap_or_else(|| "-".to_string());
            let duration = row
                .result
                .media
                .as_ref()
                .map(|media| format!("{:.2}s", media.duration_seconds))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "{} | {verdict} | format={} | confidence={} | recovery={strategy} | dur={duration}",
                row.path.display(),
                row.result.format,
                row.result.confidence,
            ));
            for note in &row.result.notes {
                lines.push(format!("    note: {note}"));
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for MergeReport {
    fn display(&self) -> String {
        let result = &self.result;
        let mut lines = vec![
            format!("Output: {} ({} bytes)", result.output_path.display(), result.size_bytes),
            format!("Method: {}", result.method),
            format!(
                "Duration: expected {:.1}s, actual {:.1}s ({:?})",
                result.expected_duration, result.actual_duration, result.duration_accuracy
            ),
            format!(
                "Chunks: {} of {} merged",
                self.included_indices.len(),
                self.expected_chunks
            ),
        ];
        if !self.recovered_indices.is_empty() {
            lines.push(format!("Recovered: {:?}", self.recovered_indices));
        }
        if !self.missing_indices.is_empty() {
            lines.push(format!("Missing: {:?}", self.missing_indices));
        }
        for warning in &self.warnings {
            lines.push(format!("  - {warning}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SessionSnapshot {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Session: {}", self.session_id),
            format!("Status: {}", self.status),
            format!(
                "Chunks: {} received ({} bytes)",
                self.stats.chunks_received, self.stats.bytes_received
            ),
        ];
        if let Some(expected) = self.expected_chunks {
            lines.push(format!("Expected: {expected}"));
        }
        if !self.missing_indices.is_empty() {
            lines.push(format!("Missing: {:?}", self.missing_indices));
        }
        if let Some(reason) = &self.failure_reason {
            lines.push(format!("Failure: {reason}"));
        }
        if let Some(result) = &self.last_result {
            lines.push(format!(
                "Artifact: {} via {}",
                result.output_path.display(),
                result.method
            ));
        }
        lines.push(format!("Updated: {}", self.updated_at.to_rfc3339()));
        lines.join("\n")
    }
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No sessions found".to_string();
        }
        self.rows
            .iter()
            .map(|row| {
                let expected = row
                    .expected_chunks
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "{} | status={} | chunks={}/{expected} | updated={}",
                    row.session_id,
                    row.status,
                    row.stats.chunks_received,
                    row.updated_at.format("%Y-%m-%d %H:%M:%S")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
