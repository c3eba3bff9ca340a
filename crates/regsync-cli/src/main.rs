//! regsync - bulk jobs against the patient registry API
//!
//! ## Commands
//!
//! - `permissions`: add or remove permission strings on every user
//! - `projects`: add or remove project ids on every user
//! - `email-domain`: move user emails from one domain to another
//! - `create-users`: create users from a CSV file
//! - `audit-status`: clinical-concepts flag and document count per subject
//! - `backup`: snapshot every user's permissions and project ids
//!
//! Every command is a dry run unless `--apply` is given.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regsync_core::{
    all_project_ids, run_job, AuditStatusJob, BackupJob, CreateUsersJob, Job, JobContext,
    PreconditionError, ProgressMode, RunMetrics, RunOptions, RunOutcome, SyncError, UpdateJob,
    DEFAULT_PROTECTED_DOMAIN, EXIT_CANCELLED, EXIT_FAILURES, EXIT_PRECONDITION,
};
use regsync_http::{
    http_transport, ApplyMode, ConfigError, RetryPolicy, RunConfig, Transport, DEFAULT_BASE_URL,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "regsync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bulk synchronization jobs for the patient registry API", long_about = None)]
struct Cli {
    /// API base URL
    #[arg(long, global = true, env = "REGSYNC_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Bearer token
    #[arg(long, global = true, env = "REGSYNC_BEARER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Value for the ProjectId header
    #[arg(long, global = true, env = "REGSYNC_PROJECT_ID")]
    project_id: Option<String>,

    /// Entities processed at once
    #[arg(long, global = true, default_value_t = 8)]
    concurrency: usize,

    #[arg(long, global = true, default_value_t = 50)]
    page_size: u32,

    #[arg(long, global = true, default_value_t = 10_000)]
    max_pages: u32,

    /// Attempts per request, first one included
    #[arg(long, global = true, default_value_t = 5)]
    max_attempts: u32,

    #[arg(long, global = true, default_value_t = 1000)]
    backoff_ms: u64,

    #[arg(long, global = true, default_value_t = 20_000)]
    max_backoff_ms: u64,

    #[arg(long, global = true, default_value_t = 60)]
    timeout_secs: u64,

    /// Directory for the result CSV and JSON
    #[arg(long, global = true, default_value = ".")]
    out_dir: PathBuf,

    /// Only process the first N listed entities
    #[arg(long, global = true)]
    limit: Option<usize>,

    /// Environment file loaded before flags are read; a missing file is ignored
    #[arg(long, global = true, default_value = ".env")]
    dotenv: PathBuf,

    /// bar, log or none
    #[arg(long, global = true, default_value = "bar")]
    progress: ProgressMode,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Also append log lines to this file
    #[arg(long, global = true, env = "REGSYNC_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Perform writes
    #[arg(long, global = true, conflicts_with = "dry_run")]
    apply: bool,

    /// Plan only (default)
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add or remove permissions on every user
    Permissions {
        #[arg(long, num_args = 1.., value_delimiter = ',')]
        add: Vec<String>,

        #[arg(long, num_args = 1.., value_delimiter = ',')]
        remove: Vec<String>,

        /// Users whose email is in this domain are left untouched
        #[arg(long = "exclude-domain", num_args = 1.., value_delimiter = ',')]
        exclude_domains: Vec<String>,
    },

    /// Add or remove project ids on every user
    Projects {
        #[arg(long, num_args = 1.., value_delimiter = ',')]
        add: Vec<String>,

        #[arg(long, num_args = 1.., value_delimiter = ',')]
        remove: Vec<String>,

        /// Grant every project the registry lists
        #[arg(long, conflicts_with = "add")]
        all_projects: bool,
    },

    /// Rewrite user emails from one domain to another
    EmailDomain {
        #[arg(long)]
        from_domain: String,

        #[arg(long)]
        to_domain: String,

        /// Domains that are never rewritten
        #[arg(
            long = "protect-domain",
            num_args = 1..,
            value_delimiter = ',',
            default_value = DEFAULT_PROTECTED_DOMAIN
        )]
        protect_domains: Vec<String>,
    },

    /// Create users from a CSV file
    CreateUsers {
        /// email, firstName, lastName required; roleCode, npi, tin optional
        #[arg(long)]
        csv: PathBuf,

        /// Permission granted to every new user
        #[arg(long = "permission", num_args = 1.., value_delimiter = ',')]
        permissions: Vec<String>,

        /// Project granted to every new user
        #[arg(long = "project", num_args = 1.., value_delimiter = ',')]
        projects: Vec<String>,
    },

    /// Clinical-concepts load flag and document count for every subject
    AuditStatus,

    /// Record every user's permissions and project ids
    Backup {
        /// Keep the full user record in the JSON output
        #[arg(long)]
        include_full: bool,
    },
}

impl Cli {
    fn mode(&self) -> ApplyMode {
        ApplyMode::from_apply_flag(self.apply && !self.dry_run)
    }

    fn run_config(&self) -> Result<RunConfig, ConfigError> {
        RunConfig::builder(&self.base_url, self.token.clone().unwrap_or_default())
            .project_id(self.project_id.clone())
            .concurrency(self.concurrency)
            .page_size(self.page_size)
            .max_pages(self.max_pages)
            .retry(RetryPolicy::new(
                self.max_attempts,
                Duration::from_millis(self.backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            ))
            .timeout(Duration::from_secs(self.timeout_secs))
            .mode(self.mode())
            .build()
    }

    fn run_options(&self) -> RunOptions {
        RunOptions {
            out_dir: self.out_dir.clone(),
            limit: self.limit,
            progress: self.progress,
        }
    }
}

/// `--dotenv` has to be found before clap runs so the file can feed the
/// `env` fallbacks.
fn dotenv_path(args: &[String]) -> PathBuf {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--dotenv" {
            if let Some(path) = iter.next() {
                return PathBuf::from(path);
            }
        } else if let Some(path) = arg.strip_prefix("--dotenv=") {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(".env")
}

/// Load `path` into the environment. Variables already set win.
fn load_dotenv(path: &Path) -> Result<bool, dotenvy::Error> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<PreconditionError>().is_some()
        || err.downcast_ref::<ConfigError>().is_some()
    {
        return EXIT_PRECONDITION;
    }
    match err.downcast_ref::<SyncError>() {
        Some(e) if e.is_precondition() => EXIT_PRECONDITION,
        Some(SyncError::Cancelled) => EXIT_CANCELLED,
        _ => EXIT_FAILURES,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let dotenv = dotenv_path(&args);
    let loaded = load_dotenv(&dotenv);

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if let Err(err) = regsync_core::init_tracing(cli.json, level, cli.log_file.as_deref()) {
        let err = anyhow::Error::from(err);
        eprintln!("Error: {:#}", err);
        return ExitCode::from(exit_code_for(&err));
    }

    match loaded {
        Ok(true) => info!(path = %dotenv.display(), "loaded environment file"),
        Ok(false) => {}
        Err(e) => warn!(path = %dotenv.display(), error = %e, "could not load environment file"),
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{:#}", err), "run failed");
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = cli.run_config()?;
    let options = cli.run_options();

    let transport = http_transport(&config).context("Failed to build HTTP client")?;
    let metrics = RunMetrics::new().with_transport(transport.stats());
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let ctx = JobContext::new(transport, config).with_metrics(metrics);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight entities");
            on_signal.cancel();
        }
    });

    let outcome = match cli.command {
        Commands::Permissions {
            add,
            remove,
            exclude_domains,
        } => {
            let job = UpdateJob::permissions(add, remove, exclude_domains)?;
            execute(job, ctx, options, cancel).await?
        }
        Commands::Projects {
            add,
            remove,
            all_projects,
        } => {
            let add = if all_projects {
                let ids = all_project_ids(&ctx)
                    .await
                    .context("Failed to list projects")?;
                if ids.is_empty() {
                    return Err(PreconditionError::InvalidChange(
                        "the project listing is empty".to_string(),
                    )
                    .into());
                }
                ids
            } else {
                add
            };
            let job = UpdateJob::projects(add, remove)?;
            execute(job, ctx, options, cancel).await?
        }
        Commands::EmailDomain {
            from_domain,
            to_domain,
            protect_domains,
        } => {
            let job = UpdateJob::email_domain(&from_domain, &to_domain, protect_domains)?;
            execute(job, ctx, options, cancel).await?
        }
        Commands::CreateUsers {
            csv,
            permissions,
            projects,
        } => {
            let job = CreateUsersJob::from_csv(&csv, permissions, projects)?;
            execute(job, ctx, options, cancel).await?
        }
        Commands::AuditStatus => execute(AuditStatusJob::new(), ctx, options, cancel).await?,
        Commands::Backup { include_full } => {
            execute(BackupJob::new(include_full), ctx, options, cancel).await?
        }
    };

    print_summary(&outcome);
    Ok(outcome.exit_code())
}

async fn execute<J: Job>(
    job: J,
    ctx: JobContext,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let name = job.name();
    let outcome = run_job(Arc::new(job), ctx, options, cancel)
        .await
        .with_context(|| format!("{} run failed", name))?;
    Ok(outcome)
}

fn print_summary(outcome: &RunOutcome) {
    let counts = &outcome.summary.counts;
    println!("Run:       {}", outcome.run_id);
    println!(
        "Results:   applied={} dry_run={} skipped={} excluded={} failed={}",
        counts.applied, counts.dry_run, counts.skipped, counts.excluded, counts.failed
    );
    if counts.write_errors > 0 {
        println!("Unsaved:   {} rows could not be written", counts.write_errors);
    }
    if outcome.duplicates > 0 {
        println!("Dropped:   {} duplicate ids", outcome.duplicates);
    }
    if outcome.cancelled {
        println!("Cancelled: {} entities not started", outcome.not_started);
    }
    println!("CSV:       {}", outcome.summary.csv_path.display());
    println!("JSON:      {}", outcome.summary.json_path.display());
}
