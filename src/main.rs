use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use merge_gate::analysis::QualityServiceClient;
use merge_gate::config::Config;
use merge_gate::eligibility::Policy;
use merge_gate::github::GitHubClient;
use merge_gate::pipeline::PipelineSettings;
use merge_gate::pr;
use merge_gate::report::{self, FanOutSink, JsonDirSink, ReportSink, TerminalSink};
use merge_gate::scheduler::BatchScheduler;

/// Merge Gate: evaluates open GitHub pull requests against code-quality
/// thresholds and merge policy, across many repositories concurrently.
#[derive(Parser, Debug)]
#[command(name = "merge-gate", version, about)]
struct Cli {
    /// Config file (defaults to .merge-gate.toml in the current directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of PRs evaluated concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Concurrent file analyses per PR
    #[arg(long)]
    fan_out: Option<usize>,

    /// Also write each verdict as JSON under this directory
    #[arg(long)]
    json_dir: Option<PathBuf>,

    /// Write the batch summary as markdown to this file instead of the terminal
    #[arg(long)]
    summary: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate every open PR of every repository listed in a file
    Batch {
        /// One repository URL per line; '#' comments and a `repo_url` CSV header are allowed
        repo_list: PathBuf,
    },
    /// Evaluate every open PR of one repository
    Repo {
        /// e.g. https://github.com/org/repo
        repo_url: String,
    },
    /// Evaluate a single pull request
    Pr {
        /// e.g. https://github.com/org/repo/pull/42
        pr_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("loading configuration");
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(workers) = cli.workers {
        config.concurrency.workers = workers;
    }
    if let Some(fan_out) = cli.fan_out {
        config.concurrency.fan_out = fan_out;
    }
    config.validate()?;
    debug!(
        workers = config.concurrency.workers,
        fan_out = config.concurrency.fan_out,
        "effective concurrency"
    );

    let http = reqwest::Client::builder()
        .timeout(config.retry.call_timeout())
        .build()?;
    let github = GitHubClient::new(
        http.clone(),
        config.github.api_base_url.clone(),
        config.github_token(),
    )
    .with_concurrency(config.github.max_concurrent_requests)
    .with_content_extensions(&config.analysis.analyzable_extensions);
    let analyzer = QualityServiceClient::new(http, config.analysis.base_url.clone());
    let policy = Policy::from_config(&config.policy)?;
    info!(predicates = ?policy.predicate_names(), "loaded merge policy");

    let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(TerminalSink)];
    if let Some(dir) = &cli.json_dir {
        sinks.push(Box::new(JsonDirSink::new(dir)));
    }

    let scheduler = BatchScheduler::new(
        Arc::new(github),
        Arc::new(analyzer),
        Arc::new(FanOutSink::new(sinks)),
        Arc::new(policy),
        PipelineSettings::from_config(&config),
        config.concurrency.clone(),
    );

    let cancel = scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling batch");
            cancel.cancel();
        }
    });

    let job = match &cli.command {
        Command::Batch { repo_list } => {
            let repos = pr::load_repo_list(repo_list)?;
            info!(repos = repos.len(), "loaded repository list");
            let span = info_span!("batch", list = %repo_list.display());
            scheduler.run(repos).instrument(span).await
        }
        Command::Repo { repo_url } => {
            let repo = pr::parse_repo_ref(repo_url)?;
            let span = info_span!("repo", repo = %repo);
            scheduler.run(vec![repo]).instrument(span).await
        }
        Command::Pr { pr_url } => {
            let parsed = pr::parse_pr_url(pr_url)?;
            let span = info_span!("pr", repo = %parsed.repo, pr = parsed.pr_number);
            scheduler.run_pr(parsed).instrument(span).await
        }
    };

    report::output(&job, cli.summary.as_deref())?;
    info!(
        eligible = job.eligible_count(),
        ineligible = job.ineligible_count(),
        failed = job.failed_count(),
        cancelled = job.cancelled,
        "done"
    );

    Ok(())
}
