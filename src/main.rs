use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use glob::Pattern;
use log::{LevelFilter, info, warn};
use relabel::commands::{self, replace::ReplaceOptions, scan::ScanOptions};
use relabel::config::Config;
use relabel::error::OrganisationRequired;
use std::io::Write;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "relabel")]
#[command(about = "CLI to replace runs-on labels across the workflows of an organisation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Base URL of the workflow API (overrides RELABEL_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Concurrent requests per batch (overrides RELABEL_CONCURRENCY)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the organisations available to the token
    Orgs,
    /// List the repositories of an organisation
    Repos {
        #[arg(long)]
        org: Option<String>,
    },
    /// List, add or remove replacement labels
    Labels {
        #[command(subcommand)]
        action: Option<LabelAction>,
    },
    /// Show the runs-on labels of every workflow in an organisation
    Scan(ScanArgs),
    /// Replace runs-on labels and commit the rewritten workflows
    Replace {
        #[command(flatten)]
        scan: ScanArgs,

        /// Label to replace, can be repeated
        #[arg(long = "from", required = true)]
        from: Vec<String>,

        /// Label that takes the place of the replaced ones
        #[arg(long)]
        to: String,

        /// Commit the changes instead of only showing the diff
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum LabelAction {
    /// Store a custom replacement label
    Add { label: String },
    /// Remove a custom replacement label
    Remove { label: String },
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long)]
    org: Option<String>,

    /// Only these repositories, can be repeated
    #[arg(long = "repo")]
    repositories: Vec<String>,

    /// Glob matched against workflow paths, e.g. '.github/workflows/ci*.yml'
    #[arg(long)]
    path: Option<Pattern>,

    /// Fetch repositories that failed again
    #[arg(long)]
    retry: bool,
}

impl ScanArgs {
    fn into_options(self, config: &Config) -> Result<ScanOptions> {
        Ok(ScanOptions {
            organisation: self.org.ok_or(OrganisationRequired)?,
            repositories: self.repositories,
            path_filter: self.path,
            retry: self.retry,
            concurrency: config.concurrency,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    let config = Config::from_env()
        .with_verbose(cli.verbose)
        .with_api_url(cli.api_url)
        .with_concurrency(cli.concurrency);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current requests");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Orgs => commands::app::orgs(&config, &cancel).await?,
        Commands::Repos { org } => {
            let organisation = org.ok_or(OrganisationRequired)?;
            commands::app::repos(&config, &organisation, &cancel).await?;
        }
        Commands::Labels { action } => match action {
            None => commands::app::labels(&config, &cancel).await?,
            Some(LabelAction::Add { label }) => commands::app::add_label(&config, &label)?,
            Some(LabelAction::Remove { label }) => commands::app::remove_label(&config, &label)?,
        },
        Commands::Scan(scan) => {
            let options = scan.into_options(&config)?;
            commands::app::scan(&config, &options, &cancel).await?;
        }
        Commands::Replace {
            scan,
            from,
            to,
            yes,
        } => {
            let options = ReplaceOptions {
                scan: scan.into_options(&config)?,
                labels_to_replace: from,
                replacement: to,
                commit: yes,
            };
            let report = commands::app::replace(&config, &options, &cancel).await?;
            if let Some(commit) = report.commit {
                if let Some(error) = commit.aborted {
                    return Err(error.into());
                }
                if commit.failed.is_empty() {
                    info!(
                        "Replaced with {} in {} files",
                        report.replacement,
                        commit.committed.len()
                    );
                }
            }
        }
    }

    Ok(())
}

fn init_logging(cli: &Cli) {
    let mut builder = env_logger::builder();
    builder
        .filter_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format(|buf, record| {
            let level = record.level();
            let style = &buf.default_level_style(level);

            writeln!(buf, "[{style}{level}{style:#}] {}", record.args())
        });

    if !cli.verbose {
        builder.format_timestamp(None);
    }

    builder.init();
}
