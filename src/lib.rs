pub mod charset;
pub mod config;
pub mod pattern;
pub mod prompt;
pub mod props;
pub mod resource;
pub mod runtime;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::error;

use charset::Charset;
use config::Settings;
use pattern::PatternSet;
use prompt::TerminalPrompter;
use resource::ResourceManager;
use resource::context::RunContext;
use runtime::{ConfigRuntime, InteractiveMode, OutputMode, PackageType, RuntimeOptions};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "autoconfig",
    version,
    about = "Resolve configuration placeholders in local, HTTP and SFTP deployments"
)]
pub struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan destinations and resolve their placeholders
    Run(RunArgs),
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Destinations: directories, archives or descriptor files (path, file:, http(s): or sftp: URL)
    #[arg(required = true, value_name = "DEST")]
    pub destinations: Vec<String>,

    /// User properties file; its values win over shared ones
    #[arg(short, long, value_name = "LOCATION")]
    pub user_properties: Option<String>,

    /// Shared properties files, earlier ones win (replaces the configured list)
    #[arg(short, long, value_name = "LOCATION")]
    pub shared_properties: Vec<String>,

    /// When to ask for values interactively
    #[arg(short, long, value_enum)]
    pub interactive: Option<InteractiveMode>,

    /// Fail and write nothing when a placeholder stays undefined
    #[arg(long)]
    pub strict: bool,

    /// Descriptor include patterns, comma separated (e.g. `conf/*.xml,**/*.properties`)
    #[arg(short, long, value_name = "PATTERNS")]
    pub descriptors: Option<String>,

    /// Descriptor exclude patterns, comma separated
    #[arg(long, value_name = "PATTERNS")]
    pub exclude_descriptors: Option<String>,

    /// Destination include patterns, comma separated
    #[arg(short, long, value_name = "PATTERNS")]
    pub packages: Option<String>,

    /// Destination exclude patterns, comma separated
    #[arg(long, value_name = "PATTERNS")]
    pub exclude_packages: Option<String>,

    /// Treat every destination as this package type
    #[arg(short = 't', long = "type", value_enum)]
    pub package_type: Option<PackageType>,

    /// Explode archives into directories instead of repacking them
    #[arg(short = 'x', long)]
    pub explode: bool,

    /// Write results below this directory instead of in place
    #[arg(short, long, value_name = "DIR", conflicts_with = "dry_run")]
    pub output: Option<PathBuf>,

    /// Resolve and report without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Charset of property files (utf-8, iso-8859-1, us-ascii)
    #[arg(short, long)]
    pub charset: Option<String>,

    /// Settings file (defaults to the platform config dir)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Destinations scanned in parallel
    #[arg(long)]
    pub workers: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute a parsed command line. Returns the process exit code.
pub fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => run_destinations(args),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "autoconfig", &mut std::io::stdout());
            Ok(0)
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(0)
        }
    }
}

fn run_destinations(args: RunArgs) -> Result<i32> {
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    let options = runtime_options(&args, &settings)?;

    let prompter = Arc::new(TerminalPrompter::new());
    let context = RunContext::new(prompter.clone()).with_default_charset(Charset::from_locale());
    let manager = Arc::new(ResourceManager::new(
        Arc::new(context),
        settings.session_settings(),
    ));
    let runtime = ConfigRuntime::new(manager.clone(), options)
        .context("starting worker pools")?
        .with_interaction(prompter);

    let report = runtime.run();
    manager.close_all();

    if args.json {
        println!("{}", report.to_json().context("rendering report")?);
    } else {
        println!("{}", report.render_summary());
    }

    match report.into_result() {
        Ok(_) => Ok(0),
        Err(e) => {
            error!(error = %e, "run did not succeed");
            Ok(1)
        }
    }
}

/// Settings overlaid with command-line flags.
fn runtime_options(args: &RunArgs, settings: &Settings) -> Result<RuntimeOptions> {
    let charset = match &args.charset {
        Some(label) => Some(Charset::parse(label)?),
        None => settings.charset()?,
    };
    let output = match (&args.output, args.dry_run) {
        (_, true) => OutputMode::DryRun,
        (Some(dir), false) => OutputMode::Directory(dir.clone()),
        (None, false) => OutputMode::InPlace,
    };
    let shared_properties = if args.shared_properties.is_empty() {
        settings.shared_properties.clone()
    } else {
        args.shared_properties.clone()
    };

    Ok(RuntimeOptions {
        destinations: args.destinations.clone(),
        descriptor_patterns: PatternSet::parse_list(
            args.descriptors.as_deref(),
            args.exclude_descriptors.as_deref(),
        )
        .context("descriptor patterns")?,
        package_patterns: PatternSet::parse_list(
            args.packages.as_deref(),
            args.exclude_packages.as_deref(),
        )
        .context("package patterns")?,
        declared_type: args.package_type,
        user_properties: args.user_properties.clone(),
        shared_properties,
        interactive: args.interactive.unwrap_or(settings.interactive),
        strict: args.strict || settings.strict,
        charset,
        output,
        explode: args.explode,
        workers: args.workers.unwrap_or(settings.workers).max(1),
        listing_concurrency: settings.listing_concurrency,
    })
}
