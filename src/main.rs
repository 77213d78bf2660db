use clap::Parser;
use tracing_subscriber::EnvFilter;

use auto_config::Cli;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
        built = option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        "autoconfig starting"
    );

    match auto_config::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr; stdout carries only the report. `RUST_LOG` wins over
/// `-v`.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "auto_config=info,autoconfig=info",
        1 => "auto_config=debug,autoconfig=debug",
        _ => "auto_config=trace,autoconfig=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
