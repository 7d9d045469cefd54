use brand_audit_cli::Cli;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Conventional exit status after SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = tokio::select! {
        result = brand_audit_cli::run(cli) => match result {
            Ok(()) => 0,
            Err(err) => brand_audit_cli::report_error(&err),
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            EXIT_INTERRUPTED
        }
    };

    std::process::exit(code);
}
