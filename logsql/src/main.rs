//! Entrypoint of the logsql binary

use dotenvy::dotenv;
use logsql_clap_blocks::logging::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands {
    pub(crate) mod serve;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "logsql",
    version,
    about = "Log search over object storage",
    long_about = r#"Log search over object storage

Examples:
    # Run the server with its config descriptor in a local directory
    logsql serve --meta-store file --meta-data-dir ~/.logsql

    # Run the server against a descriptor in an S3 compatible service
    logsql serve --meta-store s3 --meta-endpoint http://minio:9000 --meta-bucket meta

    # Run the server with debug logging
    LOG_FILTER=debug logsql serve
"#
)]
struct Config {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Run the search and ingestion server
    Serve(commands::serve::Config),
}

#[tokio::main]
async fn main() {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    match config.command {
        None => println!("command required, -h/--help for help"),
        Some(Command::Serve(config)) => {
            if let Err(e) = init_logs(&config.logging_config) {
                eprintln!("Initializing logs failed: {e}");
                std::process::exit(ReturnCode::Failure as _);
            }
            if let Err(e) = commands::serve::command(config).await {
                eprintln!("Serve command failed: {e}");
                std::process::exit(ReturnCode::Failure as _)
            }
        }
    }
}

fn init_logs(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(config.filter())?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()?;
    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing env file is not an error
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}
