use clap::Parser;
use firestarr::cli::{execute, Cli};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("firestarr: {e:#}");
            ExitCode::FAILURE
        }
    }
}
