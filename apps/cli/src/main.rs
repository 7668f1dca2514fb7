//! Loresmith CLI — worldbook extraction from chunked long-form text.
//!
//! Feeds pre-split chunks through an LLM extraction pipeline and accumulates
//! the results into a rollback-capable structured worldbook.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
