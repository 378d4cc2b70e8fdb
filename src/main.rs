use anyhow::Result;
use clap::Parser;

use agent_hub::cli::{Cli, CliRunner};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    hub_session::observability::init_tracing(cli.verbose);

    let runner = CliRunner::new(&cli).await?;
    runner.run(&cli.command).await?;

    Ok(())
}
