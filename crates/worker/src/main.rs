use clap::Parser;

use sellerflow_infra::config::Config;
use sellerflow_worker::cli::{self, Cli};
use sellerflow_worker::Services;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sellerflow_observability::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let services = Services::from_config(config).await?;

    if let Some(output) = cli::execute(cli.command, services).await? {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}
