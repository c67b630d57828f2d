use clap::Parser;
use cronmgr_gateway::{cli, runtime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::init_tracing();
    cli::run(cli::Cli::parse()).await
}
