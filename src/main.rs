use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use nr_modemd::app::AppHandles;
use nr_modemd::config::AppConfig;
use std::path::PathBuf;
use tracing::log::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "nr-modemd")]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct CliArguments {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();
}

fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = CliArguments::parse();
    let config = AppConfig::load(args.config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            let handles = AppHandles::new(config).await?;
            info!("nr-modemd is up");
            handles.run().await;
            Ok(())
        })
}
