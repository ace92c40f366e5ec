#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = missive::Cli::parse();
    missive_common::logging::init()?;

    let receipt = missive::run(cli).await?;
    println!("{}", receipt.reply);

    Ok(())
}
