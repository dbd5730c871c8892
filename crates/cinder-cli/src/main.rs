use anyhow::Result;
use clap::Parser;

mod bridge;
mod completion;
mod dispatch;
mod download;
mod elevated;
mod render;


fn main() -> Result<()> {
    let cli = dispatch::Cli::parse();
    dispatch::run_cli(cli)
}
