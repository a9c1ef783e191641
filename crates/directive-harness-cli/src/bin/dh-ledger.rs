use anyhow::Result;
use clap::Parser;
use directive_harness_cli::admin::{run_ledger_cli, LedgerCli};

fn main() -> Result<()> {
    let cli = LedgerCli::parse();
    directive_harness_cli::init_logging("warn");
    run_ledger_cli(cli, &mut std::io::stdout().lock())
}
