//! kpistore CLI entry point.

use kpistore_lib::cli::{self, Cli};
use kpistore_lib::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli::execute(cli).await
}
