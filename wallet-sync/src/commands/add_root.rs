//! Root node generation command

use anyhow::Result;

use wallet_sync::config::Config;

use super::{print_success, Session};

/// Run the add-root command
pub async fn run(config: &Config) -> Result<()> {
    let mut session = Session::open(config).await?;
    session.unlock().await?;

    let id = session.wallet.add_random_root_node().await?;
    print_success(&format!("Created root node {}", id));

    session.close()
}
