//! Child node derivation command

use anyhow::{anyhow, Result};

use wallet_sync::config::Config;
use wallet_sync::node::Node;

use super::{print_success, Session};

/// Run the derive command
pub async fn run(config: &Config, index: Option<u32>, watch_only: bool) -> Result<()> {
    let mut session = Session::open(config).await?;

    let root = session
        .wallet
        .active_root()
        .map(Node::id)
        .ok_or_else(|| anyhow!("No root node. Run 'wallet-sync add-root' first."))?;

    if !watch_only {
        session.unlock().await?;
    }

    let index = index.unwrap_or_else(|| session.wallet.next_child_index());
    let id = session
        .wallet
        .derive_child_node(&root, index, watch_only)
        .await?;
    print_success(&format!("Derived node {} at m/{}'", id, index));

    session.close()
}
