//! Node removal command

use anyhow::Result;

use wallet_sync::config::Config;
use wallet_sync::node::Node;

use super::{print_error, print_success, prompt_confirm, Session};

/// Run the remove command
pub async fn run(config: &Config, fingerprint: &str, child_index: u32) -> Result<()> {
    let mut session = Session::open(config).await?;

    let Some(id) = session.wallet.tree().find(fingerprint, child_index).map(Node::id) else {
        print_error(&format!("No node {} with child index {}", fingerprint, child_index));
        return session.close();
    };

    if !prompt_confirm(&format!("Remove node {}?", id))? {
        println!("Cancelled.");
        return session.close();
    }

    session.wallet.remove_node(&id).await?;
    print_success(&format!("Removed node {}", id));

    session.close()
}
