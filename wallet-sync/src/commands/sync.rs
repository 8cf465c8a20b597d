//! Wallet sync command

use anyhow::Result;
use tracing::warn;

use wallet_sync::config::Config;

use super::{print_success, print_warning, Session};

/// Run the sync command
pub async fn run(config: &Config, once: bool) -> Result<()> {
    let mut session = Session::open(config).await?;

    let Some(node) = session.wallet.active_child() else {
        print_warning("No derived node. Run 'wallet-sync derive' first.");
        return session.close();
    };
    println!("Node {} balance: {}", node.id(), node.balance);
    println!("Height: {}", session.wallet.height());

    if !once {
        println!("Following chain updates, press Ctrl-C to stop...");
        session
            .wallet
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await?;
        print_success(&format!("Stopped at height {}, balance {}", session.wallet.height(), session.wallet.balance()));
    }

    session.close()
}
