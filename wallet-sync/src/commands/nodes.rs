//! Node listing command

use anyhow::Result;

use wallet_sync::config::Config;
use wallet_sync::node::{child_label, Node};

use super::{print_warning, Session};

/// Run the nodes command
pub async fn run(config: &Config) -> Result<()> {
    let session = Session::open(config).await?;
    let wallet = &session.wallet;

    if !wallet.is_key_set() {
        print_warning("No root node. Run 'wallet-sync add-root' or 'wallet-sync import-root'.");
        return session.close();
    }

    let active_root = wallet.active_root().map(Node::id);
    let active_child = wallet.active_child().map(Node::id);

    println!();
    println!("Root nodes ({}):", wallet.root_nodes().len());
    for node in wallet.root_nodes() {
        let marker = if Some(node.id()) == active_root { "*" } else { " " };
        let lock = if node.is_unlocked() { "unlocked" } else { "locked" };
        println!("  {} {}  {}  {}", marker, node.fingerprint, node.path, lock);
    }

    println!();
    println!("Derived nodes ({}):", wallet.child_nodes().len());
    for node in wallet.child_nodes() {
        let marker = if Some(node.id()) == active_child { "*" } else { " " };
        let kind = if node.is_watch_only() { "watch-only" } else { "spendable" };
        println!(
            "  {} {}  {:<8} {:<10} child {}",
            marker,
            node.fingerprint,
            node.path,
            kind,
            child_label(node.child_num)
        );
        if Some(node.id()) == active_child {
            println!("      balance: {}", node.balance);
            for address in node.addresses.values().filter(|a| node.is_watching(&a.address)) {
                println!(
                    "      {:<36} {:>14} ({} txs)",
                    address.address, address.balance, address.tx_count
                );
            }
        }
    }

    println!();
    println!("Height: {}", wallet.height());
    if wallet.pending_requests() > 0 {
        print_warning(&format!("{} requests still pending", wallet.pending_requests()));
    }

    session.close()
}
