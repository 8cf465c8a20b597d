//! Root node import command

use anyhow::Result;

use wallet_sync::config::Config;
use wallet_sync::error::WalletError;

use super::{print_error, print_success, prompt_password, Session};

/// Run the import-root command
pub async fn run(config: &Config, key: Option<String>) -> Result<()> {
    let mut session = Session::open(config).await?;

    let key = match key {
        Some(key) => zeroize::Zeroizing::new(key),
        None => prompt_password("Extended private key: ")?,
    };

    session.unlock().await?;

    match session.wallet.import_root_node(key.trim()).await {
        Ok(id) => print_success(&format!("Imported root node {}", id)),
        Err(WalletError::InvalidKey(message)) => print_error(&format!("Invalid key: {}", message)),
        Err(e) => return Err(e.into()),
    }

    session.close()
}
