//! CLI Commands
//!
//! Every command opens a [`Session`]: both transports, the vault with its
//! persisted credentials, and the loaded wallet.

pub mod add_root;
pub mod derive;
pub mod import_root;
pub mod nodes;
pub mod remove;
pub mod send;
pub mod sync;

use anyhow::{anyhow, Context, Result};
use std::io::{self, Write};
use std::sync::Arc;
use zeroize::Zeroizing;

use wallet_sync::config::Config;
use wallet_sync::remote::{ChainClient, Credentials, RpcSigningAuthority, Signer};
use wallet_sync::storage::{load_json, save_json, FileStorage, Storage};
use wallet_sync::transport::{Transport, TransportConfig};
use wallet_sync::vault::{CredentialVault, SignerVault};
use wallet_sync::wallet::Wallet;

/// Storage name of the credential record.
pub const CREDENTIALS_DOCUMENT: &str = "credentials";

/// Everything a command needs.
pub struct Session {
    pub wallet: Wallet,
    pub vault: Arc<SignerVault>,
    storage: Arc<FileStorage>,
    signer_transport: Arc<Transport>,
    chain_transport: Arc<Transport>,
}

impl Session {
    /// Connect to the signing authority and the chain server, restore the
    /// credential record and load the wallet.
    pub async fn open(config: &Config) -> Result<Self> {
        let storage = Arc::new(FileStorage::new(config.wallet.data_dir.clone()));

        let signer_transport = Arc::new(Transport::new(
            config.signer.connector()?,
            TransportConfig::default(),
        ));
        signer_transport
            .connect()
            .await
            .with_context(|| format!("Cannot start signing authority {}", signer_transport.describe()))?;
        let signer = Signer::new(Arc::new(RpcSigningAuthority::new(signer_transport.clone())));

        let vault = Arc::new(SignerVault::new(signer.clone(), config.wallet.relock_after()));
        if let Some(credentials) = load_json::<Credentials>(storage.as_ref(), CREDENTIALS_DOCUMENT)? {
            vault.load_credentials(credentials).await?;
        }

        let chain_transport = Arc::new(Transport::new(
            config.server.connector(),
            config.server.transport_config(),
        ));
        let chain = ChainClient::new(chain_transport.clone());

        let storage_dyn: Arc<dyn Storage> = storage.clone();
        let vault_dyn: Arc<dyn CredentialVault> = vault.clone();
        let mut wallet = Wallet::new(
            chain,
            signer,
            vault_dyn,
            storage_dyn,
            config.wallet.address_batch,
        );

        wallet
            .start()
            .await
            .with_context(|| format!("Cannot reach chain server {}", chain_transport.describe()))?;
        wallet.load().await?;

        Ok(Self {
            wallet,
            vault,
            storage,
            signer_transport,
            chain_transport,
        })
    }

    /// Unlock the wallet, setting a passphrase first if none exists yet.
    pub async fn unlock(&mut self) -> Result<()> {
        if !self.vault.has_passphrase() {
            println!("No passphrase set. Choose one to protect private keys.");
            let passphrase = prompt_password("New passphrase: ")?;
            let confirm = prompt_password("Confirm passphrase: ")?;
            if *passphrase != *confirm {
                return Err(anyhow!("Passphrases do not match"));
            }
            let credentials = self.vault.set_passphrase(&passphrase).await?;
            save_json(self.storage.as_ref(), CREDENTIALS_DOCUMENT, &credentials)?;
            if let Some(root) = self.wallet.active_root().map(|n| n.id()) {
                self.wallet.unlock_node(&root).await?;
            }
            return Ok(());
        }

        if !self.vault.is_locked() {
            return Ok(());
        }
        let passphrase = prompt_password("Passphrase: ")?;
        self.wallet.unlock(&passphrase).await?;
        Ok(())
    }

    /// Save and tear both connections down.
    pub fn close(self) -> Result<()> {
        self.wallet.save()?;
        self.chain_transport.shutdown();
        self.signer_transport.shutdown();
        Ok(())
    }
}

/// Prompt for password input (hidden)
pub fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let password = rpassword::read_password()?;
    Ok(Zeroizing::new(password))
}

/// Prompt for confirmation
pub fn prompt_confirm(message: &str) -> Result<bool> {
    print!("{} [y/N]: ", message);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y") || input.trim().eq_ignore_ascii_case("yes"))
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("\x1b[31mError:\x1b[0m {}", message);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("\x1b[32m{}\x1b[0m", message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("\x1b[33mWarning:\x1b[0m {}", message);
}
