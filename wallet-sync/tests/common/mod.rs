//! Shared fixtures for the integration tests.
//!
//! - [`ChainServer`]: in-process Electrum-style server reached through a
//!   duplex stream, answering from scripted state
//! - [`ScriptedSigner`]: signing authority with deterministic key material
//! - [`Harness`]: both wired into wallets sharing one storage

#![allow(dead_code)]

mod chain;
mod signer;

pub use chain::*;
pub use signer::*;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use wallet_sync::remote::{ChainClient, Signer};
use wallet_sync::storage::MemoryStorage;
use wallet_sync::transport::{DisconnectPolicy, Transport, TransportConfig};
use wallet_sync::vault::SignerVault;
use wallet_sync::Wallet;

pub const ADDRESS_BATCH: u32 = 8;

pub fn test_transport_config(policy: DisconnectPolicy) -> TransportConfig {
    TransportConfig {
        connect_timeout: Duration::from_secs(2),
        backoff_min: Duration::from_millis(5),
        backoff_max: Duration::from_millis(50),
        max_line_bytes: 256 * 1024,
        on_disconnect: policy,
    }
}

/// Fail the test instead of hanging.
pub async fn settle<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("future did not settle")
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    settle(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub struct Harness {
    pub chain: ChainServer,
    pub signer: Arc<ScriptedSigner>,
    pub storage: MemoryStorage,
    pub policy: DisconnectPolicy,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            chain: ChainServer::new(),
            signer: ScriptedSigner::new(),
            storage: MemoryStorage::new(),
            policy: DisconnectPolicy::Abandon,
        }
    }

    pub fn transport(&self) -> Arc<Transport> {
        Arc::new(Transport::new(
            self.chain.connector(),
            test_transport_config(self.policy),
        ))
    }

    pub fn signer(&self) -> Signer {
        Signer::new(self.signer.clone())
    }

    pub fn chain_client(&self) -> ChainClient {
        ChainClient::new(self.transport())
    }

    /// A wallet with its own connection and vault. Not loaded.
    pub async fn wallet(&self) -> (Wallet, Arc<SignerVault>) {
        let signer = self.signer();
        let vault = Arc::new(SignerVault::new(signer.clone(), Duration::from_secs(60)));
        let mut wallet = Wallet::new(
            self.chain_client(),
            signer,
            vault.clone(),
            Arc::new(self.storage.clone()),
            ADDRESS_BATCH,
        );
        settle(wallet.start()).await.unwrap();
        (wallet, vault)
    }

    /// A wallet with an unlocked vault, one root and one derived node.
    pub async fn funded_wallet(&self) -> (Wallet, Arc<SignerVault>) {
        let (mut wallet, vault) = self.wallet().await;
        settle(vault.set_passphrase(PASSPHRASE)).await.unwrap();
        let root = settle(wallet.add_random_root_node()).await.unwrap();
        settle(wallet.derive_child_node(&root, 0, false)).await.unwrap();
        (wallet, vault)
    }
}
