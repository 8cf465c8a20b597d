//! Reconciliation of one node against the chain server
//!
//! A pass over a derived node:
//! 1. restore the node in the signing authority so it becomes the address
//!    source
//! 2. list its addresses up to the node's watermarks
//! 3. for each address not yet watched: subscribe and fetch its history
//! 4. feed each history through the transaction pipeline
//! 5. refresh address balances and history from the authority and sum the
//!    balance
//!
//! Root nodes stop after step 1. Addresses are processed concurrently; the
//! pipeline inside one address is strictly sequential. A failure on one
//! address is logged and does not stop the others.

use futures::future::join_all;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::error::WalletError;
use crate::node::Node;
use crate::remote::{AddressStatus, ChainClient, Signer, TxStatus};

/// Upper bound on watermark extensions within one pass.
const MAX_EXTENSION_ROUNDS: usize = 32;

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Addresses newly watched in this pass
    pub newly_watched: usize,
    /// Addresses whose pipeline failed
    pub failed: usize,
    /// Raw transactions fetched and reported
    pub transactions_fetched: usize,
    /// Highest block height confirmed with the authority
    pub highest_confirmed: Option<u64>,
    pub balance: u64,
}

impl ReconcileReport {
    fn absorb(&mut self, outcome: &PipelineOutcome) {
        self.transactions_fetched += outcome.transactions_fetched;
        self.highest_confirmed = self.highest_confirmed.max(outcome.highest_confirmed);
    }
}

/// Result of the transaction pipeline for one address history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub transactions_fetched: usize,
    pub highest_confirmed: Option<u64>,
}

/// Drives reconciliation passes.
#[derive(Clone)]
pub struct Reconciler {
    chain: ChainClient,
    signer: Signer,
    address_batch: u32,
}

impl Reconciler {
    pub fn new(chain: ChainClient, signer: Signer, address_batch: u32) -> Self {
        Self {
            chain,
            signer,
            address_batch,
        }
    }

    /// Full pass over `node`.
    pub async fn reconcile_node(&self, node: &mut Node) -> Result<ReconcileReport, WalletError> {
        let restored = self
            .signer
            .restore_node(&node.ext_pub_b58, node.ext_prv_enc.as_deref())
            .await?;
        if restored.fp != node.fingerprint || restored.pfp != node.parent_fingerprint {
            return Err(WalletError::Protocol(format!(
                "signing authority restored {} as {}",
                node.id(),
                restored.fp
            )));
        }

        let mut report = ReconcileReport::default();
        if node.is_root() {
            debug!("Root node {} has no addresses", node.id());
            return Ok(report);
        }

        for _ in 0..MAX_EXTENSION_ROUNDS {
            let statuses = self.signer.get_addresses().await?;
            let mut fresh: Vec<AddressStatus> = Vec::new();
            for status in statuses {
                if node.within_watermark(&status) && node.watch(&status) {
                    fresh.push(status);
                }
            }
            report.newly_watched += fresh.len();

            if !fresh.is_empty() {
                debug!("Watching {} new addresses for {}", fresh.len(), node.id());
            }

            let results = join_all(fresh.iter().map(|s| self.track_address(&s.addr_b58))).await;
            for (status, result) in fresh.iter().zip(results) {
                match result {
                    Ok(outcome) => report.absorb(&outcome),
                    Err(e) => {
                        warn!("Reconciling address {} failed: {}", status.addr_b58, e);
                        report.failed += 1;
                    }
                }
            }

            self.refresh(node).await?;

            if fresh.is_empty() || !node.extend_watermarks(self.address_batch) {
                break;
            }
            debug!(
                "Extended watermarks of {} to {}/{}",
                node.id(),
                node.public_watermark,
                node.change_watermark
            );
        }

        node.addresses_enumerated = true;
        report.balance = node.balance;
        info!(
            "Reconciled {}: {} addresses, balance {}",
            node.id(),
            node.watched_count(),
            node.balance
        );
        Ok(report)
    }

    /// React to an address-changed notification. Unwatched addresses are
    /// ignored and `Ok(None)` is returned.
    pub async fn address_changed(
        &self,
        node: &mut Node,
        address: &str,
    ) -> Result<Option<PipelineOutcome>, WalletError> {
        if !node.is_watching(address) {
            debug!("Ignoring change of unwatched address {}", address);
            return Ok(None);
        }
        let history = self.chain.get_address_history(address).await?;
        let outcome = self.process_history(&history).await?;
        self.refresh(node).await?;
        Ok(Some(outcome))
    }

    /// Subscribe to one address and run its initial history through the
    /// pipeline.
    async fn track_address(&self, address: &str) -> Result<PipelineOutcome, WalletError> {
        self.chain.subscribe_address(address).await?;
        let history = self.chain.get_address_history(address).await?;
        self.process_history(&history).await
    }

    /// Report statuses, fetch and report every transaction the authority
    /// does not know yet, then confirm the blocks of confirmed ones.
    pub async fn process_history(&self, history: &[TxStatus]) -> Result<PipelineOutcome, WalletError> {
        let mut outcome = PipelineOutcome::default();
        if history.is_empty() {
            return Ok(outcome);
        }

        let unknown = self.signer.report_tx_statuses(history).await?;
        for tx_hash in &unknown {
            let raw = self.chain.get_transaction(tx_hash).await?;
            self.signer.report_txs(&[raw]).await?;
            outcome.transactions_fetched += 1;
        }

        let heights: BTreeSet<u64> = history
            .iter()
            .filter(|s| s.is_confirmed())
            .map(|s| s.height as u64)
            .collect();
        for height in heights {
            let header = self.chain.get_block_header(height).await?;
            self.signer
                .confirm_block(header.block_height, header.timestamp)
                .await?;
            outcome.highest_confirmed = outcome.highest_confirmed.max(Some(header.block_height));
        }

        Ok(outcome)
    }

    /// Pull balances and history from the authority into the node.
    async fn refresh(&self, node: &mut Node) -> Result<(), WalletError> {
        let statuses = self.signer.get_addresses().await?;
        for status in &statuses {
            if node.is_watching(&status.addr_b58) {
                node.apply_status(status);
            }
        }
        node.transactions = self.signer.get_history().await?;
        node.recalculate_balance();
        Ok(())
    }
}
