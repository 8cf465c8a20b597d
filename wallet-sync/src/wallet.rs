//! Wallet orchestration
//!
//! [`Wallet`] owns the node tree, the active root and derived node, and the
//! highest block height seen. It wires the node manager and the reconciler
//! together and defines the load/save lifecycle:
//!
//! - `load` rebuilds every stored node through the signing authority, or
//!   fails as a whole and leaves the wallet empty
//! - tree-shape changes (add, import, derive, remove) are saved immediately
//! - `run` routes chain notifications until shutdown and resynchronizes
//!   after every reconnect

use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::error::WalletError;
use crate::node::{Node, NodeId};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::remote::{BlockHeader, ChainClient, Recipient, Signer};
use crate::storage::Storage;
use crate::transport::{Notification, NotificationMethod};
use crate::tree::{NodeManager, NodeTree};
use crate::vault::CredentialVault;

/// Storage name of the wallet document.
pub const WALLET_DOCUMENT: &str = "wallet";

/// The wallet aggregate.
pub struct Wallet {
    tree: NodeTree,
    manager: NodeManager,
    reconciler: Reconciler,
    chain: ChainClient,
    signer: Signer,
    vault: Arc<dyn CredentialVault>,
    storage: Arc<dyn Storage>,
    active_root: Option<NodeId>,
    active_child: Option<NodeId>,
    height: u64,
}

impl Wallet {
    pub fn new(
        chain: ChainClient,
        signer: Signer,
        vault: Arc<dyn CredentialVault>,
        storage: Arc<dyn Storage>,
        address_batch: u32,
    ) -> Self {
        Self {
            tree: NodeTree::new(),
            manager: NodeManager::new(signer.clone(), vault.clone()),
            reconciler: Reconciler::new(chain.clone(), signer.clone(), address_batch),
            chain,
            signer,
            vault,
            storage,
            active_root: None,
            active_child: None,
            height: 0,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn root_nodes(&self) -> &[Node] {
        self.tree.roots()
    }

    pub fn child_nodes(&self) -> &[Node] {
        self.tree.children()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.tree.get(id)
    }

    pub fn active_root(&self) -> Option<&Node> {
        self.active_root.as_ref().and_then(|id| self.tree.get(id))
    }

    pub fn active_child(&self) -> Option<&Node> {
        self.active_child.as_ref().and_then(|id| self.tree.get(id))
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Balance of the active derived node.
    pub fn balance(&self) -> u64 {
        self.active_child().map(|n| n.balance).unwrap_or(0)
    }

    pub fn next_child_index(&self) -> u32 {
        self.tree.next_child_index()
    }

    pub fn is_key_set(&self) -> bool {
        !self.tree.roots().is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.vault.is_locked()
    }

    /// Chain requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.chain.transport().pending_requests()
    }

    // ========================================================================
    // Load / save
    // ========================================================================

    /// Load the stored document and activate the first root and derived
    /// node. A missing document yields an empty wallet.
    pub async fn load(&mut self) -> Result<(), WalletError> {
        self.clear();

        let Some(bytes) = self.storage.load(WALLET_DOCUMENT)? else {
            info!("No stored wallet, starting empty");
            return Ok(());
        };

        let document = crate::node::WalletDocument::from_slice(&bytes)?;
        let mut tree = NodeTree::new();
        for record in document.root_nodes.iter().chain(document.nodes.iter()) {
            let node = match self.manager.restore(record).await {
                Ok(node) => node,
                Err(e) => {
                    error!("Discarding stored wallet: {}", e);
                    return Err(e);
                }
            };
            if !tree.insert(node) {
                warn!("Skipping duplicate stored node {}", record.id());
            }
        }

        info!(
            "Loaded {} root and {} derived nodes at height {}",
            tree.roots().len(),
            tree.children().len(),
            document.height
        );
        self.tree = tree;
        self.height = document.height;

        let first_root = self.tree.roots().first().map(Node::id);
        let first_child = self.tree.children().first().map(Node::id);
        self.set_active_root(first_root).await?;
        self.set_active_child(first_child).await?;
        Ok(())
    }

    /// Write the node tree and height to storage.
    pub fn save(&self) -> Result<(), WalletError> {
        let document = self.tree.to_document(self.height);
        crate::storage::save_json(self.storage.as_ref(), WALLET_DOCUMENT, &document)?;
        debug!("Saved wallet with {} nodes", self.tree.len());
        Ok(())
    }

    fn clear(&mut self) {
        self.tree.clear();
        self.active_root = None;
        self.active_child = None;
        self.height = 0;
    }

    // ========================================================================
    // Active selection
    // ========================================================================

    /// Switch the active root node. No-op if it already is active.
    pub async fn set_active_root(&mut self, id: Option<NodeId>) -> Result<(), WalletError> {
        if self.active_root == id {
            return Ok(());
        }
        if let Some(id) = &id {
            if !self.tree.get(id).is_some_and(Node::is_root) {
                return Err(WalletError::UnknownNode(id.to_string()));
            }
        }
        if let Some(previous) = self.active_root.take() {
            if let Some(node) = self.tree.get_mut(&previous) {
                node.reset_sync_state();
            }
        }
        self.active_root = id.clone();
        if let Some(id) = id {
            info!("Active root node {}", id);
            self.reconcile(&id).await;
            self.retarget_active_child().await?;
        }
        Ok(())
    }

    /// Switch the active derived node and reconcile it. No-op if it already
    /// is active.
    pub async fn set_active_child(&mut self, id: Option<NodeId>) -> Result<(), WalletError> {
        if self.active_child == id {
            return Ok(());
        }
        if let Some(id) = &id {
            if !self.tree.get(id).is_some_and(|n| !n.is_root()) {
                return Err(WalletError::UnknownNode(id.to_string()));
            }
        }
        if let Some(previous) = self.active_child.take() {
            if let Some(node) = self.tree.get_mut(&previous) {
                node.reset_sync_state();
            }
        }
        self.active_child = id.clone();
        if let Some(id) = id {
            info!("Active derived node {}", id);
            self.reconcile(&id).await;
        }
        Ok(())
    }

    /// Run a reconciliation pass. Failures are logged, not returned.
    async fn reconcile(&mut self, id: &NodeId) -> Option<ReconcileReport> {
        let node = self.tree.get_mut(id)?;
        match self.reconciler.reconcile_node(node).await {
            Ok(report) => {
                if let Some(height) = report.highest_confirmed {
                    self.observe_height(height);
                }
                if report.failed > 0 {
                    warn!("{} addresses of {} failed to reconcile", report.failed, id);
                }
                Some(report)
            }
            Err(e) => {
                warn!("Reconciling {} failed: {}", id, e);
                None
            }
        }
    }

    /// Drop session state of the active derived node and reconcile it from
    /// scratch (re-subscribing every address).
    pub async fn resync(&mut self) -> Option<ReconcileReport> {
        let id = self.active_child.clone()?;
        if let Some(node) = self.tree.get_mut(&id) {
            node.reset_sync_state();
        }
        self.reconcile(&id).await
    }

    // ========================================================================
    // Node management
    // ========================================================================

    pub async fn add_random_root_node(&mut self) -> Result<NodeId, WalletError> {
        let id = self.manager.add_random_root_node(&mut self.tree).await?;
        self.save()?;
        if self.active_root.is_none() {
            self.set_active_root(Some(id.clone())).await?;
        }
        Ok(id)
    }

    pub async fn import_root_node(&mut self, extended_key: &str) -> Result<NodeId, WalletError> {
        let id = self
            .manager
            .import_root_node(&mut self.tree, extended_key)
            .await?;
        self.save()?;
        if self.active_root.is_none() {
            self.set_active_root(Some(id.clone())).await?;
        }
        Ok(id)
    }

    /// Derive child `index` of `root` and save. Becomes the active derived
    /// node if none is active.
    pub async fn derive_child_node(
        &mut self,
        root: &NodeId,
        index: u32,
        watch_only: bool,
    ) -> Result<NodeId, WalletError> {
        let id = self
            .manager
            .derive_child_node(&mut self.tree, root, index, watch_only)
            .await?;
        self.save()?;
        if self.active_child.is_none() {
            self.set_active_child(Some(id.clone())).await?;
        } else {
            self.retarget_active_child().await?;
        }
        Ok(id)
    }

    /// Make the active derived node the authority's current node again
    /// after an operation restored a root.
    async fn retarget_active_child(&self) -> Result<(), WalletError> {
        let Some(node) = self.active_child() else {
            return Ok(());
        };
        debug!("Restoring active derived node {}", node.id());
        self.signer
            .restore_node(&node.ext_pub_b58, node.ext_prv_enc.as_deref())
            .await?;
        Ok(())
    }

    /// Remove a node and save. If it was active, the first remaining node of
    /// the same kind becomes active.
    pub async fn remove_node(&mut self, id: &NodeId) -> Result<(), WalletError> {
        let removed = self.manager.remove_node(&mut self.tree, id)?;
        self.save()?;

        if removed.is_root() && self.active_root.as_ref() == Some(id) {
            self.active_root = None;
            let next = self.tree.roots().first().map(Node::id);
            self.set_active_root(next).await?;
        } else if !removed.is_root() && self.active_child.as_ref() == Some(id) {
            self.active_child = None;
            let next = self.tree.children().first().map(Node::id);
            self.set_active_child(next).await?;
        }
        Ok(())
    }

    /// Unlock the vault and the active root node's private key.
    pub async fn unlock(&mut self, passphrase: &str) -> Result<(), WalletError> {
        self.vault.unlock(passphrase).await?;
        if let Some(root) = self.active_root.clone() {
            self.manager.unlock(&mut self.tree, &root).await?;
        }
        Ok(())
    }

    pub async fn unlock_node(&mut self, id: &NodeId) -> Result<(), WalletError> {
        self.manager.unlock(&mut self.tree, id).await
    }

    pub fn lock_node(&mut self, id: &NodeId) -> Result<(), WalletError> {
        self.manager.lock(&mut self.tree, id)
    }

    /// Lock the vault and forget every decrypted key.
    pub async fn lock(&mut self) -> Result<(), WalletError> {
        self.tree.lock_all();
        self.vault.lock().await?;
        Ok(())
    }

    // ========================================================================
    // Chain
    // ========================================================================

    /// Connect to the chain server and subscribe to block headers.
    pub async fn start(&mut self) -> Result<(), WalletError> {
        self.chain.transport().connect().await?;
        let header = self.chain.subscribe_headers().await?;
        self.handle_header(header).await;
        Ok(())
    }

    fn observe_height(&mut self, height: u64) -> bool {
        if height > self.height {
            self.height = height;
            true
        } else {
            false
        }
    }

    /// Record a block header and confirm it with the signing authority.
    pub async fn handle_header(&mut self, header: BlockHeader) {
        debug!("Block header at height {}", header.block_height);
        if self.observe_height(header.block_height) {
            info!("New block height {}", header.block_height);
            if let Err(e) = self.save() {
                warn!("Saving height failed: {}", e);
            }
        }
        if let Err(e) = self
            .signer
            .confirm_block(header.block_height, header.timestamp)
            .await
        {
            warn!("Confirming block {} failed: {}", header.block_height, e);
        }
    }

    /// Route one notification from the chain server.
    pub async fn handle_notification(&mut self, notification: Notification) {
        match notification.method {
            NotificationMethod::AddressChanged => {
                let Some(address) = notification.params.first().and_then(|v| v.as_str()) else {
                    warn!("Address notification without address");
                    return;
                };
                let Some(id) = self.active_child.clone() else {
                    return;
                };
                let Some(node) = self.tree.get_mut(&id) else {
                    return;
                };
                match self.reconciler.address_changed(node, address).await {
                    Ok(Some(outcome)) => {
                        if let Some(height) = outcome.highest_confirmed {
                            self.observe_height(height);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Handling change of {} failed: {}", address, e),
                }
            }
            NotificationMethod::HeaderChanged => {
                let header = notification
                    .params
                    .first()
                    .cloned()
                    .map(serde_json::from_value::<BlockHeader>);
                match header {
                    Some(Ok(header)) => self.handle_header(header).await,
                    _ => warn!("Malformed header notification"),
                }
            }
            NotificationMethod::BlockCountChanged => {
                let Some(height) = notification.params.first().and_then(|v| v.as_u64()) else {
                    warn!("Malformed block count notification");
                    return;
                };
                if height > self.height {
                    match self.chain.get_block_header(height).await {
                        Ok(header) => self.handle_header(header).await,
                        Err(e) => warn!("Fetching header {} failed: {}", height, e),
                    }
                }
            }
        }
    }

    /// Route notifications until `shutdown` resolves. After each reconnect
    /// headers are re-subscribed and the active node is resynchronized.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), WalletError>
    where
        F: Future<Output = ()>,
    {
        let transport = self.chain.transport().clone();
        let mut notifications = transport.subscribe();
        let mut sessions = transport.sessions();
        let mut seen_session = *sessions.borrow_and_update();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down wallet");
                    break;
                }
                received = notifications.recv() => match received {
                    Ok(notification) => self.handle_notification(notification).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} notifications, resynchronizing", skipped);
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let session = *sessions.borrow_and_update();
                    if session > seen_session {
                        seen_session = session;
                        if session > 1 {
                            info!("Reconnected, resynchronizing");
                            self.on_reconnect().await;
                        }
                    }
                }
            }
        }

        self.save()
    }

    async fn on_reconnect(&mut self) {
        match self.chain.subscribe_headers().await {
            Ok(header) => self.handle_header(header).await,
            Err(e) => warn!("Re-subscribing headers failed: {}", e),
        }
        self.resync().await;
    }

    // ========================================================================
    // Spending
    // ========================================================================

    /// Build, sign and broadcast a payment from the active derived node.
    /// Returns the transaction hash.
    pub async fn send_funds(&self, recipients: &[Recipient], fee: u64) -> Result<String, WalletError> {
        let node = self
            .active_child()
            .ok_or_else(|| WalletError::UnknownNode("no active derived node".into()))?;
        if node.is_watch_only() {
            return Err(WalletError::LockedWallet("send from a watch-only node"));
        }
        if self.vault.is_locked() {
            return Err(WalletError::LockedWallet("send"));
        }

        let tx = self.signer.create_tx(recipients, fee, true).await?;
        let tx_hash = self.chain.broadcast_transaction(&tx).await?;
        info!("Broadcast transaction {}", tx_hash);
        Ok(tx_hash)
    }
}
