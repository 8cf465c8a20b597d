//! Node tree management
//!
//! [`NodeTree`] holds the root and derived node sets. [`NodeManager`] creates
//! nodes through the signing authority and manages their lock state. It never
//! touches addresses or balances.
//!
//! Every operation does its remote work first and only then mutates the
//! tree, so a failure leaves the tree as it was.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{SignerError, VaultError, WalletError};
use crate::node::{Node, NodeId, NodeRecord, WalletDocument, HARDENED};
use crate::remote::Signer;
use crate::vault::CredentialVault;

/// Root and derived node sets, in insertion order.
#[derive(Debug, Default, Clone)]
pub struct NodeTree {
    roots: Vec<Node>,
    children: Vec<Node>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roots.len() + self.children.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.roots
            .iter()
            .chain(self.children.iter())
            .find(|n| &n.id() == id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.roots
            .iter_mut()
            .chain(self.children.iter_mut())
            .find(|n| &n.id() == id)
    }

    /// Look a node up by fingerprint and child index (hardened bit optional).
    pub fn find(&self, fingerprint: &str, child_index: u32) -> Option<&Node> {
        self.roots
            .iter()
            .chain(self.children.iter())
            .find(|n| n.fingerprint == fingerprint && n.child_index() == (child_index & !HARDENED))
    }

    /// Insert a node into the set matching its kind. Returns false, leaving
    /// the tree unchanged, if a node with the same identity exists.
    pub fn insert(&mut self, node: Node) -> bool {
        if self.contains(&node.id()) {
            return false;
        }
        if node.is_root() {
            self.roots.push(node);
        } else {
            self.children.push(node);
        }
        true
    }

    /// Remove by identity.
    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let set = if id.parent_fingerprint == crate::node::ROOT_SENTINEL {
            &mut self.roots
        } else {
            &mut self.children
        };
        let pos = set.iter().position(|n| &n.id() == id)?;
        Some(set.remove(pos))
    }

    /// Index for the next derived node: one past the highest hardened child
    /// number in use, or 0.
    pub fn next_child_index(&self) -> u32 {
        self.children
            .iter()
            .filter(|n| n.child_num >= HARDENED)
            .map(|n| n.child_num - HARDENED + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.roots.clear();
        self.children.clear();
    }

    /// Drop decrypted key material from every node.
    pub fn lock_all(&mut self) {
        for node in self.roots.iter_mut().chain(self.children.iter_mut()) {
            node.lock();
        }
    }

    pub fn to_document(&self, height: u64) -> WalletDocument {
        WalletDocument::new(
            self.roots.iter().map(Node::to_record).collect(),
            self.children.iter().map(Node::to_record).collect(),
            height,
        )
    }
}

/// Creates nodes and manages their lock state.
#[derive(Clone)]
pub struct NodeManager {
    signer: Signer,
    vault: Arc<dyn CredentialVault>,
}

impl NodeManager {
    pub fn new(signer: Signer, vault: Arc<dyn CredentialVault>) -> Self {
        Self { signer, vault }
    }

    pub fn vault(&self) -> &Arc<dyn CredentialVault> {
        &self.vault
    }

    /// Generate a fresh root node and add it to the tree.
    pub async fn add_random_root_node(&self, tree: &mut NodeTree) -> Result<NodeId, WalletError> {
        let mut desc = self.signer.generate_root_node().await?;
        let plaintext = desc.take_private();
        let mut node = Node::from_description(desc)?;
        if let Some(key) = plaintext {
            if !self.vault.is_locked() {
                node.set_unlocked(key);
            }
        }
        self.insert_root(tree, node)
    }

    /// Import a root node from an extended private key.
    pub async fn import_root_node(
        &self,
        tree: &mut NodeTree,
        extended_key: &str,
    ) -> Result<NodeId, WalletError> {
        let mut desc = match self.signer.import_root_node(extended_key).await {
            Ok(desc) => desc,
            Err(SignerError::Rejected { message, .. }) => {
                return Err(WalletError::InvalidKey(message))
            }
            Err(e) => return Err(e.into()),
        };
        let plaintext = desc.take_private();
        let mut node = Node::from_description(desc)?;
        if !node.is_root() {
            return Err(WalletError::InvalidKey(format!(
                "{} is not a root key",
                node.id()
            )));
        }
        if let Some(key) = plaintext {
            if !self.vault.is_locked() {
                node.set_unlocked(key);
            }
        }
        self.insert_root(tree, node)
    }

    fn insert_root(&self, tree: &mut NodeTree, node: Node) -> Result<NodeId, WalletError> {
        let id = node.id();
        if tree.insert(node) {
            info!("Added root node {}", id);
        } else {
            debug!("Root node {} already present", id);
        }
        Ok(id)
    }

    /// Derive hardened child `index` of `root`.
    ///
    /// Unless `watch_only`, the root's private key must be unlocked. The
    /// derived private key is stored encrypted.
    pub async fn derive_child_node(
        &self,
        tree: &mut NodeTree,
        root: &NodeId,
        index: u32,
        watch_only: bool,
    ) -> Result<NodeId, WalletError> {
        let root_node = tree
            .get(root)
            .filter(|n| n.is_root())
            .ok_or_else(|| WalletError::UnknownNode(root.to_string()))?;

        if !watch_only {
            if self.vault.is_locked() {
                if let Some(n) = tree.get_mut(root) {
                    n.lock();
                }
                return Err(WalletError::LockedWallet("derive"));
            }
            if !root_node.is_unlocked() {
                return Err(WalletError::LockedWallet("derive"));
            }
        }

        self.signer
            .restore_node(&root_node.ext_pub_b58, root_node.ext_prv_enc.as_deref())
            .await?;
        let mut desc = self.signer.derive_child_node(index, watch_only).await?;
        let plaintext = desc.take_private();

        if watch_only {
            desc.ext_prv_enc = None;
        } else if desc.ext_prv_enc.as_deref().map_or(true, str::is_empty) {
            let key = plaintext.as_ref().ok_or_else(|| {
                WalletError::Protocol("derived node has no private key material".into())
            })?;
            desc.ext_prv_enc = Some(self.vault.encrypt(key).await?);
        }
        if desc.path.is_none() {
            desc.path = Some(format!("m/{}'", index));
        }

        let node = Node::from_description(desc)?;
        let id = node.id();
        if tree.insert(node) {
            info!("Derived node {} at m/{}'", id, index);
        } else {
            debug!("Derived node {} already present", id);
        }
        Ok(id)
    }

    /// Remove a node by identity.
    pub fn remove_node(&self, tree: &mut NodeTree, id: &NodeId) -> Result<Node, WalletError> {
        let node = tree
            .remove(id)
            .ok_or_else(|| WalletError::UnknownNode(id.to_string()))?;
        info!("Removed node {}", id);
        Ok(node)
    }

    /// Decrypt the node's private key. A node without one unlocks trivially.
    pub async fn unlock(&self, tree: &mut NodeTree, id: &NodeId) -> Result<(), WalletError> {
        let node = tree
            .get(id)
            .ok_or_else(|| WalletError::UnknownNode(id.to_string()))?;
        let Some(enc) = node.ext_prv_enc.clone() else {
            return Ok(());
        };
        let key = match self.vault.decrypt(&enc).await {
            Ok(key) => key,
            Err(VaultError::Locked) => return Err(WalletError::LockedWallet("unlock")),
            Err(e) => return Err(e.into()),
        };
        if let Some(node) = tree.get_mut(id) {
            node.set_unlocked(key);
        }
        debug!("Unlocked node {}", id);
        Ok(())
    }

    /// Discard the node's decrypted private key.
    pub fn lock(&self, tree: &mut NodeTree, id: &NodeId) -> Result<(), WalletError> {
        let node = tree
            .get_mut(id)
            .ok_or_else(|| WalletError::UnknownNode(id.to_string()))?;
        node.lock();
        debug!("Locked node {}", id);
        Ok(())
    }

    /// Rebuild a stored node through the signing authority.
    pub async fn restore(&self, record: &NodeRecord) -> Result<Node, WalletError> {
        let expected = if record.fingerprint.is_empty() {
            let desc = self
                .signer
                .describe_node(&record.ext_pub_b58)
                .await
                .map_err(|e| WalletError::CorruptState(format!("cannot describe stored node: {}", e)))?;
            debug!("Stored node without identity described as {}", desc.fp);
            NodeId {
                fingerprint: desc.fp,
                child_num: desc.child_num,
                parent_fingerprint: desc.pfp,
            }
        } else {
            record.id()
        };
        let desc = self
            .signer
            .restore_node(&record.ext_pub_b58, record.ext_prv_enc.as_deref())
            .await
            .map_err(|e| WalletError::CorruptState(format!("cannot restore {}: {}", expected, e)))?;
        let mut node = Node::from_description(desc)
            .map_err(|e| WalletError::CorruptState(e.to_string()))?;
        if node.id() != expected {
            return Err(WalletError::CorruptState(format!(
                "stored node {} restored as {}",
                expected,
                node.id()
            )));
        }
        node.apply_record(record);
        Ok(node)
    }
}
