//! Key nodes and their persisted form
//!
//! A [`Node`] is one vertex of the deterministic key hierarchy. Root nodes
//! (parent fingerprint [`ROOT_SENTINEL`]) only mint child nodes; derived
//! nodes own a set of addresses with balances and a transaction history.
//!
//! The wallet document is versioned. Documents written before versioning
//! (keys `rnodes`, `fp`, `pfp`, `next_pub_addr`, ...) are migrated on load.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::WalletError;
use crate::remote::{AddressStatus, HistoryEntry, NodeDescription};

/// Parent fingerprint of a root node.
pub const ROOT_SENTINEL: &str = "0x00000000";

/// Offset of hardened child numbers.
pub const HARDENED: u32 = 0x8000_0000;

/// Addresses watched per chain before any gap extension.
pub const DEFAULT_WATERMARK: u32 = 8;

/// Current wallet document version.
pub const DOCUMENT_VERSION: u32 = 1;

/// Identity of a node: at most one node per id exists in the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub fingerprint: String,
    pub child_num: u32,
    pub parent_fingerprint: String,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fingerprint)?;
        if self.parent_fingerprint != ROOT_SENTINEL {
            write!(f, " ({} of {})", child_label(self.child_num), self.parent_fingerprint)?;
        }
        Ok(())
    }
}

/// `0'` for hardened child numbers, plain index otherwise.
pub fn child_label(child_num: u32) -> String {
    if child_num >= HARDENED {
        format!("{}'", child_num - HARDENED)
    } else {
        child_num.to_string()
    }
}

/// A watched address of a derived node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub address: String,
    pub index: u32,
    pub is_public: bool,
    pub path: String,
    pub balance: u64,
    pub tx_count: u64,
}

/// A vertex of the key hierarchy.
#[derive(Clone)]
pub struct Node {
    pub ext_pub_b58: String,
    pub ext_prv_enc: Option<String>,
    pub path: String,
    pub child_num: u32,
    pub fingerprint: String,
    pub parent_fingerprint: String,

    /// Number of public addresses to watch
    pub public_watermark: u32,
    /// Number of change addresses to watch
    pub change_watermark: u32,

    /// Known addresses keyed by address string; never removed.
    pub addresses: BTreeMap<String, Address>,
    /// Set once the first full address enumeration finished.
    pub addresses_enumerated: bool,
    pub balance: u64,
    pub transactions: Vec<HistoryEntry>,

    /// Addresses subscribed on the chain server in this session
    watched: HashSet<String>,
    /// Decrypted private key while unlocked
    unlocked: Option<Zeroizing<String>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("fingerprint", &self.fingerprint)
            .field("parent_fingerprint", &self.parent_fingerprint)
            .field("child_num", &self.child_num)
            .field("path", &self.path)
            .field("has_private_key", &self.has_private_key())
            .field("unlocked", &self.unlocked.is_some())
            .field("addresses", &self.addresses.len())
            .field("balance", &self.balance)
            .finish()
    }
}

impl Node {
    /// Build a node from the signing authority's description.
    pub fn from_description(desc: NodeDescription) -> Result<Self, WalletError> {
        if desc.ext_pub_b58.is_empty() {
            return Err(WalletError::Protocol(format!(
                "node {} described without public key material",
                desc.fp
            )));
        }
        let path = match &desc.path {
            Some(path) => path.clone(),
            None => default_path(&desc.pfp, desc.child_num),
        };
        Ok(Self {
            ext_pub_b58: desc.ext_pub_b58.clone(),
            ext_prv_enc: desc.ext_prv_enc.clone().filter(|enc| !enc.is_empty()),
            path,
            child_num: desc.child_num,
            fingerprint: desc.fp.clone(),
            parent_fingerprint: desc.pfp.clone(),
            public_watermark: DEFAULT_WATERMARK,
            change_watermark: DEFAULT_WATERMARK,
            addresses: BTreeMap::new(),
            addresses_enumerated: false,
            balance: 0,
            transactions: Vec::new(),
            watched: HashSet::new(),
            unlocked: None,
        })
    }

    pub fn id(&self) -> NodeId {
        NodeId {
            fingerprint: self.fingerprint.clone(),
            child_num: self.child_num,
            parent_fingerprint: self.parent_fingerprint.clone(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_fingerprint == ROOT_SENTINEL
    }

    /// Index within the parent, with the hardened bit stripped.
    pub fn child_index(&self) -> u32 {
        self.child_num & !HARDENED
    }

    pub fn has_private_key(&self) -> bool {
        self.ext_prv_enc.is_some()
    }

    pub fn is_watch_only(&self) -> bool {
        !self.has_private_key()
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.is_some()
    }

    pub fn unlocked_private(&self) -> Option<&str> {
        self.unlocked.as_ref().map(|key| key.as_str())
    }

    pub(crate) fn set_unlocked(&mut self, key: Zeroizing<String>) {
        self.unlocked = Some(key);
    }

    /// Drop decrypted key material.
    pub(crate) fn lock(&mut self) {
        self.unlocked = None;
    }

    // ------------------------------------------------------------------
    // Address state
    // ------------------------------------------------------------------

    /// Whether the address passes this node's watermarks.
    pub fn within_watermark(&self, status: &AddressStatus) -> bool {
        let limit = if status.is_public {
            self.public_watermark
        } else {
            self.change_watermark
        };
        status.child_num < limit
    }

    pub fn is_watching(&self, address: &str) -> bool {
        self.watched.contains(address)
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Mark `status` as watched in this session. Returns false if it already
    /// was.
    pub fn watch(&mut self, status: &AddressStatus) -> bool {
        if !self.watched.insert(status.addr_b58.clone()) {
            return false;
        }
        self.apply_status(status);
        true
    }

    /// Replace the balance and count of a known address.
    pub fn apply_status(&mut self, status: &AddressStatus) {
        let path = format!(
            "{}/{}/{}",
            self.path,
            if status.is_public { 0 } else { 1 },
            status.child_num
        );
        let entry = self
            .addresses
            .entry(status.addr_b58.clone())
            .or_insert_with(|| Address {
                address: status.addr_b58.clone(),
                index: status.child_num,
                is_public: status.is_public,
                path,
                balance: 0,
                tx_count: 0,
            });
        entry.balance = status.value;
        entry.tx_count = status.tx_count;
    }

    /// Sum of watched address balances.
    pub fn recalculate_balance(&mut self) -> u64 {
        self.balance = self
            .addresses
            .values()
            .filter(|a| self.watched.contains(&a.address))
            .map(|a| a.balance)
            .sum();
        self.balance
    }

    /// Extend a watermark when the last watched address on that chain has
    /// been used. Returns true if either watermark moved.
    pub fn extend_watermarks(&mut self, batch: u32) -> bool {
        let mut extended = false;
        for is_public in [true, false] {
            let watermark = if is_public {
                self.public_watermark
            } else {
                self.change_watermark
            };
            let used = self.addresses.values().any(|a| {
                a.is_public == is_public
                    && a.index + 1 == watermark
                    && a.tx_count > 0
                    && self.watched.contains(&a.address)
            });
            if used {
                let next = watermark.saturating_add(batch.max(1));
                if is_public {
                    self.public_watermark = next;
                } else {
                    self.change_watermark = next;
                }
                extended = true;
            }
        }
        extended
    }

    /// Forget session state when the node stops being active. Known
    /// addresses are kept; their balances are zeroed.
    pub fn reset_sync_state(&mut self) {
        self.watched.clear();
        for address in self.addresses.values_mut() {
            address.balance = 0;
            address.tx_count = 0;
        }
        self.addresses_enumerated = false;
        self.balance = 0;
        self.transactions.clear();
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn to_record(&self) -> NodeRecord {
        NodeRecord {
            ext_pub_b58: self.ext_pub_b58.clone(),
            ext_prv_enc: self.ext_prv_enc.clone(),
            fingerprint: self.fingerprint.clone(),
            parent_fingerprint: self.parent_fingerprint.clone(),
            child_num: self.child_num,
            path: self.path.clone(),
            public_watermark: self.public_watermark,
            change_watermark: self.change_watermark,
            addresses: self
                .addresses
                .values()
                .map(|a| AddressRecord {
                    address: a.address.clone(),
                    index: a.index,
                    is_public: a.is_public,
                })
                .collect(),
        }
    }

    /// Merge the stored shape of this node after it was restored by the
    /// signing authority. Identity comes from the authority, everything
    /// else from the record.
    pub fn apply_record(&mut self, record: &NodeRecord) {
        if self.ext_prv_enc.is_none() {
            self.ext_prv_enc = record.ext_prv_enc.clone();
        }
        if !record.path.is_empty() {
            self.path = record.path.clone();
        }
        self.public_watermark = record.public_watermark.max(1);
        self.change_watermark = record.change_watermark.max(1);
        for a in &record.addresses {
            let path = format!(
                "{}/{}/{}",
                self.path,
                if a.is_public { 0 } else { 1 },
                a.index
            );
            self.addresses.entry(a.address.clone()).or_insert(Address {
                address: a.address.clone(),
                index: a.index,
                is_public: a.is_public,
                path,
                balance: 0,
                tx_count: 0,
            });
        }
    }
}

fn default_path(parent_fingerprint: &str, child_num: u32) -> String {
    if parent_fingerprint == ROOT_SENTINEL {
        "m".to_string()
    } else {
        format!("m/{}", child_label(child_num))
    }
}

// ============================================================================
// Persisted document
// ============================================================================

fn default_watermark() -> u32 {
    DEFAULT_WATERMARK
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub index: u32,
    pub is_public: bool,
}

/// Stored form of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub ext_pub_b58: String,
    #[serde(default)]
    pub ext_prv_enc: Option<String>,
    pub fingerprint: String,
    pub parent_fingerprint: String,
    pub child_num: u32,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_watermark")]
    pub public_watermark: u32,
    #[serde(default = "default_watermark")]
    pub change_watermark: u32,
    #[serde(default)]
    pub addresses: Vec<AddressRecord>,
}

impl NodeRecord {
    pub fn id(&self) -> NodeId {
        NodeId {
            fingerprint: self.fingerprint.clone(),
            child_num: self.child_num,
            parent_fingerprint: self.parent_fingerprint.clone(),
        }
    }
}

/// The wallet's stored document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletDocument {
    pub version: u32,
    #[serde(rename = "rootNodes")]
    pub root_nodes: Vec<NodeRecord>,
    pub nodes: Vec<NodeRecord>,
    pub height: u64,
}

/// Node as written before the document was versioned.
#[derive(Debug, Deserialize)]
struct LegacyNode {
    #[serde(default)]
    child_num: u32,
    #[serde(default)]
    ext_pub_b58: String,
    #[serde(default)]
    ext_prv_enc: Option<String>,
    #[serde(default)]
    fp: String,
    #[serde(default)]
    pfp: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    next_pub_addr: Option<u32>,
    #[serde(default)]
    next_change_addr: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LegacyDocument {
    #[serde(default)]
    rnodes: Vec<LegacyNode>,
    #[serde(default)]
    nodes: Vec<LegacyNode>,
    #[serde(default)]
    height: Option<u64>,
}

impl From<LegacyNode> for NodeRecord {
    fn from(node: LegacyNode) -> Self {
        let path = match node.path {
            Some(path) => path,
            None if node.fp.is_empty() => String::new(),
            None => default_path(&node.pfp, node.child_num),
        };
        NodeRecord {
            ext_pub_b58: node.ext_pub_b58,
            ext_prv_enc: node.ext_prv_enc.filter(|enc| !enc.is_empty()),
            fingerprint: node.fp,
            parent_fingerprint: node.pfp,
            child_num: node.child_num,
            path,
            public_watermark: node.next_pub_addr.unwrap_or(DEFAULT_WATERMARK).max(1),
            change_watermark: node.next_change_addr.unwrap_or(DEFAULT_WATERMARK).max(1),
            addresses: Vec::new(),
        }
    }
}

impl WalletDocument {
    pub fn new(root_nodes: Vec<NodeRecord>, nodes: Vec<NodeRecord>, height: u64) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            root_nodes,
            nodes,
            height,
        }
    }

    /// Parse a stored document, migrating older layouts.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WalletError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| WalletError::CorruptState(format!("unreadable document: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, WalletError> {
        if !value.is_object() {
            return Err(WalletError::CorruptState("document is not an object".into()));
        }
        match value.get("version").and_then(Value::as_u64) {
            Some(v) if v == u64::from(DOCUMENT_VERSION) => serde_json::from_value(value)
                .map_err(|e| WalletError::CorruptState(e.to_string())),
            Some(v) => Err(WalletError::CorruptState(format!(
                "unsupported document version {}",
                v
            ))),
            None => {
                let legacy: LegacyDocument = serde_json::from_value(value)
                    .map_err(|e| WalletError::CorruptState(e.to_string()))?;
                Ok(Self::new(
                    legacy.rnodes.into_iter().map(NodeRecord::from).collect(),
                    legacy.nodes.into_iter().map(NodeRecord::from).collect(),
                    legacy.height.unwrap_or(0),
                ))
            }
        }
    }
}
