use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use wallet_sync::error::SignerError;
use wallet_sync::node::{HARDENED, ROOT_SENTINEL};
use wallet_sync::remote::{HistoryEntry, NodeDescription, SigningAuthority, TxStatus};

pub const PASSPHRASE: &str = "correct horse battery";

/// Addresses the authority lists per chain of a derived node.
pub const ADDRESSES_PER_CHAIN: u32 = 20;

/// Address string the authority derives for `fingerprint`.
pub fn address(fingerprint: &str, is_public: bool, index: u32) -> String {
    format!("{}-{}-{}", fingerprint, if is_public { "p" } else { "c" }, index)
}

fn rejection(code: i64, message: impl Into<String>) -> Value {
    json!({"error": {"code": code, "message": message.into()}})
}

#[derive(Default)]
struct SignerState {
    nodes: HashMap<String, NodeDescription>,
    current: Option<String>,
    generated: u32,
    funded: HashMap<String, (u64, u64)>,
    history: Vec<HistoryEntry>,
    known: HashSet<String>,
    reported_statuses: Vec<TxStatus>,
    reported_txs: Vec<String>,
    confirmed_blocks: Vec<u64>,
    log: Vec<String>,
    passphrase: Option<String>,
    unlocked: bool,
    omit_unknown: bool,
    refused: HashSet<String>,
}

/// Deterministic signing authority. Private keys are "encrypted" by
/// prefixing `enc:`.
#[derive(Default)]
pub struct ScriptedSigner {
    state: Mutex<SignerState>,
}

impl ScriptedSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a node restorable.
    pub fn register(&self, desc: NodeDescription) {
        let mut state = self.state.lock().unwrap();
        state.nodes.insert(desc.ext_pub_b58.clone(), desc);
    }

    /// Fail every restore of `ext_pub_b58`.
    pub fn refuse_restore(&self, ext_pub_b58: &str) {
        self.state
            .lock()
            .unwrap()
            .refused
            .insert(ext_pub_b58.to_string());
    }

    pub fn fund(&self, address: &str, value: u64, tx_count: u64) {
        self.state
            .lock()
            .unwrap()
            .funded
            .insert(address.to_string(), (value, tx_count));
    }

    pub fn set_history(&self, history: Vec<HistoryEntry>) {
        self.state.lock().unwrap().history = history;
    }

    pub fn mark_known(&self, tx_hash: &str) {
        self.state.lock().unwrap().known.insert(tx_hash.to_string());
    }

    /// Answer `report-tx-statuses` without an `unknown_tx_hashes` member.
    pub fn omit_unknown_hashes(&self) {
        self.state.lock().unwrap().omit_unknown = true;
    }

    pub fn confirmed_blocks(&self) -> Vec<u64> {
        self.state.lock().unwrap().confirmed_blocks.clone()
    }

    pub fn reported_txs(&self) -> Vec<String> {
        self.state.lock().unwrap().reported_txs.clone()
    }

    pub fn reported_statuses(&self) -> Vec<TxStatus> {
        self.state.lock().unwrap().reported_statuses.clone()
    }

    /// Method names in request order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.log().iter().filter(|m| *m == method).count()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.lock().unwrap().unlocked
    }

    pub fn root_description(fingerprint: &str) -> NodeDescription {
        NodeDescription {
            fp: fingerprint.to_string(),
            pfp: ROOT_SENTINEL.to_string(),
            child_num: 0,
            ext_pub_b58: format!("xpub-{}", fingerprint),
            ext_prv_enc: Some(format!("enc:xprv-{}", fingerprint)),
            ext_prv_b58: None,
            path: Some("m".to_string()),
        }
    }

    pub fn child_description(root_fp: &str, index: u32, watch_only: bool) -> NodeDescription {
        let base = u32::from_str_radix(root_fp.trim_start_matches("0x"), 16).unwrap_or(0);
        let fp = format!("0x{:08x}", base.wrapping_mul(31).wrapping_add(index + 1));
        NodeDescription {
            ext_pub_b58: format!("xpub-{}", fp),
            ext_prv_enc: None,
            ext_prv_b58: (!watch_only).then(|| format!("xprv-{}", fp)),
            fp,
            pfp: root_fp.to_string(),
            child_num: HARDENED + index,
            path: Some(format!("m/{}'", index)),
        }
    }

    fn handle(&self, state: &mut SignerState, method: &str, params: &Value) -> Value {
        match method {
            "generate-root-node" => {
                state.generated += 1;
                let fp = format!("0x{:08x}", 0x1000_0000 + state.generated);
                let mut desc = Self::root_description(&fp);
                state.nodes.insert(desc.ext_pub_b58.clone(), desc.clone());
                desc.ext_prv_b58 = Some(format!("xprv-{}", fp));
                json!(desc)
            }
            "import-root-node" => {
                let key = params["ext_prv_b58"].as_str().unwrap_or_default();
                let Some(hex) = key.strip_prefix("xprv-") else {
                    return rejection(-2, "invalid extended key");
                };
                let mut desc = Self::root_description(&format!("0x{}", hex));
                state.nodes.insert(desc.ext_pub_b58.clone(), desc.clone());
                desc.ext_prv_b58 = Some(key.to_string());
                json!(desc)
            }
            "restore-node" | "describe-node" => {
                let ext_pub = params["ext_pub_b58"].as_str().unwrap_or_default();
                if state.refused.contains(ext_pub) {
                    return rejection(-3, "cannot restore node");
                }
                let Some(mut desc) = state.nodes.get(ext_pub).cloned() else {
                    return rejection(-3, format!("unknown node {}", ext_pub));
                };
                if method == "restore-node" {
                    state.current = Some(ext_pub.to_string());
                    if let Some(enc) = params["ext_prv_enc"].as_str().filter(|e| !e.is_empty()) {
                        desc.ext_prv_enc = Some(enc.to_string());
                    }
                }
                json!(desc)
            }
            "derive-child-node" => {
                let Some(root) = state.current.as_ref().and_then(|c| state.nodes.get(c)).cloned()
                else {
                    return rejection(-4, "no current node");
                };
                if root.pfp != ROOT_SENTINEL {
                    return rejection(-4, "current node is not a root");
                }
                let index: u32 = params["path"]
                    .as_str()
                    .and_then(|p| p.strip_prefix("m/"))
                    .and_then(|p| p.strip_suffix('\''))
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                let watch_only = params["is_watch_only"].as_bool().unwrap_or(false);
                let desc = Self::child_description(&root.fp, index, watch_only);
                let mut stored = desc.clone();
                stored.ext_prv_b58 = None;
                state.nodes.insert(stored.ext_pub_b58.clone(), stored);
                json!(desc)
            }
            "get-addresses" => {
                let Some(node) = state.current.as_ref().and_then(|c| state.nodes.get(c)) else {
                    return json!({"addresses": []});
                };
                if node.pfp == ROOT_SENTINEL {
                    return json!({"addresses": []});
                }
                let mut addresses = Vec::new();
                for is_public in [true, false] {
                    for index in 0..ADDRESSES_PER_CHAIN {
                        let addr = address(&node.fp, is_public, index);
                        let (value, tx_count) = state.funded.get(&addr).copied().unwrap_or((0, 0));
                        addresses.push(json!({
                            "addr_b58": addr,
                            "child_num": index,
                            "is_public": is_public,
                            "value": value,
                            "tx_count": tx_count,
                        }));
                    }
                }
                json!({ "addresses": addresses })
            }
            "get-history" => json!({ "history": state.history }),
            "confirm-block" => {
                let height = params["block_height"].as_u64().unwrap_or_default();
                state.confirmed_blocks.push(height);
                json!({"success": true})
            }
            "report-tx-statuses" => {
                let statuses: Vec<TxStatus> =
                    serde_json::from_value(params["tx_statuses"].clone()).unwrap_or_default();
                let mut unknown: Vec<String> = Vec::new();
                for status in &statuses {
                    if !state.known.contains(&status.tx_hash) && !unknown.contains(&status.tx_hash) {
                        unknown.push(status.tx_hash.clone());
                    }
                }
                state.reported_statuses.extend(statuses);
                if state.omit_unknown {
                    json!({})
                } else {
                    json!({ "unknown_tx_hashes": unknown })
                }
            }
            "report-txs" => {
                for tx in params["txs"].as_array().cloned().unwrap_or_default() {
                    let raw = tx["tx"].as_str().unwrap_or_default().to_string();
                    if let Some(hash) = raw.strip_prefix("raw-") {
                        state.known.insert(hash.to_string());
                    }
                    state.reported_txs.push(raw);
                }
                json!({"success": true})
            }
            "create-tx" => {
                if !state.unlocked {
                    return rejection(-5, "locked");
                }
                json!({"tx": "signed-tx"})
            }
            "encrypt-item" => {
                let item = params["item"].as_str().unwrap_or_default();
                json!({ "item_enc": format!("enc:{}", item) })
            }
            "decrypt-item" => {
                let item_enc = params["item_enc"].as_str().unwrap_or_default();
                match item_enc.strip_prefix("enc:") {
                    Some(item) => json!({ "item": item }),
                    None => rejection(-6, "cannot decrypt"),
                }
            }
            "unlock" => {
                let success = state.passphrase.as_deref() == params["passphrase"].as_str();
                state.unlocked = success;
                json!({ "success": success })
            }
            "lock" => {
                state.unlocked = false;
                json!({"success": true})
            }
            "set-passphrase" => {
                state.passphrase = params["new_passphrase"].as_str().map(str::to_string);
                state.unlocked = true;
                json!({"salt": "c2FsdA==", "check": "Y2hlY2s=", "ekey_enc": "ZWtleQ=="})
            }
            "set-credentials" => json!({"success": true}),
            other => rejection(-1, format!("unknown method {}", other)),
        }
    }
}

#[async_trait]
impl SigningAuthority for ScriptedSigner {
    async fn request(&self, method: &str, params: Value) -> Result<Value, SignerError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(method.to_string());
        Ok(self.handle(&mut state, method, &params))
    }
}
