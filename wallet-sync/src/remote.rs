//! Typed remote operations
//!
//! Two facades, both thin pass-throughs with no retry or caching:
//! - [`ChainClient`] names the chain server's Electrum-style methods
//! - [`Signer`] names the signing authority's methods and decodes its
//!   responses into typed records
//!
//! The signing authority itself is reached through the [`SigningAuthority`]
//! trait so the wallet does not care whether it is a child process, a TCP
//! endpoint or an in-process stand-in.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{SignerError, TransportError};
use crate::transport::{NotificationMethod, Transport};

/// Error code used when the authority reports a failure without one.
pub const ERROR_UNSPECIFIED: i64 = -1;

// ============================================================================
// Chain server
// ============================================================================

/// Confirmation status of one transaction touching an address.
///
/// `height` is 0 (or negative) while the transaction is unconfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub tx_hash: String,
    pub height: i64,
}

impl TxStatus {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// The subset of a block header the wallet uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_height: u64,
    #[serde(default)]
    pub timestamp: u64,
}

/// Chain server operations.
#[derive(Clone)]
pub struct ChainClient {
    transport: Arc<Transport>,
}

impl ChainClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, TransportError> {
        let value = self.transport.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("bad {} result: {}", method, e)))
    }

    /// Confirmation status of every transaction touching `address`.
    pub async fn get_address_history(&self, address: &str) -> Result<Vec<TxStatus>, TransportError> {
        let history: Option<Vec<TxStatus>> = self
            .call("blockchain.address.get_history", json!([address]))
            .await?;
        Ok(history.unwrap_or_default())
    }

    /// Ask for change notifications on `address`. Returns the current status
    /// hash, if the server reports one.
    pub async fn subscribe_address(&self, address: &str) -> Result<Option<String>, TransportError> {
        self.call(NotificationMethod::ADDRESS_SUBSCRIBE, json!([address]))
            .await
    }

    /// Raw transaction as hex.
    pub async fn get_transaction(&self, tx_hash: &str) -> Result<String, TransportError> {
        self.call("blockchain.transaction.get", json!([tx_hash])).await
    }

    /// Broadcast a signed transaction. Returns the transaction hash.
    pub async fn broadcast_transaction(&self, tx_hex: &str) -> Result<String, TransportError> {
        self.call("blockchain.transaction.broadcast", json!([tx_hex]))
            .await
    }

    /// Subscribe to new block headers. Returns the current tip.
    pub async fn subscribe_headers(&self) -> Result<BlockHeader, TransportError> {
        self.call(NotificationMethod::HEADERS_SUBSCRIBE, json!([]))
            .await
    }

    pub async fn get_block_header(&self, height: u64) -> Result<BlockHeader, TransportError> {
        self.call("blockchain.block.get_header", json!([height]))
            .await
    }
}

// ============================================================================
// Signing authority
// ============================================================================

/// Request/response access to the signing authority.
#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Send one named request. The returned value is the authority's raw
    /// response object, which may itself carry an `error` member.
    async fn request(&self, method: &str, params: Value) -> Result<Value, SignerError>;
}

/// Signing authority reached over a [`Transport`] (child process or TCP).
pub struct RpcSigningAuthority {
    transport: Arc<Transport>,
}

impl RpcSigningAuthority {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SigningAuthority for RpcSigningAuthority {
    async fn request(&self, method: &str, params: Value) -> Result<Value, SignerError> {
        match self.transport.call(method, params).await {
            Ok(value) => Ok(value),
            Err(TransportError::Remote { message }) => Err(SignerError::Rejected {
                code: ERROR_UNSPECIFIED,
                message,
            }),
            Err(e) => Err(SignerError::Transport(e)),
        }
    }
}

/// Key node as described by the signing authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Fingerprint, `0x`-prefixed hex
    pub fp: String,
    /// Parent fingerprint
    pub pfp: String,
    pub child_num: u32,
    pub ext_pub_b58: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_prv_enc: Option<String>,
    /// Plaintext private key; only present right after generation,
    /// import or derivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_prv_b58: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl NodeDescription {
    /// Take the plaintext private key out of the description.
    pub fn take_private(&mut self) -> Option<Zeroizing<String>> {
        self.ext_prv_b58.take().map(Zeroizing::new)
    }
}

/// Balance summary of one derived address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressStatus {
    pub addr_b58: String,
    pub child_num: u32,
    pub is_public: bool,
    #[serde(default)]
    pub value: u64,
    #[serde(default)]
    pub tx_count: u64,
}

/// One transaction from the active node's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: String,
    #[serde(default)]
    pub addr_b58: String,
    #[serde(default)]
    pub timestamp: u64,
    /// Net effect on the node, negative for spends
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub fee: u64,
}

/// Payment output for `create-tx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub addr_b58: String,
    pub value: u64,
}

/// Passphrase verification material. Opaque to the wallet; persisted so the
/// authority can check the passphrase after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub salt: String,
    pub check: String,
    pub ekey_enc: String,
}

#[derive(Deserialize)]
struct AddressesResponse {
    #[serde(default)]
    addresses: Option<Vec<AddressStatus>>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Option<Vec<HistoryEntry>>,
}

#[derive(Deserialize)]
struct UnknownHashesResponse {
    #[serde(default)]
    unknown_tx_hashes: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TxResponse {
    tx: String,
}

#[derive(Deserialize)]
struct ItemResponse {
    item: String,
}

#[derive(Deserialize)]
struct EncryptedItemResponse {
    item_enc: String,
}

#[derive(Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

/// Typed operations on the signing authority.
#[derive(Clone)]
pub struct Signer {
    authority: Arc<dyn SigningAuthority>,
}

impl Signer {
    pub fn new(authority: Arc<dyn SigningAuthority>) -> Self {
        Self { authority }
    }

    /// Send a request and turn an in-band `error` member into a rejection.
    async fn raw(&self, method: &str, params: Value) -> Result<Value, SignerError> {
        debug!(method, "signer request");
        let response = self.authority.request(method, params).await?;
        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            let code = error
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(ERROR_UNSPECIFIED);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_string();
            return Err(SignerError::Rejected { code, message });
        }
        Ok(response)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, SignerError> {
        let response = self.raw(method, params).await?;
        serde_json::from_value(response)
            .map_err(|e| SignerError::UnexpectedResponse(format!("{}: {}", method, e)))
    }

    pub async fn generate_root_node(&self) -> Result<NodeDescription, SignerError> {
        self.call("generate-root-node", json!({})).await
    }

    pub async fn import_root_node(&self, ext_prv_b58: &str) -> Result<NodeDescription, SignerError> {
        self.call("import-root-node", json!({ "ext_prv_b58": ext_prv_b58 }))
            .await
    }

    /// Make `ext_pub_b58` the authority's current node. Root nodes become
    /// the derivation parent; derived nodes become the address source.
    pub async fn restore_node(
        &self,
        ext_pub_b58: &str,
        ext_prv_enc: Option<&str>,
    ) -> Result<NodeDescription, SignerError> {
        self.call(
            "restore-node",
            json!({
                "ext_pub_b58": ext_pub_b58,
                "ext_prv_enc": ext_prv_enc.unwrap_or_default(),
            }),
        )
        .await
    }

    pub async fn describe_node(&self, ext_pub_b58: &str) -> Result<NodeDescription, SignerError> {
        self.call("describe-node", json!({ "ext_pub_b58": ext_pub_b58 }))
            .await
    }

    /// Derive hardened child `index` of the current root node.
    pub async fn derive_child_node(
        &self,
        index: u32,
        watch_only: bool,
    ) -> Result<NodeDescription, SignerError> {
        self.call(
            "derive-child-node",
            json!({
                "path": format!("m/{}'", index),
                "is_watch_only": watch_only,
            }),
        )
        .await
    }

    /// Build a transaction spending from the current derived node. Returns
    /// the transaction as hex.
    pub async fn create_tx(
        &self,
        recipients: &[Recipient],
        fee: u64,
        sign: bool,
    ) -> Result<String, SignerError> {
        let response: TxResponse = self
            .call(
                "create-tx",
                json!({ "recipients": recipients, "fee": fee, "sign": sign }),
            )
            .await?;
        Ok(response.tx)
    }

    pub async fn encrypt_item(&self, item: &str) -> Result<String, SignerError> {
        let response: EncryptedItemResponse =
            self.call("encrypt-item", json!({ "item": item })).await?;
        Ok(response.item_enc)
    }

    pub async fn decrypt_item(&self, item_enc: &str) -> Result<Zeroizing<String>, SignerError> {
        let response: ItemResponse = self
            .call("decrypt-item", json!({ "item_enc": item_enc }))
            .await?;
        Ok(Zeroizing::new(response.item))
    }

    /// Addresses of the current derived node with their balances.
    pub async fn get_addresses(&self) -> Result<Vec<AddressStatus>, SignerError> {
        let response: AddressesResponse = self.call("get-addresses", json!({})).await?;
        Ok(response.addresses.unwrap_or_default())
    }

    /// Transaction history of the current derived node.
    pub async fn get_history(&self) -> Result<Vec<HistoryEntry>, SignerError> {
        let response: HistoryResponse = self.call("get-history", json!({})).await?;
        Ok(response.history.unwrap_or_default())
    }

    pub async fn confirm_block(&self, block_height: u64, timestamp: u64) -> Result<(), SignerError> {
        self.raw(
            "confirm-block",
            json!({ "block_height": block_height, "timestamp": timestamp }),
        )
        .await?;
        Ok(())
    }

    /// Report confirmation heights. Returns the hashes the authority has not
    /// seen yet; when it does not say, every reported hash counts as unseen.
    pub async fn report_tx_statuses(&self, statuses: &[TxStatus]) -> Result<Vec<String>, SignerError> {
        let response: UnknownHashesResponse = self
            .call("report-tx-statuses", json!({ "tx_statuses": statuses }))
            .await?;
        Ok(response
            .unknown_tx_hashes
            .unwrap_or_else(|| statuses.iter().map(|s| s.tx_hash.clone()).collect()))
    }

    /// Hand raw transactions (hex) to the authority.
    pub async fn report_txs(&self, txs: &[String]) -> Result<(), SignerError> {
        let txs: Vec<Value> = txs.iter().map(|tx| json!({ "tx": tx })).collect();
        self.raw("report-txs", json!({ "txs": txs })).await?;
        Ok(())
    }

    /// Returns whether the passphrase was accepted.
    pub async fn unlock(&self, passphrase: &str) -> Result<bool, SignerError> {
        let response: SuccessResponse = self
            .call("unlock", json!({ "passphrase": passphrase }))
            .await?;
        Ok(response.success)
    }

    pub async fn lock(&self) -> Result<(), SignerError> {
        self.raw("lock", json!({})).await?;
        Ok(())
    }

    /// Set a new passphrase. Returns the credential record to persist.
    pub async fn set_passphrase(&self, new_passphrase: &str) -> Result<Credentials, SignerError> {
        self.call("set-passphrase", json!({ "new_passphrase": new_passphrase }))
            .await
    }

    /// Hand a previously persisted credential record back to the authority.
    pub async fn set_credentials(&self, credentials: &Credentials) -> Result<(), SignerError> {
        self.raw(
            "set-credentials",
            json!({
                "salt": credentials.salt,
                "check": credentials.check,
                "ekey_enc": credentials.ekey_enc,
            }),
        )
        .await?;
        Ok(())
    }
}
