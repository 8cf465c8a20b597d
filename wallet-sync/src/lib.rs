//! Wallet synchronization engine
//!
//! Keeps a hierarchy of deterministic key nodes in sync with an
//! Electrum-style chain server. Key derivation and signing are delegated to
//! an external signing authority.
//!
//! ## Layers
//!
//! - [`transport`]: multiplexed line-delimited JSON connection with
//!   reconnect backoff
//! - [`remote`]: typed chain-server and signing-authority operations
//! - [`tree`]: node creation, derivation and lock state
//! - [`reconcile`]: per-node address and history reconciliation
//! - [`wallet`]: the aggregate with load/save and notification routing

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod reconcile;
pub mod remote;
pub mod storage;
pub mod transport;
pub mod tree;
pub mod vault;
pub mod wallet;

pub use config::Config;
pub use error::{SignerError, StorageError, TransportError, VaultError, WalletError};
pub use node::{Node, NodeId};
pub use remote::{ChainClient, RpcSigningAuthority, Signer, SigningAuthority};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use transport::{ConnectionState, DisconnectPolicy, Transport};
pub use vault::{CredentialVault, SignerVault};
pub use wallet::Wallet;
