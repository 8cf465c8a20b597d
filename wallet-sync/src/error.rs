//! Error types
//!
//! Each layer has its own error enum; `WalletError` is the taxonomy surfaced
//! to callers of node-management and lifecycle operations.

use std::io;
use thiserror::Error;

/// Errors raised by the line-delimited JSON transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server could not be reached.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Connecting took longer than the configured timeout.
    #[error("connection timed out")]
    Timeout,

    /// A message could not be framed or parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered the request with an `error` member.
    #[error("remote error: {message}")]
    Remote { message: String },

    /// The connection dropped while the request was in flight.
    #[error("connection lost before a response arrived")]
    ConnectionLost,

    /// The transport has been shut down.
    #[error("transport is shut down")]
    Shutdown,
}

/// Errors raised by the signing authority facade.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The signing authority refused the request.
    #[error("signing authority rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// The request never reached the signing authority.
    #[error("signing authority unreachable: {0}")]
    Transport(#[from] TransportError),

    /// The response did not have the expected shape.
    #[error("unexpected response from signing authority: {0}")]
    UnexpectedResponse(String),
}

/// Errors raised by the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("wallet is locked")]
    Locked,

    #[error("passphrase was not accepted")]
    BadPassphrase,

    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Errors raised by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by wallet operations.
#[derive(Debug, Error)]
pub enum WalletError {
    /// The chain-data server cannot be reached.
    #[error("cannot reach chain server: {0}")]
    Connection(String),

    /// A malformed message was received.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The signing authority rejected the supplied key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The operation needs private key material that is not available.
    #[error("cannot {0}: wallet is locked")]
    LockedWallet(&'static str),

    /// The persisted wallet document cannot be reconstructed.
    #[error("stored wallet state is corrupt: {0}")]
    CorruptState(String),

    /// The chain server answered with an error.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// The signing authority failed or refused a request.
    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The referenced node is not part of the wallet.
    #[error("unknown node {0}")]
    UnknownNode(String),
}

impl From<TransportError> for WalletError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection(e) => WalletError::Connection(e.to_string()),
            TransportError::Timeout => WalletError::Connection("timed out".to_string()),
            TransportError::Protocol(msg) => WalletError::Protocol(msg),
            TransportError::Remote { message } => WalletError::Remote(message),
            TransportError::ConnectionLost | TransportError::Shutdown => {
                WalletError::Connection(err.to_string())
            }
        }
    }
}

impl From<VaultError> for WalletError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Locked => WalletError::LockedWallet("use private key"),
            VaultError::BadPassphrase => WalletError::LockedWallet("unlock"),
            VaultError::Signer(e) => WalletError::Signer(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WalletError::LockedWallet("derive");
        assert_eq!(err.to_string(), "cannot derive: wallet is locked");

        let err = TransportError::Remote {
            message: "unknown method".to_string(),
        };
        assert_eq!(err.to_string(), "remote error: unknown method");
    }

    #[test]
    fn test_transport_error_maps_to_taxonomy() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: WalletError = TransportError::Connection(io_err).into();
        assert!(matches!(err, WalletError::Connection(_)));

        let err: WalletError = TransportError::Protocol("bad json".into()).into();
        assert!(matches!(err, WalletError::Protocol(_)));
    }

    #[test]
    fn test_vault_locked_maps_to_locked_wallet() {
        let err: WalletError = VaultError::Locked.into();
        assert!(matches!(err, WalletError::LockedWallet(_)));
    }
}
