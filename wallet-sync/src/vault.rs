//! Credential vault
//!
//! Gatekeeper for private key material. The signing authority owns the actual
//! encryption key; the vault tracks whether it is unlocked and relocks it
//! once `relock_after` has passed since the last unlock.
//!
//! Security: decrypted material is handed out in `Zeroizing<String>` so it is
//! wiped from memory when dropped.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::VaultError;
use crate::remote::{Credentials, Signer};

/// Lock state and encryption of private key material.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    fn is_locked(&self) -> bool;

    async fn unlock(&self, passphrase: &str) -> Result<(), VaultError>;

    async fn lock(&self) -> Result<(), VaultError>;

    /// Encrypt `plaintext`. Fails with `VaultError::Locked` while locked.
    async fn encrypt(&self, plaintext: &str) -> Result<String, VaultError>;

    /// Decrypt `ciphertext`. Fails with `VaultError::Locked` while locked.
    async fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>, VaultError>;
}

#[derive(Default)]
struct VaultState {
    unlocked_until: Option<Instant>,
    credentials: Option<Credentials>,
}

/// Vault backed by the signing authority's passphrase handling.
pub struct SignerVault {
    signer: Signer,
    relock_after: Duration,
    state: Mutex<VaultState>,
}

impl SignerVault {
    pub fn new(signer: Signer, relock_after: Duration) -> Self {
        Self {
            signer,
            relock_after,
            state: Mutex::new(VaultState::default()),
        }
    }

    /// Whether a passphrase has ever been set.
    pub fn has_passphrase(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.credentials.is_some())
            .unwrap_or(false)
    }

    /// Credential record to persist, if a passphrase is set.
    pub fn credentials(&self) -> Option<Credentials> {
        self.state.lock().ok().and_then(|s| s.credentials.clone())
    }

    /// Restore a persisted credential record. The vault stays locked.
    pub async fn load_credentials(&self, credentials: Credentials) -> Result<(), VaultError> {
        self.signer.set_credentials(&credentials).await?;
        if let Ok(mut state) = self.state.lock() {
            state.credentials = Some(credentials);
            state.unlocked_until = None;
        }
        Ok(())
    }

    /// Set the passphrase. Changing an existing passphrase requires the vault
    /// to be unlocked. Leaves the vault unlocked.
    pub async fn set_passphrase(&self, new_passphrase: &str) -> Result<Credentials, VaultError> {
        if self.has_passphrase() && self.is_locked() {
            return Err(VaultError::Locked);
        }
        let credentials = self.signer.set_passphrase(new_passphrase).await?;
        if let Ok(mut state) = self.state.lock() {
            state.credentials = Some(credentials.clone());
            state.unlocked_until = Some(Instant::now() + self.relock_after);
        }
        info!("Passphrase set");
        Ok(credentials)
    }

    /// Tell the authority to lock if the unlock window has lapsed.
    async fn relock_if_expired(&self) -> Result<(), VaultError> {
        let expired = match self.state.lock() {
            Ok(mut state) => match state.unlocked_until {
                Some(deadline) if Instant::now() >= deadline => {
                    state.unlocked_until = None;
                    true
                }
                _ => false,
            },
            Err(_) => false,
        };
        if expired {
            debug!("Unlock window expired, relocking");
            self.signer.lock().await?;
        }
        Ok(())
    }

    async fn ensure_unlocked(&self) -> Result<(), VaultError> {
        self.relock_if_expired().await?;
        if self.is_locked() {
            return Err(VaultError::Locked);
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialVault for SignerVault {
    fn is_locked(&self) -> bool {
        self.state
            .lock()
            .map(|s| match s.unlocked_until {
                Some(deadline) => Instant::now() >= deadline,
                None => true,
            })
            .unwrap_or(true)
    }

    async fn unlock(&self, passphrase: &str) -> Result<(), VaultError> {
        if !self.signer.unlock(passphrase).await? {
            return Err(VaultError::BadPassphrase);
        }
        if let Ok(mut state) = self.state.lock() {
            state.unlocked_until = Some(Instant::now() + self.relock_after);
        }
        info!("Wallet unlocked for {:?}", self.relock_after);
        Ok(())
    }

    async fn lock(&self) -> Result<(), VaultError> {
        if let Ok(mut state) = self.state.lock() {
            state.unlocked_until = None;
        }
        self.signer.lock().await?;
        info!("Wallet locked");
        Ok(())
    }

    async fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        self.ensure_unlocked().await?;
        Ok(self.signer.encrypt_item(plaintext).await?)
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>, VaultError> {
        self.ensure_unlocked().await?;
        Ok(self.signer.decrypt_item(ciphertext).await?)
    }
}
