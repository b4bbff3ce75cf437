use crate::adapters::vault::VaultProvider;
use crate::domain::identity::{VERIFICATION_PLAINTEXT, VaultIdentity};
use crate::error::{AgentError, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Plaintext bytes per AEAD block.
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Encrypted block overhead: nonce + authentication tag.
pub const BLOCK_OVERHEAD: usize = NONCE_LEN + TAG_LEN;
/// Safety gate in front of the block sequence; readers also accept streams
/// written by older releases without it.
const MAGIC: [u8; 4] = *b"ANCR";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;

const PBKDF2_ROUNDS: u32 = 210_000;
/// Required headroom on the temp volume beyond the estimated output size.
const TEMP_SLACK: u64 = 500 * 1024 * 1024;

/// Key suffix marking an encrypted object.
pub const ENCRYPTED_SUFFIX: &str = ".anchor";

/// Streaming authenticated encryption for vault objects.
///
/// Lifecycle: uninitialized until a password unlocks (or creates) a vault
/// key, configured afterwards, uninitialized again on explicit disable.
#[derive(Clone, Default)]
pub struct CryptoEngine {
    key: Arc<RwLock<Option<[u8; 32]>>>,
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine").field("configured", &self.is_configured()).finish()
    }
}

/// Derives the vault data key from a password and the identity salt.
#[must_use]
pub fn derive_key(password: &str, salt: &[u8; 32]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

fn cipher_for(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// Seals one block as `nonce ‖ ciphertext ‖ tag` with a fresh random nonce.
fn seal_block(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| AgentError::Provider("Encryption failed".into()))?;

    let mut block = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    block.extend_from_slice(&nonce);
    block.extend_from_slice(&ciphertext);
    Ok(block)
}

fn open_block(cipher: &Aes256Gcm, block: &[u8]) -> Result<Vec<u8>> {
    if block.len() < BLOCK_OVERHEAD {
        return Err(AgentError::Provider("Truncated encrypted block".into()));
    }
    let (nonce, ciphertext) = block.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AgentError::Provider("Block authentication failed".into()))
}

/// Seals the identity verification token under a derived key.
///
/// # Errors
/// Returns an error if the underlying cipher fails.
pub fn seal_verification_token(key: &[u8; 32]) -> Result<Vec<u8>> {
    seal_block(&cipher_for(key), VERIFICATION_PLAINTEXT)
}

impl CryptoEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.key.read().map(|k| k.is_some()).unwrap_or(false)
    }

    /// Forgets the vault key; the engine returns to uninitialized.
    pub fn disable(&self) {
        if let Ok(mut key) = self.key.write() {
            *key = None;
        }
    }

    fn current_key(&self) -> Result<[u8; 32]> {
        self.key
            .read()
            .ok()
            .and_then(|k| *k)
            .ok_or_else(|| AgentError::Provider("Encryption engine is not configured".into()))
    }

    /// Performs the vault identity handshake.
    ///
    /// A vault without an identity gets one created: unencrypted when no
    /// password is supplied, otherwise encrypted with a fresh salt and a
    /// sealed verification token. An existing encrypted identity must be
    /// unlocked with the password; an existing unencrypted identity leaves
    /// the engine unconfigured (turning encryption on for a legacy vault is
    /// a UI-mediated flow, not something the core decides).
    ///
    /// # Errors
    /// `InvalidPassword` when the password is wrong or missing for an
    /// encrypted vault; provider errors when the identity cannot be
    /// read or written.
    #[tracing::instrument(skip(self, provider, password), err)]
    pub async fn handshake(
        &self,
        provider: &dyn VaultProvider,
        password: Option<&str>,
    ) -> Result<VaultIdentity> {
        if let Some(identity) = provider.load_identity().await.map_err(AgentError::from)? {
            if identity.salt.is_some() {
                let password = password.ok_or(AgentError::InvalidPassword)?;
                self.unlock(&identity, password)?;
            } else if password.is_some() {
                tracing::info!(vault_id = %identity.vault_id, "Vault is unencrypted; enabling encryption requires an explicit migration");
            }
            return Ok(identity);
        }

        let identity = if let Some(password) = password {
            let mut salt = [0u8; 32];
            OsRng.fill_bytes(&mut salt);
            let key = derive_key(password, &salt);
            let token = seal_verification_token(&key)?;
            let identity = VaultIdentity::encrypted(salt, token);
            provider.save_identity(&identity).await.map_err(AgentError::from)?;
            if let Ok(mut slot) = self.key.write() {
                *slot = Some(key);
            }
            identity
        } else {
            let identity = VaultIdentity::unencrypted();
            provider.save_identity(&identity).await.map_err(AgentError::from)?;
            identity
        };

        tracing::info!(vault_id = %identity.vault_id, encrypted = identity.is_encrypted(), "Initialized vault identity");
        Ok(identity)
    }

    /// Unlocks an encrypted identity. Exactly one mismatch yields
    /// `InvalidPassword` and leaves the engine unconfigured.
    ///
    /// # Errors
    /// `InvalidPassword` if the token does not open to the expected value.
    pub fn unlock(&self, identity: &VaultIdentity, password: &str) -> Result<()> {
        let salt = identity.salt.as_ref().ok_or(AgentError::InvalidPassword)?;
        let token = identity.verification_token.as_ref().ok_or(AgentError::InvalidPassword)?;

        let key = derive_key(password, salt);
        let opened = open_block(&cipher_for(&key), token).map_err(|_| AgentError::InvalidPassword)?;
        if opened != VERIFICATION_PLAINTEXT {
            return Err(AgentError::InvalidPassword);
        }

        if let Ok(mut slot) = self.key.write() {
            *slot = Some(key);
        }
        Ok(())
    }

    /// Size of the encrypted artifact for a plaintext of `source_size` bytes.
    #[must_use]
    pub fn estimated_encrypted_size(source_size: u64) -> u64 {
        let chunks = source_size.div_ceil(CHUNK_SIZE as u64).max(1);
        HEADER_LEN as u64 + source_size + chunks * BLOCK_OVERHEAD as u64
    }

    /// Pre-flight check that the temp volume can hold the encrypted
    /// artifact plus slack.
    ///
    /// # Errors
    /// `DiskFull` when the volume lacks the estimated space.
    pub fn ensure_temp_capacity(temp_dir: &Path, source_size: u64) -> Result<()> {
        let required = Self::estimated_encrypted_size(source_size) + TEMP_SLACK;
        let available = fs4::available_space(temp_dir)?;
        if available < required {
            return Err(AgentError::DiskFull { required, available });
        }
        Ok(())
    }

    /// Encrypts `source` into `dest`, chunk by chunk. The whole file is
    /// never resident in memory; `cancel` is polled before every chunk and
    /// any failure or cancellation removes the partial output.
    ///
    /// # Errors
    /// `Cancelled` when the cancel check fires; I/O and cipher failures
    /// otherwise.
    #[tracing::instrument(level = "debug", skip(self, cancel), err)]
    pub async fn encrypt_file(
        &self,
        source: &Path,
        dest: &Path,
        cancel: impl Fn() -> bool + Send,
    ) -> Result<u64> {
        let key = self.current_key()?;
        let cipher = cipher_for(&key);

        let result = async {
            let mut reader = tokio::fs::File::open(source).await?;
            let mut writer = tokio::fs::File::create(dest).await?;
            let mut written = 0u64;

            let mut header = [0u8; HEADER_LEN];
            header[..MAGIC.len()].copy_from_slice(&MAGIC);
            header[MAGIC.len()] = FORMAT_VERSION;
            writer.write_all(&header).await?;
            written += header.len() as u64;

            let mut first = true;
            loop {
                if cancel() {
                    return Err(AgentError::Cancelled);
                }

                let mut plaintext = Vec::with_capacity(CHUNK_SIZE.min(1 << 20));
                (&mut reader).take(CHUNK_SIZE as u64).read_to_end(&mut plaintext).await?;
                if plaintext.is_empty() && !first {
                    break;
                }

                let block = seal_block(&cipher, &plaintext)?;
                writer.write_all(&block).await?;
                written += block.len() as u64;

                let last = plaintext.len() < CHUNK_SIZE;
                first = false;
                if last {
                    break;
                }
            }

            writer.flush().await?;
            Ok(written)
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    /// Decrypts `source` into `dest`. Accepts both headered streams and the
    /// legacy headerless layout. A failure on any block removes the partial
    /// destination.
    ///
    /// # Errors
    /// Authentication failures, truncated blocks, and I/O errors.
    #[tracing::instrument(level = "debug", skip(self, cancel), err)]
    pub async fn decrypt_file(
        &self,
        source: &Path,
        dest: &Path,
        cancel: impl Fn() -> bool + Send,
    ) -> Result<()> {
        let key = self.current_key()?;
        let cipher = cipher_for(&key);
        let block_len = CHUNK_SIZE + BLOCK_OVERHEAD;

        let result = async {
            let mut reader = tokio::fs::File::open(source).await?;
            let mut writer = tokio::fs::File::create(dest).await?;

            // Probe for the safety header; without it the bytes belong to
            // the first block of a legacy stream.
            let mut probe = Vec::with_capacity(HEADER_LEN);
            (&mut reader).take(HEADER_LEN as u64).read_to_end(&mut probe).await?;
            let mut carry =
                if probe.as_slice() == [MAGIC.as_slice(), &[FORMAT_VERSION]].concat() { Vec::new() } else { probe };

            loop {
                if cancel() {
                    return Err(AgentError::Cancelled);
                }

                let mut block = std::mem::take(&mut carry);
                (&mut reader).take((block_len - block.len()) as u64).read_to_end(&mut block).await?;
                if block.is_empty() {
                    break;
                }

                let plaintext = open_block(&cipher, &block)?;
                writer.write_all(&plaintext).await?;

                if block.len() < block_len {
                    break;
                }
            }

            writer.flush().await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }
}

/// Streaming SHA-256 of a file, as lowercase hex.
///
/// # Errors
/// Returns the underlying I/O error.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
