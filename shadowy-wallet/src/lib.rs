use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shadowy_core::{hex_bytes, Address};
use shadowy_crypto::{CryptoError, Keypair};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PBKDF2_ROUNDS: u32 = 10_000;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("wallet encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("cipher failure")]
    Cipher,
    #[error("wrong password or corrupt wallet")]
    Unlock,
    #[error("key material: {0}")]
    Key(#[from] CryptoError),
    #[error("wallet {0} not found")]
    NotFound(String),
}

/// On-disk farmer wallet: the ML-DSA public half in the clear, the secret
/// half sealed with AES-256-GCM under a PBKDF2-derived key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub name: String,
    pub address: Address,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub encrypted_secret: Vec<u8>,
    pub nonce: [u8; 12],
}

/// Directory of `<name>.json` wallet files.
pub struct WalletStore {
    root: PathBuf,
}

impl WalletStore {
    pub fn new(root: PathBuf) -> Result<Self, WalletError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn create(&self, name: &str, password: &str) -> Result<Wallet, WalletError> {
        let keypair = Keypair::generate();
        self.import(name, password, &keypair)
    }

    pub fn import(
        &self,
        name: &str,
        password: &str,
        keypair: &Keypair,
    ) -> Result<Wallet, WalletError> {
        let (encrypted_secret, nonce) = encrypt_secret(&keypair.secret_key, password)?;
        let wallet = Wallet {
            name: name.to_string(),
            address: keypair.address(),
            public_key: keypair.public_key.clone(),
            encrypted_secret,
            nonce,
        };
        fs::write(self.path_of(name), serde_json::to_vec_pretty(&wallet)?)?;
        Ok(wallet)
    }

    pub fn list(&self) -> Result<Vec<Wallet>, WalletError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && entry.path().extension().map(|e| e == "json").unwrap_or(false)
            {
                let bytes = fs::read(entry.path())?;
                out.push(serde_json::from_slice(&bytes)?);
            }
        }
        out.sort_by(|a: &Wallet, b: &Wallet| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn load(&self, name: &str) -> Result<Wallet, WalletError> {
        let path = self.path_of(name);
        if !path.exists() {
            return Err(WalletError::NotFound(name.to_string()));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Decrypts the secret half and rebuilds the signing keypair.
    pub fn unlock(&self, wallet: &Wallet, password: &str) -> Result<Keypair, WalletError> {
        let secret = decrypt_secret(&wallet.encrypted_secret, &wallet.nonce, password)?;
        Ok(Keypair::from_parts(wallet.public_key.clone(), secret)?)
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }
}

fn encrypt_secret(secret: &[u8], password: &str) -> Result<(Vec<u8>, [u8; 12]), WalletError> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let mut key = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| WalletError::Cipher)?;
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), secret)
        .map_err(|_| WalletError::Cipher)?;
    let mut sealed = salt.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok((sealed, nonce_bytes))
}

fn decrypt_secret(
    sealed: &[u8],
    nonce: &[u8; 12],
    password: &str,
) -> Result<Vec<u8>, WalletError> {
    if sealed.len() < 16 {
        return Err(WalletError::Unlock);
    }
    let (salt, ciphertext) = sealed.split_at(16);
    let mut key = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| WalletError::Cipher)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| WalletError::Unlock)
}

/// Default wallet path inside the node data directory.
pub fn wallet_dir(base: &Path) -> PathBuf {
    base.join("wallets")
}
