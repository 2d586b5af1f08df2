// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

//! Encrypted at-rest storage for tunnel configurations.
//!
//! One record per tunnel at `<data_dir>/tunnels/<name>.conf.enc`. A record is
//! `hex(iv):hex(ciphertext)` using AES-256-CBC with PKCS#7 padding and a fresh
//! random IV per write. The key is the SHA-256 digest of the installation's
//! data directory path, so records only open on the installation that wrote
//! them.
//!
//! Records that are not in that shape are returned verbatim as legacy
//! plaintext.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use wg_tunnel_common::tunnel_config::ensure_valid_name;
use wg_tunnel_common::{Error, Result};
use zeroize::Zeroizing;

use crate::permissions;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;
const RECORD_SUFFIX: &str = ".conf.enc";

pub struct SecureStore {
    dir: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl SecureStore {
    /// Open (creating if needed) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("tunnels");
        permissions::ensure_directory_with_permissions(&dir, false)
            .map_err(|e| Error::FileSystem(format!("{:#}", e)))?;

        let digest = Sha256::digest(data_dir.to_string_lossy().as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);

        debug!("Opened configuration store at {}", dir.display());
        Ok(Self { dir, key })
    }

    fn record_path(&self, name: &str) -> Result<PathBuf> {
        ensure_valid_name(name)?;
        Ok(self.dir.join(format!("{}{}", name, RECORD_SUFFIX)))
    }

    /// Encrypt and persist, replacing any existing record.
    pub fn put(&self, name: &str, plaintext: &str) -> Result<()> {
        let path = self.record_path(name)?;
        let record = self.encrypt(plaintext)?;

        let staging = path.with_extension("enc.tmp");
        fs::write(&staging, record.as_bytes())
            .map_err(|e| Error::FileSystem(format!("writing {}: {}", staging.display(), e)))?;
        permissions::set_file_permissions_private(&staging)
            .map_err(|e| Error::FileSystem(format!("{:#}", e)))?;
        fs::rename(&staging, &path).map_err(|e| {
            let _ = fs::remove_file(&staging);
            Error::FileSystem(format!("replacing {}: {}", path.display(), e))
        })?;

        debug!("Stored configuration for {}", name);
        Ok(())
    }

    /// Load and decrypt. Missing records are `ConfigNotFound`.
    pub fn get(&self, name: &str) -> Result<Zeroizing<String>> {
        let path = self.record_path(name)?;
        let record = match fs::read_to_string(&path) {
            Ok(record) => Zeroizing::new(record),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::ConfigNotFound(name.to_string()))
            }
            Err(e) => {
                return Err(Error::FileSystem(format!(
                    "reading {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        self.decrypt(&record)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.record_path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Names of all stored tunnels, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| Error::FileSystem(format!("listing {}: {}", self.dir.display(), e)))?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().into_string().ok()?;
                let name = file_name.strip_suffix(RECORD_SUFFIX)?;
                ensure_valid_name(name).ok()?;
                Some(name.to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.record_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::ConfigNotFound(name.to_string()))
            }
            Err(e) => Err(Error::FileSystem(format!(
                "removing {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let encryptor = Aes256CbcEnc::new_from_slices(self.key.as_slice(), &iv)
            .map_err(|e| Error::Encryption(format!("cipher init: {}", e)))?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    fn decrypt(&self, record: &str) -> Result<Zeroizing<String>> {
        let Some((iv_hex, body_hex)) = split_record(record) else {
            warn!("Found unencrypted configuration record; it will be encrypted on next write");
            return Ok(Zeroizing::new(record.to_string()));
        };

        let iv = hex::decode(iv_hex).map_err(|e| Error::Encryption(format!("bad IV: {}", e)))?;
        let ciphertext = hex::decode(body_hex)
            .map_err(|e| Error::Encryption(format!("bad ciphertext encoding: {}", e)))?;

        let decryptor = Aes256CbcDec::new_from_slices(self.key.as_slice(), &iv)
            .map_err(|e| Error::Encryption(format!("cipher init: {}", e)))?;
        let plaintext = Zeroizing::new(
            decryptor
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
                .map_err(|_| Error::Encryption("decryption failed".to_string()))?,
        );

        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| Error::Encryption("decrypted record is not UTF-8".to_string()))?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

/// Split an encrypted record into its IV and body. Returns `None` for
/// anything else, including plaintext that happens to hold one colon.
fn split_record(record: &str) -> Option<(&str, &str)> {
    let trimmed = record.trim();
    let (iv_hex, body_hex) = trimmed.split_once(':')?;
    let looks_encrypted = iv_hex.len() == IV_LEN * 2
        && iv_hex.bytes().all(|b| b.is_ascii_hexdigit())
        && !body_hex.contains(':')
        && !body_hex.chars().any(char::is_whitespace);
    looks_encrypted.then_some((iv_hex, body_hex))
}
