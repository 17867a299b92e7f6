// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Keystore: the node's long-lived identity bundle.
//!
//! Two keypairs are persisted under the data directory:
//! - `signing.key` - Ed25519 PKCS#8, signs outgoing packets.
//! - `noise_static.key` - X25519 static keypair (`private || public`), the
//!   Noise identity; `SHA-256(public)` is the node's fingerprint.
//!
//! With `EMBERMESH_KEY_PASSPHRASE` set, both files are sealed at rest as
//! `EMBRKEY1 || salt(16) || nonce(12) || AES-256-GCM(key bytes)`, the AEAD
//! key stretched from the passphrase with PBKDF2-HMAC-SHA256
//! (`EMBERMESH_PBKDF2_ITERS` overrides the work factor within sane
//! bounds). Key files are written through a staged sibling and renamed
//! into place, created mode 0600. `panic_reset` deletes both files and
//! regenerates a fresh identity in place.

use crate::core::types::{Fingerprint, PeerId, NOISE_PATTERN};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use ring::{aead, pbkdf2};
use std::io::Write;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use std::fs;
use thiserror::Error;
use zeroize::Zeroizing;

const SIGNING_KEY_FILE: &str = "signing.key";
const STATIC_KEY_FILE: &str = "noise_static.key";

const VAULT_MAGIC: &[u8; 8] = b"EMBRKEY1";
const VAULT_SALT_LEN: usize = 16;
const VAULT_NONCE_LEN: usize = 12;
// Magic + salt + nonce + at least an AEAD tag.
const VAULT_MIN_SEALED: usize = 8 + VAULT_SALT_LEN + VAULT_NONCE_LEN + 16;

const STRETCH_ITERS_DEFAULT: u32 = 100_000;
const SIGN_BUDGET_PER_SEC: u32 = 10_000;

/// Keystore errors.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Filesystem failure.
    #[error("io")]
    Io,
    /// Key file contents are not a valid key.
    #[error("invalid key encoding")]
    InvalidKey,
    /// Sealed key present but no passphrase set.
    #[error("missing passphrase (set EMBERMESH_KEY_PASSPHRASE)")]
    MissingPassphrase,
    /// Cryptographic primitive failure.
    #[error("crypto")]
    Crypto,
    /// Too many signing requests in one window.
    #[error("rate limited")]
    RateLimited,
    /// Signature did not verify.
    #[error("bad signature")]
    BadSignature,
}

/// Seals key material for disk and opens it again. One vault serves both
/// the signing-key and static-key paths; without a passphrase it is a
/// plaintext passthrough.
struct KeyVault {
    passphrase: Option<Zeroizing<Vec<u8>>>,
}

impl KeyVault {
    fn from_env() -> Self {
        let passphrase = std::env::var("EMBERMESH_KEY_PASSPHRASE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| Zeroizing::new(v.into_bytes()));
        Self { passphrase }
    }

    fn stretch_iters() -> NonZeroU32 {
        let iters = std::env::var("EMBERMESH_PBKDF2_ITERS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(STRETCH_ITERS_DEFAULT)
            .clamp(10_000, 10_000_000);
        NonZeroU32::new(iters).unwrap_or(NonZeroU32::MIN)
    }

    /// Stretch the passphrase over `salt` into an AEAD cipher.
    fn cipher(pass: &[u8], salt: &[u8]) -> Result<aead::LessSafeKey, KeystoreError> {
        let mut stretched = Zeroizing::new([0u8; 32]);
        let out: &mut [u8] = &mut *stretched;
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            Self::stretch_iters(),
            salt,
            pass,
            out,
        );
        aead::UnboundKey::new(&aead::AES_256_GCM, &*stretched)
            .map(aead::LessSafeKey::new)
            .map_err(|_| KeystoreError::Crypto)
    }

    fn seal(&self, secret: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        let Some(pass) = &self.passphrase else {
            return Ok(secret.to_vec());
        };

        // One random draw covers salt and nonce.
        let mut header = [0u8; VAULT_SALT_LEN + VAULT_NONCE_LEN];
        SystemRandom::new()
            .fill(&mut header)
            .map_err(|_| KeystoreError::Crypto)?;
        let (salt, nonce) = header.split_at(VAULT_SALT_LEN);
        let nonce: [u8; VAULT_NONCE_LEN] =
            nonce.try_into().map_err(|_| KeystoreError::Crypto)?;

        let cipher = Self::cipher(pass, salt)?;
        let mut sealed = secret.to_vec();
        cipher
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| KeystoreError::Crypto)?;

        let mut out = Vec::with_capacity(VAULT_MAGIC.len() + header.len() + sealed.len());
        out.extend_from_slice(VAULT_MAGIC);
        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unseal(&self, on_disk: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
        if !on_disk.starts_with(VAULT_MAGIC) {
            // Plaintext key material from before a passphrase was set.
            return Ok(Zeroizing::new(on_disk.to_vec()));
        }
        if on_disk.len() < VAULT_MIN_SEALED {
            return Err(KeystoreError::InvalidKey);
        }
        let Some(pass) = &self.passphrase else {
            return Err(KeystoreError::MissingPassphrase);
        };

        let (salt, rest) = on_disk[VAULT_MAGIC.len()..].split_at(VAULT_SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(VAULT_NONCE_LEN);
        let nonce: [u8; VAULT_NONCE_LEN] =
            nonce.try_into().map_err(|_| KeystoreError::InvalidKey)?;

        let cipher = Self::cipher(pass, salt)?;
        let mut buf = Zeroizing::new(ciphertext.to_vec());
        let plain_len = cipher
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut buf,
            )
            .map_err(|_| KeystoreError::Crypto)?
            .len();
        buf.truncate(plain_len);
        Ok(buf)
    }

    fn load(&self, path: &Path) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
        let raw = fs::read(path).map_err(|_| KeystoreError::Io)?;
        self.unseal(&raw)
    }

    /// Seal and persist: staged sibling file (created 0600), fsync, rename.
    fn store(&self, path: &Path, secret: &[u8]) -> Result<(), KeystoreError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|_| KeystoreError::Io)?;
        }
        let sealed = self.seal(secret)?;

        let staged = path.with_extension("staged");
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut f = options.open(&staged).map_err(|_| KeystoreError::Io)?;
            f.write_all(&sealed).map_err(|_| KeystoreError::Io)?;
            let _ = f.sync_all();
        }
        fs::rename(&staged, path).map_err(|_| KeystoreError::Io)
    }
}

/// Signing budget: a fixed allowance per one-second window, refilled on a
/// deadline.
struct SignBudget {
    resets_at: Instant,
    remaining: u32,
}

impl SignBudget {
    fn new() -> Self {
        Self {
            resets_at: Instant::now(),
            remaining: SIGN_BUDGET_PER_SEC,
        }
    }

    fn take(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.resets_at {
            self.resets_at = now + Duration::from_secs(1);
            self.remaining = SIGN_BUDGET_PER_SEC;
        }
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// The node's persisted identity: Ed25519 signing keypair plus X25519
/// static keypair.
pub struct Keystore {
    signing: Ed25519KeyPair,
    static_private: Zeroizing<Vec<u8>>,
    static_public: [u8; 32],
    data_dir: PathBuf,
    vault: KeyVault,
    budget: Mutex<SignBudget>,
}

impl Keystore {
    /// Load or create the identity bundle under `data_dir`.
    pub fn open(data_dir: &str) -> Result<Self, KeystoreError> {
        let dir = PathBuf::from(data_dir);
        fs::create_dir_all(&dir).map_err(|_| KeystoreError::Io)?;
        let vault = KeyVault::from_env();

        let signing = Self::signing_keypair(&vault, &dir.join(SIGNING_KEY_FILE))?;
        let (static_private, static_public) =
            Self::static_keypair(&vault, &dir.join(STATIC_KEY_FILE))?;

        Ok(Self {
            signing,
            static_private,
            static_public,
            data_dir: dir,
            vault,
            budget: Mutex::new(SignBudget::new()),
        })
    }

    fn signing_keypair(vault: &KeyVault, path: &Path) -> Result<Ed25519KeyPair, KeystoreError> {
        if path.exists() {
            let pkcs8 = vault.load(path)?;
            return Ed25519KeyPair::from_pkcs8(&pkcs8).map_err(|_| KeystoreError::InvalidKey);
        }

        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
            .map_err(|_| KeystoreError::Crypto)?;
        vault.store(path, pkcs8.as_ref())?;
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| KeystoreError::InvalidKey)
    }

    fn static_keypair(
        vault: &KeyVault,
        path: &Path,
    ) -> Result<(Zeroizing<Vec<u8>>, [u8; 32]), KeystoreError> {
        if path.exists() {
            let bundle = vault.load(path)?;
            if bundle.len() != 64 {
                return Err(KeystoreError::InvalidKey);
            }
            let private = Zeroizing::new(bundle[..32].to_vec());
            let mut public = [0u8; 32];
            public.copy_from_slice(&bundle[32..]);
            return Ok((private, public));
        }

        let params = NOISE_PATTERN.parse().map_err(|_| KeystoreError::Crypto)?;
        let keypair = snow::Builder::new(params)
            .generate_keypair()
            .map_err(|_| KeystoreError::Crypto)?;

        let private = Zeroizing::new(keypair.private.clone());
        let mut bundle = Zeroizing::new(Vec::with_capacity(64));
        bundle.extend_from_slice(&private);
        bundle.extend_from_slice(&keypair.public);
        vault.store(path, &bundle)?;

        let mut public = [0u8; 32];
        public.copy_from_slice(&keypair.public);
        Ok((private, public))
    }

    /// Ed25519 public key.
    pub fn signing_public(&self) -> [u8; 32] {
        let pk = self.signing.public_key().as_ref();
        let mut out = [0u8; 32];
        out.copy_from_slice(pk);
        out
    }

    /// X25519 static public key (the Noise identity).
    pub fn static_public(&self) -> [u8; 32] {
        self.static_public
    }

    /// Private half of the static key for building Noise handshakes.
    pub fn static_private_bytes(&self) -> Zeroizing<Vec<u8>> {
        self.static_private.clone()
    }

    /// `SHA-256(static_public)`, the stable identity.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_static_key(&self.static_public)
    }

    /// Sign message bytes, within the per-second budget.
    pub fn sign(&self, msg: &[u8]) -> Result<[u8; 64], KeystoreError> {
        {
            let mut budget = self.budget.lock().map_err(|_| KeystoreError::RateLimited)?;
            if !budget.take() {
                return Err(KeystoreError::RateLimited);
            }
        }

        let sig = self.signing.sign(msg);
        let mut out = [0u8; 64];
        out.copy_from_slice(sig.as_ref());
        Ok(out)
    }

    /// Generate a fresh random 8-byte peer ID (per process start or on
    /// rotation). Never returns the broadcast sentinel.
    pub fn fresh_peer_id(&self) -> Result<PeerId, KeystoreError> {
        let rng = SystemRandom::new();
        loop {
            let mut id = [0u8; 8];
            rng.fill(&mut id).map_err(|_| KeystoreError::Crypto)?;
            let peer = PeerId::from_bytes(id);
            if !peer.is_broadcast() {
                return Ok(peer);
            }
        }
    }

    /// Wipe both key files and regenerate a fresh identity in place.
    pub fn panic_reset(&mut self) -> Result<(), KeystoreError> {
        let signing_path = self.data_dir.join(SIGNING_KEY_FILE);
        let static_path = self.data_dir.join(STATIC_KEY_FILE);
        let _ = fs::remove_file(&signing_path);
        let _ = fs::remove_file(&static_path);

        self.signing = Self::signing_keypair(&self.vault, &signing_path)?;
        let (private, public) = Self::static_keypair(&self.vault, &static_path)?;
        self.static_private = private;
        self.static_public = public;
        Ok(())
    }
}

/// Verify an Ed25519 signature given raw public key bytes.
pub fn verify_bytes(pk: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> Result<(), KeystoreError> {
    let pk = UnparsedPublicKey::new(&ED25519, pk);
    pk.verify(msg, sig).map_err(|_| KeystoreError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_sign_verify() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ks = Keystore::open(dir.path().to_str().unwrap()).expect("open");
        let msg = b"canonical bytes";
        let sig = ks.sign(msg).expect("sign");
        verify_bytes(&ks.signing_public(), msg, &sig).expect("verify");
        assert!(verify_bytes(&ks.signing_public(), b"other", &sig).is_err());
    }

    #[test]
    fn identity_persists_across_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_str().unwrap().to_string();
        let (fp, spk) = {
            let ks = Keystore::open(&path).expect("open");
            (ks.fingerprint(), ks.signing_public())
        };
        let ks = Keystore::open(&path).expect("reopen");
        assert_eq!(ks.fingerprint(), fp);
        assert_eq!(ks.signing_public(), spk);
    }

    #[test]
    fn panic_reset_rotates_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ks = Keystore::open(dir.path().to_str().unwrap()).expect("open");
        let before = ks.fingerprint();
        ks.panic_reset().expect("reset");
        assert_ne!(ks.fingerprint(), before);
    }

    #[test]
    fn fresh_peer_ids_are_distinct() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ks = Keystore::open(dir.path().to_str().unwrap()).expect("open");
        let a = ks.fresh_peer_id().expect("id");
        let b = ks.fresh_peer_id().expect("id");
        assert_ne!(a, b);
    }

    #[test]
    fn vault_seal_roundtrip_with_passphrase() {
        let vault = KeyVault {
            passphrase: Some(Zeroizing::new(b"correct horse".to_vec())),
        };
        let secret = b"thirty-two bytes of key material";
        let sealed = vault.seal(secret).expect("seal");
        assert!(sealed.starts_with(VAULT_MAGIC));
        assert_ne!(&sealed[VAULT_MIN_SEALED - 16..], secret.as_slice());
        let opened = vault.unseal(&sealed).expect("unseal");
        assert_eq!(opened.as_slice(), secret);

        // The wrong passphrase fails closed.
        let wrong = KeyVault {
            passphrase: Some(Zeroizing::new(b"battery staple".to_vec())),
        };
        assert!(wrong.unseal(&sealed).is_err());

        // A vault without a passphrase cannot open sealed material.
        let locked_out = KeyVault { passphrase: None };
        assert!(matches!(
            locked_out.unseal(&sealed),
            Err(KeystoreError::MissingPassphrase)
        ));
    }
}
