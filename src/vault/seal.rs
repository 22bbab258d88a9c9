//! Sealing for the local fallback key file
//!
//! AES-256-GCM with a key-encryption key derived through HKDF-SHA256 from a
//! per-install random salt and the machine identity. The sealed blob is
//! `mhseal1:` followed by base64 of nonce || ciphertext || tag.

use super::BackendFault;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, Zeroizing};

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 32;
const TAG_LEN: usize = 16;
const SEAL_PREFIX: &str = "mhseal1:";
const HKDF_INFO: &[u8] = b"mailhub-local-dbkey-seal-v1";

/// HKDF output length marker
struct KekLen(usize);

impl hkdf::KeyType for KekLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Seals and opens small secrets bound to this install and machine
#[derive(Debug, Clone)]
pub struct LocalSealer {
    salt_path: PathBuf,
}

impl LocalSealer {
    pub fn new(salt_path: impl Into<PathBuf>) -> Self {
        Self {
            salt_path: salt_path.into(),
        }
    }

    pub fn salt_path(&self) -> &Path {
        &self.salt_path
    }

    fn salt(&self, create: bool) -> Result<[u8; SALT_LEN], BackendFault> {
        if self.salt_path.exists() {
            let data = fs::read(&self.salt_path)
                .map_err(|e| BackendFault::new(format!("failed to read seal salt: {}", e)))?;
            if data.len() == SALT_LEN {
                let mut salt = [0u8; SALT_LEN];
                salt.copy_from_slice(&data);
                return Ok(salt);
            }
            if !create {
                return Err(BackendFault::new("seal salt is corrupt"));
            }
        } else if !create {
            return Err(BackendFault::new("seal salt is missing"));
        }

        let mut salt = [0u8; SALT_LEN];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| BackendFault::new("failed to generate seal salt"))?;
        write_private(&self.salt_path, &salt)?;
        Ok(salt)
    }

    fn derive_kek(&self, create_salt: bool) -> Result<Zeroizing<[u8; 32]>, BackendFault> {
        let salt = self.salt(create_salt)?;
        let identity = Zeroizing::new(machine_identity()?);

        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt).extract(identity.as_bytes());
        let info: &[&[u8]] = &[HKDF_INFO];
        let okm = prk
            .expand(info, KekLen(32))
            .map_err(|_| BackendFault::new("HKDF expansion failed"))?;

        let mut kek = Zeroizing::new([0u8; 32]);
        okm.fill(&mut kek[..])
            .map_err(|_| BackendFault::new("HKDF fill failed"))?;
        Ok(kek)
    }

    /// Seal plaintext, creating the install salt on first use
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, BackendFault> {
        let kek = self.derive_kek(true)?;
        let key = LessSafeKey::new(
            UnboundKey::new(&AES_256_GCM, &kek[..])
                .map_err(|_| BackendFault::new("invalid sealing key"))?,
        );

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| BackendFault::new("failed to generate nonce"))?;

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(HKDF_INFO),
            &mut in_out,
        )
        .map_err(|_| BackendFault::new("sealing failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        in_out.zeroize();

        Ok(format!("{}{}", SEAL_PREFIX, STANDARD.encode(&blob)))
    }

    /// Open a sealed blob
    pub fn open(&self, sealed: &str) -> Result<Zeroizing<Vec<u8>>, BackendFault> {
        let encoded = sealed
            .trim()
            .strip_prefix(SEAL_PREFIX)
            .ok_or_else(|| BackendFault::new("sealed key has an unknown format"))?;
        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| BackendFault::new(format!("sealed key is not valid base64: {}", e)))?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(BackendFault::new("sealed key is truncated"));
        }

        let kek = self.derive_kek(false)?;
        let key = LessSafeKey::new(
            UnboundKey::new(&AES_256_GCM, &kek[..])
                .map_err(|_| BackendFault::new("invalid sealing key"))?,
        );

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| BackendFault::new("invalid nonce"))?;

        let mut in_out = Zeroizing::new(ciphertext.to_vec());
        let plaintext = key
            .open_in_place(nonce, Aad::from(HKDF_INFO), &mut in_out[..])
            .map_err(|_| {
                BackendFault::new("cannot unseal key: wrong machine, changed salt or corrupted file")
                    .with_suggestion("Restore the original salt file or run `mailhub vault setup` on this machine")
            })?;
        Ok(Zeroizing::new(plaintext.to_vec()))
    }
}

/// Identity material mixed into the sealing key
fn machine_identity() -> Result<String, BackendFault> {
    let mut parts: Vec<String> = Vec::new();

    #[cfg(target_os = "linux")]
    if let Ok(id) = fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if !id.is_empty() {
            parts.push(id.to_string());
        }
    }

    if let Ok(host) = hostname::get() {
        if let Some(h) = host.to_str() {
            if !h.is_empty() {
                parts.push(h.to_string());
            }
        }
    }

    for var in ["USER", "USERNAME"] {
        if let Ok(user) = std::env::var(var) {
            if !user.is_empty() {
                parts.push(user);
                break;
            }
        }
    }

    if let Some(home) = dirs::home_dir() {
        parts.push(home.to_string_lossy().to_string());
    }

    if parts.is_empty() {
        return Err(BackendFault::new("no machine identity available for key sealing"));
    }
    Ok(parts.join("|"))
}

/// Create parent dir (0700) and write a 0600 file
pub(crate) fn write_private(path: &Path, data: &[u8]) -> Result<(), BackendFault> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BackendFault::new(format!("cannot create {}: {}", parent.display(), e)))?;
        crate::store::restrict_dir_permissions(parent)
            .map_err(|e| BackendFault::new(format!("cannot restrict {}: {}", parent.display(), e)))?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| BackendFault::new(format!("cannot write {}: {}", path.display(), e)))?;
        file.write_all(data)
            .map_err(|e| BackendFault::new(format!("cannot write {}: {}", path.display(), e)))?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, data)
            .map_err(|e| BackendFault::new(format!("cannot write {}: {}", path.display(), e)))?;
    }

    crate::store::restrict_file_permissions(path)
        .map_err(|e| BackendFault::new(format!("cannot restrict {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_open() {
        let temp = TempDir::new().unwrap();
        let sealer = LocalSealer::new(temp.path().join(".seal_salt"));

        let sealed = sealer.seal(b"top secret key material").unwrap();
        assert!(sealed.starts_with(SEAL_PREFIX));
        assert!(!sealed.contains("top secret"));

        let opened = sealer.open(&sealed).unwrap();
        assert_eq!(opened.as_slice(), b"top secret key material");
    }

    #[test]
    fn test_different_salt_cannot_open() {
        let temp = TempDir::new().unwrap();
        let a = LocalSealer::new(temp.path().join("a_salt"));
        let b = LocalSealer::new(temp.path().join("b_salt"));

        let sealed = a.seal(b"payload").unwrap();
        // b has no salt yet and must not create one while opening
        assert!(b.open(&sealed).is_err());
        assert!(!b.salt_path().exists());

        b.seal(b"other").unwrap();
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let temp = TempDir::new().unwrap();
        let sealer = LocalSealer::new(temp.path().join(".seal_salt"));
        let sealed = sealer.seal(b"payload").unwrap();

        let mut blob = STANDARD.decode(sealed.trim_start_matches(SEAL_PREFIX)).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = format!("{}{}", SEAL_PREFIX, STANDARD.encode(&blob));
        assert!(sealer.open(&tampered).is_err());
        assert!(sealer.open("plain text").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_salt_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let sealer = LocalSealer::new(temp.path().join("state").join(".seal_salt"));
        sealer.seal(b"x").unwrap();
        let mode = fs::metadata(sealer.salt_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = fs::metadata(temp.path().join("state")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
