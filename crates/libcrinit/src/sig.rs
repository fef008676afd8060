//! Signature checking for configuration files.
//!
//! Trust is rooted in a public key held in the kernel's user keyring (loaded
//! there by the bootloader or an early userspace stage). The subsystem reads
//! that key, then walks the signed-key directory: every `<name>.key` must
//! come with a detached `<name>.key.sig` that verifies against the root key.
//! Keys that pass enter the signed-keys table; task and series files are then
//! accepted if their own `.sig` verifies against any table entry.
//!
//! All signatures are SHA-256 + RSA PKCS#1 v1.5; key blobs are DER or PEM
//! encoded RSA public keys of at most 4096 bytes. Anything that is not RSA is
//! rejected at parse time.

use std::path::Path;
use std::sync::RwLock;

use log::{info, trace, warn};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::lock_ext::RwLockExt;

/// Keyring description of the root key when none is configured.
pub const DEFAULT_ROOT_KEY_DESC: &str = "crinit-root";

/// Maximum accepted size of a key payload, in the keyring or on disk.
pub const MAX_KEY_PAYLOAD: usize = 4096;

const SIGNED_KEYS_INITIAL_SIZE: usize = 32;
const SIGNED_KEYS_SIZE_INCREMENT: usize = 32;

// keyctl(2) constants; the libc crate does not expose them.
const KEYCTL_SEARCH: libc::c_ulong = 10;
const KEYCTL_READ: libc::c_ulong = 11;
const KEY_SPEC_USER_KEYRING: libc::c_long = -4;

/// The signature verification context. One per process, created when the
/// `signatures` kernel-cmdline option is set.
pub struct SigContext {
    root_key: VerifyingKey<Sha256>,
    /// Signed signer keys. The lock guards table growth; verification takes
    /// the read side and may proceed concurrently.
    signed_keys: RwLock<Vec<VerifyingKey<Sha256>>>,
}

impl SigContext {
    /// Initialize from the user keyring: search for a `user`-type key whose
    /// description equals `root_key_desc` and parse its payload.
    pub fn from_keyring(root_key_desc: &str) -> Result<Self> {
        let payload = read_user_keyring_key(root_key_desc)?;
        Self::from_root_key_bytes(&payload)
    }

    /// Initialize from raw key bytes. Tests and alternate key sources inject
    /// through this.
    pub fn from_root_key_bytes(payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_KEY_PAYLOAD {
            return Err(Error::Crypto(format!(
                "root key payload exceeds {MAX_KEY_PAYLOAD} bytes"
            )));
        }
        let key = parse_rsa_public_key(payload)?;
        let mut table = Vec::new();
        table.reserve_exact(SIGNED_KEYS_INITIAL_SIZE);
        Ok(Self {
            root_key: VerifyingKey::<Sha256>::new(key),
            signed_keys: RwLock::new(table),
        })
    }

    /// Walk `dir` for `<name>.key` files, verify each against the root key
    /// using its `<name>.key.sig` sibling, and append the good ones to the
    /// signed-keys table. Returns the number of keys loaded.
    ///
    /// A key without a signature sibling, a bad signature, or an unparsable
    /// blob fails the whole load: a partially trusted key directory is worse
    /// than none.
    pub fn load_signed_keys(&self, dir: &Path) -> Result<usize> {
        let series = crate::fseries::FileSeries::from_dir(dir, ".key", false)?;
        let mut loaded = 0;
        for key_path in series.paths() {
            let sig_path = {
                let mut p = key_path.clone().into_os_string();
                p.push(".sig");
                std::path::PathBuf::from(p)
            };
            let key_blob = read_bounded(&key_path)?;
            let sig_blob = std::fs::read(&sig_path).map_err(|e| {
                Error::io(
                    format!("reading key signature {}", sig_path.display()),
                    e,
                )
            })?;
            let signature = Signature::try_from(sig_blob.as_slice()).map_err(|e| {
                Error::Crypto(format!("malformed signature {}: {e}", sig_path.display()))
            })?;
            self.root_key
                .verify(&key_blob, &signature)
                .map_err(|_| {
                    Error::Crypto(format!(
                        "signer key {} does not verify against the root key",
                        key_path.display()
                    ))
                })?;

            let key = parse_rsa_public_key(&key_blob)?;
            let mut table = self.signed_keys.write_poisoned();
            if table.len() == table.capacity() {
                table.reserve_exact(SIGNED_KEYS_SIZE_INCREMENT);
            }
            table.push(VerifyingKey::<Sha256>::new(key));
            loaded += 1;
            trace!("Loaded signed key {}", key_path.display());
        }
        info!("Loaded {loaded} signed key(s) from {}", dir.display());
        Ok(loaded)
    }

    /// Verify a payload against the signed-keys table. Success if any one
    /// key matches the detached signature.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::try_from(signature)
            .map_err(|e| Error::Crypto(format!("malformed detached signature: {e}")))?;
        let table = self.signed_keys.read_poisoned();
        if table.is_empty() {
            return Err(Error::Crypto(
                "no signed keys loaded; cannot verify payload".into(),
            ));
        }
        for key in table.iter() {
            if key.verify(payload, &signature).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Crypto(
            "payload signature does not match any signed key".into(),
        ))
    }

    /// Verify the file at `path` against its `<path>.sig` sibling.
    pub fn verify_file(&self, path: &Path) -> Result<()> {
        let sig_path = {
            let mut p = path.to_path_buf().into_os_string();
            p.push(".sig");
            std::path::PathBuf::from(p)
        };
        let payload = std::fs::read(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        let signature = std::fs::read(&sig_path)
            .map_err(|e| Error::io(format!("reading signature {}", sig_path.display()), e))?;
        self.verify(&payload, &signature)
    }

    /// Number of keys currently in the table.
    pub fn signed_key_count(&self) -> usize {
        self.signed_keys.read_poisoned().len()
    }
}

fn read_bounded(path: &Path) -> Result<Vec<u8>> {
    let blob =
        std::fs::read(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    if blob.len() > MAX_KEY_PAYLOAD {
        return Err(Error::Crypto(format!(
            "key {} exceeds {MAX_KEY_PAYLOAD} bytes",
            path.display()
        )));
    }
    Ok(blob)
}

/// Parse a DER- or PEM-encoded RSA public key. SPKI and PKCS#1 framings are
/// both accepted; any other algorithm fails.
fn parse_rsa_public_key(blob: &[u8]) -> Result<RsaPublicKey> {
    if let Ok(key) = RsaPublicKey::from_public_key_der(blob) {
        return Ok(key);
    }
    if let Ok(key) = RsaPublicKey::from_pkcs1_der(blob) {
        return Ok(key);
    }
    if let Ok(text) = std::str::from_utf8(blob) {
        if let Ok(key) = RsaPublicKey::from_public_key_pem(text) {
            return Ok(key);
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_pem(text) {
            return Ok(key);
        }
    }
    Err(Error::Crypto(
        "key payload is not an RSA public key (DER or PEM)".into(),
    ))
}

/// Search the user keyring for a `user`-type key with the given description
/// and read its payload.
fn read_user_keyring_key(desc: &str) -> Result<Vec<u8>> {
    let key_type = std::ffi::CString::new("user").unwrap();
    let desc_c = std::ffi::CString::new(desc)
        .map_err(|_| Error::InvalidInput("NUL byte in root key description".into()))?;

    let serial = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_SEARCH,
            KEY_SPEC_USER_KEYRING,
            key_type.as_ptr(),
            desc_c.as_ptr(),
            0 as libc::c_long,
        )
    };
    if serial < 0 {
        return Err(Error::os(
            format!("searching user keyring for key '{desc}'"),
            nix::Error::last(),
        ));
    }

    let mut payload = vec![0u8; MAX_KEY_PAYLOAD];
    let len = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_READ,
            serial,
            payload.as_mut_ptr(),
            payload.len(),
        )
    };
    if len < 0 {
        return Err(Error::os(
            format!("reading keyring key '{desc}'"),
            nix::Error::last(),
        ));
    }
    let len = len as usize;
    if len > MAX_KEY_PAYLOAD {
        return Err(Error::Crypto(format!(
            "keyring key '{desc}' payload exceeds {MAX_KEY_PAYLOAD} bytes"
        )));
    }
    payload.truncate(len);
    if payload.is_empty() {
        warn!("Keyring key '{desc}' has an empty payload");
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::SigningKey;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;

    // 1024-bit keys keep test-time key generation fast; verification code
    // paths are identical to production-size keys.
    fn gen_keypair() -> (RsaPrivateKey, Vec<u8>) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_der = private
            .to_public_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        (private, public_der)
    }

    fn sign(private: &RsaPrivateKey, payload: &[u8]) -> Vec<u8> {
        let signing = SigningKey::<Sha256>::new(private.clone());
        signing.sign(payload).to_bytes().to_vec()
    }

    #[test]
    fn root_key_parses_der_and_rejects_garbage() {
        let (_, public_der) = gen_keypair();
        SigContext::from_root_key_bytes(&public_der).unwrap();
        assert!(SigContext::from_root_key_bytes(b"not a key").is_err());
    }

    #[test]
    fn oversized_root_key_is_rejected() {
        let blob = vec![0u8; MAX_KEY_PAYLOAD + 1];
        assert!(SigContext::from_root_key_bytes(&blob).is_err());
    }

    #[test]
    fn signed_key_chain_and_payload_verification() {
        let (root_private, root_public) = gen_keypair();
        let (signer_private, signer_public) = gen_keypair();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("signer.key"), &signer_public).unwrap();
        std::fs::write(
            dir.path().join("signer.key.sig"),
            sign(&root_private, &signer_public),
        )
        .unwrap();

        let ctx = SigContext::from_root_key_bytes(&root_public).unwrap();
        assert_eq!(ctx.load_signed_keys(dir.path()).unwrap(), 1);
        assert_eq!(ctx.signed_key_count(), 1);

        let payload = b"NAME = hello\nCOMMAND = /bin/true\n";
        let good_sig = sign(&signer_private, payload);
        ctx.verify(payload, &good_sig).unwrap();

        // Signed by the root key, not a signer key: must not verify.
        let wrong_sig = sign(&root_private, payload);
        assert!(ctx.verify(payload, &wrong_sig).is_err());

        // Tampered payload.
        assert!(ctx.verify(b"NAME = evil\n", &good_sig).is_err());
    }

    #[test]
    fn key_without_signature_sibling_fails_load() {
        let (_, root_public) = gen_keypair();
        let (_, signer_public) = gen_keypair();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lonely.key"), &signer_public).unwrap();

        let ctx = SigContext::from_root_key_bytes(&root_public).unwrap();
        assert!(ctx.load_signed_keys(dir.path()).is_err());
    }

    #[test]
    fn badly_signed_key_fails_load() {
        let (_, root_public) = gen_keypair();
        let (other_private, _) = gen_keypair();
        let (_, signer_public) = gen_keypair();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("signer.key"), &signer_public).unwrap();
        std::fs::write(
            dir.path().join("signer.key.sig"),
            sign(&other_private, &signer_public),
        )
        .unwrap();

        let ctx = SigContext::from_root_key_bytes(&root_public).unwrap();
        assert!(ctx.load_signed_keys(dir.path()).is_err());
    }

    #[test]
    fn verify_without_signed_keys_is_an_error() {
        let (_, root_public) = gen_keypair();
        let ctx = SigContext::from_root_key_bytes(&root_public).unwrap();
        assert!(ctx.verify(b"payload", &[0u8; 128]).is_err());
    }

    #[test]
    fn verify_file_uses_sig_sibling() {
        let (root_private, root_public) = gen_keypair();
        let (signer_private, signer_public) = gen_keypair();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("signer.key"), &signer_public).unwrap();
        std::fs::write(
            dir.path().join("signer.key.sig"),
            sign(&root_private, &signer_public),
        )
        .unwrap();

        let ctx = SigContext::from_root_key_bytes(&root_public).unwrap();
        ctx.load_signed_keys(dir.path()).unwrap();

        let task_file = dir.path().join("hello.crinit");
        std::fs::write(&task_file, b"NAME = hello\n").unwrap();
        std::fs::write(
            dir.path().join("hello.crinit.sig"),
            sign(&signer_private, b"NAME = hello\n"),
        )
        .unwrap();
        ctx.verify_file(&task_file).unwrap();

        std::fs::write(&task_file, b"NAME = tampered\n").unwrap();
        assert!(ctx.verify_file(&task_file).is_err());
    }
}
