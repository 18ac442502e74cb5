//! RSA signing keys and their JWKS projection.
//!
//! The active key lives on disk as `private_key.pem` (PKCS#8, mode 0600),
//! `public_key.pem` (SPKI) and a `kid` file, and is reused on every start so
//! tokens stay verifiable across restarts. Keys retired by rotation keep only
//! their public half, in `retired.json`, newest first.
//!
//! Updates are staged: every file of an update is written into `staging.tmp/`,
//! which is renamed to `staging/` once complete, and then moved into place.
//! A leftover `staging/` is rolled forward on the next load and a leftover
//! `staging.tmp/` is thrown away, so a crash never mixes two keys.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use thiserror::Error;

pub const DEFAULT_KID: &str = "default-key-2025";
pub const DEFAULT_KEY_BITS: usize = 2048;

/// retired keys still published for verification
const MAX_RETIRED_KEYS: usize = 3;

const PRIVATE_KEY_FILE: &str = "private_key.pem";
const PUBLIC_KEY_FILE: &str = "public_key.pem";
const KID_FILE: &str = "kid";
const RETIRED_FILE: &str = "retired.json";
const STAGING_DIR: &str = "staging";
const STAGING_TMP_DIR: &str = "staging.tmp";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to access key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to generate RSA key: {0}")]
    Generate(#[from] rsa::Error),

    #[error("invalid key material in {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KeyError + '_ {
    move |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn invalid(path: &Path) -> impl Fn(String) -> KeyError + '_ {
    move |reason| KeyError::Invalid {
        path: path.to_path_buf(),
        reason,
    }
}

/// JWK representation of an RSA public key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub kid: String,
    /// modulus, base64url big-endian
    pub n: String,
    /// exponent, base64url big-endian
    pub e: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

/// Public half of a key: all it takes to check a signature or publish it.
#[derive(Clone)]
pub struct VerifyingKey {
    kid: String,
    public_key: RsaPublicKey,
    decoding_key: DecodingKey,
}

impl VerifyingKey {
    fn new(kid: &str, public_key: RsaPublicKey) -> Self {
        let decoding_key = DecodingKey::from_rsa_raw_components(
            &public_key.n().to_bytes_be(),
            &public_key.e().to_bytes_be(),
        );
        Self {
            kid: kid.to_string(),
            public_key,
            decoding_key,
        }
    }

    pub fn to_jwk(&self) -> JsonWebKey {
        jwk_for(&self.kid, &self.public_key)
    }
}

fn jwk_for(kid: &str, public_key: &RsaPublicKey) -> JsonWebKey {
    JsonWebKey {
        kty: "RSA".to_string(),
        key_use: "sig".to_string(),
        alg: "RS256".to_string(),
        kid: kid.to_string(),
        n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    }
}

#[derive(Clone)]
pub struct RsaKeyPair {
    private_key: RsaPrivateKey,
    encoding_key: EncodingKey,
    verifying: VerifyingKey,
}

impl RsaKeyPair {
    pub fn generate(kid: &str, bits: usize) -> Result<Self, KeyError> {
        let mut rng = rand_core::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)?;
        Self::from_private_key(kid, private_key, Path::new("<generated>"))
    }

    fn from_private_key(
        kid: &str,
        private_key: RsaPrivateKey,
        origin: &Path,
    ) -> Result<Self, KeyError> {
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| invalid(origin)(e.to_string()))?;
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| invalid(origin)(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key,
            encoding_key,
            verifying: VerifyingKey::new(kid, public_key),
        })
    }

    pub fn kid(&self) -> &str {
        &self.verifying.kid
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    fn public_pem(&self) -> Result<String, KeyError> {
        public_pem(&self.verifying.public_key)
    }
}

fn public_pem(public_key: &RsaPublicKey) -> Result<String, KeyError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| invalid(Path::new("<public key>"))(e.to_string()))
}

/// On-disk form of a retired key
#[derive(Debug, Serialize, Deserialize)]
struct RetiredKeyRecord {
    kid: String,
    public_key_pem: String,
}

struct KeyRing {
    active: RsaKeyPair,
    /// newest first
    retired: Vec<VerifyingKey>,
}

impl KeyRing {
    /// Active key first, then the retired ones
    fn published(&self) -> impl Iterator<Item = &VerifyingKey> {
        std::iter::once(&self.active.verifying).chain(self.retired.iter())
    }
}

pub struct KeyManager {
    dir: PathBuf,
    bits: usize,
    ring: RwLock<KeyRing>,
}

impl KeyManager {
    /// Loads the persisted key from `dir`, or generates and persists a new one
    /// under `kid` if there's nothing there yet.
    ///
    /// Errors here are meant to stop startup: signing with a key that was never
    /// saved would orphan every token on the next restart.
    pub fn load_or_create(dir: impl Into<PathBuf>, kid: &str, bits: usize) -> Result<Self, KeyError> {
        let dir = dir.into();
        if dir.is_dir() {
            recover_staging(&dir)?;
        }

        let private_path = dir.join(PRIVATE_KEY_FILE);
        let ring = if private_path.exists() {
            let active = load_keypair(&dir, kid)?;
            let retired = load_retired(&dir, active.kid())?;
            tracing::info!(
                "Loaded signing key '{}' and {} retired key(s) from {}",
                active.kid(),
                retired.len(),
                dir.display()
            );
            KeyRing { active, retired }
        } else {
            tracing::info!("Generating new RSA keypair in {}", dir.display());
            let active = RsaKeyPair::generate(kid, bits)?;
            commit(&dir, &keypair_files(&active)?)?;
            tracing::info!("Keys saved to {}", dir.display());
            KeyRing {
                active,
                retired: Vec::new(),
            }
        };

        Ok(Self {
            dir,
            bits,
            ring: RwLock::new(ring),
        })
    }

    fn ring(&self) -> RwLockReadGuard<'_, KeyRing> {
        self.ring.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_kid(&self) -> String {
        self.ring().active.kid().to_string()
    }

    /// Runs `f` against the current signing key.
    pub fn with_signing_key<R>(&self, f: impl FnOnce(&RsaKeyPair) -> R) -> R {
        f(&self.ring().active)
    }

    /// Verification key for `kid`, covering the active and retired keys.
    pub fn decoding_key(&self, kid: &str) -> Option<DecodingKey> {
        self.ring()
            .published()
            .find(|key| key.kid == kid)
            .map(|key| key.decoding_key.clone())
    }

    pub fn public_key_as_jwk(&self, kid: &str) -> Option<JsonWebKey> {
        self.ring()
            .published()
            .find(|key| key.kid == kid)
            .map(VerifyingKey::to_jwk)
    }

    /// Active key first, then anything retired that may still sign live tokens.
    pub fn jwks(&self) -> JsonWebKeySet {
        JsonWebKeySet {
            keys: self.ring().published().map(VerifyingKey::to_jwk).collect(),
        }
    }

    /// Generates and persists a new active key. The previous one is kept,
    /// public half only, so outstanding tokens keep verifying across restarts.
    /// Blocks for as long as RSA key generation takes.
    pub fn rotate(&self, new_kid: &str) -> Result<(), KeyError> {
        let pair = RsaKeyPair::generate(new_kid, self.bits)?;

        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        if ring.published().any(|key| key.kid == new_kid) {
            return Err(invalid(&self.dir)(format!("kid '{}' is already in use", new_kid)));
        }

        let mut retired = vec![ring.active.verifying.clone()];
        retired.extend(ring.retired.iter().cloned());
        retired.truncate(MAX_RETIRED_KEYS);

        let mut files = keypair_files(&pair)?;
        files.push(retired_file(&retired)?);
        commit(&self.dir, &files)?;

        tracing::info!("Rotated signing key '{}' -> '{}'", ring.active.kid(), new_kid);
        ring.active = pair;
        ring.retired = retired;
        Ok(())
    }
}

/// A file of a staged update: name, contents, owner-only
type StagedFile = (&'static str, Vec<u8>, bool);

fn keypair_files(pair: &RsaKeyPair) -> Result<Vec<StagedFile>, KeyError> {
    let private_pem = pair
        .private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| invalid(Path::new(PRIVATE_KEY_FILE))(e.to_string()))?;

    Ok(vec![
        (PRIVATE_KEY_FILE, private_pem.as_bytes().to_vec(), true),
        (PUBLIC_KEY_FILE, pair.public_pem()?.into_bytes(), false),
        (KID_FILE, pair.kid().as_bytes().to_vec(), false),
    ])
}

fn retired_file(retired: &[VerifyingKey]) -> Result<StagedFile, KeyError> {
    let records = retired
        .iter()
        .map(|key| {
            Ok(RetiredKeyRecord {
                kid: key.kid.clone(),
                public_key_pem: public_pem(&key.public_key)?,
            })
        })
        .collect::<Result<Vec<_>, KeyError>>()?;
    let json = serde_json::to_vec_pretty(&records)
        .map_err(|e| invalid(Path::new(RETIRED_FILE))(e.to_string()))?;
    Ok((RETIRED_FILE, json, false))
}

fn load_keypair(dir: &Path, default_kid: &str) -> Result<RsaKeyPair, KeyError> {
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);
    let kid_path = dir.join(KID_FILE);

    let private_pem = std::fs::read_to_string(&private_path).map_err(io_err(&private_path))?;
    let private_key =
        RsaPrivateKey::from_pkcs8_pem(&private_pem).map_err(|e| invalid(&private_path)(e.to_string()))?;

    let kid = match std::fs::read_to_string(&kid_path) {
        Ok(kid) if !kid.trim().is_empty() => kid.trim().to_string(),
        Ok(_) => default_kid.to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => default_kid.to_string(),
        Err(e) => return Err(io_err(&kid_path)(e)),
    };

    let pair = RsaKeyPair::from_private_key(&kid, private_key, &private_path)?;

    // the private key is authoritative, a missing or foreign public half gets rewritten
    let public_matches = match std::fs::read_to_string(&public_path) {
        Ok(pem) => RsaPublicKey::from_public_key_pem(&pem)
            .is_ok_and(|public_key| public_key == pair.verifying.public_key),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(io_err(&public_path)(e)),
    };
    if !public_matches {
        tracing::warn!(
            "{} does not belong to {}, rewriting it",
            public_path.display(),
            private_path.display()
        );
        commit(dir, &[(PUBLIC_KEY_FILE, pair.public_pem()?.into_bytes(), false)])?;
    }

    Ok(pair)
}

fn load_retired(dir: &Path, active_kid: &str) -> Result<Vec<VerifyingKey>, KeyError> {
    let path = dir.join(RETIRED_FILE);
    let json = match std::fs::read(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(&path)(e)),
    };

    let records: Vec<RetiredKeyRecord> =
        serde_json::from_slice(&json).map_err(|e| invalid(&path)(e.to_string()))?;

    let mut retired = Vec::new();
    for record in records {
        if record.kid == active_kid || retired.iter().any(|k: &VerifyingKey| k.kid == record.kid) {
            continue;
        }
        let public_key = RsaPublicKey::from_public_key_pem(&record.public_key_pem)
            .map_err(|e| invalid(&path)(format!("retired key '{}': {}", record.kid, e)))?;
        retired.push(VerifyingKey::new(&record.kid, public_key));
    }
    retired.truncate(MAX_RETIRED_KEYS);
    Ok(retired)
}

/// Writes every file into a fresh staging directory, publishes the directory
/// with a single rename, then moves the files into place.
fn commit(dir: &Path, files: &[StagedFile]) -> Result<(), KeyError> {
    std::fs::create_dir_all(dir).map_err(io_err(dir))?;

    let tmp = dir.join(STAGING_TMP_DIR);
    remove_dir_if_present(&tmp)?;
    std::fs::create_dir(&tmp).map_err(io_err(&tmp))?;
    for (name, contents, private) in files {
        write_file(&tmp.join(name), contents, *private)?;
    }

    let staging = dir.join(STAGING_DIR);
    std::fs::rename(&tmp, &staging).map_err(io_err(&staging))?;
    roll_forward(dir)
}

/// Startup half of `commit`: finish a published update, drop an unpublished one.
fn recover_staging(dir: &Path) -> Result<(), KeyError> {
    let tmp = dir.join(STAGING_TMP_DIR);
    if tmp.exists() {
        tracing::warn!("Discarding incomplete key update in {}", tmp.display());
        remove_dir_if_present(&tmp)?;
    }
    if dir.join(STAGING_DIR).exists() {
        tracing::warn!("Finishing interrupted key update in {}", dir.display());
        roll_forward(dir)?;
    }
    Ok(())
}

/// Idempotent, safe to rerun after a crash halfway through.
fn roll_forward(dir: &Path) -> Result<(), KeyError> {
    let staging = dir.join(STAGING_DIR);
    let entries = std::fs::read_dir(&staging).map_err(io_err(&staging))?;
    for entry in entries {
        let entry = entry.map_err(io_err(&staging))?;
        let target = dir.join(entry.file_name());
        std::fs::rename(entry.path(), &target).map_err(io_err(&target))?;
    }
    std::fs::remove_dir(&staging).map_err(io_err(&staging))
}

fn remove_dir_if_present(path: &Path) -> Result<(), KeyError> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_err(path)(e)),
        _ => Ok(()),
    }
}

fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<(), KeyError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(path).map_err(io_err(path))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(io_err(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &Path) -> KeyManager {
        KeyManager::load_or_create(dir, DEFAULT_KID, DEFAULT_KEY_BITS).unwrap()
    }

    fn kids(keys: &KeyManager) -> Vec<String> {
        keys.jwks().keys.into_iter().map(|k| k.kid).collect()
    }

    #[test]
    fn test_generates_and_persists_keypair() {
        let dir = TempDir::new().unwrap();
        let keys = manager(dir.path());

        assert_eq!(keys.active_kid(), DEFAULT_KID);
        assert!(dir.path().join(PRIVATE_KEY_FILE).exists());
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join(KID_FILE)).unwrap(),
            DEFAULT_KID
        );
        assert!(!dir.path().join(STAGING_DIR).exists());
        assert!(!dir.path().join(STAGING_TMP_DIR).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let keys = manager(dir.path());
        keys.rotate("key-2").unwrap();

        let mode = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_reload_reuses_persisted_key() {
        let dir = TempDir::new().unwrap();
        let first = manager(dir.path()).jwks();
        let second = manager(dir.path()).jwks();

        assert_eq!(first, second);
    }

    #[test]
    fn test_jwk_shape() {
        let dir = TempDir::new().unwrap();
        let keys = manager(dir.path());

        let jwk = keys.public_key_as_jwk(DEFAULT_KID).unwrap();
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.key_use, "sig");
        assert_eq!(jwk.alg, "RS256");
        // 65537
        assert_eq!(jwk.e, "AQAB");
        // 2048 bit modulus is 256 bytes -> 342 base64url chars
        assert_eq!(jwk.n.len(), 342);
        assert!(keys.public_key_as_jwk("unknown").is_none());

        let json = serde_json::to_value(keys.jwks()).unwrap();
        assert_eq!(json["keys"][0]["use"], "sig");
        assert_eq!(json["keys"][0]["kid"], DEFAULT_KID);
    }

    #[test]
    fn test_foreign_public_half_is_rewritten() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let expected = manager(a.path()).jwks();
        manager(b.path());

        std::fs::copy(
            b.path().join(PUBLIC_KEY_FILE),
            a.path().join(PUBLIC_KEY_FILE),
        )
        .unwrap();

        assert_eq!(manager(a.path()).jwks(), expected);
        let public_pem = std::fs::read_to_string(a.path().join(PUBLIC_KEY_FILE)).unwrap();
        let on_disk = RsaPublicKey::from_public_key_pem(&public_pem).unwrap();
        assert_eq!(jwk_for(DEFAULT_KID, &on_disk), expected.keys[0]);
    }

    #[test]
    fn test_corrupt_private_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        manager(dir.path());
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "not a key").unwrap();

        assert!(matches!(
            KeyManager::load_or_create(dir.path(), DEFAULT_KID, DEFAULT_KEY_BITS),
            Err(KeyError::Invalid { .. })
        ));
    }

    #[test]
    fn test_interrupted_update_is_rolled_forward() {
        let current = TempDir::new().unwrap();
        let next = TempDir::new().unwrap();
        manager(current.path());
        let next_jwks = KeyManager::load_or_create(next.path(), "key-2", DEFAULT_KEY_BITS)
            .unwrap()
            .jwks();

        // crash after the public half was moved into place, before the rest
        let staging = current.path().join(STAGING_DIR);
        std::fs::create_dir(&staging).unwrap();
        for name in [PRIVATE_KEY_FILE, KID_FILE] {
            std::fs::copy(next.path().join(name), staging.join(name)).unwrap();
        }
        std::fs::copy(
            next.path().join(PUBLIC_KEY_FILE),
            current.path().join(PUBLIC_KEY_FILE),
        )
        .unwrap();

        let keys = manager(current.path());
        assert_eq!(keys.active_kid(), "key-2");
        assert_eq!(keys.jwks(), next_jwks);
        assert!(!staging.exists());
    }

    #[test]
    fn test_unpublished_update_is_discarded() {
        let dir = TempDir::new().unwrap();
        let expected = manager(dir.path()).jwks();

        let tmp = dir.path().join(STAGING_TMP_DIR);
        std::fs::create_dir(&tmp).unwrap();
        std::fs::write(tmp.join(PRIVATE_KEY_FILE), "half written").unwrap();

        assert_eq!(manager(dir.path()).jwks(), expected);
        assert!(!tmp.exists());
    }

    #[test]
    fn test_unwritable_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("keys");
        std::fs::write(&blocker, "not a directory").unwrap();

        assert!(matches!(
            KeyManager::load_or_create(&blocker, DEFAULT_KID, DEFAULT_KEY_BITS),
            Err(KeyError::Io { .. })
        ));
    }

    #[test]
    fn test_rotate_keeps_old_key_published() {
        let dir = TempDir::new().unwrap();
        let keys = manager(dir.path());

        keys.rotate("key-2").unwrap();

        assert_eq!(keys.active_kid(), "key-2");
        assert_eq!(kids(&keys), vec!["key-2".to_string(), DEFAULT_KID.to_string()]);
        assert!(keys.decoding_key(DEFAULT_KID).is_some());

        // both survive a restart, in the same order
        let reloaded = manager(dir.path());
        assert_eq!(reloaded.active_kid(), "key-2");
        assert_eq!(reloaded.jwks(), keys.jwks());
    }

    #[test]
    fn test_retired_keys_are_capped() {
        let dir = TempDir::new().unwrap();
        let keys = manager(dir.path());
        for i in 2..=6 {
            keys.rotate(&format!("key-{i}")).unwrap();
        }

        let expected = vec!["key-6", "key-5", "key-4", "key-3"];
        assert_eq!(kids(&keys), expected);
        assert_eq!(kids(&manager(dir.path())), expected);
    }

    #[test]
    fn test_rotate_to_published_kid_is_rejected() {
        let dir = TempDir::new().unwrap();
        let keys = manager(dir.path());
        keys.rotate("key-2").unwrap();

        for kid in ["key-2", DEFAULT_KID] {
            assert!(matches!(keys.rotate(kid), Err(KeyError::Invalid { .. })));
        }
        assert_eq!(kids(&keys), vec!["key-2".to_string(), DEFAULT_KID.to_string()]);
    }
}
