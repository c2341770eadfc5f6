//! On-disk certificate store
//!
//! Layout under `<cache_dir>/easypki`:
//!
//! ```text
//! easypki/root/certs/<name>.crt
//! easypki/root/keys/<name>.key
//! ```

use crate::error::CaError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Store directory name below the cache dir
pub const STORE_DIR: &str = "easypki";

/// Name of the root certificate inside the store
pub const ROOT_NAME: &str = "root";

/// PEM material for one certificate
#[derive(Debug, Clone)]
pub struct PemBundle {
    /// Certificate PEM
    pub cert_pem: String,
    /// Private key PEM
    pub key_pem: String,
}

/// File-backed certificate store
#[derive(Debug, Clone)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    /// Store rooted at `<cache_dir>/easypki`
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: cache_dir.as_ref().join(STORE_DIR),
        }
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Certificate file for `name`
    pub fn cert_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(ROOT_NAME)
            .join("certs")
            .join(format!("{}.crt", file_stem(name)))
    }

    /// Key file for `name`
    pub fn key_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(ROOT_NAME)
            .join("keys")
            .join(format!("{}.key", file_stem(name)))
    }

    /// Load a bundle; `Ok(None)` when either file is missing
    pub fn load(&self, name: &str) -> Result<Option<PemBundle>, CaError> {
        let cert_pem = match fs::read_to_string(self.cert_path(name)) {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key_pem = match fs::read_to_string(self.key_path(name)) {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(PemBundle { cert_pem, key_pem }))
    }

    /// Persist a bundle, creating directories as needed
    pub fn save(&self, name: &str, bundle: &PemBundle) -> Result<(), CaError> {
        let cert_path = self.cert_path(name);
        let key_path = self.key_path(name);
        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&key_path, &bundle.key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        fs::write(&cert_path, &bundle.cert_pem)?;
        Ok(())
    }
}

/// Map a certificate name onto a safe file stem
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '*' => '_',
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' => c,
            _ => '-',
        })
        .collect()
}
