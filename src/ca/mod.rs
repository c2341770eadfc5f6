//! Certificate authority for TLS interception
//!
//! Owns one long-lived root key pair and issues leaf certificates for the
//! server names clients ask for. Leaves are cached in memory (bounded LRU)
//! and persisted in a [`CertStore`]; issuance is serialized so concurrent
//! requests for the same name sign at most once.

mod cache;
mod store;

pub use store::{CertStore, PemBundle, ROOT_NAME, STORE_DIR};

use crate::error::CaError;
use cache::LruCache;
use chrono::{Datelike, NaiveDate, Utc};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info};

/// Organization placed in every subject
pub const SUBJECT_ORGANIZATION: &str = "SOT DO NOT TRUST";

/// Common name of the root certificate
pub const ROOT_COMMON_NAME: &str = "SOT DO NOT TRUST CA";

/// Default number of cached leaves
pub const DEFAULT_CACHE_CAPACITY: usize = 5000;

/// Default leaf validity
pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 365;

const ROOT_VALIDITY_YEARS: i32 = 100;

/// Certificate authority settings
#[derive(Debug, Clone)]
pub struct CaSettings {
    /// Collapse `a.b.example.com` to `*.b.example.com`
    pub wildcard: bool,
    /// Number of leaves kept in memory
    pub cache_capacity: usize,
    /// Leaf validity in days
    pub leaf_validity_days: u32,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            wildcard: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            leaf_validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
        }
    }
}

/// A signed leaf certificate together with its key
#[derive(Debug)]
pub struct LeafCert {
    name: String,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl LeafCert {
    /// Name the certificate was issued for (possibly a wildcard)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Leaf followed by the root
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }

    /// Private key of the leaf
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

struct Root {
    issuer: Issuer<'static, KeyPair>,
    der: CertificateDer<'static>,
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaStats {
    /// Leaves currently cached
    pub cached: usize,
    /// Leaves signed by this process
    pub issued: u64,
}

/// Root holder and leaf issuer
pub struct CertificateAuthority {
    store: CertStore,
    settings: CaSettings,
    root: OnceCell<Arc<Root>>,
    cache: Mutex<LruCache<String, Arc<LeafCert>>>,
    issue_lock: tokio::sync::Mutex<()>,
    issued: AtomicU64,
}

impl CertificateAuthority {
    /// Authority backed by `<cache_dir>/easypki`
    pub fn new(cache_dir: impl AsRef<Path>, settings: CaSettings) -> Self {
        Self {
            store: CertStore::new(cache_dir),
            cache: Mutex::new(LruCache::new(settings.cache_capacity)),
            settings,
            root: OnceCell::new(),
            issue_lock: tokio::sync::Mutex::new(()),
            issued: AtomicU64::new(0),
        }
    }

    /// Load the root from the store, creating and persisting it if absent
    pub async fn ensure_root(&self) -> Result<(), CaError> {
        self.root().await.map(|_| ())
    }

    /// DER of the root certificate
    pub async fn root_der(&self) -> Result<CertificateDer<'static>, CaError> {
        Ok(self.root().await?.der.clone())
    }

    /// Cache and issuance counters
    pub fn stats(&self) -> CaStats {
        CaStats {
            cached: self.cache.lock().len(),
            issued: self.issued.load(Ordering::Relaxed),
        }
    }

    /// Certificate name used for `domain` under the configured policy
    pub fn cert_name(&self, domain: &str) -> String {
        cert_name(domain, self.settings.wildcard)
    }

    /// Leaf certificate for `domain`
    ///
    /// Served from the cache, then from the store, and signed only when both
    /// miss.
    pub async fn issue(&self, domain: &str) -> Result<Arc<LeafCert>, CaError> {
        let name = self.cert_name(domain);
        if name.is_empty() {
            return Err(CaError::Generation("empty server name".into()));
        }
        if let Some(leaf) = self.cache.lock().get(&name) {
            debug!("{} certificate found in cache", name);
            return Ok(leaf);
        }

        let root = self.root().await?;
        let _guard = self.issue_lock.lock().await;
        if let Some(leaf) = self.cache.lock().get(&name) {
            return Ok(leaf);
        }

        let store = self.store.clone();
        let days = self.settings.leaf_validity_days;
        let job_name = name.clone();
        let (leaf, signed) =
            tokio::task::spawn_blocking(move || load_or_sign(&store, &root, &job_name, days))
                .await
                .map_err(|e| CaError::Generation(e.to_string()))??;
        if signed {
            self.issued.fetch_add(1, Ordering::Relaxed);
        }

        let leaf = Arc::new(leaf);
        self.cache.lock().insert(name, leaf.clone());
        Ok(leaf)
    }

    async fn root(&self) -> Result<Arc<Root>, CaError> {
        self.root
            .get_or_try_init(|| async {
                let store = self.store.clone();
                tokio::task::spawn_blocking(move || load_or_create_root(&store))
                    .await
                    .map_err(|e| CaError::Generation(e.to_string()))?
                    .map(Arc::new)
            })
            .await
            .cloned()
    }
}

/// Normalize a server name and apply the wildcard policy
///
/// Only names with at least three labels are widened, replacing the
/// leftmost label. IP addresses are never widened.
pub fn cert_name(domain: &str, wildcard: bool) -> String {
    let host = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    if !wildcard || host.parse::<IpAddr>().is_ok() || host.starts_with("*.") {
        return host;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 3 {
        return host;
    }
    format!("*.{}", labels[1..].join("."))
}

/// Subject alternative names for a certificate name
fn subject_alt_names(name: &str) -> Vec<String> {
    match name.strip_prefix("*.") {
        Some(base) => vec![name.to_string(), base.to_string()],
        None => vec![name.to_string()],
    }
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, SUBJECT_ORGANIZATION);
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Validity window starting yesterday and ending `until(today)`
fn set_validity(params: &mut CertificateParams, until: impl FnOnce(NaiveDate) -> NaiveDate) {
    let ymd = |d: NaiveDate| rcgen::date_time_ymd(d.year(), d.month() as u8, d.day() as u8);
    let today = Utc::now().date_naive();
    params.not_before = ymd(today.pred_opt().unwrap_or(today));
    params.not_after = ymd(until(today));
}

fn gen_err(e: rcgen::Error) -> CaError {
    CaError::Generation(e.to_string())
}

fn load_or_create_root(store: &CertStore) -> Result<Root, CaError> {
    let bundle = match store.load(ROOT_NAME)? {
        Some(bundle) => {
            debug!("Loaded root certificate from {:?}", store.cert_path(ROOT_NAME));
            bundle
        }
        None => {
            let bundle = generate_root()?;
            store.save(ROOT_NAME, &bundle)?;
            info!(
                "Generated new root certificate at {:?}",
                store.cert_path(ROOT_NAME)
            );
            bundle
        }
    };

    let key = KeyPair::from_pem(&bundle.key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
    let issuer = Issuer::from_ca_cert_pem(&bundle.cert_pem, key)
        .map_err(|e| CaError::Parse(e.to_string()))?;
    let der = first_cert(&bundle.cert_pem)?;
    Ok(Root { issuer, der })
}

fn generate_root() -> Result<PemBundle, CaError> {
    let key = KeyPair::generate().map_err(gen_err)?;
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(gen_err)?;
    params.distinguished_name = subject(ROOT_COMMON_NAME);
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, |today| {
        NaiveDate::from_ymd_opt(today.year() + ROOT_VALIDITY_YEARS, today.month(), 1)
            .unwrap_or(today)
    });

    let cert = params.self_signed(&key).map_err(gen_err)?;
    Ok(PemBundle {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn load_or_sign(
    store: &CertStore,
    root: &Root,
    name: &str,
    validity_days: u32,
) -> Result<(LeafCert, bool), CaError> {
    if let Some(bundle) = store.load(name)? {
        debug!("{} certificate found in local store", name);
        return Ok((leaf_from_bundle(name, &bundle, root)?, false));
    }

    let key = KeyPair::generate().map_err(gen_err)?;
    let mut params = CertificateParams::new(subject_alt_names(name)).map_err(gen_err)?;
    params.distinguished_name = subject(name);
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    set_validity(&mut params, |today| {
        today
            .checked_add_days(chrono::Days::new(validity_days as u64))
            .unwrap_or(today)
    });

    let cert = params.signed_by(&key, &root.issuer).map_err(gen_err)?;
    let bundle = PemBundle {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    };
    store.save(name, &bundle)?;
    info!("Issued certificate for {}", name);
    Ok((leaf_from_bundle(name, &bundle, root)?, true))
}

fn leaf_from_bundle(name: &str, bundle: &PemBundle, root: &Root) -> Result<LeafCert, CaError> {
    let leaf = first_cert(&bundle.cert_pem)?;
    let key = rustls_pemfile::private_key(&mut bundle.key_pem.as_bytes())
        .map_err(|e| CaError::Parse(e.to_string()))?
        .ok_or_else(|| CaError::Parse(format!("no private key stored for {}", name)))?;
    Ok(LeafCert {
        name: name.to_string(),
        chain: vec![leaf, root.der.clone()],
        key,
    })
}

fn first_cert(pem: &str) -> Result<CertificateDer<'static>, CaError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .ok_or_else(|| CaError::Parse("no certificate in PEM".into()))?
        .map_err(|e| CaError::Parse(e.to_string()))
}
