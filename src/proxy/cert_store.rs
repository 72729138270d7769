//! Filesystem persistence for the root CA.
//!
//! The CA lives in two PEM files under `<base>/certificates/`. Both are
//! written atomically (temp + rename) and the private key is chmod 0600.

use crate::proxy::cert_minter;
use anyhow::{anyhow, Context};
use rcgen::{Certificate, CertificateParams, KeyPair};
use rustls::pki_types::CertificateDer;
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

const CA_KEY_FILE: &str = "rootCA.key";
const CA_CERT_FILE: &str = "rootCA.crt";

/// A loaded CA is regenerated when fewer than this many days of validity
/// remain.
const MIN_REMAINING_DAYS: i64 = 30;

/// Loaded root CA material, shared read-only after initialization.
pub struct RootCa {
    pub(crate) cert: Certificate,
    pub(crate) key: KeyPair,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

impl RootCa {
    /// PEM-encoded CA certificate, exactly the bytes clients install.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER encoding of the installed certificate.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

/// Persistent storage of the root CA key and certificate.
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            dir: base_dir.join("certificates"),
        }
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILE)
    }

    fn cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    /// Load the CA from disk, generating and persisting a fresh one when
    /// either file is missing or fewer than 30 days of validity remain.
    pub fn load_or_initialize(&self) -> anyhow::Result<RootCa> {
        let key_path = self.key_path();
        let cert_path = self.cert_path();

        if key_path.exists() && cert_path.exists() {
            let key_pem =
                fs::read_to_string(&key_path).context("reading CA key file")?;
            let cert_pem =
                fs::read_to_string(&cert_path).context("reading CA certificate file")?;
            let key = KeyPair::from_pem(&key_pem).context("parsing CA key")?;
            let params =
                CertificateParams::from_ca_cert_pem(&cert_pem).context("parsing CA certificate")?;

            let horizon = OffsetDateTime::now_utc() + Duration::days(MIN_REMAINING_DAYS);
            if params.not_after > horizon {
                let cert = params
                    .self_signed(&key)
                    .context("reconstructing CA certificate")?;
                let cert_der = pem_to_der(&cert_pem)?;
                return Ok(RootCa {
                    cert,
                    key,
                    cert_pem,
                    cert_der,
                });
            }
            tracing::warn!(
                "Root CA expires within {} days; generating a replacement",
                MIN_REMAINING_DAYS
            );
        }

        let (cert, key) = cert_minter::generate_root()?;
        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();

        fs::create_dir_all(&self.dir).context("creating certificate directory")?;
        write_atomic(&key_path, key_pem.as_bytes(), true)?;
        write_atomic(&cert_path, cert_pem.as_bytes(), false)?;
        tracing::info!("Generated new root CA at {:?}", cert_path);

        let cert_der = CertificateDer::from(cert.der().to_vec());
        Ok(RootCa {
            cert,
            key,
            cert_pem,
            cert_der,
        })
    }

    /// CA certificate as installed on disk, PEM encoded.
    pub fn read_pem(&self) -> anyhow::Result<Vec<u8>> {
        fs::read(self.cert_path()).context("reading CA certificate file")
    }

    /// CA certificate as installed on disk, DER encoded.
    pub fn read_der(&self) -> anyhow::Result<Vec<u8>> {
        let pem = fs::read_to_string(self.cert_path()).context("reading CA certificate file")?;
        Ok(pem_to_der(&pem)?.to_vec())
    }
}

fn pem_to_der(pem: &str) -> anyhow::Result<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .ok_or_else(|| anyhow!("no certificate in PEM data"))?
        .context("decoding certificate PEM")
}

/// Write via a sibling temp file and rename so a crash never leaves a
/// half-written CA behind.
fn write_atomic(path: &Path, bytes: &[u8], private: bool) -> anyhow::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    fs::write(&tmp, bytes).with_context(|| format!("writing {:?}", tmp))?;
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .context("restricting key file permissions")?;
    }
    #[cfg(not(unix))]
    let _ = private;
    fs::rename(&tmp, path).with_context(|| format!("renaming {:?} into place", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn initializes_once_and_reuses_existing_files() {
        let dir = tempdir().unwrap();
        let store = CertStore::new(dir.path());

        let first = store.load_or_initialize().expect("initial creation");
        assert!(store.key_path().exists());
        assert!(store.cert_path().exists());

        let second = store.load_or_initialize().expect("reuse existing");
        assert_eq!(first.cert_pem(), second.cert_pem());
        assert_eq!(
            fs::read(store.cert_path()).unwrap(),
            store.read_pem().unwrap()
        );
    }

    #[test]
    fn der_matches_installed_pem() {
        let dir = tempdir().unwrap();
        let store = CertStore::new(dir.path());
        let root = store.load_or_initialize().unwrap();
        let der = store.read_der().unwrap();
        assert_eq!(der, root.cert_der().as_ref());
        // DER certificates start with a SEQUENCE tag.
        assert_eq!(der[0], 0x30);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = CertStore::new(dir.path());
        store.load_or_initialize().unwrap();
        let mode = fs::metadata(store.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn near_expiry_ca_is_replaced() {
        let dir = tempdir().unwrap();
        let store = CertStore::new(dir.path());

        let now = OffsetDateTime::now_utc();
        let (cert, key) = cert_minter::generate_root_with_validity(
            now - Duration::hours(1),
            now + Duration::days(10),
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("certificates")).unwrap();
        fs::write(store.cert_path(), cert.pem()).unwrap();
        fs::write(store.key_path(), key.serialize_pem()).unwrap();

        let reloaded = store.load_or_initialize().expect("regenerates");
        assert_ne!(reloaded.cert_pem(), cert.pem());
        let params = CertificateParams::from_ca_cert_pem(reloaded.cert_pem()).unwrap();
        assert!(params.not_after > now + Duration::days(365));
    }
}
