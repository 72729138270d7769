//! On-demand leaf certificate issuance.
//!
//! The minter owns the loaded root CA and a per-hostname cache of leaf
//! identities. Concurrent requests for the same hostname coalesce onto a
//! single key-generation + signing pass; everyone gets the same leaf.

use crate::proxy::cert_store::RootCa;
use anyhow::{anyhow, Context};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;

const PRODUCT_NAME: &str = "Wiretap";
const ROOT_CA_DAYS: i64 = 365 * 10;
const LEAF_DAYS: i64 = 365;

/// A minted per-hostname server identity.
pub struct LeafCert {
    pub hostname: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    cert_der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl LeafCert {
    /// TLS server configuration presenting this leaf (chain includes the CA).
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn valid_now(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        self.not_before <= now && now < self.not_after
    }
}

type LeafSlot = Arc<AsyncMutex<Option<Arc<LeafCert>>>>;

/// Issues and caches leaf certificates signed by the root CA.
pub struct CertMinter {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_der: CertificateDer<'static>,
    leaves: Mutex<HashMap<String, LeafSlot>>,
}

impl CertMinter {
    pub fn new(root: RootCa) -> Self {
        let ca_der = root.cert_der().clone();
        Self {
            ca_cert: root.cert,
            ca_key: root.key,
            ca_der,
            leaves: Mutex::new(HashMap::new()),
        }
    }

    /// DER of the signing CA, for callers that need a trust anchor.
    pub fn ca_certificate_der(&self) -> CertificateDer<'static> {
        self.ca_der.clone()
    }

    /// Produce (or reuse) the leaf identity for `hostname`.
    ///
    /// Single-flight per hostname: the first caller generates, concurrent
    /// callers await and receive the identical leaf. Expired entries are
    /// replaced on access.
    pub async fn mint(&self, hostname: &str) -> anyhow::Result<Arc<LeafCert>> {
        let slot = {
            let mut map = self.leaves.lock().expect("leaf cache lock poisoned");
            map.entry(hostname.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock().await;
        if let Some(leaf) = guard.as_ref() {
            if leaf.valid_now() {
                return Ok(leaf.clone());
            }
            tracing::debug!("Cached leaf for {} expired; reissuing", hostname);
        }

        let now = OffsetDateTime::now_utc();
        let leaf = Arc::new(
            self.issue(
                hostname,
                now.checked_sub(Duration::hours(1)).unwrap_or(now),
                now.checked_add(Duration::days(LEAF_DAYS)).unwrap_or(now),
            )
            .await?,
        );
        *guard = Some(leaf.clone());
        Ok(leaf)
    }

    /// Convenience: the rustls server config for `hostname`.
    pub async fn server_config_for(&self, hostname: &str) -> anyhow::Result<Arc<ServerConfig>> {
        Ok(self.mint(hostname).await?.server_config())
    }

    /// Drop every cached leaf.
    pub fn purge(&self) {
        let mut map = self.leaves.lock().expect("leaf cache lock poisoned");
        map.clear();
    }

    /// Number of hostnames with a minted leaf currently cached.
    pub fn cached_leaf_count(&self) -> usize {
        let map = self.leaves.lock().expect("leaf cache lock poisoned");
        map.values()
            .filter(|slot| match slot.try_lock() {
                Ok(guard) => guard.is_some(),
                Err(_) => true, // a mint is in flight
            })
            .count()
    }

    async fn issue(
        &self,
        hostname: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> anyhow::Result<LeafCert> {
        // RSA keygen is the expensive part; keep it off the async threads.
        let key_pair = tokio::task::spawn_blocking(generate_rsa_key_pair)
            .await
            .context("leaf key generation task failed")??;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        dn.push(DnType::OrganizationName, PRODUCT_NAME);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = leaf_sans(hostname)?;
        params.serial_number = Some(SerialNumber::from(uuid::Uuid::new_v4().as_bytes().to_vec()));
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("signing leaf certificate")?;

        let chain = vec![cert.der().clone(), self.ca_der.clone()];
        let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, PrivateKeyDer::from(key_der))
            .context("building TLS server config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(LeafCert {
            hostname: hostname.to_string(),
            not_before,
            not_after,
            cert_der: cert.der().clone(),
            server_config: Arc::new(config),
        })
    }

    #[cfg(test)]
    pub(crate) async fn mint_with_validity(
        &self,
        hostname: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> anyhow::Result<Arc<LeafCert>> {
        let slot = {
            let mut map = self.leaves.lock().unwrap();
            map.entry(hostname.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
                .clone()
        };
        let leaf = Arc::new(self.issue(hostname, not_before, not_after).await?);
        *slot.lock().await = Some(leaf.clone());
        Ok(leaf)
    }
}

fn leaf_sans(hostname: &str) -> anyhow::Result<Vec<SanType>> {
    let mut sans = vec![
        SanType::DnsName(
            Ia5String::try_from(hostname.to_string())
                .map_err(|_| anyhow!("invalid hostname for certificate: {hostname}"))?,
        ),
        SanType::DnsName(
            Ia5String::try_from(format!("*.{hostname}"))
                .map_err(|_| anyhow!("invalid hostname for certificate: {hostname}"))?,
        ),
    ];
    if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
        sans.push(SanType::IpAddress(IpAddr::V4(ip)));
    }
    Ok(sans)
}

/// Root CA generation contract: RSA-2048, self-signed, SHA-256, ten years.
pub(crate) fn generate_root() -> anyhow::Result<(Certificate, KeyPair)> {
    let now = OffsetDateTime::now_utc();
    generate_root_with_validity(
        now.checked_sub(Duration::hours(1)).unwrap_or(now),
        now.checked_add(Duration::days(ROOT_CA_DAYS)).unwrap_or(now),
    )
}

pub(crate) fn generate_root_with_validity(
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> anyhow::Result<(Certificate, KeyPair)> {
    let key_pair = generate_rsa_key_pair()?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{PRODUCT_NAME} Root CA"));
    dn.push(DnType::OrganizationName, PRODUCT_NAME);

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    params.serial_number = Some(SerialNumber::from(uuid::Uuid::new_v4().as_bytes().to_vec()));
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params
        .self_signed(&key_pair)
        .context("self-signing root CA")?;
    Ok((cert, key_pair))
}

/// RSA-2048 keypair as an rcgen signing key (PKCS#8 bridge).
///
/// rcgen's own keygen cannot produce RSA material, so the key comes from
/// the `rsa` crate and is imported; rcgen then signs with RSA/SHA-256.
pub(crate) fn generate_rsa_key_pair() -> anyhow::Result<KeyPair> {
    let mut rng = rand::rngs::OsRng;
    let private = RsaPrivateKey::new(&mut rng, 2048).context("generating RSA key")?;
    let pkcs8 = private
        .to_pkcs8_der()
        .context("encoding RSA key as PKCS#8")?;
    KeyPair::try_from(pkcs8.as_bytes()).context("importing RSA key into signer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cert_store::CertStore;
    use rustls::client::ClientConfig;
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    fn new_minter() -> CertMinter {
        let dir = tempfile::tempdir().unwrap();
        let root = CertStore::new(dir.path()).load_or_initialize().unwrap();
        CertMinter::new(root)
    }

    fn client_config_trusting(minter: &CertMinter) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(minter.ca_certificate_der()).unwrap();
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    /// Handshake against the minted config, validating `server_name`
    /// against the leaf's SAN list with the CA as the only trust anchor.
    async fn assert_handshake(minter: &CertMinter, minted_host: &str, server_name: &str) {
        let config = minter.server_config_for(minted_host).await.unwrap();
        let (client_io, server_io) = duplex(8192);

        let acceptor = TlsAcceptor::from(config);
        let server = tokio::spawn(async move {
            let mut tls = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(b"pong").await.unwrap();
            tls.flush().await.unwrap();
        });

        let connector = TlsConnector::from(client_config_trusting(minter));
        let name = ServerName::try_from(server_name.to_string()).unwrap();
        let mut tls = connector.connect(name, client_io).await.expect("chain validates");
        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mints_single_flight() {
        let minter = Arc::new(new_minter());

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let minter = minter.clone();
            tasks.push(tokio::spawn(async move {
                minter.mint("a.test").await.unwrap()
            }));
        }

        let mut leaves = Vec::new();
        for task in tasks {
            leaves.push(task.await.unwrap());
        }

        let first = &leaves[0];
        assert!(leaves.iter().all(|leaf| Arc::ptr_eq(first, leaf)));
        assert_eq!(minter.cached_leaf_count(), 1);
        assert!(first.valid_now());
        assert_eq!(first.hostname, "a.test");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leaf_chains_to_root_and_covers_wildcard() {
        let minter = new_minter();
        assert_handshake(&minter, "site.test", "site.test").await;
        // The wildcard SAN covers one level of subdomain.
        assert_handshake(&minter, "site.test", "api.site.test").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ipv4_literal_gets_an_ip_san() {
        let minter = new_minter();
        assert_handshake(&minter, "127.0.0.1", "127.0.0.1").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_leaf_is_reissued_on_access() {
        let minter = new_minter();
        let now = OffsetDateTime::now_utc();
        let stale = minter
            .mint_with_validity(
                "old.test",
                now - Duration::days(400),
                now - Duration::days(35),
            )
            .await
            .unwrap();
        assert!(!stale.valid_now());

        let fresh = minter.mint("old.test").await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(fresh.valid_now());
        assert_eq!(minter.cached_leaf_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn purge_empties_the_cache() {
        let minter = new_minter();
        minter.mint("gone.test").await.unwrap();
        assert_eq!(minter.cached_leaf_count(), 1);
        minter.purge();
        assert_eq!(minter.cached_leaf_count(), 0);
    }
}
