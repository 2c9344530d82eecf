use std::{
    fmt, fs, io,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, bail};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P384_SHA384,
    SerialNumber,
};
use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, CertificateSigningRequestDer},
};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use p384::pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _, LineEnding};
use x509_parser::{parse_x509_certificate, pem::Pem};

use crate::config::PkiPaths;

const CA_COMMON_NAME: &str = "autodemo Local Root CA";
const CA_VALIDITY: Duration = Duration::days(3652);
const LEAF_VALIDITY: Duration = Duration::days(365);
const EC_PRIVATE_KEY_LABEL: &str = "EC PRIVATE KEY";
const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";
const EC_PARAMETERS_LABEL: &str = "EC PARAMETERS";
const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const DIR_MODE_RESTRICTED: u32 = 0o700;
const FILE_MODE_RESTRICTED: u32 = 0o600;
const FILE_MODE_READABLE: u32 = 0o644;

#[derive(Debug)]
pub enum PkiError {
    /// A CA certificate exists without its private key.
    TrustAnchorConflict { ca_key: PathBuf, ca_cert: PathBuf },
    CsrParse(String),
    Signing(String),
    Io { path: PathBuf, source: io::Error },
    InvalidMaterial(String),
}

impl fmt::Display for PkiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrustAnchorConflict { ca_key, ca_cert } => write!(
                f,
                "CA certificate {} exists but CA private key {} is missing; \
                 refusing to generate a new key that would orphan the trusted certificate",
                ca_cert.display(),
                ca_key.display()
            ),
            Self::CsrParse(message) => write!(f, "parse certificate signing request: {message}"),
            Self::Signing(message) => write!(f, "sign certificate: {message}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::InvalidMaterial(message) => write!(f, "invalid key material: {message}"),
        }
    }
}

impl std::error::Error for PkiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Local certificate authority plus the proxy's own end-entity key.
///
/// All material is immutable once bootstrapped.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    ee_key: KeyPair,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Loads existing material or generates whatever is missing.
    ///
    /// Order: CA key, end-entity key, CA certificate.
    pub fn bootstrap(paths: &PkiPaths) -> Result<Self, PkiError> {
        let ca_key = if paths.ca_key.exists() {
            load_private_key(&paths.ca_key)?
        } else if paths.ca_cert.exists() {
            return Err(PkiError::TrustAnchorConflict {
                ca_key: paths.ca_key.clone(),
                ca_cert: paths.ca_cert.clone(),
            });
        } else {
            let key = generate_key()?;
            write_private_key(&paths.ca_key, &key)?;
            tracing::info!(path = %paths.ca_key.display(), "generated CA private key");
            key
        };

        let ee_key = if paths.ee_key.exists() {
            load_private_key(&paths.ee_key)?
        } else {
            let key = generate_key()?;
            write_private_key(&paths.ee_key, &key)?;
            tracing::info!(path = %paths.ee_key.display(), "generated end-entity private key");
            key
        };

        let (ca_cert_der, ca_cert_pem) = if paths.ca_cert.exists() {
            load_ca_cert(&paths.ca_cert, &ca_key)?
        } else {
            let cert = self_sign_ca(&ca_key)?;
            write_new_file(&paths.ca_cert, cert.pem().as_bytes(), FILE_MODE_RESTRICTED)?;
            tracing::info!(path = %paths.ca_cert.display(), "generated CA certificate");
            (cert.der().clone(), cert.pem())
        };

        let issuer = Issuer::from_ca_cert_der(&ca_cert_der, ca_key)
            .map_err(|err| PkiError::InvalidMaterial(format!("load CA issuer: {err}")))?;

        Ok(Self {
            issuer,
            ca_cert_der,
            ca_cert_pem,
            ee_key,
        })
    }

    /// Signs a DER-encoded CSR and returns the leaf certificate as DER.
    pub fn issue_leaf(&self, csr_der: &[u8]) -> Result<Vec<u8>, PkiError> {
        let csr_der = CertificateSigningRequestDer::from(csr_der);
        let mut csr = CertificateSigningRequestParams::from_der(&csr_der)
            .map_err(|err| PkiError::CsrParse(err.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let params = &mut csr.params;
        params.serial_number = Some(random_serial());
        params.not_before = now;
        params.not_after = now + LEAF_VALIDITY;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;

        let cert = csr
            .signed_by(&self.issuer)
            .map_err(|err| PkiError::Signing(err.to_string()))?;
        Ok(cert.der().to_vec())
    }

    /// Root store holding only this CA.
    pub fn trust_pool(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        // The CA certificate was validated during bootstrap.
        let _ = roots.add(self.ca_cert_der.clone());
        roots
    }

    pub fn ee_key(&self) -> &KeyPair {
        &self.ee_key
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Colon-separated upper-case SHA-256 of the CA certificate.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.ca_cert_der.as_ref())
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Copies the CA certificate to `out_path` for installation in client trust stores.
pub fn export_ca_cert(ca_cert_path: &Path, out_path: &Path, force: bool) -> anyhow::Result<()> {
    if !ca_cert_path.exists() {
        bail!(
            "CA certificate not found at {}; run `autodemo pki init` first",
            ca_cert_path.display()
        );
    }
    let cert_pem = fs::read(ca_cert_path)
        .with_context(|| format!("read CA certificate {}", ca_cert_path.display()))?;

    if out_path.exists() {
        if !force {
            bail!(
                "file {} already exists; pass `--force` to overwrite",
                out_path.display()
            );
        }
        fs::remove_file(out_path)
            .with_context(|| format!("remove existing file {}", out_path.display()))?;
    }
    write_new_file(out_path, &cert_pem, FILE_MODE_READABLE)?;
    Ok(())
}

fn generate_key() -> Result<KeyPair, PkiError> {
    KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
        .map_err(|err| PkiError::InvalidMaterial(format!("generate P-384 key: {err}")))
}

fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 16] = rand::random();
    // Keep the DER integer positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn self_sign_ca(ca_key: &KeyPair) -> Result<Certificate, PkiError> {
    let mut params = CertificateParams::new(Vec::new())
        .map_err(|err| PkiError::Signing(format!("initialize CA parameters: {err}")))?;
    let now = OffsetDateTime::now_utc();
    params.serial_number = Some(random_serial());
    params.not_before = now;
    params.not_after = now + CA_VALIDITY;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    params
        .self_signed(ca_key)
        .map_err(|err| PkiError::Signing(format!("self-sign CA certificate: {err}")))
}

/// Reads the first PEM block, skipping the `EC PARAMETERS` preamble `openssl ecparam` emits.
fn read_pem(path: &Path) -> Result<(Pem, String), PkiError> {
    let raw = fs::read(path).map_err(|source| PkiError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut blocks = Pem::iter_from_buffer(&raw);
    let block = loop {
        match blocks.next() {
            Some(Ok(block)) if block.label == EC_PARAMETERS_LABEL => continue,
            Some(Ok(block)) => break block,
            Some(Err(err)) => {
                return Err(PkiError::InvalidMaterial(format!(
                    "parse PEM {}: {err}",
                    path.display()
                )));
            }
            None => {
                return Err(PkiError::InvalidMaterial(format!(
                    "{}: no PEM block found",
                    path.display()
                )));
            }
        }
    };
    let text = String::from_utf8(raw).map_err(|_| {
        PkiError::InvalidMaterial(format!("PEM file {} is not UTF-8", path.display()))
    })?;
    Ok((block, text))
}

/// Loads a SEC1 (`EC PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) ECDSA key.
fn load_private_key(path: &Path) -> Result<KeyPair, PkiError> {
    let (block, _) = read_pem(path)?;
    let invalid =
        |message: String| PkiError::InvalidMaterial(format!("{}: {message}", path.display()));

    match block.label.as_str() {
        EC_PRIVATE_KEY_LABEL => {
            let pkcs8 = sec1_to_pkcs8(&block.contents).map_err(invalid)?;
            KeyPair::try_from(pkcs8.as_slice())
                .map_err(|err| invalid(format!("parse private key: {err}")))
        }
        PRIVATE_KEY_LABEL => KeyPair::try_from(block.contents.as_slice())
            .map_err(|err| invalid(format!("parse private key: {err}"))),
        other => Err(invalid(format!(
            "expected `{EC_PRIVATE_KEY_LABEL}` or `{PRIVATE_KEY_LABEL}` block, got `{other}`"
        ))),
    }
}

/// Re-encodes a SEC1 `ECPrivateKey` on P-384 or P-256 as PKCS#8 DER.
fn sec1_to_pkcs8(der: &[u8]) -> Result<Vec<u8>, String> {
    let document = if let Ok(key) = p384::SecretKey::from_sec1_der(der) {
        key.to_pkcs8_der()
    } else if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
        key.to_pkcs8_der()
    } else {
        return Err("unsupported EC private key; expected a P-384 or P-256 SEC1 key".to_owned());
    };
    document
        .map(|document| document.as_bytes().to_vec())
        .map_err(|err| format!("encode PKCS#8: {err}"))
}

/// Writes a generated P-384 key as a SEC1 `EC PRIVATE KEY` block.
fn write_private_key(path: &Path, key: &KeyPair) -> Result<(), PkiError> {
    let secret = p384::SecretKey::from_pkcs8_der(&key.serialize_der()).map_err(|err| {
        PkiError::InvalidMaterial(format!("decode generated key for {}: {err}", path.display()))
    })?;
    let pem = secret.to_sec1_pem(LineEnding::LF).map_err(|err| {
        PkiError::InvalidMaterial(format!("encode SEC1 key for {}: {err}", path.display()))
    })?;
    write_new_file(path, pem.as_bytes(), FILE_MODE_RESTRICTED)
}

fn load_ca_cert(
    path: &Path,
    ca_key: &KeyPair,
) -> Result<(CertificateDer<'static>, String), PkiError> {
    let (block, pem) = read_pem(path)?;
    if block.label != CERTIFICATE_LABEL {
        return Err(PkiError::InvalidMaterial(format!(
            "{}: expected `{CERTIFICATE_LABEL}` block, got `{}`",
            path.display(),
            block.label
        )));
    }
    let der = block.contents;

    let (_, certificate) = parse_x509_certificate(&der).map_err(|err| {
        PkiError::InvalidMaterial(format!("parse CA certificate {}: {err}", path.display()))
    })?;
    let cert_public_key = certificate
        .tbs_certificate
        .subject_pki
        .subject_public_key
        .data
        .as_ref();
    if cert_public_key != ca_key.public_key_raw() {
        return Err(PkiError::InvalidMaterial(format!(
            "CA certificate {} does not match the CA private key",
            path.display()
        )));
    }

    Ok((CertificateDer::from(der), pem))
}

fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), PkiError> {
    let io_err = |source| PkiError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|source| PkiError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
        set_dir_permissions(parent, DIR_MODE_RESTRICTED).map_err(|source| PkiError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut file = create_file_with_mode(path, mode).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

fn create_file_with_mode(path: &Path, mode: u32) -> io::Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    opts.open(path)
}

fn set_dir_permissions(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}
