//! Sign, encrypt, decrypt and verify the S/MIME envelope carried on the wire.
//!
//! Every operation here shells out to `openssl`'s PKCS#7 support instead of
//! a raw `openssl` CLI subprocess the way `ssm/crypto.py` does — same
//! underlying library, called in-process.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::symm::Cipher as OpensslCipher;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509Lookup, X509};

use super::subject::legacy_subject;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("signing failed: key and certificate could not be read or do not match")]
    SignFailed,
    #[error("unsupported cipher, expected one of aes128/aes192/aes256")]
    BadCipher,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("verification failed")]
    VerifyFailed,
    #[error("certificate {path} has expired or expires within the next {window_days} day(s)")]
    CertExpiring { path: String, window_days: u64 },
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("openssl error: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),
}

/// Recognized symmetric ciphers for `encrypt()`. Any other config string is
/// a `CryptoError::BadCipher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes128,
    Aes192,
    Aes256,
}

impl Cipher {
    pub fn parse(raw: &str) -> Result<Self, CryptoError> {
        match raw {
            "aes128" => Ok(Cipher::Aes128),
            "aes192" => Ok(Cipher::Aes192),
            "aes256" => Ok(Cipher::Aes256),
            _ => Err(CryptoError::BadCipher),
        }
    }

    fn to_openssl(self) -> OpensslCipher {
        match self {
            Cipher::Aes128 => OpensslCipher::aes_128_cbc(),
            Cipher::Aes192 => OpensslCipher::aes_192_cbc(),
            Cipher::Aes256 => OpensslCipher::aes_256_cbc(),
        }
    }
}

pub struct VerifyOutcome {
    pub plaintext: Vec<u8>,
    pub signer_subject: String,
}

fn load_cert(path: &Path) -> Result<X509, CryptoError> {
    let pem = fs::read(path).map_err(|e| CryptoError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    X509::from_pem(&pem).map_err(|_| CryptoError::SignFailed)
}

fn load_private_key(path: &Path) -> Result<PKey<Private>, CryptoError> {
    let pem = fs::read(path).map_err(|e| CryptoError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    PKey::private_key_from_pem(&pem).map_err(|_| CryptoError::SignFailed)
}

/// `sign(plaintext, cert_path, key_path) -> envelope`.
///
/// Produces a `multipart/signed` MIME document: the plaintext carried as
/// text, a detached PKCS#7 signature as the second part.
pub fn sign(plaintext: &[u8], cert_path: &Path, key_path: &Path) -> Result<Vec<u8>, CryptoError> {
    // Empty bodies are legal for STOMP senders and are signed like any
    // other payload.
    let cert = load_cert(cert_path)?;
    let pkey = load_private_key(key_path)?;
    if !cert
        .public_key()
        .map_err(CryptoError::from)?
        .public_eq(&pkey)
    {
        return Err(CryptoError::SignFailed);
    }
    let certs = Stack::new()?;
    let flags = Pkcs7Flags::DETACHED | Pkcs7Flags::TEXT;
    let pkcs7 = Pkcs7::sign(&cert, &pkey, &certs, plaintext, flags)
        .map_err(|_| CryptoError::SignFailed)?;
    pkcs7
        .to_smime(plaintext, flags)
        .map_err(|_| CryptoError::SignFailed)
}

/// `encrypt(envelope, peer_cert_path, cipher) -> encrypted_envelope`.
pub fn encrypt(
    envelope: &[u8],
    peer_cert_path: &Path,
    cipher: Cipher,
) -> Result<Vec<u8>, CryptoError> {
    let peer_cert = load_cert(peer_cert_path)?;
    let mut certs = Stack::new()?;
    certs.push(peer_cert).map_err(CryptoError::from)?;
    let flags = Pkcs7Flags::empty();
    let pkcs7 = Pkcs7::encrypt(&certs, envelope, cipher.to_openssl(), flags)
        .map_err(|_| CryptoError::BadCipher)?;
    pkcs7
        .to_smime(envelope, flags)
        .map_err(|_| CryptoError::BadCipher)
}

/// `decrypt(encrypted_envelope, cert_path, key_path) -> envelope`.
pub fn decrypt(
    encrypted_envelope: &[u8],
    cert_path: &Path,
    key_path: &Path,
) -> Result<Vec<u8>, CryptoError> {
    let (pkcs7, _content) =
        Pkcs7::from_smime(encrypted_envelope).map_err(|_| CryptoError::DecryptFailed)?;
    let cert = load_cert(cert_path)?;
    let pkey = load_private_key(key_path)?;
    pkcs7
        .decrypt(&pkey, &cert, Pkcs7Flags::empty())
        .map_err(|_| CryptoError::DecryptFailed)
}

fn is_pkcs7_mime(document: &[u8]) -> bool {
    let head = &document[..document.len().min(4096)];
    let head_str = String::from_utf8_lossy(head);
    let header_block = head_str.split("\r\n\r\n").next().unwrap_or(&head_str);
    let header_block = header_block.split("\n\n").next().unwrap_or(header_block);
    header_block.to_ascii_lowercase().contains("pkcs7-mime")
}

fn split_mime_headers(buf: &[u8]) -> (HashMap<String, String>, Vec<u8>) {
    let text = String::from_utf8_lossy(buf);
    let (sep, sep_len) = if let Some(idx) = text.find("\r\n\r\n") {
        (idx, 4)
    } else if let Some(idx) = text.find("\n\n") {
        (idx, 2)
    } else {
        return (HashMap::new(), buf.to_vec());
    };
    let header_block = &text[..sep];
    let mut headers = HashMap::new();
    for line in header_block.lines() {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
    let body_start = sep + sep_len;
    let body_bytes = text.as_bytes()[body_start..].to_vec();
    (headers, body_bytes)
}

/// Hand-rolled quoted-printable decoder (RFC 2045 §6.7); no crate in the
/// example pack covers this and the transform is small enough to own.
fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'=' if i + 2 < input.len() && input[i + 1] == b'\r' && input[i + 2] == b'\n' => {
                i += 3; // soft line break, drop it
            }
            b'=' if i + 1 < input.len() && input[i + 1] == b'\n' => {
                i += 2; // bare-LF soft line break
            }
            b'=' if i + 2 < input.len() => {
                let hex = std::str::from_utf8(&input[i + 1..i + 3]).unwrap_or("");
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(input[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn decode_transfer_encoding(encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match encoding.map(|s| s.to_ascii_lowercase()) {
        Some(ref e) if e == "quoted-printable" => Ok(decode_quoted_printable(body)),
        Some(ref e) if e == "base64" => {
            use base64::Engine;
            let cleaned: String = body
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .map(|b| *b as char)
                .collect();
            base64::engine::general_purpose::STANDARD
                .decode(cleaned)
                .map_err(|_| CryptoError::VerifyFailed)
        }
        // Absent, 7bit, 8bit: literal.
        _ => Ok(body.to_vec()),
    }
}

fn build_trust_store(trust_store_path: &Path, check_revocation: bool) -> Result<X509Store, CryptoError> {
    let mut builder = X509StoreBuilder::new()?;
    let lookup = builder.add_lookup(X509Lookup::hash_dir())?;
    lookup
        .add_dir(
            trust_store_path.to_str().ok_or(CryptoError::VerifyFailed)?,
            openssl::x509::X509FileType::PEM,
        )
        .map_err(CryptoError::from)?;
    if check_revocation {
        builder.set_flags(X509VerifyFlags::CRL_CHECK_ALL)?;
    }
    Ok(builder.build())
}

/// `get_signer_cert(document) -> cert_PEM`. Extracts the embedded signer
/// certificate without verifying it.
pub fn get_signer_cert(document: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (pkcs7, _) = Pkcs7::from_smime(document).map_err(|_| CryptoError::VerifyFailed)?;
    let empty = Stack::new()?;
    let signers = pkcs7
        .signers(&empty, Pkcs7Flags::NOVERIFY)
        .map_err(|_| CryptoError::VerifyFailed)?;
    let signer = signers.iter().next().ok_or(CryptoError::VerifyFailed)?;
    signer.to_pem().map_err(CryptoError::from)
}

/// `verify(document, trust_store_path, check_revocation) -> (plaintext,
/// signer_subject)`.
///
/// `local_identity` supplies `(cert_path, key_path)` for the decrypt step
/// when `document` is `application/pkcs7-mime`/`application/x-pkcs7-mime`;
/// see SPEC_FULL.md §3.1 for why this deviates from the distilled spec's
/// bare `verify(document, trust_store_path, check_revocation)` signature.
pub fn verify(
    document: &[u8],
    local_identity: Option<(&Path, &Path)>,
    trust_store_path: &Path,
    check_revocation: bool,
) -> Result<VerifyOutcome, CryptoError> {
    if document.is_empty() {
        return Err(CryptoError::VerifyFailed);
    }

    let signed_document = if is_pkcs7_mime(document) {
        let (cert_path, key_path) = local_identity.ok_or(CryptoError::DecryptFailed)?;
        decrypt(document, cert_path, key_path)?
    } else {
        document.to_vec()
    };

    // Guard against the empty-string hang the Python implementation
    // works around by appending a trailing blank line before handing the
    // text to `openssl smime -verify`.
    let mut padded = signed_document.clone();
    if !padded.ends_with(b"\n\n") {
        padded.extend_from_slice(b"\n\n");
    }

    let (pkcs7, content) =
        Pkcs7::from_smime(&padded).map_err(|_| CryptoError::VerifyFailed)?;

    let empty_certs = Stack::new()?;
    let signer_certs = pkcs7
        .signers(&empty_certs, Pkcs7Flags::NOVERIFY)
        .map_err(|_| CryptoError::VerifyFailed)?;
    let signer = signer_certs.iter().next().ok_or(CryptoError::VerifyFailed)?;
    let signer_subject = legacy_subject(signer.subject_name());

    let store = build_trust_store(trust_store_path, check_revocation)?;
    let mut out = Vec::new();
    pkcs7
        .verify(
            &empty_certs,
            &store,
            content.as_deref(),
            Some(&mut out),
            Pkcs7Flags::empty(),
        )
        .map_err(|_| CryptoError::VerifyFailed)?;

    let (headers, body) = split_mime_headers(&out);
    let cte = headers.get("content-transfer-encoding").map(|s| s.as_str());
    let plaintext = decode_transfer_encoding(cte, &body)?;

    Ok(VerifyOutcome {
        plaintext,
        signer_subject,
    })
}

/// `check_cert_key(cert_path, key_path) -> bool`. True iff the certificate's
/// public modulus matches the one derived from the private key.
pub fn check_cert_key(cert_path: &Path, key_path: &Path) -> bool {
    (|| -> Result<bool, CryptoError> {
        let cert = load_cert(cert_path)?;
        let key = load_private_key(key_path)?;
        Ok(cert.public_key()?.public_eq(&key))
    })()
    .unwrap_or(false)
}

/// `verify_cert_path(certpath, capath, check_crls)` in `ssm/crypto.py`:
/// verify a standalone certificate (not a signed message) against a CA
/// trust directory, used to validate a configured server/encryption
/// certificate before trusting it. Unlike the Python original, which
/// shells out to `openssl verify` and greps its stdout for `"OK"`, this
/// calls `X509StoreContext::verify_cert` directly.
pub fn verify_cert_path(cert_path: &Path, capath: &Path, check_crls: bool) -> Result<bool, CryptoError> {
    let cert = load_cert(cert_path)?;
    let store = build_trust_store(capath, check_crls)?;
    let mut ctx = openssl::x509::X509StoreContext::new()?;
    let chain = Stack::new()?;
    Ok(ctx.init(&store, &cert, &chain, |c| c.verify_cert())?)
}

/// `get_certificate_subject(path)` in `ssm/crypto.py`: load a cert from
/// disk and render its subject in legacy form, for the startup log lines
/// ("Messages will be signed/encrypted using ...").
pub fn certificate_subject(cert_path: &Path) -> Result<String, CryptoError> {
    let cert = load_cert(cert_path)?;
    Ok(legacy_subject(cert.subject_name()))
}

/// `verify_cert_not_expiring(cert_path, window) -> bool`. False if the
/// certificate has already expired or expires within `window`.
pub fn verify_cert_not_expiring(cert_path: &Path, window: Duration) -> Result<bool, CryptoError> {
    let cert = load_cert(cert_path)?;
    let threshold = openssl::asn1::Asn1Time::days_from_now(
        (window.as_secs() / 86_400).max(1) as u32,
    )?;
    Ok(cert.not_after() > threshold)
}

/// Window used for the mandatory startup expiry check on local/peer
/// certificates (spec.md §7: "expired local certificate (or expiring
/// within one day)").
pub const CERT_EXPIRY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// `verify_cert_not_expiring`, raising `CryptoError::CertExpiring` instead
/// of returning a bare bool, for use at Agent startup where an expiring
/// cert must abort the run with a message naming the window (spec.md §7/§8
/// scenario 6).
pub fn check_not_expiring(cert_path: &Path, window: Duration) -> Result<(), CryptoError> {
    if verify_cert_not_expiring(cert_path, window)? {
        Ok(())
    } else {
        Err(CryptoError::CertExpiring {
            path: cert_path.display().to_string(),
            window_days: (window.as_secs() / 86_400).max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Name, X509};
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct TestIdentity {
        cert_file: NamedTempFile,
        key_file: NamedTempFile,
        trust_dir: tempfile::TempDir,
        subject: String,
    }

    fn make_self_signed(cn: &str) -> TestIdentity {
        make_self_signed_expiring(cn, 365)
    }

    fn make_self_signed_expiring(cn: &str, not_after_days: u32) -> TestIdentity {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();

        let mut name_builder = X509Name::builder().unwrap();
        name_builder.append_entry_by_text("CN", cn).unwrap();
        let name = name_builder.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        let not_before = openssl::asn1::Asn1Time::days_from_now(0).unwrap();
        let not_after = openssl::asn1::Asn1Time::days_from_now(not_after_days).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(&cert.to_pem().unwrap()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file
            .write_all(&pkey.private_key_to_pem_pkcs8().unwrap())
            .unwrap();

        // `X509Lookup::hash_dir()` looks files up by subject-name hash
        // (`<hash>.0`, as `c_rehash` would produce), not by arbitrary
        // filename, so the trust directory fixture must follow that
        // convention too.
        let trust_dir = tempfile::tempdir().unwrap();
        let hash = cert.subject_name().hash().unwrap();
        std::fs::write(
            trust_dir.path().join(format!("{hash:08x}.0")),
            cert.to_pem().unwrap(),
        )
        .unwrap();

        TestIdentity {
            cert_file,
            key_file,
            trust_dir,
            subject: format!("/CN={cn}"),
        }
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let id = make_self_signed("sender.example.org");
        let plaintext = b"APEL-summary-job-message: v0.2\nhello";
        let envelope = sign(plaintext, id.cert_file.path(), id.key_file.path()).unwrap();
        let outcome = verify(&envelope, None, id.trust_dir.path(), false).unwrap();
        assert_eq!(outcome.plaintext, plaintext);
        assert_eq!(outcome.signer_subject, id.subject);
    }

    #[test]
    fn tamper_detection_fails_verify() {
        let id = make_self_signed("sender.example.org");
        let plaintext = b"hello";
        let mut envelope = sign(plaintext, id.cert_file.path(), id.key_file.path()).unwrap();
        // Flip a byte inside the signed text part.
        if let Some(pos) = envelope.iter().position(|&b| b == b'h') {
            envelope[pos] = b'H';
        }
        let result = verify(&envelope, None, id.trust_dir.path(), false);
        assert!(result.is_err());
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let id = make_self_signed("receiver.example.org");
        let plaintext = b"secret payload";
        let encrypted = encrypt(plaintext, id.cert_file.path(), Cipher::Aes256).unwrap();
        let decrypted = decrypt(&encrypted, id.cert_file.path(), id.key_file.path()).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn bad_cipher_name_is_rejected() {
        assert!(matches!(Cipher::parse("rot13"), Err(CryptoError::BadCipher)));
        assert!(matches!(Cipher::parse("aes256"), Ok(Cipher::Aes256)));
    }

    #[test]
    fn check_cert_key_detects_mismatch() {
        let a = make_self_signed("a.example.org");
        let b = make_self_signed("b.example.org");
        assert!(check_cert_key(a.cert_file.path(), a.key_file.path()));
        assert!(!check_cert_key(a.cert_file.path(), b.key_file.path()));
    }

    #[test]
    fn empty_plaintext_sign_verify_round_trips() {
        let id = make_self_signed("sender.example.org");
        let envelope = sign(b"", id.cert_file.path(), id.key_file.path()).unwrap();
        let outcome = verify(&envelope, None, id.trust_dir.path(), false).unwrap();
        assert_eq!(outcome.plaintext, b"");
    }

    #[test]
    fn empty_document_fails_verify() {
        let id = make_self_signed("sender.example.org");
        let result = verify(&[], None, id.trust_dir.path(), false);
        assert!(result.is_err());
    }

    #[test]
    fn cert_expiring_within_window_is_rejected() {
        let id = make_self_signed_expiring("sender.example.org", 0);
        let result = check_not_expiring(id.cert_file.path(), Duration::from_secs(24 * 60 * 60));
        assert!(matches!(result, Err(CryptoError::CertExpiring { .. })));
    }

    #[test]
    fn cert_well_within_validity_passes() {
        let id = make_self_signed_expiring("sender.example.org", 365);
        assert!(check_not_expiring(id.cert_file.path(), Duration::from_secs(24 * 60 * 60)).is_ok());
    }
}
