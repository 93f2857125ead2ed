//! S/MIME PKCS#7 envelope operations: sign, encrypt, decrypt, verify.

pub mod envelope;
pub mod subject;

pub use envelope::{
    certificate_subject, check_cert_key, check_not_expiring, decrypt, encrypt, get_signer_cert,
    sign, verify, verify_cert_not_expiring, verify_cert_path, Cipher, CryptoError, CERT_EXPIRY_WINDOW,
    VerifyOutcome,
};
