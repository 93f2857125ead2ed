//! Legacy openssl-style `/RDN=value/...` subject rendering.
//!
//! `openssl x509 -noout -subject` prints `subject= /C=UK/O=eScience/CN=host`
//! (after stripping the `subject= ` prefix). Trust-list files written
//! against the Python tool are full of subjects in this exact shape, so we
//! reproduce it rather than any RFC 2253 comma-separated form.

use openssl::x509::X509NameRef;

/// Render an X.509 name the way `openssl x509 -noout -subject` does,
/// minus the `subject= ` prefix that the CLI prints and the Python
/// implementation strips off (see `get_certificate_subject` in
/// `ssm/crypto.py`).
pub fn legacy_subject(name: &X509NameRef) -> String {
    let mut out = String::new();
    for entry in name.entries() {
        let short_name = entry
            .object()
            .nid()
            .short_name()
            .unwrap_or("UNKNOWN");
        let value = entry.data().as_utf8().map(|s| s.to_string()).unwrap_or_default();
        out.push('/');
        out.push_str(short_name);
        out.push('=');
        out.push_str(&value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_renders_empty_string() {
        let name = openssl::x509::X509NameBuilder::new().unwrap().build();
        assert_eq!(legacy_subject(&name), "");
    }

    #[test]
    fn single_rdn_renders_with_leading_slash() {
        let mut builder = openssl::x509::X509NameBuilder::new().unwrap();
        builder
            .append_entry_by_text("CN", "host.example.org")
            .unwrap();
        let name = builder.build();
        assert_eq!(legacy_subject(&name), "/CN=host.example.org");
    }

    #[test]
    fn multiple_rdns_concatenate_in_order() {
        let mut builder = openssl::x509::X509NameBuilder::new().unwrap();
        builder.append_entry_by_text("C", "UK").unwrap();
        builder.append_entry_by_text("O", "eScience").unwrap();
        builder.append_entry_by_text("CN", "host.example.org").unwrap();
        let name = builder.build();
        assert_eq!(legacy_subject(&name), "/C=UK/O=eScience/CN=host.example.org");
    }
}
