//! Trust list / banned list loading.
//!
//! Direct port of `get_dns()` / `get_banned_dns()` in
//! `examples/original_source/ssm/agents.py`: blank lines and lines starting
//! with `#` are skipped, lines starting with `/` are accepted as subjects,
//! anything else is a warning and is ignored. An empty trust list is fatal
//! for a receiver; an absent or empty banned list is not.

use std::path::Path;

use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no valid DNs found in {0}, SSM will not start")]
    Empty(String),
}

fn load_lines(path: &Path) -> Result<Vec<String>, TrustError> {
    let contents = std::fs::read_to_string(path).map_err(|e| TrustError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut subjects = Vec::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('/') {
            subjects.push(line.to_string());
        } else {
            warn!("DN in incorrect format: {}", raw_line);
        }
    }
    Ok(subjects)
}

/// Load the trust list from `dn_file`. Zero valid entries is a fatal
/// configuration error for a receiver (spec.md §3 "Trust list").
pub fn load_trust_list(dn_file: &Path) -> Result<Vec<String>, TrustError> {
    let subjects = load_lines(dn_file)?;
    if subjects.is_empty() {
        return Err(TrustError::Empty(dn_file.display().to_string()));
    }
    Ok(subjects)
}

/// Load the banned list, if configured. Unlike the trust list, an empty
/// banned list is legitimate.
pub fn load_banned_list(banned_file: &Path) -> Result<Vec<String>, TrustError> {
    load_lines(banned_file)
}

/// Classification of a verified signer against the trust/banned lists
/// (spec.md §4.5.2 `on_message` contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Accepted,
    Banned,
    Untrusted,
}

pub fn classify(signer: &str, trusted: &[String], banned: &[String]) -> TrustDecision {
    // A signer present in the banned list overrides any presence in the
    // trust list (spec.md §3 "Trust list").
    if banned.iter().any(|s| s == signer) {
        TrustDecision::Banned
    } else if trusted.iter().any(|s| s == signer) {
        TrustDecision::Accepted
    } else {
        TrustDecision::Untrusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        let f = write_file("# a comment\n\n/DC=org/CN=host\n");
        let dns = load_trust_list(f.path()).unwrap();
        assert_eq!(dns, vec!["/DC=org/CN=host".to_string()]);
    }

    #[test]
    fn malformed_lines_are_warned_and_ignored() {
        let f = write_file("not-a-subject\n/DC=org/CN=host\n");
        let dns = load_trust_list(f.path()).unwrap();
        assert_eq!(dns, vec!["/DC=org/CN=host".to_string()]);
    }

    #[test]
    fn empty_trust_list_is_fatal() {
        let f = write_file("# nothing but comments\n");
        assert!(matches!(load_trust_list(f.path()), Err(TrustError::Empty(_))));
    }

    #[test]
    fn empty_banned_list_is_allowed() {
        let f = write_file("# nothing but comments\n");
        assert_eq!(load_banned_list(f.path()).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn banned_overrides_trusted() {
        let trusted = vec!["/CN=host".to_string()];
        let banned = vec!["/CN=host".to_string()];
        assert_eq!(classify("/CN=host", &trusted, &banned), TrustDecision::Banned);
    }

    #[test]
    fn untrusted_signer_is_rejected() {
        let trusted = vec!["/CN=other".to_string()];
        assert_eq!(classify("/CN=host", &trusted, &[]), TrustDecision::Untrusted);
    }

    #[test]
    fn trusted_signer_not_banned_is_accepted() {
        let trusted = vec!["/CN=host".to_string()];
        assert_eq!(classify("/CN=host", &trusted, &[]), TrustDecision::Accepted);
    }
}
