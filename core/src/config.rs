//! INI-style configuration per `spec.md §6`, loaded with the `config` crate
//! (grounded in `examples/tari-project-tari/common/Cargo.toml`'s use of the
//! same crate, here with its `ini` feature instead of `toml`).
//!
//! Mirrors the fail-fast option reads in
//! `examples/original_source/ssm/agents.py` (`get_protocol`, `get_ssm_args`,
//! `run_sender`, `run_receiver`): a missing required key or an unparseable
//! value is a `ConfigError`, not a silent default, except where the Python
//! source itself defaults (protocol, `messaging.path_type`).

use std::path::{Path, PathBuf};

use crate::store::PathType;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required option {0}")]
    Missing(String),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
    #[error("invalid protocol '{0}', must be STOMP or AMS")]
    UnknownProtocol(String),
    #[error("no brokers configured")]
    NoBrokers,
    #[error(
        "server certificate is the same as host certificate in config file. \
         Do you really mean to encrypt messages with this certificate?"
    )]
    SelfEncryption,
    #[error("no destination queue is configured")]
    EmptyDestination,
    #[error("BDII broker discovery is not implemented; configure broker.host/broker.port directly")]
    BrokerDiscoveryUnsupported,
    #[error("failed to load config file: {0}")]
    Load(#[from] config::ConfigError),
}

/// `sender.protocol` / `receiver.protocol`: defaults to `STOMP` with a
/// logged warning when absent (`get_protocol` in `ssm/agents.py`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Stomp,
    Ams,
}

impl Protocol {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "STOMP" => Ok(Protocol::Stomp),
            "AMS" => Ok(Protocol::Ams),
            other => Err(ConfigError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Broker address resolution: an explicit `(host, port)` list, or BDII/LDAP
/// discovery (contract-only per spec.md §1/§6; `ssm-core` never pulls in an
/// LDAP client, see DESIGN.md).
#[derive(Debug, Clone)]
pub enum BrokerSource {
    Explicit(Vec<(String, u16)>),
    Bdii { url: String, network: String },
}

impl BrokerSource {
    /// Resolve to a concrete `(host, port)` list, or fail with
    /// `BrokerDiscoveryUnsupported` for the BDII variant.
    pub fn resolve(&self) -> Result<Vec<(String, u16)>, ConfigError> {
        match self {
            BrokerSource::Explicit(list) => Ok(list.clone()),
            BrokerSource::Bdii { .. } => Err(ConfigError::BrokerDiscoveryUnsupported),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub logfile: PathBuf,
    pub level: String,
    pub console: bool,
}

#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub capath: PathBuf,
    pub server_cert: Option<PathBuf>,
    pub verify_server_cert: bool,
    pub check_crls: bool,
}

#[derive(Debug, Clone)]
pub struct AmsConfig {
    pub host: String,
    pub project: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub brokers: BrokerSource,
    pub use_ssl: bool,
    pub protocol: Protocol,
    pub path: PathBuf,
    pub path_type: PathType,
    pub destination: String,
    pub certificates: CertificateConfig,
    pub ams: Option<AmsConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub brokers: BrokerSource,
    pub use_ssl: bool,
    pub protocol: Protocol,
    pub path: PathBuf,
    pub destination: String,
    pub certificates: CertificateConfig,
    pub ams: Option<AmsConfig>,
    pub pidfile: PathBuf,
    pub banned_dns: Option<PathBuf>,
    pub logging: LoggingConfig,
}

fn required_string(cfg: &config::Config, key: &str) -> Result<String, ConfigError> {
    cfg.get_string(key)
        .map_err(|_| ConfigError::Missing(key.to_string()))
}

fn optional_string(cfg: &config::Config, key: &str) -> Option<String> {
    cfg.get_string(key).ok()
}

fn required_bool(cfg: &config::Config, key: &str) -> Result<bool, ConfigError> {
    cfg.get_bool(key)
        .map_err(|_| ConfigError::Missing(key.to_string()))
}

fn bool_with_default(cfg: &config::Config, key: &str, default: bool) -> bool {
    cfg.get_bool(key).unwrap_or(default)
}

fn load_ini(path: &Path) -> Result<config::Config, ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Ini))
        .build()
        .map_err(ConfigError::from)
}

fn logging_config(cfg: &config::Config) -> Result<LoggingConfig, ConfigError> {
    Ok(LoggingConfig {
        logfile: PathBuf::from(required_string(cfg, "logging.logfile")?),
        level: required_string(cfg, "logging.level")?,
        console: required_bool(cfg, "logging.console")?,
    })
}

fn broker_source(cfg: &config::Config) -> Result<(BrokerSource, bool), ConfigError> {
    let use_ssl = bool_with_default(cfg, "broker.use_ssl", false);
    if let (Some(bdii), Some(network)) = (
        optional_string(cfg, "broker.bdii"),
        optional_string(cfg, "broker.network"),
    ) {
        return Ok((BrokerSource::Bdii { url: bdii, network }, use_ssl));
    }

    let host = required_string(cfg, "broker.host")?;
    let port = cfg
        .get_string("broker.port")
        .ok()
        .and_then(|p| p.parse::<u16>().ok());

    match port {
        Some(port) => Ok((BrokerSource::Explicit(vec![(host, port)]), use_ssl)),
        // AMS: a bare hostname with no port.
        None => Ok((BrokerSource::Explicit(vec![(host, 0)]), use_ssl)),
    }
}

/// `get_protocol()` in `ssm/agents.py`: read `sender.protocol` /
/// `receiver.protocol`, defaulting to STOMP with a logged warning when
/// absent, and failing hard on anything else.
fn protocol(cfg: &config::Config, section: &str) -> Result<Protocol, ConfigError> {
    match cfg.get_string(&format!("{section}.protocol")) {
        Ok(raw) => Protocol::parse(&raw),
        Err(_) => {
            tracing::warn!("no option set for 'protocol'. Defaulting to STOMP.");
            Ok(Protocol::Stomp)
        }
    }
}

fn certificate_config(cfg: &config::Config) -> Result<CertificateConfig, ConfigError> {
    let server_cert = optional_string(cfg, "certificates.server_cert").map(PathBuf::from);
    Ok(CertificateConfig {
        certificate: PathBuf::from(required_string(cfg, "certificates.certificate")?),
        key: PathBuf::from(required_string(cfg, "certificates.key")?),
        capath: PathBuf::from(required_string(cfg, "certificates.capath")?),
        server_cert,
        verify_server_cert: bool_with_default(cfg, "certificates.verify_server_cert", true),
        check_crls: bool_with_default(cfg, "certificates.check_crls", true),
    })
}

fn ams_config(cfg: &config::Config, proto: Protocol, brokers: &BrokerSource) -> Option<AmsConfig> {
    if proto != Protocol::Ams {
        return None;
    }
    let host = match brokers {
        BrokerSource::Explicit(list) => list.first().map(|(h, _)| h.clone()).unwrap_or_default(),
        BrokerSource::Bdii { url, .. } => url.clone(),
    };
    let project = optional_string(cfg, "messaging.ams_project").unwrap_or_default();
    let token = optional_string(cfg, "messaging.token").unwrap_or_default();
    Some(AmsConfig { host, project, token })
}

fn path_type(cfg: &config::Config) -> PathType {
    match optional_string(cfg, "messaging.path_type") {
        Some(raw) => PathType::parse(&raw).unwrap_or(PathType::DirQ),
        None => {
            tracing::info!("no path type defined, assuming dirq.");
            PathType::DirQ
        }
    }
}

impl SenderConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = load_ini(path)?;
        let proto = protocol(&cfg, "sender")?;
        let (brokers, use_ssl) = broker_source(&cfg)?;

        let destination = required_string(&cfg, "messaging.destination")?;
        if destination.is_empty() {
            return Err(ConfigError::EmptyDestination);
        }

        let certificates = certificate_config(&cfg)?;
        if let Some(server_cert) = &certificates.server_cert {
            if server_cert == &certificates.certificate {
                return Err(ConfigError::SelfEncryption);
            }
        }

        let ams = ams_config(&cfg, proto, &brokers);
        if proto == Protocol::Ams && ams.as_ref().map(|a| a.project.is_empty()).unwrap_or(true) {
            return Err(ConfigError::Missing("messaging.ams_project".to_string()));
        }

        Ok(SenderConfig {
            brokers,
            use_ssl,
            protocol: proto,
            path: PathBuf::from(required_string(&cfg, "messaging.path")?),
            path_type: path_type(&cfg),
            destination,
            certificates,
            ams,
            logging: logging_config(&cfg)?,
        })
    }
}

impl ReceiverConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = load_ini(path)?;
        let proto = protocol(&cfg, "receiver")?;
        let (brokers, use_ssl) = broker_source(&cfg)?;

        let destination = required_string(&cfg, "messaging.destination")?;
        let certificates = certificate_config(&cfg)?;
        let ams = ams_config(&cfg, proto, &brokers);
        if proto == Protocol::Ams && ams.as_ref().map(|a| a.project.is_empty()).unwrap_or(true) {
            return Err(ConfigError::Missing("messaging.ams_project".to_string()));
        }

        Ok(ReceiverConfig {
            brokers,
            use_ssl,
            protocol: proto,
            path: PathBuf::from(required_string(&cfg, "messaging.path")?),
            destination,
            certificates,
            ams,
            pidfile: PathBuf::from(required_string(&cfg, "daemon.pidfile")?),
            banned_dns: optional_string(&cfg, "auth.banned-dns").map(PathBuf::from),
            logging: logging_config(&cfg)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    fn minimal_sender_ini() -> String {
        r#"
[broker]
host = broker.example.org
port = 6163
use_ssl = true

[messaging]
path = /var/spool/apel/outbound
destination = /queue/accounting

[certificates]
certificate = /etc/grid-security/hostcert.pem
key = /etc/grid-security/hostkey.pem
capath = /etc/grid-security/certificates

[logging]
logfile = /var/log/apel/ssm.log
level = INFO
console = false
"#
        .to_string()
    }

    #[test]
    fn loads_minimal_sender_config_defaulting_protocol_and_path_type() {
        let f = write_ini(&minimal_sender_ini());
        let cfg = SenderConfig::load(f.path()).unwrap();
        assert_eq!(cfg.protocol, Protocol::Stomp);
        assert_eq!(cfg.path_type, PathType::DirQ);
        assert!(cfg.use_ssl);
        assert_eq!(cfg.destination, "/queue/accounting");
    }

    #[test]
    fn empty_destination_is_fatal() {
        let mut ini = minimal_sender_ini();
        ini = ini.replace("destination = /queue/accounting", "destination = ");
        let f = write_ini(&ini);
        assert!(matches!(
            SenderConfig::load(f.path()),
            Err(ConfigError::EmptyDestination)
        ));
    }

    #[test]
    fn self_encryption_guard_rejects_matching_certs() {
        let mut ini = minimal_sender_ini();
        ini.push_str("\n[certificates]\nserver_cert = /etc/grid-security/hostcert.pem\n");
        let f = write_ini(&ini);
        // config merges repeated sections; server_cert now equals certificate.
        let result = SenderConfig::load(f.path());
        assert!(matches!(result, Err(ConfigError::SelfEncryption)));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let mut ini = minimal_sender_ini();
        ini.push_str("\n[sender]\nprotocol = CARRIER_PIGEON\n");
        let f = write_ini(&ini);
        assert!(matches!(
            SenderConfig::load(f.path()),
            Err(ConfigError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn missing_required_key_is_reported() {
        let ini = minimal_sender_ini().replace("path = /var/spool/apel/outbound\n", "");
        let f = write_ini(&ini);
        assert!(matches!(
            SenderConfig::load(f.path()),
            Err(ConfigError::Missing(_))
        ));
    }
}
