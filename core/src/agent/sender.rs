//! One-shot Sender loop: lock -> get -> sign -> [encrypt] -> publish ->
//! remove -> purge -> stop. Grounded in `Ssm2.send_all()` /
//! `Ssm2.has_msgs()` / `run_sender()` in
//! `examples/original_source/ssm/ssm2.py` and `ssm/agents.py`.

use std::path::Path;

use tracing::{info, warn};

use crate::config::{BrokerSource, Protocol, SenderConfig};
use crate::crypto;
use crate::store::{open_store, MessageStore};
use crate::transport::ams::AmsConfig;
use crate::transport::{AmsTransport, StompTransport, Transport};

use super::AgentError;

fn build_transport(
    protocol: Protocol,
    brokers: &BrokerSource,
    use_ssl: bool,
    destination: &str,
    ams: Option<&crate::config::AmsConfig>,
    cert: &Path,
    key: &Path,
) -> Result<Transport, AgentError> {
    match protocol {
        Protocol::Stomp => {
            let hosts = brokers.resolve()?;
            Ok(Transport::Stomp(
                StompTransport::new(hosts, use_ssl).with_destination(destination.to_string()),
            ))
        }
        Protocol::Ams => {
            let ams = ams.expect("AMS protocol implies an AmsConfig (enforced at config load)");
            let client_identity = if ams.token.is_empty() {
                Some((cert.to_path_buf(), key.to_path_buf()))
            } else {
                None
            };
            Ok(Transport::Ams(AmsTransport::new(AmsConfig {
                host: ams.host.clone(),
                project: ams.project.clone(),
                topic: Some(destination.to_string()),
                subscription: None,
                token: ams.token.clone(),
                client_identity,
            })?))
        }
    }
}

/// Run the sender agent once: send every message currently in the outbound
/// queue, then return. Unlike the receiver, there is no retry loop here —
/// a publish failure aborts the run and the remaining messages stay queued
/// for the next invocation (spec.md §4.5.1).
pub async fn run_sender(config_path: &Path) -> Result<(), AgentError> {
    let config = SenderConfig::load(config_path)?;

    if !crypto::check_cert_key(&config.certificates.certificate, &config.certificates.key) {
        return Err(AgentError::CertKeyMismatch);
    }
    crypto::check_not_expiring(&config.certificates.certificate, crypto::CERT_EXPIRY_WINDOW)?;

    let host_subject = crypto::certificate_subject(&config.certificates.certificate)?;
    info!("Messages will be signed using {}", host_subject);
    if let Some(server_cert) = &config.certificates.server_cert {
        crypto::check_not_expiring(server_cert, crypto::CERT_EXPIRY_WINDOW)?;
        let server_subject = crypto::certificate_subject(server_cert)?;
        info!("Messages will be encrypted using {}", server_subject);
        if config.certificates.verify_server_cert
            && !crypto::verify_cert_path(
                server_cert,
                &config.certificates.capath,
                config.certificates.check_crls,
            )?
        {
            return Err(AgentError::Crypto(crypto::CryptoError::VerifyFailed));
        }
    } else {
        info!("No server certificate supplied.  Will not encrypt messages.");
    }

    let store = open_store(&config.path, config.path_type)?;
    let ids = store.enumerate()?;
    if ids.is_empty() {
        info!("No messages found to send.");
        return Ok(());
    }
    info!("Found {} messages.", ids.len());

    let mut transport = build_transport(
        config.protocol,
        &config.brokers,
        config.use_ssl,
        &config.destination,
        config.ams.as_ref(),
        &config.certificates.certificate,
        &config.certificates.key,
    )?;
    transport.start().await?;

    for msgid in ids {
        if !store.lock(&msgid)? {
            warn!("Message was locked. {} will not be sent.", msgid);
            continue;
        }

        let body = store.get(&msgid)?;
        let signed = crypto::sign(&body, &config.certificates.certificate, &config.certificates.key)?;
        let to_send = match &config.certificates.server_cert {
            // `crypto.encrypt`'s default cipher in ssm/crypto.py is aes128.
            Some(server_cert) => crypto::encrypt(&signed, server_cert, crypto::Cipher::Aes128)?,
            None => signed,
        };

        info!("Sending message: {}", msgid);
        transport.publish(&to_send, &msgid).await?;
        store.remove(&msgid)?;
    }

    store.purge()?;
    transport.stop().await?;
    info!("SSM run has finished.");
    Ok(())
}
