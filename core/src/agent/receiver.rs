//! Long-lived Receiver daemon loop. Ported from the `while True` loop in
//! `run_receiver()` (`examples/original_source/ssm/agents.py`) and
//! `Ssm2.on_message()` / `_handle_msg()` (`ssm/ssm2.py`).

use std::path::Path;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{BrokerSource, Protocol, ReceiverConfig};
use crate::crypto;
use crate::pidfile;
use crate::store::{open_store, MessageStore, StoreRecord};
use crate::transport::ams::AmsConfig;
use crate::transport::{AmsTransport, Delivery, StompTransport, Transport, TransportError};
use crate::trust::{self, TrustDecision};

use super::AgentError;

/// How often (in ticks) to reload the trust/banned lists and send a
/// keep-alive ping (`REFRESH_DNS` in `ssm/agents.py`, counted in 100ms
/// ticks there: `i % (REFRESH_DNS * 10) == 0`).
const TICK_PERIOD: Duration = Duration::from_millis(100);
const REFRESH_DNS_TICKS: u64 = 600 * 10;
/// Pause after a lost connection before restarting (`run_receiver`'s
/// `time.sleep(10 * 60)`).
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(10 * 60);

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
                topic: None,
                subscription: Some(destination.to_string()),
                token: ams.token.clone(),
                client_identity,
            })?))
        }
    }
}

/// Verify, classify and store a single delivered message. Pings are
/// discarded before this is called (spec.md §4.4.1).
fn on_message(
    delivery: Delivery,
    cert: &Path,
    key: &Path,
    capath: &Path,
    check_crls: bool,
    trusted: &[String],
    banned: &[String],
    incoming: &dyn MessageStore,
    reject: &dyn MessageStore,
) {
    let empaid = delivery.empa_id().to_string();
    info!("Received message. ID = {}", empaid);

    match crypto::verify(&delivery.body, Some((cert, key)), capath, check_crls) {
        Ok(outcome) => match trust::classify(&outcome.signer_subject, trusted, banned) {
            TrustDecision::Accepted => {
                info!("Valid signer: {}", outcome.signer_subject);
                match incoming.add_record(StoreRecord::incoming(
                    outcome.plaintext,
                    outcome.signer_subject,
                    Some(empaid),
                )) {
                    Ok(name) => info!("Message saved to incoming queue as {}", name),
                    Err(e) => error!("Failed to read or write file: {}", e),
                }
            }
            TrustDecision::Untrusted => {
                warn!("Signer not in valid DNs list: {}", outcome.signer_subject);
                let err_msg = "Signer not in valid DNs list.".to_string();
                match reject.add_record(StoreRecord::reject(
                    delivery.body,
                    Some(outcome.signer_subject),
                    Some(empaid),
                    err_msg,
                )) {
                    Ok(name) => info!("Message saved to reject queue as {}", name),
                    Err(e) => error!("Failed to read or write file: {}", e),
                }
            }
            TrustDecision::Banned => {
                warn!("Signer is banned: {}", outcome.signer_subject);
                let err_msg = "Signer is banned.".to_string();
                match reject.add_record(StoreRecord::reject(
                    delivery.body,
                    Some(outcome.signer_subject),
                    Some(empaid),
                    err_msg,
                )) {
                    Ok(name) => info!("Message saved to reject queue as {}", name),
                    Err(e) => error!("Failed to read or write file: {}", e),
                }
            }
        },
        Err(e) => {
            // Crypto failed before a signer subject was ever established —
            // this is never a trust-list verdict. Matches `on_message`'s
            // `'Could not extract message.'` branch in
            // examples/original_source/ssm/ssm2.py (signer is None there).
            let err_msg = format!("Could not extract message: {e}");
            warn!("Message rejected: {}", err_msg);
            match reject.add_record(StoreRecord::reject(delivery.body, None, Some(empaid), err_msg)) {
                Ok(name) => info!("Message saved to reject queue as {}", name),
                Err(e) => error!("Failed to read or write file: {}", e),
            }
        }
    }
}

/// Run the receiver daemon until SIGTERM, or forever if the process is
/// killed by signal the OS delivers directly.
pub async fn run_receiver(config_path: &Path, dn_file: &Path) -> Result<(), AgentError> {
    let config = ReceiverConfig::load(config_path)?;

    if !crypto::check_cert_key(&config.certificates.certificate, &config.certificates.key) {
        return Err(AgentError::CertKeyMismatch);
    }
    crypto::check_not_expiring(&config.certificates.certificate, crypto::CERT_EXPIRY_WINDOW)?;

    info!("Fetching valid DNs.");
    let mut trusted = trust::load_trust_list(dn_file)?;
    let mut banned = match &config.banned_dns {
        Some(path) => trust::load_banned_list(path)?,
        None => Vec::new(),
    };

    let incoming = open_store(&config.path.join("incoming"), crate::store::PathType::DirQ)?;
    let reject = open_store(&config.path.join("reject"), crate::store::PathType::DirQ)?;

    let mut transport = build_transport(
        config.protocol,
        &config.brokers,
        config.use_ssl,
        &config.destination,
        config.ams.as_ref(),
        &config.certificates.certificate,
        &config.certificates.key,
    )?;

    pidfile::write_pidfile(&config.pidfile);
    transport.start().await?;
    if let Transport::Stomp(stomp) = &mut transport {
        stomp.subscribe(&config.destination).await?;
    }
    info!("The SSM will run as a daemon.");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(TransportError::Io)?;
    let mut ticker = interval(TICK_PERIOD);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received the shutdown signal.");
                break;
            }
            _ = ticker.tick() => {
                let result = receiver_tick(
                    &mut transport,
                    &config,
                    &*incoming,
                    &*reject,
                    &trusted,
                    &banned,
                )
                .await;

                if let Err(e) = result {
                    warn!("Connection lost.");
                    error!("{}", e);
                    transport.stop().await.ok();
                    pidfile::remove_pidfile(&config.pidfile);
                    info!("Waiting for 10 minutes before restarting...");
                    tokio::time::sleep(RECONNECT_COOLDOWN).await;
                    info!("Restarting SSM.");
                    pidfile::write_pidfile(&config.pidfile);
                    transport.start().await?;
                    if let Transport::Stomp(stomp) = &mut transport {
                        stomp.subscribe(&config.destination).await?;
                    }
                    tick = 0;
                    continue;
                }

                tick += 1;
                if tick % REFRESH_DNS_TICKS == 0 {
                    info!("Refreshing valid DNs and then sending ping.");
                    trusted = trust::load_trust_list(dn_file)?;
                    banned = match &config.banned_dns {
                        Some(path) => trust::load_banned_list(path)?,
                        None => Vec::new(),
                    };
                    if config.protocol == Protocol::Stomp {
                        transport.send_ping().await?;
                    }
                }
            }
        }
    }

    transport.stop().await.ok();
    pidfile::remove_pidfile(&config.pidfile);
    info!("Receiving SSM has shut down.");
    Ok(())
}

async fn receiver_tick(
    transport: &mut Transport,
    config: &ReceiverConfig,
    incoming: &dyn MessageStore,
    reject: &dyn MessageStore,
    trusted: &[String],
    banned: &[String],
) -> Result<(), AgentError> {
    match (transport, config.protocol) {
        (Transport::Ams(ams), Protocol::Ams) => {
            let cert = &config.certificates.certificate;
            let key = &config.certificates.key;
            let capath = &config.certificates.capath;
            let check_crls = config.certificates.check_crls;
            let mut pending = Vec::new();
            ams.pull(1, |delivery| {
                if !delivery.is_ping() {
                    pending.push(delivery);
                } else {
                    info!("Received ping message.");
                }
            })
            .await?;
            for delivery in pending {
                on_message(delivery, cert, key, capath, check_crls, trusted, banned, incoming, reject);
            }
            Ok(())
        }
        (Transport::Stomp(stomp), Protocol::Stomp) => {
            while let Some(delivery) = stomp.try_recv() {
                if delivery.is_ping() {
                    info!("Received ping message.");
                    continue;
                }
                on_message(
                    delivery,
                    &config.certificates.certificate,
                    &config.certificates.key,
                    &config.certificates.capath,
                    config.certificates.check_crls,
                    trusted,
                    banned,
                    incoming,
                    reject,
                );
            }
            if stomp.state().await == crate::transport::stomp::ConnectionState::Dead {
                return Err(AgentError::LostConnection);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
