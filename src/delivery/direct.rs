//! Direct-to-MX delivery: resolve the recipient domain, then hand the raw
//! message to the first exchanger that answers.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::client::AsyncSmtpConnection;
use lettre::transport::smtp::extension::ClientId;
use lettre::transport::smtp::Error as SmtpError;
use lettre::Address;
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::proto::rr::Name;
use trust_dns_resolver::TokioAsyncResolver;

use super::{DeliveryEngine, DeliveryError};
use crate::config::DeliverySettings;
use crate::envelope::DeliveryRequest;

pub struct DirectDelivery {
    resolver: TokioAsyncResolver,
    port: u16,
    timeout: Duration,
    helo_name: Option<String>,
}

impl DirectDelivery {
    pub fn from_system_conf(settings: &DeliverySettings) -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .context("Failed to load system resolver configuration")?;

        Ok(Self {
            resolver,
            port: settings.port,
            timeout: Duration::from_secs(settings.timeout_secs),
            helo_name: settings.helo_name.clone(),
        })
    }

    /// Name announced in EHLO: the configured one, else the PTR record of
    /// the address we are sending as.
    async fn helo_name(&self, sending_address: &str) -> Result<String, DeliveryError> {
        if let Some(name) = &self.helo_name {
            return Ok(name.clone());
        }

        let ip: IpAddr = sending_address
            .parse()
            .map_err(|_| DeliveryError::Lookup(format!("invalid sending address: {}", sending_address)))?;

        let names = self
            .resolver
            .reverse_lookup(ip)
            .await
            .map_err(|e| DeliveryError::Lookup(e.to_string()))?;

        names
            .iter()
            .next()
            .map(|name| name.to_utf8().trim_end_matches('.').to_string())
            .ok_or_else(|| DeliveryError::Lookup(format!("no PTR record for {}", ip)))
    }

    async fn exchangers(&self, domain: &Name) -> Result<Vec<String>, DeliveryError> {
        match self.resolver.mx_lookup(domain.clone()).await {
            Ok(lookup) => {
                let records = lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect();
                Ok(exchange_order(records))
            }
            Err(e) if is_no_records(&e) => Ok(vec![host_name(&domain.to_utf8())]),
            Err(e) => Err(DeliveryError::Lookup(e.to_string())),
        }
    }
}

#[async_trait]
impl DeliveryEngine for DirectDelivery {
    async fn send(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        let envelope = smtp_envelope(request)?;
        let domain = ascii_domain(recipient_domain(&request.rcpt_to)?)?;
        let hosts = self.exchangers(&domain).await?;
        let helo = self.helo_name(&request.sending_address).await?;

        let dialer = Dialer {
            port: self.port,
            timeout: self.timeout,
            hello_name: ClientId::Domain(helo),
            local_ip: request.local_address.parse().ok(),
        };
        dialer.send_via(&hosts, &envelope, request.data.as_bytes()).await
    }
}

/// Outbound connection settings shared by every exchanger of one message.
struct Dialer {
    port: u16,
    timeout: Duration,
    hello_name: ClientId,
    /// Source address to bind; `None` lets the kernel pick.
    local_ip: Option<IpAddr>,
}

impl Dialer {
    /// A reply carrying a status code ends the attempt. Connection level
    /// failures move on to the next exchanger.
    async fn send_via(&self, hosts: &[String], envelope: &Envelope, data: &[u8]) -> Result<(), DeliveryError> {
        let mut last_error = "no mail exchanger available".to_string();

        for host in hosts {
            match self.send_once(host, envelope, data).await {
                Ok(()) => return Ok(()),
                Err(e) => match e.status() {
                    Some(code) => {
                        let detail = std::error::Error::source(&e)
                            .map(|source| source.to_string())
                            .unwrap_or_else(|| e.to_string());
                        return Err(DeliveryError::Rejected {
                            code: code.to_string(),
                            detail,
                        });
                    }
                    None => last_error = format!("{}: {}", host, e),
                },
            }
        }

        Err(DeliveryError::Unreachable(last_error))
    }

    async fn send_once(&self, host: &str, envelope: &Envelope, data: &[u8]) -> Result<(), SmtpError> {
        let mut conn = AsyncSmtpConnection::connect_tokio1(
            (host, self.port),
            Some(self.timeout),
            &self.hello_name,
            None,
            self.local_ip,
        )
        .await?;

        conn.send(envelope, data).await?;
        // the message is already accepted at this point
        conn.quit().await.ok();
        Ok(())
    }
}

fn is_no_records(e: &ResolveError) -> bool {
    matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn host_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_string()
}

fn recipient_domain(rcpt_to: &str) -> Result<&str, DeliveryError> {
    match rcpt_to.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(domain),
        _ => Err(DeliveryError::BadRecipient),
    }
}

fn ascii_domain(domain: &str) -> Result<Name, DeliveryError> {
    Name::from_utf8(domain).map_err(|e| DeliveryError::Domain(e.to_string()))
}

/// Exchangers by ascending preference. Equal preferences keep DNS order.
fn exchange_order(mut records: Vec<(u16, String)>) -> Vec<String> {
    records.sort_by_key(|(preference, _)| *preference);
    records
        .into_iter()
        .map(|(_, host)| host_name(&host))
        .filter(|host| !host.is_empty())
        .collect()
}

fn smtp_envelope(request: &DeliveryRequest) -> Result<Envelope, DeliveryError> {
    let from = if request.mail_from.is_empty() {
        None
    } else {
        let sender = request
            .mail_from
            .parse::<Address>()
            .map_err(|e| DeliveryError::BadSender(e.to_string()))?;
        Some(sender)
    };

    let to = request
        .rcpt_to
        .parse::<Address>()
        .map_err(|_| DeliveryError::BadRecipient)?;

    Envelope::new(from, vec![to]).map_err(|_| DeliveryError::BadRecipient)
}
