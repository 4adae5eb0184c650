use std::collections::HashMap;
use std::net::SocketAddr;

use crate::access::canonical_ip;
use crate::delivery::{self, DeliveryEngine, DeliveryOutcome};
use crate::engine::{Command, Event, ProtocolSession};
use crate::envelope::{DeliveryRequest, Envelope};
use crate::utils::{safe_log_string, Logger};

/// State owned by one accepted connection.
pub struct Session {
    /// Address the connection was accepted on; the identity used for delivery.
    pub local_address: String,
    pub remote_address: SocketAddr,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Completed,
    Aborted,
    DeliveryFailed,
}

/// Read-only collaborators a session needs.
pub struct SessionContext<'a> {
    pub map_ip: &'a HashMap<String, String>,
    pub delivery: &'a dyn DeliveryEngine,
    pub logger: &'a Logger,
}

impl Session {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_address: canonical_ip(&local_addr),
            remote_address: remote_addr,
            envelope: Envelope::default(),
        }
    }

    /// Drives the protocol engine until the connection has to be closed.
    pub async fn run<P>(&mut self, proto: &mut P, ctx: &SessionContext<'_>) -> SessionEnd
    where
        P: ProtocolSession + ?Sized,
    {
        loop {
            match proto.next().await {
                Event::Abort(reason) | Event::TlsError(reason) => {
                    proto.reject().await;
                    ctx.logger
                        .log(&format!("Session from {} aborted: {}", self.remote_address, reason))
                        .await;
                    return SessionEnd::Aborted;
                }
                Event::AuthAbort => {
                    proto.reject().await;
                    ctx.logger
                        .log(&format!("Session from {} aborted: authentication cancelled", self.remote_address))
                        .await;
                    return SessionEnd::Aborted;
                }
                Event::AuthResponse(client_bytes) => {
                    proto.continue_authentication(&client_bytes).await;
                }
                Event::Command { cmd, arg } => {
                    match cmd {
                        Command::MailFrom => self.envelope.mail_from = arg,
                        Command::RcptTo => self.envelope.rcpt_to = arg,
                        _ => {}
                    }
                    proto.accept().await;
                }
                Event::GotData(body) => {
                    self.envelope.data = body;
                    if let Some(end) = self.deliver(proto, ctx).await {
                        return end;
                    }
                }
                Event::Done => {
                    proto.accept().await;
                    return SessionEnd::Completed;
                }
            }
        }
    }

    /// One delivery attempt for the current envelope. Returns `Some` when
    /// the session has to end.
    async fn deliver<P>(&mut self, proto: &mut P, ctx: &SessionContext<'_>) -> Option<SessionEnd>
    where
        P: ProtocolSession + ?Sized,
    {
        let request = DeliveryRequest::build(&self.local_address, &self.envelope, ctx.map_ip);
        if request.sending_address != self.local_address {
            ctx.logger
                .debug(&format!(
                    "Local IP address '{}' change to '{}'",
                    self.local_address, request.sending_address
                ))
                .await;
        }

        let outcome = delivery::dispatch(ctx.delivery, &request).await;
        ctx.logger
            .log(&format!(
                "Mail from <{}> to <{}> result: {}",
                safe_log_string(&request.mail_from),
                safe_log_string(&request.rcpt_to),
                outcome.describe()
            ))
            .await;

        match outcome {
            DeliveryOutcome::Delivered => {
                proto.accept().await;
                None
            }
            DeliveryOutcome::Failed(reason) => {
                let line = format!("{}\r\n", reason);
                if let Err(e) = proto.write_raw(line.as_bytes()).await {
                    ctx.logger
                        .log(&format!("Failed to send rejection to {}: {}", self.remote_address, e))
                        .await;
                }
                Some(SessionEnd::DeliveryFailed)
            }
        }
    }
}
