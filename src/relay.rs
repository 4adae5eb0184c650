use crate::access::{canonical_ip, AccessFilter};
use crate::config::Config;
use crate::delivery::DeliveryEngine;
use crate::engine::{tls, EngineConfig, SmtpConn};
use crate::session::{Session, SessionContext};
use crate::utils::Logger;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub struct SmtpRelay {
    pub config: Config,
    logger: Logger,
    access: AccessFilter,
    delivery: Arc<dyn DeliveryEngine>,
    engine_config: Arc<EngineConfig>,
    pub tls_acceptor: Option<TlsAcceptor>,
}

impl SmtpRelay {
    pub fn new(config: Config, logger: Logger, delivery: Arc<dyn DeliveryEngine>) -> Result<Self> {
        let tls_acceptor = match config.tls_paths() {
            Some((cert, key)) => {
                let acceptor = tls::load_acceptor(cert, key)?;
                eprintln!("[INFO] STARTTLS enabled with certificate: {:?}", cert);
                Some(acceptor)
            }
            None => {
                if config.smtpd.tls_cert.is_some() || config.smtpd.tls_key.is_some() {
                    eprintln!("[WARNING] tls_cert and tls_key must both be set, STARTTLS disabled");
                }
                None
            }
        };

        let access = AccessFilter::new(config.allow_ip.iter().cloned());
        if access.is_empty() {
            eprintln!("[WARNING] allow_ip is empty, every connection will be denied");
        }

        Ok(Self {
            access,
            engine_config: Arc::new(EngineConfig::from(&config.smtpd)),
            config,
            logger,
            delivery,
            tls_acceptor,
        })
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))
    }

    /// Gate a new connection on the allow-list. Denials are logged here.
    async fn admit(&self, remote_addr: &SocketAddr) -> bool {
        let remote_ip = canonical_ip(remote_addr);
        if self.access.is_allowed(&remote_ip) {
            return true;
        }

        self.logger.log(&format!("Deny connect from IP {}", remote_ip)).await;
        false
    }

    pub async fn handle_client(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        if !self.admit(&remote_addr).await {
            return Ok(());
        }

        let local_addr = stream
            .local_addr()
            .context("Failed to read local address of connection")?;

        let mut proto = SmtpConn::new(stream, self.engine_config.clone(), self.tls_acceptor.clone());
        let mut session = Session::new(local_addr, remote_addr);
        let ctx = SessionContext {
            map_ip: &self.config.map_ip,
            delivery: self.delivery.as_ref(),
            logger: &self.logger,
        };

        let end = session.run(&mut proto, &ctx).await;
        self.logger
            .debug(&format!("Connection from {} closed ({:?})", remote_addr, end))
            .await;
        Ok(())
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port);
        self.logger.log(&format!("Listen on port {}", port)).await;

        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_client(stream, remote_addr).await {
                            this.logger
                                .log(&format!("Error on connection from {}: {:#}", remote_addr, e))
                                .await;
                        }
                    });
                }
                Err(e) => {
                    self.logger.log(&format!("Accept error: {}", e)).await;
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.logger.log(&format!("{:#}", e)).await;
                return Err(e);
            }
        };
        self.serve(listener).await
    }
}
