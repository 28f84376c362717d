//! Keep-alive channel between the master harness and slave harnesses.
//!
//! The master accepts connections on the keep-alive port and simply holds
//! them. A slave harness keeps one connection open; when it reads EOF or an
//! error the master is gone and the slave tears down locally.

use crate::config::QaConfig;
use crate::errors::{ProtocolError, Result as CoreResult};
use crate::protocol::ConnectPolicy;
use crate::types::{KEEPALIVE_PORT, resolve_endpoint};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const KEEPALIVE_PORT_KEY: &str = "dth.keepAlivePort";

/// Configured keep-alive port.
pub fn keepalive_port(config: &QaConfig) -> CoreResult<u16> {
    let port = config.get_int(KEEPALIVE_PORT_KEY, i32::from(KEEPALIVE_PORT))?;
    Ok(u16::try_from(port).unwrap_or(KEEPALIVE_PORT))
}

/// Master side: accepts and holds slave connections until shut down.
pub struct KeepAliveServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    held: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl KeepAliveServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown, rx) = watch::channel(false);
        let held = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(accept_loop(listener, rx, Arc::clone(&held)));
        info!(%addr, "keep-alive server listening");
        Ok(Self {
            addr,
            shutdown,
            held,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connections currently held open.
    pub fn held_connections(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    /// Close every held connection and stop accepting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "keep-alive accept task failed");
        }
        debug!("keep-alive server stopped");
    }
}

async fn accept_loop(listener: TcpListener, mut shutdown: watch::Receiver<bool>, held: Arc<AtomicUsize>) {
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "slave connected to keep-alive");
                    let rx = shutdown.clone();
                    let held = Arc::clone(&held);
                    connections.push(tokio::spawn(hold(stream, rx, held)));
                }
                Err(e) => warn!(error = %e, "keep-alive accept failed"),
            },
        }
    }
    for connection in connections {
        let _ = connection.await;
    }
}

async fn hold(mut stream: TcpStream, mut shutdown: watch::Receiver<bool>, held: Arc<AtomicUsize>) {
    held.fetch_add(1, Ordering::SeqCst);
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    held.fetch_sub(1, Ordering::SeqCst);
}

/// Why a slave's keep-alive connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveEnd {
    /// The master closed the connection.
    Eof,
    /// The connection failed.
    Error(String),
}

/// Slave side: connect to the master (retrying per `policy`) and wait for the
/// connection to end. Fails only if no connection could be made.
pub async fn monitor(endpoint: &str, policy: &ConnectPolicy) -> Result<KeepAliveEnd, ProtocolError> {
    let mut stream = connect(endpoint, policy).await?;
    info!(endpoint, "keep-alive connection established");
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return Ok(KeepAliveEnd::Eof),
            Ok(_) => {}
            Err(e) => return Ok(KeepAliveEnd::Error(e.to_string())),
        }
    }
}

async fn connect(endpoint: &str, policy: &ConnectPolicy) -> Result<TcpStream, ProtocolError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match resolve_endpoint(endpoint) {
            Ok(addr) => TcpStream::connect(addr).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt >= policy.attempts => {
                return Err(ProtocolError::Connect {
                    endpoint: endpoint.to_string(),
                    source: e,
                });
            }
            Err(e) => {
                debug!(endpoint, attempt, error = %e, "keep-alive connect failed, retrying");
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_monitor_returns_eof_when_master_stops() {
        let server = KeepAliveServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = server.local_addr().to_string();
        let watcher = tokio::spawn(async move { monitor(&endpoint, &ConnectPolicy::once()).await });

        for _ in 0..100 {
            if server.held_connections() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.held_connections(), 1);
        server.shutdown().await;

        let end = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, KeepAliveEnd::Eof);
    }

    #[tokio::test]
    async fn test_monitor_fails_without_master() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);
        let policy = ConnectPolicy {
            interval: Duration::from_millis(10),
            attempts: 2,
        };
        let err = monitor(&endpoint, &policy).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Connect { .. }));
    }

    #[test]
    fn test_port_from_config() {
        let config = QaConfig::builder()
            .defaults([(KEEPALIVE_PORT_KEY.to_string(), "12003".to_string())].into_iter().collect())
            .build()
            .unwrap();
        assert_eq!(keepalive_port(&config).unwrap(), 12003);
        assert_eq!(keepalive_port(&QaConfig::default()).unwrap(), KEEPALIVE_PORT);
    }
}
