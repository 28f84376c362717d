//! Request/reply messaging between harnesses and test VMs.
//!
//! Every exchange uses a fresh TCP connection: the client writes one request
//! frame, the server writes at most one reply frame, and both sides close.
//! A server that closes without replying means "no reply"; this is not an
//! error for requests that do not expect one.

pub mod autot;
pub mod frame;
pub mod harness;
pub mod slave;

pub use autot::{AutotListener, AutotReply, AutotRequest, AutotState};
pub use frame::{Envelope, MAX_FRAME_LEN, PROTOCOL_VERSION, read_frame, write_frame};
pub use harness::{HarnessRequest, VmStarted, harness_endpoints, start_slave_vms};
pub use slave::{AdminQuery, OverrideProvider, ServiceRef, SlaveRequest, request_slave};

use crate::config::QaConfig;
use crate::errors::{ProtocolError, Result as CoreResult};
use crate::types::resolve_endpoint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Config key: delay between slave connection attempts, in milliseconds.
pub const CONNECT_INTERVAL_KEY: &str = "dth.slaveConnectInterval";
/// Config key: number of slave connection attempts.
pub const CONNECT_ATTEMPTS_KEY: &str = "dth.slaveConnectAttempts";

const IO_TIMEOUT: Duration = Duration::from_secs(300);

/// Generic reply: a JSON value or the remote error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum Reply {
    Ok(serde_json::Value),
    Err(String),
}

impl Reply {
    pub fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Err(format!("failed to encode reply: {e}")),
        }
    }

    pub fn unit() -> Self {
        Self::Ok(serde_json::Value::Null)
    }

    pub fn from_result<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::ok(&value),
            Err(e) => Self::Err(e.to_string()),
        }
    }

    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        match self {
            Self::Ok(value) => Ok(serde_json::from_value(value)?),
            Self::Err(message) => Err(ProtocolError::Remote(message)),
        }
    }
}

/// Fixed-interval connect retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            attempts: 30,
        }
    }
}

impl ConnectPolicy {
    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self {
            interval: Duration::ZERO,
            attempts: 1,
        }
    }

    pub fn from_config(config: &QaConfig) -> CoreResult<Self> {
        let defaults = Self::default();
        let interval_ms = config.get_long(
            CONNECT_INTERVAL_KEY,
            i64::try_from(defaults.interval.as_millis()).unwrap_or(1000),
        )?;
        let attempts = config.get_int(CONNECT_ATTEMPTS_KEY, defaults.attempts as i32)?;
        Ok(Self {
            interval: Duration::from_millis(u64::try_from(interval_ms).unwrap_or(0)),
            attempts: u32::try_from(attempts).unwrap_or(1).max(1),
        })
    }
}

/// Connect to `endpoint`, retrying per `policy`.
pub fn connect_with_retry(endpoint: &str, policy: &ConnectPolicy) -> Result<TcpStream, ProtocolError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = resolve_endpoint(endpoint).and_then(TcpStream::connect);
        match result {
            Ok(stream) => {
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                return Ok(stream);
            }
            Err(e) if attempt >= policy.attempts => {
                return Err(ProtocolError::Connect {
                    endpoint: endpoint.to_string(),
                    source: e,
                });
            }
            Err(e) => {
                debug!(endpoint, attempt, error = %e, "connect failed, retrying");
                thread::sleep(policy.interval);
            }
        }
    }
}

/// Send `request` and read the optional reply frame.
pub fn exchange<Req, Rep>(
    endpoint: &str,
    request: &Req,
    policy: &ConnectPolicy,
) -> Result<Option<Rep>, ProtocolError>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    let mut stream = connect_with_retry(endpoint, policy)?;
    write_frame(&mut stream, request)?;
    let _ = stream.shutdown(std::net::Shutdown::Write);
    read_frame(&mut stream)
}

/// Send `request` and decode the [`Reply`]; a missing reply is an error.
pub fn request<Req, T>(endpoint: &str, request: &Req, policy: &ConnectPolicy) -> Result<T, ProtocolError>
where
    Req: Serialize,
    T: DeserializeOwned,
{
    match exchange::<Req, Reply>(endpoint, request, policy)? {
        Some(reply) => reply.into_result(),
        None => Err(ProtocolError::NoReply),
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failed.len()
    }
}

/// Deliver `request` to every endpoint in order, one connection attempt each.
pub fn broadcast<Req: Serialize>(endpoints: &[String], request: &Req) -> BroadcastReport {
    broadcast_with(endpoints, request, &ConnectPolicy::once())
}

/// Sequential best-effort delivery; failures are logged and counted.
pub fn broadcast_with<Req: Serialize>(
    endpoints: &[String],
    request: &Req,
    policy: &ConnectPolicy,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for endpoint in endpoints {
        report.attempted += 1;
        match exchange::<Req, Reply>(endpoint, request, policy) {
            Ok(Some(Reply::Err(message))) => {
                warn!(endpoint = %endpoint, error = %message, "slave rejected broadcast");
                report.failed.push(endpoint.clone());
            }
            Ok(_) => debug!(endpoint = %endpoint, "broadcast delivered"),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "broadcast to slave failed");
                report.failed.push(endpoint.clone());
            }
        }
    }
    if !report.failed.is_empty() {
        warn!(
            attempted = report.attempted,
            failed = report.failed.len(),
            "broadcast incomplete"
        );
    }
    report
}

/// Accept loop answering one request per connection on a dedicated thread.
///
/// Requests are handled one at a time in arrival order.
pub struct RequestListener {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RequestListener {
    pub fn bind<Req, H>(name: &str, addr: SocketAddr, handler: H) -> io::Result<Self>
    where
        Req: DeserializeOwned + 'static,
        H: FnMut(Req) -> Option<Reply> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)?;
        Self::from_listener(name, listener, handler)
    }

    pub fn from_listener<Req, H>(name: &str, listener: TcpListener, mut handler: H) -> io::Result<Self>
    where
        Req: DeserializeOwned + 'static,
        H: FnMut(Req) -> Option<Reply> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let label = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("dth-{name}"))
            .spawn(move || {
                info!(listener = %label, %addr, "request listener started");
                for conn in listener.incoming() {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match conn {
                        Ok(stream) => {
                            if let Err(e) = serve_connection(stream, &mut handler) {
                                warn!(listener = %label, error = %e, "request failed");
                            }
                        }
                        Err(e) => warn!(listener = %label, error = %e, "accept failed"),
                    }
                }
                debug!(listener = %label, "request listener stopped");
            })?;
        Ok(Self {
            addr,
            stop,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and join the listener thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        // Unblock accept().
        let _ = TcpStream::connect_timeout(&wake_addr(self.addr), Duration::from_secs(1));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RequestListener {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let ip = match addr {
            SocketAddr::V4(_) => std::net::IpAddr::from([127, 0, 0, 1]),
            SocketAddr::V6(_) => std::net::IpAddr::from(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, addr.port())
    } else {
        addr
    }
}

fn serve_connection<Req, H>(mut stream: TcpStream, handler: &mut H) -> Result<(), ProtocolError>
where
    Req: DeserializeOwned,
    H: FnMut(Req) -> Option<Reply>,
{
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    let Some(request) = read_frame::<_, Req>(&mut stream)? else {
        return Ok(());
    };
    if let Some(reply) = handler(request) {
        write_frame(&mut stream, &reply)?;
    }
    Ok(())
}
