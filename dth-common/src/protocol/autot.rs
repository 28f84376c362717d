//! Out-of-band status and suspend/resume channel.
//!
//! Served on its own listener thread so an external controller can poll or
//! pause a test even while the test thread is blocked.

use super::{Reply, RequestListener};
use crate::config::QaConfig;
use crate::errors::Result as CoreResult;
use crate::suspend::SuspendGate;
use crate::types::AUTOT_PORT;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

pub const AUTOT_PORT_KEY: &str = "dth.autotPort";

pub fn autot_port(config: &QaConfig) -> CoreResult<u16> {
    let port = config.get_int(AUTOT_PORT_KEY, i32::from(AUTOT_PORT))?;
    Ok(u16::try_from(port).unwrap_or(AUTOT_PORT))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum AutotRequest {
    Status,
    Suspend,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutotState {
    Running,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutotReply {
    pub test: String,
    pub state: AutotState,
    pub elapsed_ms: u64,
}

/// Listener bound to a test's [`SuspendGate`].
pub struct AutotListener {
    listener: RequestListener,
}

impl AutotListener {
    pub fn start(addr: SocketAddr, test: impl Into<String>, gate: Arc<SuspendGate>) -> io::Result<Self> {
        let test = test.into();
        let started = Instant::now();
        let listener = RequestListener::bind("autot", addr, move |req: AutotRequest| {
            match req {
                AutotRequest::Status => {}
                AutotRequest::Suspend => gate.suspend(),
                AutotRequest::Resume => gate.resume(),
            }
            let state = if gate.is_suspended() {
                AutotState::Suspended
            } else {
                AutotState::Running
            };
            Some(Reply::ok(&AutotReply {
                test: test.clone(),
                state,
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }))
        })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn shutdown(self) {
        self.listener.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectPolicy, request};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_suspend_and_resume_while_test_blocks() {
        let gate = Arc::new(SuspendGate::new());
        let autot = AutotListener::start(
            "127.0.0.1:0".parse().unwrap(),
            "lookup/Register.td",
            Arc::clone(&gate),
        )
        .unwrap();
        let endpoint = autot.local_addr().to_string();
        let policy = ConnectPolicy::once();

        let reply: AutotReply = request(&endpoint, &AutotRequest::Suspend, &policy).unwrap();
        assert_eq!(reply.state, AutotState::Suspended);
        assert_eq!(reply.test, "lookup/Register.td");

        let test_thread = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_while_suspended())
        };
        thread::sleep(Duration::from_millis(30));
        let status: AutotReply = request(&endpoint, &AutotRequest::Status, &policy).unwrap();
        assert_eq!(status.state, AutotState::Suspended);

        let resumed: AutotReply = request(&endpoint, &AutotRequest::Resume, &policy).unwrap();
        assert_eq!(resumed.state, AutotState::Running);
        test_thread.join().unwrap();
        autot.shutdown();
    }
}
