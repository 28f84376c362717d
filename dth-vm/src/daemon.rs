//! Activation daemon: accepts liveness probes until interrupted.

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const PID_FILE: &str = "activation.pid";

/// Run the daemon on `port`, writing its pid into `dir`. Returns the exit
/// code once ctrl-c is received.
pub async fn run(port: u16, dir: &Path) -> Result<i32> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .await
        .with_context(|| format!("activation daemon could not bind port {port}"))?;
    let pid_file = write_pid_file(dir)?;
    info!(port, dir = %dir.display(), "activation daemon started");

    tokio::select! {
        _ = accept_loop(listener) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&pid_file) {
        debug!(error = %e, "pid file already gone");
    }
    info!(port, "activation daemon stopped");
    Ok(0)
}

fn write_pid_file(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(PID_FILE);
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

async fn accept_loop(listener: TcpListener) {
    loop {
        match listener.accept().await {
            // A probe only needs the connection to succeed
            Ok((_stream, peer)) => debug!(%peer, "liveness probe"),
            Err(e) => warn!(error = %e, "activation daemon accept failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_written_into_new_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("group");
        let path = write_pid_file(&dir).unwrap();
        assert_eq!(path, dir.join(PID_FILE));
        let pid: u32 = std::fs::read_to_string(&path).unwrap().parse().unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[tokio::test]
    async fn test_accept_loop_answers_probes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_loop(listener));
        for _ in 0..3 {
            tokio::net::TcpStream::connect(addr).await.unwrap();
        }
        server.abort();
    }
}
