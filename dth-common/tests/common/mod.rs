//! Shared fixtures for integration tests.

#![allow(dead_code)]

use dth_common::config::parse_properties;
use dth_common::pipe::OutputSink;
use dth_common::testing::{RecordingPlatform, init_test_logging};
use dth_common::{AdminManager, DeletionList, HarnessSettings, HostRole, ProcessOrchestrator, QaConfig, RuntimeContext};
use std::sync::Arc;

#[ctor::ctor]
fn setup() {
    init_test_logging();
}

/// Service definitions plus settings that keep admins away from real daemons.
pub const SERVICES: &str = "dth.activation.type=external\n\
                            dth.activation.stopDelay=0\n\
                            dth.activation.attempts=0\n\
                            dth.serviceUnregisterWait=0\n\
                            dth.slaveConnectAttempts=1\n\
                            reggie.type=activatable\n\
                            reggie.impl=Registrar\n\
                            mahalo.type=nonactivatable\n\
                            mahalo.impl=TxnManager\n";

pub struct Host {
    pub manager: AdminManager,
    pub platform: Arc<RecordingPlatform>,
    pub dir: tempfile::TempDir,
}

/// An admin manager on a recording platform, in `role`, with `extra`
/// properties appended to [`SERVICES`].
pub fn host(role: HostRole, extra: &str) -> Host {
    let dir = tempfile::tempdir().unwrap();
    let config = QaConfig::builder()
        .defaults(parse_properties(&format!(
            "{SERVICES}sharedGroup.persistenceRoot={}\n{extra}",
            dir.path().display()
        )))
        .role(role)
        .build()
        .unwrap();
    let platform = Arc::new(RecordingPlatform::new());
    platform.set_daemon_alive(true);
    let runtime = RuntimeContext::new(
        platform.clone(),
        ProcessOrchestrator::new(OutputSink::buffer().0, OutputSink::buffer().0),
        HarnessSettings::default(),
        Arc::new(DeletionList::at(dir.path().join("delete-list.txt"))),
    );
    Host {
        manager: AdminManager::new(config, runtime),
        platform,
        dir,
    }
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
