//! The test VM proper: bootstrap, then drive a test or serve a master.

use anyhow::{Context, Result};
use dth_common::config::store::SLAVE_REQUEST_PORT_KEY;
use dth_common::driver::write_status_line;
use dth_common::protocol::autot::{AutotListener, autot_port};
use dth_common::protocol::slave::SlaveRequest;
use dth_common::protocol::RequestListener;
use dth_common::types::SLAVE_REQUEST_PORT;
use dth_common::{
    AdminManager, DeletionList, HarnessSettings, LocalPlatform, ProcessOrchestrator, QaConfig,
    RuntimeContext, TestRegistry, TestRun, TestRunDriver, VmBootstrap,
};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, mpsc};
use tracing::{info, warn};

/// Read the bootstrap from stdin and run in the role it describes.
pub fn run_from_stdin() -> Result<i32> {
    let bootstrap = VmBootstrap::read_from(io::stdin().lock())?;
    let run = bootstrap.run;
    let mut config = QaConfig::from_snapshot(bootstrap.snapshot)?;
    config.set_test_description(run.description.clone());
    config.set_config_tag(Some(run.config_tag.clone()));

    let (settings, errors) = HarnessSettings::from_env();
    for error in &errors {
        warn!(%error, "ignoring invalid harness setting");
    }
    let runtime = RuntimeContext::new(
        Arc::new(LocalPlatform::default()),
        ProcessOrchestrator::default(),
        settings,
        Arc::new(DeletionList::default()),
    );
    let manager = AdminManager::new(config, runtime);

    info!(test = run.name(), tag = %run.config_tag, role = ?manager.config().role(), "test VM started");
    if manager.config().is_master() {
        drive_test(manager, &run)
    } else {
        serve_master(manager)
    }
}

fn drive_test(mut manager: AdminManager, run: &TestRun) -> Result<i32> {
    let driver = TestRunDriver::new(TestRegistry::with_builtins());

    let autot = match autot_port(manager.config()) {
        Ok(port) => AutotListener::start(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            run.name(),
            driver.gate(),
        )
        .map_err(|e| warn!(port, error = %e, "autot channel unavailable"))
        .ok(),
        Err(e) => {
            warn!(error = %e, "autot port misconfigured");
            None
        }
    };

    let result = driver.execute(&mut manager, run);

    if let Some(autot) = autot {
        autot.shutdown();
    }
    write_status_line(&result, &mut io::stderr().lock()).context("failed to report test status")?;
    Ok(result.exit_code())
}

/// Serve slave requests until the master sends `Teardown`.
fn serve_master(manager: AdminManager) -> Result<i32> {
    let port = listen_port(manager.config())?;
    let manager = Arc::new(Mutex::new(manager));
    let (done_tx, done_rx) = mpsc::channel();

    let handler_manager = Arc::clone(&manager);
    let listener = RequestListener::bind(
        "slave-request",
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        move |request: SlaveRequest| {
            let teardown = matches!(request, SlaveRequest::Teardown);
            let reply = handler_manager
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle_slave_request(request);
            if teardown {
                let _ = done_tx.send(());
            }
            Some(reply)
        },
    )
    .with_context(|| format!("failed to listen for slave requests on port {port}"))?;

    // A dropped sender means the listener thread is gone; tear down anyway
    let _ = done_rx.recv();
    listener.shutdown();

    let failures = manager.lock().unwrap_or_else(|e| e.into_inner()).teardown();
    info!(failures, "slave test VM exiting");
    Ok(0)
}

/// Port from this host's entry in the host list, else the configured default.
fn listen_port(config: &QaConfig) -> Result<u16> {
    let hosts = config.hosts()?;
    let own = hosts
        .iter()
        .skip(1)
        .find(|h| h.is_local(config.local_host()))
        .and_then(|h| h.port);
    if let Some(port) = own {
        return Ok(port);
    }
    let port = config.get_int(SLAVE_REQUEST_PORT_KEY, i32::from(SLAVE_REQUEST_PORT))?;
    Ok(u16::try_from(port).unwrap_or(SLAVE_REQUEST_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> QaConfig {
        QaConfig::builder()
            .defaults(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
            .build()
            .unwrap()
    }

    #[test]
    fn test_listen_port_from_own_host_entry() {
        let config = config(&[("dth.hosts", "master.example, localhost:12002")]);
        assert_eq!(listen_port(&config).unwrap(), 12002);
    }

    #[test]
    fn test_listen_port_falls_back_to_configured_port() {
        let config = config(&[
            ("dth.hosts", "master.example, localhost"),
            (SLAVE_REQUEST_PORT_KEY, "12102"),
        ]);
        assert_eq!(listen_port(&config).unwrap(), 12102);
        assert_eq!(listen_port(&QaConfig::default()).unwrap(), SLAVE_REQUEST_PORT);
    }
}
