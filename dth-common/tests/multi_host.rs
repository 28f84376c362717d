//! A master test VM driving services on a slave test VM over the request
//! protocol.

mod common;

use common::{closed_port, host};
use dth_common::protocol::slave::{AdminQuery, SlaveRequest};
use dth_common::protocol::{RequestListener, request_slave};
use dth_common::{AdminManager, FailureType, HostRole, TestDescription, TestRegistry, TestRun, TestRunDriver};
use std::sync::{Arc, Mutex};

fn serve(manager: AdminManager) -> (RequestListener, Arc<Mutex<AdminManager>>) {
    let manager = Arc::new(Mutex::new(manager));
    let handler = Arc::clone(&manager);
    let listener = RequestListener::bind("slave-request", "127.0.0.1:0".parse().unwrap(), move |req: SlaveRequest| {
        Some(handler.lock().unwrap().handle_slave_request(req))
    })
    .unwrap();
    (listener, manager)
}

fn starter_run() -> TestRun {
    let props = [("testClass".to_string(), "dth.ServiceStarter".to_string())]
        .into_iter()
        .collect();
    TestRun::new(TestDescription::new("multi/Starter.td", props), "default")
}

#[test]
fn test_services_on_slave_are_torn_down_with_the_test() {
    let slave = host(HostRole::Slave, "");
    let slave_platform = Arc::clone(&slave.platform);
    let (listener, slave_manager) = serve(slave.manager);
    let port = listener.local_addr().port();

    let mut master = host(
        HostRole::Master,
        &format!("dth.hosts=localhost, 127.0.0.1:{port}\ntestServices=reggie@1, mahalo@1, reggie\n"),
    );
    let driver = TestRunDriver::new(TestRegistry::with_builtins());
    let result = driver.execute(&mut master.manager, &starter_run());

    assert!(result.passed, "{:?}", result.message);
    let calls = slave_platform.calls();
    assert!(calls.contains(&"create_activatable".to_string()));
    assert!(calls.contains(&"start_service_in_group".to_string()));
    assert_eq!(slave_platform.inner().service_count(), 0);
    assert_eq!(slave_platform.inner().group_count(), 0);
    assert!(slave_manager.lock().unwrap().running_admins().is_empty());
    assert_eq!(master.platform.inner().service_count(), 0);

    listener.shutdown();
}

#[test]
fn test_unreachable_slave_fails_construction_as_environment() {
    let mut master = host(
        HostRole::Master,
        &format!("dth.hosts=localhost, 127.0.0.1:{}\ntestServices=reggie, reggie@1\n", closed_port()),
    );
    let driver = TestRunDriver::new(TestRegistry::with_builtins());
    let result = driver.execute(&mut master.manager, &starter_run());

    assert!(!result.passed);
    assert_eq!(result.failure_type, FailureType::Env);
    // The local service started before the failure is still cleaned up
    assert_eq!(master.platform.inner().service_count(), 0);
    assert!(master.manager.running_admins().is_empty());
}

#[test]
fn test_slave_answers_queries_for_its_own_services() {
    let slave = host(HostRole::Slave, "");
    let (listener, _slave_manager) = serve(slave.manager);
    let endpoint = listener.local_addr().to_string();
    let policy = dth_common::protocol::ConnectPolicy::once();

    let info: dth_common::ServiceInfo = dth_common::protocol::request(
        &endpoint,
        &SlaveRequest::StartService { prefix: "reggie".into() },
        &policy,
    )
    .unwrap();
    let proxy: serde_json::Value = dth_common::protocol::request(
        &endpoint,
        &SlaveRequest::Query(AdminQuery::Proxy { service: info.service.clone() }),
        &policy,
    )
    .unwrap();
    assert_eq!(proxy["attributes"]["implementation"], "Registrar");

    let running: serde_json::Value =
        dth_common::protocol::request(&endpoint, &SlaveRequest::Query(AdminQuery::RunningAdmins), &policy).unwrap();
    assert_eq!(running.as_array().map(Vec::len), Some(1));

    let err = dth_common::protocol::request::<_, serde_json::Value>(
        &endpoint,
        &SlaveRequest::StartService { prefix: "missing".into() },
        &policy,
    )
    .unwrap_err();
    assert!(err.to_string().contains("missing"));
    listener.shutdown();
}

#[test]
fn test_request_slave_addresses_slaves_by_host_index() {
    let slave = host(HostRole::Slave, "");
    let (listener, _slave_manager) = serve(slave.manager);
    let port = listener.local_addr().port();
    let master = host(HostRole::Master, &format!("dth.hosts=localhost, 127.0.0.1:{port}\n"));
    let config = master.manager.config();

    let running: Vec<serde_json::Value> =
        request_slave(config, 1, &SlaveRequest::Query(AdminQuery::RunningAdmins)).unwrap();
    assert!(running.is_empty());

    let err = request_slave::<serde_json::Value>(config, 2, &SlaveRequest::Ping).unwrap_err();
    assert!(err.message().contains("no slave at host index 2"));
    listener.shutdown();
}
