//! Broadcasts reach every reachable slave and never fail as a whole.

mod common;

use common::{closed_port, host};
use dth_common::protocol::slave::SlaveRequest;
use dth_common::protocol::{Reply, RequestListener, broadcast};
use dth_common::{AdminManager, HostRole};
use std::sync::{Arc, Mutex};

fn recording_listener() -> (RequestListener, Arc<Mutex<Vec<SlaveRequest>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let listener = RequestListener::bind("recording", "127.0.0.1:0".parse().unwrap(), move |req: SlaveRequest| {
        log.lock().unwrap().push(req);
        Some(Reply::unit())
    })
    .unwrap();
    (listener, seen)
}

#[test]
fn test_broadcast_skips_dead_slave_and_reaches_the_rest() {
    let (first, first_seen) = recording_listener();
    let (last, last_seen) = recording_listener();
    let dead = format!("127.0.0.1:{}", closed_port());
    let endpoints = vec![first.local_addr().to_string(), dead.clone(), last.local_addr().to_string()];

    let report = broadcast(&endpoints, &SlaveRequest::Ping);

    assert_eq!(report.attempted, 3);
    assert_eq!(report.failed, vec![dead]);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(first_seen.lock().unwrap().as_slice(), [SlaveRequest::Ping]);
    assert_eq!(last_seen.lock().unwrap().as_slice(), [SlaveRequest::Ping]);
    first.shutdown();
    last.shutdown();
}

#[test]
fn test_rejection_counts_as_failure() {
    let listener = RequestListener::bind("rejecting", "127.0.0.1:0".parse().unwrap(), |_req: SlaveRequest| {
        Some(Reply::Err("busy".into()))
    })
    .unwrap();
    let endpoint = listener.local_addr().to_string();
    let report = broadcast(std::slice::from_ref(&endpoint), &SlaveRequest::Teardown);
    assert_eq!(report.failed, vec![endpoint]);
    listener.shutdown();
}

#[test]
fn test_dynamic_parameter_reaches_live_slaves_only() {
    let slave = host(HostRole::Slave, "");
    let slave_manager: Arc<Mutex<AdminManager>> = Arc::new(Mutex::new(slave.manager));
    let handler = Arc::clone(&slave_manager);
    let listener = RequestListener::bind("slave-request", "127.0.0.1:0".parse().unwrap(), move |req: SlaveRequest| {
        Some(handler.lock().unwrap().handle_slave_request(req))
    })
    .unwrap();

    let mut master = host(
        HostRole::Master,
        &format!(
            "dth.hosts=localhost, 127.0.0.1:{}, 127.0.0.1:{}\n",
            closed_port(),
            listener.local_addr().port()
        ),
    );
    master
        .manager
        .config_mut()
        .set_dynamic_parameter("lookup.groups", "qa-group")
        .unwrap();

    assert_eq!(
        master.manager.config().get_string("lookup.groups", "").unwrap(),
        "qa-group"
    );
    assert_eq!(
        slave_manager.lock().unwrap().config().get_string("lookup.groups", "").unwrap(),
        "qa-group"
    );
    listener.shutdown();
}
