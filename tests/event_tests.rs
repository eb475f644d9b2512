extern crate multicl;

use multicl::mock::{MockBackend, MockDevice, MockPlatform};
use multicl::{DeviceTypeFilter, EventGroup, ExecutionStatus, ProxyError, Session};
use std::time::Duration;

fn user_event(session: &Session<MockBackend>) -> EventGroup {
    let devices = session.discover(DeviceTypeFilter::All).unwrap();
    let contexts = session.create_contexts(&devices, false).unwrap();
    session.create_user_event(&contexts)
}

fn session() -> Session<MockBackend> {
    Session::new(
        MockBackend::new().with_platform(
            MockPlatform::new("Mock")
                .with_device(MockDevice::cpu("c"))
                .with_device(MockDevice::gpu("g")),
        ),
    )
}

#[tokio::test]
async fn wait_resolves_once_every_device_completed() {
    let session = session();
    let event = user_event(&session);
    assert_eq!(event.len(), 2);

    let waiting = event.wait();
    let completer = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.set_status(ExecutionStatus::Running).unwrap();
        event.set_status(ExecutionStatus::Complete).unwrap();
    };
    let (result, ()) = tokio::join!(waiting, completer);
    result.unwrap();
    assert!(event.replicas().iter().all(|replica| replica.native().is_complete()));
}

#[tokio::test]
async fn wait_reports_failed_devices() {
    let session = session();
    let event = user_event(&session);
    let replicas: Vec<_> = event.replicas().iter().map(|r| r.native().clone()).collect();

    let handle = tokio::spawn(async move {
        replicas[0].set_status(ExecutionStatus::Complete).unwrap();
        replicas[1].set_status(ExecutionStatus::Failed(-5)).unwrap();
    });
    handle.await.unwrap();

    match event.wait().await {
        Err(ProxyError::EventFailed { device, code }) => {
            assert_eq!(device.index(), 1);
            assert_eq!(code, -5);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn completed_events_resolve_immediately() {
    let session = session();
    let event = user_event(&session);
    event.set_status(ExecutionStatus::Complete).unwrap();
    tokio::time::timeout(Duration::from_secs(1), event.wait())
        .await
        .unwrap()
        .unwrap();
}
