//! Joining, leaving and watchdog reaping.

use std::time::Duration;

use tokio::time::Instant;
use ubus_core::config::RuntimeConfig;
use ubus_core::control::{ControlDoc, ResponseCode, TopicRequest};
use ubus_core::wire::{write_frame, Frame, FrameType};
use ubus_core::BusError;
use ubus_runtime::Runtime;

use crate::{test_runtime, wait_until, RawClient, TestMaster, KEEP_ALIVE, TICK};

#[tokio::test]
async fn duplicate_name_is_refused() {
    let master = TestMaster::start().await.unwrap();
    let first = master.join("dup").await.unwrap();

    let second = test_runtime();
    let err = second
        .init("dup", "127.0.0.1", master.port())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Conflict(ResponseCode::Duplicate)));
    assert!(!second.is_initialized());
    assert_eq!(master.registry.participant_count(), 1);
    assert_eq!(
        master.registry.participant("dup").unwrap().listening_port,
        first.listen_addr().unwrap().port()
    );

    first.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn version_mismatch_is_refused_and_retry_is_allowed() {
    let master = TestMaster::start().await.unwrap();
    let mut raw = RawClient::connect(master.addr).await.unwrap();

    assert_eq!(
        raw.join("old", "0.9").await.unwrap(),
        ResponseCode::VersionMismatch
    );
    assert!(master.registry.participant("old").is_none());

    // The connection is still awaiting initiation.
    assert_eq!(raw.join_current("old").await.unwrap(), ResponseCode::Ok);
    assert!(master.registry.participant("old").is_some());

    master.stop().await.unwrap();
}

#[tokio::test]
async fn requests_before_joining_are_invalid() {
    let master = TestMaster::start().await.unwrap();
    let mut raw = RawClient::connect(master.addr).await.unwrap();

    let req = TopicRequest {
        topic: "t1".into(),
        type_id: 11,
    };
    // The handshake answers anything but INITIATION in its own frame type.
    let reply = raw
        .request(FrameType::EventRegister, &ControlDoc::encode(&req).unwrap())
        .await
        .unwrap();
    assert_eq!(reply.response_code().unwrap(), ResponseCode::Invalid);
    assert!(master.registry.event("t1").is_none());

    assert_eq!(raw.join_current("late").await.unwrap(), ResponseCode::Ok);
    master.stop().await.unwrap();
}

#[tokio::test]
async fn silent_participant_is_reaped_by_the_watchdog() {
    let master = TestMaster::start().await.unwrap();
    let mut raw = RawClient::connect(master.addr).await.unwrap();

    // The watchdog ticks on its own schedule, so a silent participant goes
    // on the third tick after joining: more than two periods, at most three.
    let sent = Instant::now();
    assert_eq!(raw.join_current("silent").await.unwrap(), ResponseCode::Ok);
    let joined = Instant::now();

    // Give the control loop a tick to take the connection over, then
    // register a topic so the cascade is visible too.
    tokio::time::sleep(TICK * 3).await;
    let req = TopicRequest {
        topic: "orphan".into(),
        type_id: 11,
    };
    let reply = raw
        .request(FrameType::EventRegister, &ControlDoc::encode(&req).unwrap())
        .await
        .unwrap();
    assert_eq!(reply.response_code().unwrap(), ResponseCode::Ok);

    tokio::time::sleep_until(sent + KEEP_ALIVE * 2 - TICK).await;
    assert!(
        master.registry.participant("silent").is_some(),
        "reaped before two keep-alive periods"
    );

    let registry = master.registry.clone();
    let deadline = joined + KEEP_ALIVE * 3 + TICK * 3;
    let reaped = wait_until(deadline.saturating_duration_since(Instant::now()), || {
        registry.participant("silent").is_none()
    })
    .await;
    assert!(reaped, "silent participant outlived three keep-alive periods");
    assert!(master.registry.event("orphan").is_none());

    drop(raw);
    master.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_that_stops_reading_does_not_stall_the_others() {
    let master = TestMaster::start().await.unwrap();
    let good = master.join("good").await.unwrap();

    let mut hog = RawClient::connect(master.addr).await.unwrap();
    assert_eq!(hog.join_current("hog").await.unwrap(), ResponseCode::Ok);

    // Pipeline listing requests with keep-alives and never read a reply.
    let flood = tokio::spawn(async move {
        let mut doc = ControlDoc::new();
        doc.set_str("debug_type", "list_participant");
        let listing = Frame::control(FrameType::Debug, &doc);
        let keep_alive = Frame::empty(FrameType::KeepAlive);
        for _ in 0..100_000 {
            if write_frame(&mut hog.stream, &listing).await.is_err()
                || write_frame(&mut hog.stream, &keep_alive).await.is_err()
            {
                break;
            }
        }
        hog
    });

    tokio::time::sleep(KEEP_ALIVE * 5).await;
    assert!(master.registry.participant("good").is_some());
    assert!(good.is_initialized());
    let names: Vec<_> = good
        .list_participants()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert!(names.contains(&"good".to_string()));

    let registry = master.registry.clone();
    assert!(
        wait_until(KEEP_ALIVE * 5, || registry.participant("hog").is_none()).await,
        "a peer that never reads should be dropped"
    );

    good.shutdown().await;
    drop(flood.await.unwrap());
    master.stop().await.unwrap();
}

#[tokio::test]
async fn reaped_runtime_notices_and_can_join_again() {
    let master = TestMaster::start().await.unwrap();
    let rt = Runtime::new(RuntimeConfig {
        keep_alive_interval_ms: 60_000,
        ..test_runtime().config().clone()
    });
    rt.init("sleepy", "127.0.0.1", master.port()).await.unwrap();
    rt.advertise_event::<crate::TestMessage1>("t1").await.unwrap();

    let registry = master.registry.clone();
    assert!(wait_until(KEEP_ALIVE * 5, || registry.participant("sleepy").is_none()).await);
    assert!(
        wait_until(Duration::from_secs(1), || !rt.is_initialized()).await,
        "runtime still thinks it is joined after being reaped"
    );
    assert!(matches!(
        rt.advertise_event::<crate::TestMessage1>("t2").await,
        Err(BusError::NotInitialized)
    ));

    rt.init("sleepy", "127.0.0.1", master.port()).await.unwrap();
    rt.advertise_event::<crate::TestMessage1>("t1").await.unwrap();
    assert_eq!(master.registry.event("t1").unwrap().publisher.name, "sleepy");

    rt.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn keep_alives_hold_the_watchdog_off() {
    let master = TestMaster::start().await.unwrap();
    let mut raw = RawClient::connect(master.addr).await.unwrap();
    assert_eq!(raw.join_current("chatty").await.unwrap(), ResponseCode::Ok);

    for _ in 0..12 {
        tokio::time::sleep(KEEP_ALIVE / 2).await;
        write_frame(&mut raw.stream, &Frame::empty(FrameType::KeepAlive))
            .await
            .unwrap();
    }
    assert!(master.registry.participant("chatty").is_some());

    let rt = master.join("runtime").await.unwrap();
    tokio::time::sleep(KEEP_ALIVE * 5).await;
    assert!(master.registry.participant("runtime").is_some());

    rt.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn closed_connection_is_reaped_without_waiting_for_the_watchdog() {
    let master = TestMaster::start().await.unwrap();
    let mut raw = RawClient::connect(master.addr).await.unwrap();
    assert_eq!(raw.join_current("brief").await.unwrap(), ResponseCode::Ok);
    drop(raw);

    let registry = master.registry.clone();
    assert!(wait_until(KEEP_ALIVE, || registry.participant("brief").is_none()).await);

    master.stop().await.unwrap();
}

#[tokio::test]
async fn name_is_reusable_after_leaving() {
    let master = TestMaster::start().await.unwrap();
    let first = master.join("node").await.unwrap();
    first.advertise_event::<crate::TestMessage1>("t1").await.unwrap();
    first.shutdown().await;
    assert!(!first.is_initialized());

    let registry = master.registry.clone();
    assert!(wait_until(Duration::from_secs(1), || registry.participant("node").is_none()).await);
    assert!(master.registry.event("t1").is_none());

    let second = master.join("node").await.unwrap();
    second.advertise_event::<crate::TestMessage1>("t1").await.unwrap();
    assert_eq!(master.registry.participant_count(), 1);

    second.shutdown().await;
    master.stop().await.unwrap();
}
