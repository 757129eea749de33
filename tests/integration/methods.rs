//! Method provide/query/call scenarios.

use std::time::Duration;

use ubus_core::control::ResponseCode;
use ubus_core::message::{Int32Msg, Int64Msg, MessageError, StringMsg};
use ubus_core::BusError;

use crate::{wait_until, TestMaster, TestMessage1};

#[tokio::test]
async fn echo_returns_the_request() {
    let master = TestMaster::start().await.unwrap();
    let p = master.join("p").await.unwrap();
    let c = master.join("c").await.unwrap();

    p.provide_method::<TestMessage1, TestMessage1, _>("echo", |req| req)
        .await
        .unwrap();
    let reply: TestMessage1 = c
        .call_method("echo", &TestMessage1("ping".into()))
        .await
        .unwrap();
    assert_eq!(reply, TestMessage1("ping".into()));

    p.shutdown().await;
    c.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn request_and_response_types_may_differ() {
    let master = TestMaster::start().await.unwrap();
    let p = master.join("p").await.unwrap();
    let c = master.join("c").await.unwrap();

    p.provide_method::<Int32Msg, Int64Msg, _>("widen", |req| Int64Msg(i64::from(req.0) * 1_000_000))
        .await
        .unwrap();
    let reply: Int64Msg = c.call_method("widen", &Int32Msg(4096)).await.unwrap();
    assert_eq!(reply, Int64Msg(4_096_000_000));

    // The same call with explicit type ids and raw payloads.
    let raw = c.call_method_raw("widen", 2, 3, b"-7").await.unwrap();
    assert_eq!(raw, b"-7000000");

    p.shutdown().await;
    c.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn a_participant_may_call_its_own_method() {
    let master = TestMaster::start().await.unwrap();
    let p = master.join("p").await.unwrap();

    p.provide_method::<StringMsg, StringMsg, _>("upper", |req| StringMsg(req.0.to_uppercase()))
        .await
        .unwrap();
    let reply: StringMsg = p.call_method("upper", &StringMsg::from("abc")).await.unwrap();
    assert_eq!(reply.0, "ABC");

    p.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_method_is_not_published() {
    let master = TestMaster::start().await.unwrap();
    let c = master.join("c").await.unwrap();

    let err = c
        .call_method::<TestMessage1, TestMessage1>("missing", &TestMessage1("x".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NotFound(ref m) if m == "missing"));

    c.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn second_provider_is_duplicate() {
    let master = TestMaster::start().await.unwrap();
    let p = master.join("p").await.unwrap();
    let q = master.join("q").await.unwrap();

    p.provide_method::<TestMessage1, TestMessage1, _>("echo", |req| req)
        .await
        .unwrap();
    let err = q
        .provide_method::<TestMessage1, TestMessage1, _>("echo", |req| req)
        .await
        .unwrap_err();
    assert_eq!(err.response_code(), Some(ResponseCode::Duplicate));
    assert_eq!(master.registry.method("echo").unwrap().provider.name, "p");

    p.shutdown().await;
    q.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn provider_rejects_mismatched_types() {
    let master = TestMaster::start().await.unwrap();
    let p = master.join("p").await.unwrap();
    let c = master.join("c").await.unwrap();

    p.provide_method::<TestMessage1, TestMessage1, _>("echo", |req| req)
        .await
        .unwrap();
    let err = c
        .call_method::<StringMsg, TestMessage1>("echo", &StringMsg::from("ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Rejected(ResponseCode::Invalid)));

    p.shutdown().await;
    c.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn handler_decode_failure_answers_invalid() {
    let master = TestMaster::start().await.unwrap();
    let p = master.join("p").await.unwrap();
    let c = master.join("c").await.unwrap();

    p.provide_method::<Int32Msg, Int32Msg, _>("double", |req| Int32Msg(req.0 * 2))
        .await
        .unwrap();
    let err = c
        .call_method_raw("double", 2, 2, b"not a number")
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Rejected(ResponseCode::Invalid)));

    // The provider keeps serving after a bad request.
    let reply: Int32Msg = c.call_method("double", &Int32Msg(21)).await.unwrap();
    assert_eq!(reply, Int32Msg(42));

    p.shutdown().await;
    c.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn non_text_request_is_refused_locally() {
    let master = TestMaster::start().await.unwrap();
    let c = master.join("c").await.unwrap();

    let err = c
        .call_method_raw("anything", 6, 6, &[0xff, 0xfe])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Codec(MessageError::InvalidUtf8)));

    c.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn methods_of_a_departed_provider_become_unresolvable() {
    let master = TestMaster::start().await.unwrap();
    let p = master.join("p").await.unwrap();
    let c = master.join("c").await.unwrap();

    p.provide_method::<TestMessage1, TestMessage1, _>("echo", |req| req)
        .await
        .unwrap();
    p.shutdown().await;

    let registry = master.registry.clone();
    assert!(wait_until(Duration::from_secs(1), || registry.method("echo").is_none()).await);
    let err = c
        .call_method::<TestMessage1, TestMessage1>("echo", &TestMessage1("ping".into()))
        .await
        .unwrap_err();
    assert_eq!(err.response_code(), Some(ResponseCode::NotPublished));

    c.shutdown().await;
    master.stop().await.unwrap();
}
