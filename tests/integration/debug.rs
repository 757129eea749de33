//! DEBUG listings as a tool sees them.

use ubus_core::control::{ControlDoc, DebugKind, EventListing, MethodListing, ResponseCode};
use ubus_core::wire::FrameType;

use crate::{RawClient, TestMaster, TestMessage1};

#[tokio::test]
async fn listings_reflect_the_registry() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let b = master.join("b").await.unwrap();

    a.advertise_event::<TestMessage1>("t1").await.unwrap();
    b.subscribe_event::<TestMessage1, _>("t1", |_| {}).await.unwrap();
    a.provide_method::<TestMessage1, TestMessage1, _>("echo", |req| req)
        .await
        .unwrap();

    let events = b.list_events().await.unwrap();
    assert_eq!(
        events,
        vec![EventListing {
            name: "t1".into(),
            type_id: 11,
            publisher: "a".into(),
            subscribers: vec!["b".into()],
        }]
    );

    let methods = b.list_methods().await.unwrap();
    assert_eq!(
        methods,
        vec![MethodListing {
            name: "echo".into(),
            request_type: 11,
            response_type: 11,
            provider: "a".into(),
        }]
    );

    let participants = a.list_participants().await.unwrap();
    let names: Vec<_> = participants.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    let listed_a = &participants[0];
    let listen = a.listen_addr().unwrap();
    assert_eq!(listed_a.listening_ip, listen.ip().to_string());
    assert_eq!(listed_a.listening_port, listen.port());
    assert_eq!(listed_a.ip, "127.0.0.1");

    a.shutdown().await;
    b.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn raw_listing_uses_wire_field_names() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    a.advertise_event::<TestMessage1>("t1").await.unwrap();

    let rows = a.debug_query(DebugKind::ListEvent).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "t1");
    assert_eq!(rows[0]["type"], 11);
    assert_eq!(rows[0]["publisher"], "a");

    a.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_debug_type_is_invalid() {
    let master = TestMaster::start().await.unwrap();
    let mut raw = RawClient::connect(master.addr).await.unwrap();
    assert_eq!(raw.join_current("tool").await.unwrap(), ResponseCode::Ok);

    let mut doc = ControlDoc::new();
    doc.set_str("debug_type", "list_everything");
    let reply = raw.request(FrameType::Debug, &doc).await.unwrap();
    assert_eq!(reply.response_code().unwrap(), ResponseCode::Invalid);

    let mut doc = ControlDoc::new();
    doc.set_str("debug_type", "list_participant");
    let reply = raw.request(FrameType::Debug, &doc).await.unwrap();
    assert_eq!(reply.response_code().unwrap(), ResponseCode::Ok);
    assert_eq!(reply.get_array("response_data").unwrap().len(), 1);

    master.stop().await.unwrap();
}
