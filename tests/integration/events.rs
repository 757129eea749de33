//! Publish/subscribe scenarios between runtimes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ubus_core::control::ResponseCode;
use ubus_core::message::{Int32Msg, StringMsg};
use ubus_core::BusError;
use ubus_runtime::Runtime;

use crate::{wait_until, TestMaster, TestMessage1, KEEP_ALIVE};

type Inbox = Arc<Mutex<Vec<String>>>;

async fn collect(rt: &Runtime, topic: &str) -> Result<Inbox, BusError> {
    let inbox: Inbox = Arc::default();
    let sink = inbox.clone();
    rt.subscribe_event::<TestMessage1, _>(topic, move |msg| {
        sink.lock().unwrap().push(msg.0);
    })
    .await?;
    Ok(inbox)
}

fn received(inbox: &Inbox) -> Vec<String> {
    inbox.lock().unwrap().clone()
}

/// Subscribers of `topic` as the master lists them.
fn listed_subscribers(master: &TestMaster, topic: &str) -> Vec<String> {
    master
        .registry
        .event(topic)
        .map(|e| e.subscribers.iter().map(|p| p.name.clone()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn publish_without_subscribers_reaches_nobody() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();

    a.advertise_event::<TestMessage1>("t1").await.unwrap();
    let reached = a
        .publish_event("t1", &TestMessage1("hello".into()))
        .await
        .unwrap();
    assert_eq!(reached, 0);
    assert_eq!(a.subscriber_count("t1"), Some(0));

    a.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn hello_is_delivered_exactly_once() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let b = master.join("b").await.unwrap();

    a.advertise_event::<TestMessage1>("t1").await.unwrap();
    let inbox = collect(&b, "t1").await.unwrap();
    assert_eq!(a.subscriber_count("t1"), Some(1));

    let reached = a
        .publish_event("t1", &TestMessage1("hello".into()))
        .await
        .unwrap();
    assert_eq!(reached, 1);

    assert!(wait_until(Duration::from_secs(2), || !received(&inbox).is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received(&inbox), vec!["hello".to_string()]);

    a.shutdown().await;
    b.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn events_arrive_in_publish_order() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let b = master.join("b").await.unwrap();

    a.advertise_event::<TestMessage1>("seq").await.unwrap();
    let inbox = collect(&b, "seq").await.unwrap();

    let sent: Vec<String> = (0..50).map(|i| format!("msg-{i}")).collect();
    for text in &sent {
        a.publish_event("seq", &TestMessage1(text.clone()))
            .await
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(3), || received(&inbox).len() == sent.len()).await);
    assert_eq!(received(&inbox), sent);

    a.shutdown().await;
    b.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn every_subscriber_gets_a_copy() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let b = master.join("b").await.unwrap();
    let c = master.join("c").await.unwrap();

    a.advertise_event::<TestMessage1>("fan").await.unwrap();
    let inbox_b = collect(&b, "fan").await.unwrap();
    let inbox_c = collect(&c, "fan").await.unwrap();

    let reached = a
        .publish_event("fan", &TestMessage1("both".into()))
        .await
        .unwrap();
    assert_eq!(reached, 2);
    assert!(
        wait_until(Duration::from_secs(2), || {
            received(&inbox_b).len() == 1 && received(&inbox_c).len() == 1
        })
        .await
    );

    let event = master.registry.event("fan").unwrap();
    let mut subscribers: Vec<_> = event.subscribers.iter().map(|p| p.name.clone()).collect();
    subscribers.sort();
    assert_eq!(subscribers, vec!["b", "c"]);

    for rt in [a, b, c] {
        rt.shutdown().await;
    }
    master.stop().await.unwrap();
}

#[tokio::test]
async fn unregistered_topic_is_not_published() {
    let master = TestMaster::start().await.unwrap();
    let b = master.join("b").await.unwrap();

    let err = collect(&b, "nowhere").await.unwrap_err();
    assert!(matches!(err, BusError::NotFound(ref t) if t == "nowhere"));
    assert_eq!(err.response_code(), Some(ResponseCode::NotPublished));
    assert!(!b.is_subscribed("nowhere"));

    b.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn second_subscription_by_same_name_is_duplicate() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let b = master.join("b").await.unwrap();

    a.advertise_event::<TestMessage1>("t1").await.unwrap();
    let inbox = collect(&b, "t1").await.unwrap();

    let err = collect(&b, "t1").await.unwrap_err();
    assert!(matches!(err, BusError::Conflict(ResponseCode::Duplicate)));

    // The first subscription is untouched.
    assert_eq!(a.subscriber_count("t1"), Some(1));
    assert_eq!(listed_subscribers(&master, "t1"), vec!["b"]);
    a.publish_event("t1", &TestMessage1("still here".into()))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || received(&inbox).len() == 1).await);

    a.shutdown().await;
    b.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn publisher_rejects_mismatched_type() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let b = master.join("b").await.unwrap();

    a.advertise_event::<TestMessage1>("t1").await.unwrap();
    let err = b
        .subscribe_event::<Int32Msg, _>("t1", |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Rejected(ResponseCode::Invalid)));
    assert!(!b.is_subscribed("t1"));
    assert_eq!(a.subscriber_count("t1"), Some(0));
    // The master forgets the refused subscription too.
    assert!(listed_subscribers(&master, "t1").is_empty());
    assert!(b.list_events().await.unwrap()[0].subscribers.is_empty());

    // A matching subscription still goes through afterwards.
    collect(&b, "t1").await.unwrap();
    assert_eq!(b.subscribed_type("t1"), Some(11));
    assert_eq!(a.subscriber_count("t1"), Some(1));
    assert_eq!(listed_subscribers(&master, "t1"), vec!["b"]);

    a.shutdown().await;
    b.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_frees_the_name_for_a_new_subscription() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let b = master.join("b").await.unwrap();

    a.advertise_event::<TestMessage1>("t1").await.unwrap();
    let first = collect(&b, "t1").await.unwrap();

    assert_eq!(listed_subscribers(&master, "t1"), vec!["b"]);

    assert!(b.unsubscribe_event("t1").await.unwrap());
    assert!(listed_subscribers(&master, "t1").is_empty());
    assert!(!b.unsubscribe_event("t1").await.unwrap());
    assert!(wait_until(Duration::from_secs(2), || a.subscriber_count("t1") == Some(0)).await);

    let second = collect(&b, "t1").await.unwrap();
    a.publish_event("t1", &TestMessage1("again".into()))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || received(&second).len() == 1).await);
    assert!(received(&first).is_empty());
    assert_eq!(listed_subscribers(&master, "t1"), vec!["b"]);

    a.shutdown().await;
    b.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn departed_subscriber_is_dropped_by_publisher() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let b = master.join("b").await.unwrap();

    a.advertise_event::<StringMsg>("t1").await.unwrap();
    b.subscribe_event::<StringMsg, _>("t1", |_| {}).await.unwrap();
    assert_eq!(a.subscriber_count("t1"), Some(1));

    b.shutdown().await;
    assert!(wait_until(Duration::from_secs(2), || a.subscriber_count("t1") == Some(0)).await);
    assert_eq!(a.publish_event("t1", &StringMsg::from("x")).await.unwrap(), 0);

    a.shutdown().await;
    master.stop().await.unwrap();
}

#[tokio::test]
async fn topics_of_a_departed_publisher_become_unresolvable() {
    let master = TestMaster::start().await.unwrap();
    let a = master.join("a").await.unwrap();
    let c = master.join("c").await.unwrap();

    a.advertise_event::<TestMessage1>("t1").await.unwrap();
    a.shutdown().await;

    let registry = master.registry.clone();
    assert!(wait_until(KEEP_ALIVE, || registry.event("t1").is_none()).await);
    let err = collect(&c, "t1").await.unwrap_err();
    assert_eq!(err.response_code(), Some(ResponseCode::NotPublished));

    // The topic is free for someone else to publish.
    c.advertise_event::<TestMessage1>("t1").await.unwrap();
    assert_eq!(master.registry.event("t1").unwrap().publisher.name, "c");

    c.shutdown().await;
    master.stop().await.unwrap();
}
