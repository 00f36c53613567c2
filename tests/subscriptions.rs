use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};

use resbridge::{
    ClientEvent, ClientEventSink, Gateway, GatewayConfig, InMemoryBus, Value,
};

type EventLog = Arc<Mutex<Vec<(String, ClientEvent)>>>;

fn event_sink() -> (ClientEventSink, EventLog) {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&events);
    let sink: ClientEventSink = Arc::new(move |rid: &str, event: ClientEvent| {
        captured.lock().unwrap().push((rid.to_string(), event));
    });
    (sink, events)
}

fn gateway() -> (Gateway, InMemoryBus) {
    let bus = InMemoryBus::new();
    let gateway = Gateway::new(Arc::new(bus.clone()));
    (gateway, bus)
}

fn allow_all(bus: &InMemoryBus, name: &str) {
    bus.respond_to(format!("access.{}", name), |_| Ok(json!({"get": true})));
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_returns_snapshot_then_streams_events() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune", "pages": 412}}))
    });
    allow_all(&bus, "library.book.1");

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    let set = conn.subscribe("library.book.1").await.unwrap();

    assert_eq!(
        set.models["library.book.1"],
        json!({"pages": 412, "title": "Dune"})
    );
    assert!(events.lock().unwrap().is_empty());

    bus.publish(
        "event.library.book.1.change",
        json!({"values": {"pages": 500}}),
    );
    settle().await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "library.book.1");
    match &events[0].1 {
        ClientEvent::Change { values, resources } => {
            assert_eq!(values["pages"], Value::Primitive(json!(500)));
            assert!(resources.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn connections_share_one_backend_subscription() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    allow_all(&bus, "library.book.1");

    let (sink_a, _) = event_sink();
    let (sink_b, _) = event_sink();
    let conn_a = gateway.connection("c1", sink_a);
    let conn_b = gateway.connection("c2", sink_b);

    let (a, b) = tokio::join!(
        conn_a.subscribe("library.book.1"),
        conn_b.subscribe("library.book.1"),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(bus.requests_to("get.library.book.1").len(), 1);
    assert!(bus.is_subscribed("event.library.book.1.>"));
}

#[tokio::test(flavor = "multi_thread")]
async fn access_decisions_are_cached_per_token() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    allow_all(&bus, "library.book.1");

    let (sink_a, _) = event_sink();
    let conn_a = gateway.connection("c1", sink_a);
    conn_a.subscribe("library.book.1").await.unwrap();

    let (sink_b, _) = event_sink();
    let conn_b = gateway.connection("c2", sink_b);
    conn_b.subscribe("library.book.1").await.unwrap();

    // same (rid, token) -> the second connection hit the cached decision
    assert_eq!(bus.requests_to("access.library.book.1").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn denied_access_fails_the_subscribe() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    bus.respond_to("access.library.book.1", |_| Ok(json!({"get": false})));

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    let err = conn.subscribe("library.book.1").await.unwrap_err();
    assert_eq!(err.code_str(), "system.accessDenied");
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn references_are_expanded_into_the_snapshot() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {
            "title": "Dune",
            "author": {"rid": "library.author.1"},
        }}))
    });
    bus.respond_to("get.library.author.1", |_| {
        Ok(json!({"model": {"name": "Frank Herbert"}}))
    });
    allow_all(&bus, "library.book.1");

    let (sink, _) = event_sink();
    let conn = gateway.connection("c1", sink);
    let set = conn.subscribe("library.book.1").await.unwrap();

    assert_eq!(set.models.len(), 2);
    assert_eq!(
        set.models["library.author.1"],
        json!({"name": "Frank Herbert"})
    );
    // the child rides on the parent's access; no extra access request
    assert!(bus.requests_to("access.library.author.1").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_child_degrades_to_an_error_entry() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {
            "author": {"rid": "library.author.1"},
            "publisher": {"rid": "library.publisher.1"},
        }}))
    });
    bus.respond_to("get.library.publisher.1", |_| {
        Ok(json!({"model": {"name": "Chilton"}}))
    });
    bus.respond_to("get.library.author.1", |_| {
        Err(resbridge::error::not_found())
    });
    allow_all(&bus, "library.book.1");

    let (sink, _) = event_sink();
    let conn = gateway.connection("c1", sink);
    let set = conn.subscribe("library.book.1").await.unwrap();

    assert_eq!(set.models.len(), 2);
    assert!(set.models.contains_key("library.publisher.1"));
    assert_eq!(
        set.errors["library.author.1"].code_str(),
        "system.notFound"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_references_resolve() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.test.a", |_| {
        Ok(json!({"model": {"name": "a", "peer": {"rid": "test.b"}}}))
    });
    bus.respond_to("get.test.b", |_| {
        Ok(json!({"model": {"name": "b", "peer": {"rid": "test.a"}}}))
    });
    allow_all(&bus, "test.a");

    let (sink, _) = event_sink();
    let conn = gateway.connection("c1", sink);
    let set = conn.subscribe("test.a").await.unwrap();

    assert_eq!(set.models.len(), 2);
    assert!(set.models.contains_key("test.a"));
    assert!(set.models.contains_key("test.b"));
}

#[tokio::test(flavor = "multi_thread")]
async fn change_event_with_new_reference_embeds_the_child() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    allow_all(&bus, "library.book.1");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    bus.respond_to("get.library.author.1", move |_| {
        let _ = release_rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(2));
        Ok(json!({"model": {"name": "Frank Herbert"}}))
    });

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    conn.subscribe("library.book.1").await.unwrap();

    bus.publish(
        "event.library.book.1.change",
        json!({"values": {"author": {"rid": "library.author.1"}}}),
    );
    settle().await;
    // a later event queues behind the loading child
    bus.publish(
        "event.library.book.1.change",
        json!({"values": {"title": "Dune Messiah"}}),
    );
    settle().await;
    assert!(events.lock().unwrap().is_empty());

    release_tx.send(()).unwrap();
    settle().await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2, "events: {:?}", *events);
    match &events[0].1 {
        ClientEvent::Change { values, resources } => {
            assert_eq!(
                values["author"],
                Value::Reference(resbridge::Rid::parse("library.author.1").unwrap())
            );
            let resources = resources.as_ref().expect("embedded resources");
            assert_eq!(
                resources.models["library.author.1"],
                json!({"name": "Frank Herbert"})
            );
        }
        other => panic!("unexpected event {:?}", other),
    }
    match &events[1].1 {
        ClientEvent::Change { values, .. } => {
            assert_eq!(values["title"], Value::Primitive(json!("Dune Messiah")));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn collection_add_embeds_referenced_child() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.books", |_| {
        Ok(json!({"collection": [{"rid": "library.book.1"}]}))
    });
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    bus.respond_to("get.library.book.2", |_| {
        Ok(json!({"model": {"title": "Dune Messiah"}}))
    });
    allow_all(&bus, "library.books");

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    let set = conn.subscribe("library.books").await.unwrap();
    assert!(set.collections.contains_key("library.books"));
    assert!(set.models.contains_key("library.book.1"));

    bus.publish(
        "event.library.books.add",
        json!({"idx": 1, "value": {"rid": "library.book.2"}}),
    );
    settle().await;

    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].1 {
            ClientEvent::Add {
                idx,
                value,
                resources,
            } => {
                assert_eq!(*idx, 1);
                assert!(value.reference().is_some());
                let resources = resources.as_ref().expect("embedded resources");
                assert_eq!(
                    resources.models["library.book.2"],
                    json!({"title": "Dune Messiah"})
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    // removing the reference releases the child subscription
    bus.publish("event.library.books.remove", json!({"idx": 1}));
    settle().await;
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1].1, ClientEvent::Remove { idx: 1 }));
    assert!(!bus.is_subscribed("event.library.book.2.>"));
}

#[tokio::test(flavor = "multi_thread")]
async fn reaccess_denial_unsubscribes_the_client() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    allow_all(&bus, "library.book.1");

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    conn.subscribe("library.book.1").await.unwrap();

    bus.respond_to("access.library.book.1", |_| Ok(json!({"get": false})));
    bus.publish("event.library.book.1.reaccess", JsonValue::Null);
    settle().await;

    let captured = events.lock().unwrap();
    assert_eq!(captured.len(), 1);
    match &captured[0].1 {
        ClientEvent::Unsubscribe { reason } => {
            assert_eq!(reason.code_str(), "system.accessDenied");
        }
        other => panic!("unexpected event {:?}", other),
    }
    drop(captured);

    // the subscription is gone; later events reach nobody
    bus.publish(
        "event.library.book.1.change",
        json!({"values": {"title": "x"}}),
    );
    settle().await;
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn token_change_reevaluates_access() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    bus.respond_to("access.library.book.1", |payload| {
        let granted = payload.get("token") == Some(&json!({"user": "alice"}));
        Ok(json!({"get": granted}))
    });

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    conn.set_token(Some(json!({"user": "alice"}))).await;
    conn.subscribe("library.book.1").await.unwrap();

    conn.set_token(Some(json!({"user": "mallory"}))).await;
    settle().await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].1, ClientEvent::Unsubscribe { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_event_reaches_the_client_and_clears_state() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    allow_all(&bus, "library.book.1");

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    conn.subscribe("library.book.1").await.unwrap();

    bus.publish("event.library.book.1.delete", JsonValue::Null);
    settle().await;

    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, ClientEvent::Delete));
    }
    assert!(!bus.is_subscribed("event.library.book.1.>"));

    // unsubscribing the vanished subscription reports no subscription
    let err = conn.unsubscribe("library.book.1").await.unwrap_err();
    assert_eq!(err.code_str(), "system.noSubscription");
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_releases_the_backend_subscription() {
    let (gateway, bus) = gateway();
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    allow_all(&bus, "library.book.1");

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    conn.subscribe("library.book.1").await.unwrap();
    conn.unsubscribe("library.book.1").await.unwrap();
    settle().await;

    assert!(!bus.is_subscribed("event.library.book.1.>"));
    let err = conn.unsubscribe("library.book.1").await.unwrap_err();
    assert_eq!(err.code_str(), "system.noSubscription");

    bus.publish(
        "event.library.book.1.change",
        json!({"values": {"title": "x"}}),
    );
    settle().await;
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_limit_is_enforced() {
    let bus = InMemoryBus::new();
    let gateway = Gateway::with_config(
        Arc::new(bus.clone()),
        GatewayConfig {
            subscription_limit: 1,
            ..GatewayConfig::default()
        },
    );
    bus.respond_to("get.library.book.1", |_| {
        Ok(json!({"model": {"title": "Dune"}}))
    });
    allow_all(&bus, "library.book.1");
    allow_all(&bus, "library.book.2");

    let (sink, _) = event_sink();
    let conn = gateway.connection("c1", sink);
    conn.subscribe("library.book.1").await.unwrap();

    let err = conn.subscribe("library.book.2").await.unwrap_err();
    assert_eq!(err.code_str(), "system.subscriptionLimitExceeded");
}

#[tokio::test(flavor = "multi_thread")]
async fn disposing_a_connection_cancels_inflight_loads() {
    let (gateway, bus) = gateway();
    allow_all(&bus, "library.book.1");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    bus.respond_to("get.library.book.1", move |_| {
        let _ = release_rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(2));
        Ok(json!({"model": {"title": "Dune"}}))
    });

    let (sink, events) = event_sink();
    let conn = gateway.connection("c1", sink);
    let pending = {
        let conn = conn.connection().clone();
        tokio::spawn(async move { conn.subscribe("library.book.1").await })
    };
    settle().await;

    conn.dispose();
    release_tx.send(()).unwrap();

    let result = pending.await.unwrap();
    assert_eq!(result.unwrap_err().code_str(), "system.disposedSubscription");

    settle().await;
    assert!(events.lock().unwrap().is_empty());
    assert!(!bus.is_subscribed("event.library.book.1.>"));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_rid_is_rejected_up_front() {
    let (gateway, _bus) = gateway();
    let (sink, _) = event_sink();
    let conn = gateway.connection("c1", sink);

    let err = conn.subscribe("no spaces allowed").await.unwrap_err();
    assert_eq!(err.code_str(), "system.invalidRequest");
}
