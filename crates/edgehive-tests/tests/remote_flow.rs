use edgehive_protocol::message::now_ms;
use edgehive_protocol::{Content, Message, operation};
use edgehive_tests::harness::modules::{Echo, Silent, link};
use edgehive_tests::harness::{init_tracing, poll_until};
use libedgehive::{Bus, Dispatcher};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn request(id: &str, body: serde_json::Value) -> Message {
    Message::new_raw()
        .build_header(id, "", now_ms())
        .build_router("cloudhub", "", "node/edge-1/status", operation::QUERY)
        .fill_json(body)
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_module_behaves_like_a_local_one() {
    init_tracing();
    let server = Bus::local();
    let silent = Arc::new(Silent::new("logger"));
    let mut dispatcher = Dispatcher::new(server.clone());
    dispatcher.register(Arc::new(Echo::new("edged")));
    dispatcher.register(silent.clone());
    dispatcher.start_all().await.unwrap();

    let client = Bus::local();
    let _peer = link(&server, &client).await.unwrap();

    // Topology is in place as soon as the link reports connected.
    assert!(client.has_module("edged").await);
    assert!(client.is_remote("edged").await);

    let reply = client
        .send_sync("edged", request("r1", json!({"cpu": 12})), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.parent_id(), "r1");
    assert_eq!(reply.content, Content::Json(json!({"cpu": 12})));

    for n in 0..5 {
        client.send("logger", request(&format!("log-{n}"), json!(n))).await;
    }
    let silent = &silent;
    assert!(poll_until(Duration::from_secs(2), || async move { silent.received() == 5 }).await);

    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_sync_without_reply_times_out() {
    init_tracing();
    let server = Bus::local();
    let mut dispatcher = Dispatcher::new(server.clone());
    dispatcher.register(Arc::new(Silent::new("silent")));
    dispatcher.start_all().await.unwrap();

    let client = Bus::local();
    let _peer = link(&server, &client).await.unwrap();

    let err = client
        .send_sync("silent", request("r2", json!(null)), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err}");

    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn topology_is_exchanged_both_ways() {
    init_tracing();
    let server = Bus::local();
    server.add_module("edged").await;

    let client = Bus::local();
    client.add_module("cloudhub").await;
    client.add_module_group("cloudhub", "hub").await.unwrap();

    let _peer = link(&server, &client).await.unwrap();

    assert!(client.is_remote("edged").await);
    let server_ref = &server;
    assert!(
        poll_until(Duration::from_secs(2), || async move {
            server_ref.is_remote("cloudhub").await
        })
        .await
    );
    assert_eq!(server.group_members("hub").await, vec!["cloudhub".to_string()]);

    // A request from the server side reaches the dialer's module.
    server.send("cloudhub", request("up-1", json!("hi"))).await;
    let msg = tokio::time::timeout(Duration::from_secs(2), client.receive("cloudhub"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.id(), "up-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn group_sync_spans_the_link() {
    init_tracing();
    let server = Bus::local();
    let mut dispatcher = Dispatcher::new(server.clone());
    dispatcher.register(Arc::new(Echo::new("a").in_group("g")));
    dispatcher.register(Arc::new(Echo::new("b").in_group("g")));
    dispatcher.start_all().await.unwrap();

    let client = Bus::local();
    let mut client_dispatcher = Dispatcher::new(client.clone());
    client_dispatcher.register(Arc::new(Echo::new("c").in_group("g")));
    client_dispatcher.start_all().await.unwrap();

    let _peer = link(&server, &client).await.unwrap();

    let mut members = client.group_members("g").await;
    members.sort();
    assert_eq!(members, vec!["a", "b", "c"]);

    client
        .send_to_group_sync("g", request("g1", json!("sync")), Duration::from_secs(2))
        .await
        .unwrap();

    client_dispatcher.shutdown().await;
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn local_module_shadows_remote_one() {
    init_tracing();
    let server = Bus::local();
    server.add_module("edged").await;

    let client = Bus::local();
    client.add_module("edged").await;
    let _peer = link(&server, &client).await.unwrap();

    assert!(!client.is_remote("edged").await);
    client.send("edged", request("local-1", json!(null))).await;
    assert_eq!(client.receive("edged").await.unwrap().id(), "local-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn message_with_parent_id_reaches_remote_destination() {
    init_tracing();
    let server = Bus::local();
    server.add_module("x").await;
    server.add_module("hub").await;
    server.add_module_group("hub", "hub").await.unwrap();

    let client = Bus::local();
    let _peer = link(&server, &client).await.unwrap();

    // A follow-up naming an earlier request, sent one way.
    let follow_up = Message::new("some-request-id").build_router("edged", "", "r", operation::UPDATE);
    client.send("x", follow_up).await;
    let msg = tokio::time::timeout(Duration::from_secs(2), server.receive("x"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.parent_id(), "some-request-id");

    // A reply broadcast to a group whose member lives across the link.
    let reply = Message::new("req-9").build_router("streamruleendpoint", "user", "", operation::UPLOAD);
    client.send_to_group("hub", reply).await;
    let msg = tokio::time::timeout(Duration::from_secs(2), server.receive("hub"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.parent_id(), "req-9");
    assert_eq!(server.uninvited_replies(), 0);
}
