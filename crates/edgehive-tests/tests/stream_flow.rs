use edgehive_protocol::{HttpResponse, Message, TunnelMessageType};
use edgehive_stream::endpoint::{MODULE_NAME, OP_START, OP_STOP, SOURCE_TYPE};
use edgehive_stream::{DialerConfig, EndpointConfig, StreamRuleEndpoint, UrlStore};
use edgehive_tests::harness::tunnel::{MockTunnelServer, TunnelPeer};
use edgehive_tests::harness::upstream::{StalledSource, UpstreamSource};
use edgehive_tests::harness::{init_tracing, poll_until};
use libedgehive::{Bus, Dispatcher};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn control(op: &str, resource: &str) -> Message {
    Message::new("").build_router(SOURCE_TYPE, "", resource, op)
}

fn endpoint_config(dialer: DialerConfig) -> EndpointConfig {
    EndpointConfig {
        dialer,
        ..Default::default()
    }
}

/// A node with the stream endpoint and a `hub` module collecting its
/// replies.
struct Node {
    bus: Bus,
    endpoint: Arc<StreamRuleEndpoint>,
    dispatcher: Dispatcher,
}

impl Node {
    async fn start(dialer: DialerConfig, store: UrlStore) -> Self {
        let bus = Bus::local();
        bus.add_module("hub").await;
        bus.add_module_group("hub", "hub").await.unwrap();
        let endpoint = Arc::new(StreamRuleEndpoint::new(endpoint_config(dialer), store).unwrap());
        let mut dispatcher = Dispatcher::new(bus.clone());
        dispatcher.register(endpoint.clone());
        dispatcher.start_all().await.unwrap();
        Self {
            bus,
            endpoint,
            dispatcher,
        }
    }

    async fn request(&self, op: &str, resource: &str) -> HttpResponse {
        let msg = control(op, resource);
        let id = msg.id().to_string();
        self.bus.send(MODULE_NAME, msg).await;
        let reply = self.next_reply().await;
        assert_eq!(reply.0, id);
        reply.1
    }

    async fn next_reply(&self) -> (String, HttpResponse) {
        let reply = tokio::time::timeout(WAIT, self.bus.receive("hub"))
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(reply.source(), MODULE_NAME);
        assert_eq!(reply.group(), "user");
        (reply.parent_id().to_string(), reply.decode_body().expect("http envelope"))
    }

    async fn stop(self) {
        self.dispatcher.shutdown().await;
    }
}

/// The boot sweep dials every stored row, camera rows included; skips
/// tunnels until the one for `endpoint` arrives.
async fn tunnel_for(cloud: &mut MockTunnelServer, endpoint: &str) -> TunnelPeer {
    loop {
        let peer = cloud.next_peer(WAIT).await.unwrap();
        if peer.dial.endpoint == endpoint {
            return peer;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_stop_round_trip() {
    init_tracing();
    let mut cloud = MockTunnelServer::spawn().await.unwrap();
    let tmp = TempDir::new().unwrap();
    let store = UrlStore::open(&tmp.path().join("edgehive.db")).unwrap();
    let node = Node::start(cloud.dialer_config(), store.clone()).await;

    let resp = node.request(OP_START, "ep1/rtsp://host/stream").await;
    assert_eq!(resp.status_code, 200, "{}", resp.body_str());
    assert_eq!(resp.body_str(), r#"{"code":200,"message":"OK"}"#);
    let row = store.get("ep1").await.unwrap().expect("row stored");
    assert_eq!(row.url, "rtsp://host/stream");

    let mut tunnel = cloud.next_peer(WAIT).await.unwrap();
    assert_eq!(tunnel.dial.path, "/v1/edgehive/videoconnect");
    assert_eq!(tunnel.dial.endpoint, "ep1");
    assert_eq!(tunnel.dial.url, "rtsp://host/stream");
    assert_eq!(node.endpoint.state_of("ep1").await, Some("running"));

    let resp = node.request(OP_STOP, "ep1/ignored").await;
    assert_eq!(resp.status_code, 200);
    assert!(store.get("ep1").await.unwrap().is_none());
    tunnel.wait_closed(WAIT).await.unwrap();
    assert!(node.endpoint.state_of("ep1").await.is_none());

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_endpoint_resumes_on_boot() {
    init_tracing();
    let mut cloud = MockTunnelServer::spawn().await.unwrap();
    let store = UrlStore::open_in_memory().unwrap();
    store.insert("ep2", "rtsp://cam-2/live").await.unwrap();

    let node = Node::start(cloud.dialer_config(), store.clone()).await;
    let tunnel = cloud.next_peer(WAIT).await.unwrap();
    assert_eq!(tunnel.dial.endpoint, "ep2");
    assert_eq!(tunnel.dial.url, "rtsp://cam-2/live");

    let endpoint = &node.endpoint;
    assert!(
        poll_until(WAIT, || async move {
            endpoint.running_endpoints().await == vec!["ep2".to_string()]
        })
        .await
    );
    assert!(!cloud.has_more_peers(Duration::from_millis(300)).await);
    assert_eq!(cloud.dial_count(), 1);
    assert!(store.get("ep2").await.unwrap().is_some());

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_stored_endpoint_is_forgotten() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let store = UrlStore::open_in_memory().unwrap();
    store.insert("ep3", "rtsp://cam-3/live").await.unwrap();
    let dialer = DialerConfig {
        server: addr,
        scheme: "ws".to_string(),
        retry_interval_ms: 20,
        ..Default::default()
    };
    let node = Node::start(dialer, store.clone()).await;

    let store_ref = &store;
    assert!(poll_until(WAIT, || async move { store_ref.is_empty().await.unwrap() }).await);
    assert!(node.endpoint.running_endpoints().await.is_empty());

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoint_is_redialed_after_restart() {
    init_tracing();
    let mut cloud = MockTunnelServer::spawn().await.unwrap();
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("edgehive.db");

    let node = Node::start(cloud.dialer_config(), UrlStore::open(&db).unwrap()).await;
    let resp = node.request(OP_START, "ep4/http://cam-4/mjpeg").await;
    assert_eq!(resp.status_code, 200);
    let mut first = cloud.next_peer(WAIT).await.unwrap();
    node.stop().await;
    first.wait_closed(WAIT).await.unwrap();

    let node = Node::start(cloud.dialer_config(), UrlStore::open(&db).unwrap()).await;
    let second = cloud.next_peer(WAIT).await.unwrap();
    assert_eq!(second.dial.endpoint, "ep4");
    assert_eq!(second.dial.url, "http://cam-4/mjpeg");
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_starts_dial_once() {
    init_tracing();
    let mut cloud = MockTunnelServer::spawn().await.unwrap();
    let store = UrlStore::open_in_memory().unwrap();
    let node = Node::start(cloud.dialer_config(), store.clone()).await;

    node.bus.send(MODULE_NAME, control(OP_START, "ep5/rtsp://cam-5/a")).await;
    node.bus.send(MODULE_NAME, control(OP_START, "ep5/rtsp://cam-5/b")).await;
    let mut codes = vec![
        node.next_reply().await.1.status_code,
        node.next_reply().await.1.status_code,
    ];
    codes.sort();
    assert_eq!(codes, vec![200, 500]);

    let _tunnel = cloud.next_peer(WAIT).await.unwrap();
    assert!(!cloud.has_more_peers(Duration::from_millis(300)).await);
    assert_eq!(cloud.dial_count(), 1);
    assert_eq!(store.list().await.unwrap().len(), 1);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_operation_is_rejected() {
    init_tracing();
    let cloud = MockTunnelServer::spawn().await.unwrap();
    let node = Node::start(cloud.dialer_config(), UrlStore::open_in_memory().unwrap()).await;

    let resp = node.request("restart", "ep1/rtsp://cam").await;
    assert_eq!(resp.status_code, 404);
    assert_eq!(cloud.dial_count(), 0);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn frames_reach_only_their_connection() {
    init_tracing();
    let mut cloud = MockTunnelServer::spawn().await.unwrap();
    let mut source_7 = UpstreamSource::spawn(b"RTSP/1.0 200 OK\r\n\r\n").await.unwrap();
    let mut source_8 = UpstreamSource::spawn(b"RTSP/1.0 200 OK\r\n\r\n").await.unwrap();

    let store = UrlStore::open_in_memory().unwrap();
    store.insert("cam7", &source_7.url("/live")).await.unwrap();
    store.insert("cam8", &source_8.url("/live")).await.unwrap();
    let node = Node::start(cloud.dialer_config(), store.clone()).await;
    let resp = node.request(OP_START, &format!("ep6/{}", source_7.url("/live"))).await;
    assert_eq!(resp.status_code, 200);
    let mut tunnel = tunnel_for(&mut cloud, "ep6").await;

    tunnel.video_connect(7, "cam7").await.unwrap();
    tunnel.video_connect(8, "cam8").await.unwrap();
    source_7.wait_accepted(WAIT).await.unwrap();
    source_8.wait_accepted(WAIT).await.unwrap();

    // Upstream greetings come back tagged with their connect ids.
    let mut greeted = BTreeSet::new();
    while greeted.len() < 2 {
        let frame = tunnel.next_frame(WAIT).await.unwrap();
        assert_eq!(frame.message_type, TunnelMessageType::Data);
        assert_eq!(frame.data, b"RTSP/1.0 200 OK\r\n\r\n");
        greeted.insert(frame.connect_id);
    }
    assert_eq!(greeted, BTreeSet::from([7, 8]));

    let mut expected = Vec::new();
    for n in 0..100u32 {
        let chunk = format!("frame-{n:04}|").into_bytes();
        expected.extend_from_slice(&chunk);
        tunnel.send_data(7, &chunk).await.unwrap();
    }
    let got = source_7.read_exact_len(expected.len(), WAIT).await;
    assert_eq!(got, expected);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(source_8.drain_received().is_empty());

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_connection_does_not_hold_up_its_neighbour() {
    init_tracing();
    let mut cloud = MockTunnelServer::spawn().await.unwrap();
    let mut stalled = StalledSource::spawn().await.unwrap();
    let mut healthy = UpstreamSource::spawn(b"").await.unwrap();

    let store = UrlStore::open_in_memory().unwrap();
    store.insert("slow", &stalled.url("/live")).await.unwrap();
    store.insert("fast", &healthy.url("/live")).await.unwrap();
    let node = Node::start(cloud.dialer_config(), store).await;
    let resp = node.request(OP_START, &format!("ep7/{}", healthy.url("/live"))).await;
    assert_eq!(resp.status_code, 200);
    let mut tunnel = tunnel_for(&mut cloud, "ep7").await;

    tunnel.video_connect(1, "slow").await.unwrap();
    tunnel.video_connect(2, "fast").await.unwrap();
    healthy.wait_accepted(WAIT).await.unwrap();

    // Far more than the stalled socket's buffers can take.
    let block = vec![0xAB; 8 * 1024];
    for _ in 0..3000 {
        tunnel.send_data(1, &block).await.unwrap();
    }
    tunnel.send_data(2, b"still flowing").await.unwrap();
    assert_eq!(healthy.read_exact_len(13, WAIT).await, b"still flowing");

    let session = node.endpoint.session("ep7").await.expect("running session");
    assert!(session.has_local_connection(1).await);
    stalled.release();
    let session_ref = &session;
    assert!(
        poll_until(WAIT, || async move { !session_ref.has_local_connection(1).await }).await
    );
    assert!(session.has_local_connection(2).await);
    tunnel.send_data(2, b"after close").await.unwrap();
    assert_eq!(healthy.read_exact_len(11, WAIT).await, b"after close");
    assert!(!session.is_closed());

    node.stop().await;
}
