use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use ems_broker::{scanner, Engine};
use ems_client::{Client, FRAME_TYPE_ERROR, FRAME_TYPE_RESPONSE};
use ems_config::Settings;

struct TestNode {
    engine: Arc<Engine>,
    tcp_addr: String,
    http_addr: String,
    _dir: TempDir,
}

impl TestNode {
    fn http_url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.http_addr, path_and_query)
    }
}

async fn start_node() -> TestNode {
    start_node_with(|_| {}).await
}

async fn start_node_with<F: FnOnce(&mut Settings)>(customize: F) -> TestNode {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.queue.data_path = dir.path().to_string_lossy().into_owned();
    settings.queue.mem_queue_size = 100;
    settings.scan.interval_ms = 20;
    settings.scan.refresh_interval_ms = 200;
    settings.client.msg_timeout_ms = 60_000;
    customize(&mut settings);

    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp_listener.local_addr().unwrap().to_string();
    let http_addr = http_listener.local_addr().unwrap().to_string();

    let engine = Engine::new(settings);
    engine.start();
    tokio::spawn(scanner::queue_scan_loop(Arc::clone(&engine)));
    tokio::spawn(crate::tcp::run_tcp_server(Arc::clone(&engine), tcp_listener));
    tokio::spawn(crate::http::run_http_server(
        Arc::clone(&engine),
        http_listener,
    ));

    TestNode {
        engine,
        tcp_addr,
        http_addr,
        _dir: dir,
    }
}

async fn identified_client(node: &TestNode) -> Client {
    let mut client = Client::connect(&node.tcp_addr).await.unwrap();
    let frame = client
        .identify(&serde_json::json!({
            "client_id": "test",
            "hostname": "test-host",
            "user_agent": "ems-tests/0.1",
            "feature_negotiation": true,
        }))
        .await
        .unwrap();
    assert_eq!(frame.frame_type, FRAME_TYPE_RESPONSE);
    let negotiated: serde_json::Value = serde_json::from_slice(&frame.data).unwrap();
    assert_eq!(negotiated["tls_v1"], false);
    client
}

#[tokio::test(flavor = "multi_thread")]
async fn full_publish_consume_cycle_over_tcp_and_http() {
    let node = start_node().await;
    let http = reqwest::Client::new();

    // create the topic through the HTTP surface
    let resp = http
        .post(node.http_url("/topic/create?topic=t1"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let mut client = identified_client(&node).await;
    let frame = client.subscribe("t1", "c1").await.unwrap();
    assert_eq!(frame.data, b"OK");
    client.rdy(1).await.unwrap();

    let resp = http
        .post(node.http_url("/pub?topic=t1"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let msg = timeout(Duration::from_secs(2), client.next_message())
        .await
        .expect("delivery timed out")
        .unwrap();
    assert_eq!(msg.body, b"hello");
    assert_eq!(msg.attempts, 1);

    client.fin(&msg.id_str()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let channel = node
        .engine
        .get_existing_topic("t1")
        .unwrap()
        .get_existing_channel("c1")
        .unwrap();
    assert_eq!(channel.depth(), 0);
    assert_eq!(channel.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_magic_closes_the_connection() {
    let node = start_node().await;
    let mut stream = TcpStream::connect(&node.tcp_addr).await.unwrap();
    stream.write_all(b"  V9").await.unwrap();

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server should close promptly")
        .unwrap();
    assert_eq!(n, 0, "expected EOF after bad magic");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_command_is_fatal() {
    let node = start_node().await;
    let mut client = Client::connect(&node.tcp_addr).await.unwrap();

    // no such verb: one error frame, then close
    let mut raw = TcpStream::connect(&node.tcp_addr).await.unwrap();
    raw.write_all(b"  V2BOGUS\n").await.unwrap();
    let size = raw.read_u32().await.unwrap();
    let frame_type = raw.read_i32().await.unwrap();
    let mut data = vec![0u8; (size - 4) as usize];
    raw.read_exact(&mut data).await.unwrap();
    assert_eq!(frame_type, FRAME_TYPE_ERROR);
    assert!(data.starts_with(b"E_INVALID"), "{:?}", String::from_utf8_lossy(&data));

    let mut one = [0u8; 1];
    let n = timeout(Duration::from_secs(2), raw.read(&mut one))
        .await
        .expect("server should close after a fatal error")
        .unwrap();
    assert_eq!(n, 0);

    // the well-behaved connection is unaffected
    let frame = client.publish("t", b"still-alive").await.unwrap();
    assert_eq!(frame.data, b"OK");
}

#[tokio::test(flavor = "multi_thread")]
async fn fin_with_unknown_id_is_recoverable() {
    let node = start_node().await;
    let mut client = identified_client(&node).await;
    client.subscribe("t", "c").await.unwrap();

    client.fin("0123456789abcdef").await.unwrap();
    let frame = client.read_frame().await.unwrap();
    assert_eq!(frame.frame_type, FRAME_TYPE_ERROR);
    assert!(frame.data.starts_with(b"E_FIN_FAILED"));

    // connection stays open and usable
    let frame = client.publish("t", b"after-error").await.unwrap();
    assert_eq!(frame.data, b"OK");
}

#[tokio::test(flavor = "multi_thread")]
async fn rdy_beyond_max_is_fatal() {
    let node = start_node().await;
    let mut client = identified_client(&node).await;
    client.subscribe("t", "c").await.unwrap();

    client.rdy(1_000_000).await.unwrap();
    let frame = client.read_frame().await.unwrap();
    assert_eq!(frame.frame_type, FRAME_TYPE_ERROR);
    assert!(frame.data.starts_with(b"E_INVALID"));
    assert!(client.read_frame().await.is_err(), "connection must close");
}

#[tokio::test(flavor = "multi_thread")]
async fn dpub_honors_the_defer_window() {
    let node = start_node().await;
    let mut consumer = identified_client(&node).await;
    consumer.subscribe("t", "c").await.unwrap();
    consumer.rdy(1).await.unwrap();

    let mut producer = identified_client(&node).await;
    let started = Instant::now();
    let frame = producer
        .publish_deferred("t", 300, b"later")
        .await
        .unwrap();
    assert_eq!(frame.data, b"OK");

    let msg = timeout(Duration::from_secs(3), consumer.next_message())
        .await
        .expect("deferred delivery timed out")
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(msg.body, b"later");
    assert!(elapsed >= Duration::from_millis(300), "early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "late: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn mpub_delivers_every_body() {
    let node = start_node().await;
    let mut consumer = identified_client(&node).await;
    consumer.subscribe("t", "c").await.unwrap();
    consumer.rdy(5).await.unwrap();

    let mut producer = identified_client(&node).await;
    let frame = producer
        .publish_multi("t", &[b"one", b"two", b"three"])
        .await
        .unwrap();
    assert_eq!(frame.data, b"OK");

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let msg = timeout(Duration::from_secs(2), consumer.next_message())
            .await
            .expect("MPUB delivery timed out")
            .unwrap();
        bodies.push(msg.body.clone());
        consumer.fin(&msg.id_str()).await.unwrap();
    }
    bodies.sort();
    assert_eq!(bodies, vec![b"one".to_vec(), b"three".to_vec(), b"two".to_vec()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn requeued_message_comes_back_with_bumped_attempts() {
    let node = start_node().await;
    let mut client = identified_client(&node).await;
    client.subscribe("t", "c").await.unwrap();
    client.rdy(1).await.unwrap();

    let mut producer = identified_client(&node).await;
    producer.publish("t", b"again").await.unwrap();

    let first = client.next_message().await.unwrap();
    assert_eq!(first.attempts, 1);
    client.requeue(&first.id_str(), 0).await.unwrap();

    let second = timeout(Duration::from_secs(2), client.next_message())
        .await
        .expect("requeue redelivery timed out")
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempts, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeats_flow_on_the_negotiated_interval() {
    let node = start_node().await;
    let mut client = Client::connect(&node.tcp_addr).await.unwrap();
    client
        .identify(&serde_json::json!({
            "heartbeat_interval": 1000,
            "feature_negotiation": false,
        }))
        .await
        .unwrap();

    // two heartbeat rounds, each answered with NOP
    for _ in 0..2 {
        let frame = timeout(Duration::from_millis(2500), client.read_frame())
            .await
            .expect("heartbeat missing")
            .unwrap();
        assert!(frame.is_heartbeat(), "{:?}", String::from_utf8_lossy(&frame.data));
        client.nop().await.unwrap();
    }

    // still a functional connection afterwards
    let frame = client.publish("t", b"alive").await.unwrap();
    assert_eq!(frame.data, b"OK");
}

#[tokio::test(flavor = "multi_thread")]
async fn ephemeral_pair_vanishes_after_last_consumer() {
    let node = start_node().await;
    let mut consumer = identified_client(&node).await;
    consumer.subscribe("t#ephemeral", "c#ephemeral").await.unwrap();
    consumer.rdy(1).await.unwrap();

    let mut producer = identified_client(&node).await;
    producer.publish("t#ephemeral", b"fleeting").await.unwrap();

    let msg = timeout(Duration::from_secs(2), consumer.next_message())
        .await
        .expect("ephemeral delivery timed out")
        .unwrap();
    assert_eq!(msg.body, b"fleeting");
    consumer.fin(&msg.id_str()).await.unwrap();

    drop(consumer);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(node.engine.get_existing_topic("t#ephemeral").is_err());
    let leftovers: Vec<_> = std::fs::read_dir(node._dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains("ephemeral"))
        .collect();
    assert!(leftovers.is_empty(), "ephemeral state on disk: {leftovers:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn http_ping_stats_and_channel_pause() {
    let node = start_node().await;
    let http = reqwest::Client::new();

    let resp = http.get(node.http_url("/ping")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "OK");

    http.post(node.http_url("/channel/create?topic=t1&channel=c1"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let stats: serde_json::Value = http
        .get(node.http_url("/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["topics"][0]["topic_name"], "t1");
    assert_eq!(stats["topics"][0]["channels"][0]["channel_name"], "c1");

    // paused channel buffers; unpaused it delivers
    http.post(node.http_url("/channel/pause?topic=t1&channel=c1"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let mut client = identified_client(&node).await;
    client.subscribe("t1", "c1").await.unwrap();
    client.rdy(1).await.unwrap();
    http.post(node.http_url("/pub?topic=t1"))
        .body("held")
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let channel = node
        .engine
        .get_existing_topic("t1")
        .unwrap()
        .get_existing_channel("c1")
        .unwrap();
    assert_eq!(channel.depth(), 1);

    http.post(node.http_url("/channel/unpause?topic=t1&channel=c1"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    let msg = timeout(Duration::from_secs(2), client.next_message())
        .await
        .expect("delivery after unpause timed out")
        .unwrap();
    assert_eq!(msg.body, b"held");
}

#[tokio::test(flavor = "multi_thread")]
async fn config_put_validates_and_applies() {
    let node = start_node().await;
    let http = reqwest::Client::new();

    let resp = http
        .put(node.http_url("/config/lookupd_tcp_addresses"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    assert!(node.engine.opts().lookup.lookupd_tcp_addresses.is_empty());

    let resp = http
        .put(node.http_url("/config/lookupd_tcp_addresses"))
        .body(r#"["127.0.0.1:4160"]"#)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(
        node.engine.opts().lookup.lookupd_tcp_addresses,
        vec!["127.0.0.1:4160".to_string()]
    );

    let resp = http
        .put(node.http_url("/config/no_such_key"))
        .body("1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn mpub_body_parser_rejects_malformed_input() {
    // count says two, only one present
    let mut body = Vec::new();
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&3u32.to_be_bytes());
    body.extend_from_slice(b"abc");
    assert!(crate::protocol::parse_mpub_body(&body, 1024).is_err());

    // trailing garbage
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_be_bytes());
    body.extend_from_slice(&3u32.to_be_bytes());
    body.extend_from_slice(b"abcXX");
    assert!(crate::protocol::parse_mpub_body(&body, 1024).is_err());

    // well-formed
    let mut body = Vec::new();
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes());
    body.push(b'a');
    body.extend_from_slice(&1u32.to_be_bytes());
    body.push(b'b');
    let bodies = crate::protocol::parse_mpub_body(&body, 1024).unwrap();
    assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec()]);
}
