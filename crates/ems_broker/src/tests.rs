use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use ems_config::Settings;

use crate::client::{ClientConn, ClientState, OutFrame};
use crate::engine::Engine;
use crate::message::{Message, MessageId};
use crate::pqueue::MessagePqueue;
use crate::scanner;

fn test_settings(dir: &TempDir) -> Settings {
    let mut s = Settings::default();
    s.queue.data_path = dir.path().to_string_lossy().into_owned();
    s.queue.mem_queue_size = 100;
    s.scan.interval_ms = 20;
    s.scan.refresh_interval_ms = 200;
    s.client.msg_timeout_ms = 100;
    s
}

fn make_client(
    engine: &Engine,
    ready: i64,
) -> (Arc<ClientConn>, mpsc::UnboundedReceiver<OutFrame>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let opts = engine.opts();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let client = Arc::new(ClientConn::new(
        engine.ctx.next_client_id(),
        addr,
        out_tx,
        ems_utils::time::ms_to_ns(opts.client.msg_timeout_ms),
        opts.client.max_heartbeat_interval_ms / 2,
        16 * 1024,
        opts.client.output_buffer_timeout_ms,
    ));
    client.set_state(ClientState::Subscribed);
    client.set_ready_count(ready);
    (client, out_rx)
}

async fn recv_message(rx: &mut mpsc::UnboundedReceiver<OutFrame>) -> Message {
    loop {
        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("client queue closed");
        if let OutFrame::Message(payload) = frame {
            return Message::decode(&payload).expect("delivered frame decodes");
        }
    }
}

// ---- priority queue ----

fn pq_msg(id: u64, priority: i64) -> Message {
    let mut m = Message::new(MessageId::from_u64(id), vec![]);
    m.priority = priority;
    m
}

#[test]
fn pqueue_orders_by_priority() {
    let mut pq = MessagePqueue::new(8);
    for (id, pri) in [(1u64, 50i64), (2, 10), (3, 30), (4, 20), (5, 40)] {
        pq.push(pq_msg(id, pri));
    }
    let mut seen = Vec::new();
    while let Some(m) = pq.pop() {
        seen.push(m.priority);
    }
    assert_eq!(seen, vec![10, 20, 30, 40, 50]);
}

#[test]
fn pqueue_remove_arbitrary() {
    let mut pq = MessagePqueue::new(8);
    for i in 0..10u64 {
        pq.push(pq_msg(i, i as i64));
    }
    let victim = MessageId::from_u64(4);
    assert!(pq.remove(&victim).is_some());
    assert!(pq.remove(&victim).is_none());
    assert_eq!(pq.len(), 9);

    let mut seen = Vec::new();
    while let Some(m) = pq.pop() {
        seen.push(m.priority);
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
}

#[test]
fn pqueue_peek_and_shift_reports_wait() {
    let mut pq = MessagePqueue::new(8);
    assert!(matches!(pq.peek_and_shift(100), (None, 0)));

    pq.push(pq_msg(1, 150));
    let (m, wait) = pq.peek_and_shift(100);
    assert!(m.is_none());
    assert_eq!(wait, 50);

    let (m, wait) = pq.peek_and_shift(200);
    assert_eq!(m.unwrap().priority, 150);
    assert_eq!(wait, 0);
    assert!(pq.is_empty());
}

#[test]
fn pqueue_update_priority_resifts() {
    let mut pq = MessagePqueue::new(8);
    for i in 1..=5u64 {
        pq.push(pq_msg(i, i as i64 * 10));
    }
    // push the cheapest entry to the back
    assert!(pq.update_priority(&MessageId::from_u64(1), 100));
    let first = pq.pop().unwrap();
    assert_eq!(first.priority, 20);
}

// ---- message codec ----

#[test]
fn message_wire_round_trip() {
    let mut m = Message::new(MessageId::from_u64(0xdeadbeef), b"payload".to_vec());
    m.attempts = 3;
    let encoded = m.encode();
    assert_eq!(encoded.len(), 8 + 2 + 16 + 7);

    let decoded = Message::decode(&encoded).unwrap();
    assert_eq!(decoded.id, m.id);
    assert_eq!(decoded.timestamp, m.timestamp);
    assert_eq!(decoded.attempts, 3);
    assert_eq!(decoded.body, b"payload");
}

#[test]
fn message_ids_are_printable_and_unique() {
    let factory = crate::message::IdFactory::new();
    let a = factory.next_id();
    let b = factory.next_id();
    assert_ne!(a, b);
    assert_eq!(a.to_string().len(), 16);
    assert!(a.to_string().chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn message_decode_rejects_short_input() {
    assert!(Message::decode(&[0u8; 10]).is_err());
}

// ---- topic / channel ----

#[tokio::test(flavor = "multi_thread")]
async fn fanout_reaches_every_channel() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t").unwrap();
    let c1 = topic.get_channel("c1").unwrap();
    let c2 = topic.get_channel("c2").unwrap();

    let m = Message::new(topic.generate_id(), b"hello".to_vec());
    topic.put_message(m).await.unwrap();

    // the pump copies to both channels; no consumers, so both hold one
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(c1.depth(), 1);
    assert_eq!(c2.depth(), 1);
    assert_eq!(topic.depth(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn deliver_then_fin_empties_channel() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();
    channel.wake();

    let m = Message::new(topic.generate_id(), b"hello".to_vec());
    topic.put_message(m).await.unwrap();

    let got = recv_message(&mut rx).await;
    assert_eq!(got.body, b"hello");
    assert_eq!(got.attempts, 1);
    assert_eq!(channel.in_flight_count(), 1);
    assert_eq!(channel.depth(), 0);

    channel.finish_message(client.id, got.id).unwrap();
    client.finished_message();
    assert_eq!(channel.in_flight_count(), 0);
    assert_eq!(channel.depth(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn message_lives_in_exactly_one_store() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();

    let m = Message::new(topic.generate_id(), b"x".to_vec());
    topic.put_message(m).await.unwrap();
    let got = recv_message(&mut rx).await;

    // in flight only
    assert_eq!(channel.in_flight_count(), 1);
    assert_eq!(channel.deferred_count(), 0);
    assert_eq!(channel.depth(), 0);

    // requeue with a delay: deferred only; stop the client from
    // immediately pulling it back
    client.set_ready_count(0);
    client.requeued_message();
    channel
        .requeue_message(client.id, got.id, ems_utils::time::ms_to_ns(10_000))
        .await
        .unwrap();
    assert_eq!(channel.in_flight_count(), 0);
    assert_eq!(channel.deferred_count(), 1);
    assert_eq!(channel.depth(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_clears_all_stores() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();

    // one in flight
    topic
        .put_message(Message::new(topic.generate_id(), b"a".to_vec()))
        .await
        .unwrap();
    let _ = recv_message(&mut rx).await;
    // one deferred
    channel.put_message_deferred(
        Message::new(topic.generate_id(), b"b".to_vec()),
        ems_utils::time::ms_to_ns(10_000),
    );
    // several queued, with the client unable to take them
    client.set_ready_count(0);
    for _ in 0..3 {
        channel
            .put_message(Message::new(topic.generate_id(), b"c".to_vec()))
            .await
            .unwrap();
    }

    channel.empty().await.unwrap();
    assert_eq!(channel.depth(), 0);
    assert_eq!(channel.in_flight_count(), 0);
    assert_eq!(channel.deferred_count(), 0);
    assert_eq!(client.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unacked_message_is_redelivered_with_bumped_attempts() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();
    tokio::spawn(scanner::queue_scan_loop(Arc::clone(&engine)));

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();

    topic
        .put_message(Message::new(topic.generate_id(), b"retry-me".to_vec()))
        .await
        .unwrap();

    let first = recv_message(&mut rx).await;
    assert_eq!(first.attempts, 1);
    // deliberately never FIN: the 100ms in-flight timeout must fire

    let second = recv_message(&mut rx).await;
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempts, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn touch_cannot_outlive_max_msg_timeout() {
    let dir = TempDir::new().unwrap();
    let mut settings = test_settings(&dir);
    settings.client.msg_timeout_ms = 50;
    settings.client.max_msg_timeout_ms = 150;
    let engine = Engine::new(settings);
    engine.start();
    tokio::spawn(scanner::queue_scan_loop(Arc::clone(&engine)));

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();

    topic
        .put_message(Message::new(topic.generate_id(), b"touchy".to_vec()))
        .await
        .unwrap();
    let first = recv_message(&mut rx).await;

    // ask for an hour; the ceiling clamps to timestamp + 150ms
    channel
        .touch_message(client.id, first.id, ems_utils::time::ms_to_ns(3_600_000))
        .unwrap();

    let started = Instant::now();
    let second = recv_message(&mut rx).await;
    assert_eq!(second.id, first.id);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "clamped TOUCH must still expire promptly"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_fin_single_winner() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();

    topic
        .put_message(Message::new(topic.generate_id(), b"once".to_vec()))
        .await
        .unwrap();
    let got = recv_message(&mut rx).await;

    let c1 = Arc::clone(&channel);
    let c2 = Arc::clone(&channel);
    let (id, cid) = (got.id, client.id);
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { c1.finish_message(cid, id) }),
        tokio::spawn(async move { c2.finish_message(cid, id) }),
    );
    let results = [r1.unwrap(), r2.unwrap()];
    let oks = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(oks, 1, "exactly one FIN may win: {results:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_message_honors_its_delay() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();
    tokio::spawn(scanner::queue_scan_loop(Arc::clone(&engine)));

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();

    let started = Instant::now();
    let mut m = Message::new(topic.generate_id(), b"later".to_vec());
    m.deferred_ns = ems_utils::time::ms_to_ns(150);
    topic.put_message(m).await.unwrap();

    let got = recv_message(&mut rx).await;
    let elapsed = started.elapsed();
    assert_eq!(got.body, b"later");
    assert!(elapsed >= Duration::from_millis(150), "delivered early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "delivered late: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_consumers_split_the_stream_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (a, mut rx_a) = make_client(&engine, 5);
    let (b, mut rx_b) = make_client(&engine, 5);
    channel.add_client(Arc::clone(&a)).unwrap();
    channel.add_client(Arc::clone(&b)).unwrap();

    let total = 100;
    for i in 0..total {
        topic
            .put_message(Message::new(
                topic.generate_id(),
                format!("m{i}").into_bytes(),
            ))
            .await
            .unwrap();
    }

    let mut seen = HashSet::new();
    let mut from_a = 0;
    let mut from_b = 0;
    while from_a + from_b < total {
        tokio::select! {
            Some(OutFrame::Message(p)) = rx_a.recv() => {
                let m = Message::decode(&p).unwrap();
                assert!(seen.insert(m.id), "duplicate delivery {}", m.id);
                channel.finish_message(a.id, m.id).unwrap();
                a.finished_message();
                from_a += 1;
            }
            Some(OutFrame::Message(p)) = rx_b.recv() => {
                let m = Message::decode(&p).unwrap();
                assert!(seen.insert(m.id), "duplicate delivery {}", m.id);
                channel.finish_message(b.id, m.id).unwrap();
                b.finished_message();
                from_b += 1;
            }
            _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("stalled at {}", from_a + from_b),
        }
    }
    assert_eq!(from_a + from_b, total);
    assert!(from_a > 0 && from_b > 0, "both consumers should share work");
}

#[tokio::test(flavor = "multi_thread")]
async fn overflow_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut settings = test_settings(&dir);
    settings.queue.mem_queue_size = 2;

    {
        let engine = Engine::new(settings.clone());
        engine.start();
        let topic = engine.get_topic("t").unwrap();
        for i in 0..5 {
            topic
                .put_message(Message::new(
                    topic.generate_id(),
                    format!("m{i}").into_bytes(),
                ))
                .await
                .unwrap();
        }
        assert_eq!(topic.depth(), 5);
        assert_eq!(topic.stats().backend_depth, 3);
        engine.exit().await;
    }

    let engine = Engine::new(settings);
    engine.load_metadata().unwrap();
    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c1").unwrap();
    engine.start();

    let (client, mut rx) = make_client(&engine, 5);
    channel.add_client(Arc::clone(&client)).unwrap();

    let mut received = 0;
    while received < 5 {
        let m = recv_message(&mut rx).await;
        channel.finish_message(client.id, m.id).unwrap();
        client.finished_message();
        received += 1;
    }
    assert_eq!(channel.depth(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_restart_preserves_topology_and_pause_flags() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir);

    {
        let engine = Engine::new(settings.clone());
        engine.start();
        let topic = engine.get_topic("orders").unwrap();
        topic.get_channel("billing").unwrap();
        let audit = topic.get_channel("audit").unwrap();
        audit.pause();
        let clicks = engine.get_topic("clicks").unwrap();
        clicks.pause();
        engine.exit().await;
    }

    let engine = Engine::new(settings);
    engine.load_metadata().unwrap();

    let orders = engine.get_existing_topic("orders").unwrap();
    assert!(!orders.is_paused());
    assert!(!orders.get_existing_channel("billing").unwrap().is_paused());
    assert!(orders.get_existing_channel("audit").unwrap().is_paused());
    assert!(engine.get_existing_topic("clicks").unwrap().is_paused());
}

#[tokio::test(flavor = "multi_thread")]
async fn ephemeral_topic_and_channel_leave_no_trace() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t#ephemeral").unwrap();
    let channel = topic.get_channel("c#ephemeral").unwrap();
    assert!(topic.is_ephemeral());
    assert!(channel.is_ephemeral());

    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();
    topic
        .put_message(Message::new(topic.generate_id(), b"gone-soon".to_vec()))
        .await
        .unwrap();
    let got = recv_message(&mut rx).await;
    channel.finish_message(client.id, got.id).unwrap();

    // consumer leaves: the transport tears the pair down
    channel.remove_client(client.id);
    if channel.is_ephemeral() && channel.client_count() == 0 {
        topic.delete_existing_channel(&channel.name).await.unwrap();
    }
    if topic.is_ephemeral() && topic.channel_count() == 0 {
        engine.delete_existing_topic(&topic.name).await.unwrap();
    }
    assert!(engine.get_existing_topic("t#ephemeral").is_err());

    // nothing of the ephemeral pair may touch the data dir
    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains("ephemeral"))
        .collect();
    assert!(files.is_empty(), "ephemeral files on disk: {files:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_close_persists_in_flight_work() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();

    topic
        .put_message(Message::new(topic.generate_id(), b"precious".to_vec()))
        .await
        .unwrap();
    let _ = recv_message(&mut rx).await;
    assert_eq!(channel.in_flight_count(), 1);

    channel.close().await.unwrap();

    // the in-flight message was written back to the channel's backend
    let reopened = ems_persistence::DiskQueue::new(
        "t;c",
        dir.path(),
        crate::engine::queue_options(&engine.opts()),
    )
    .unwrap();
    assert_eq!(reopened.depth(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_channel_buffers_until_unpause()  {
    let dir = TempDir::new().unwrap();
    let engine = Engine::new(test_settings(&dir));
    engine.start();

    let topic = engine.get_topic("t").unwrap();
    let channel = topic.get_channel("c").unwrap();
    channel.pause();

    let (client, mut rx) = make_client(&engine, 1);
    channel.add_client(Arc::clone(&client)).unwrap();

    topic
        .put_message(Message::new(topic.generate_id(), b"held".to_vec()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.depth(), 1, "paused channel must hold the message");
    assert!(rx.try_recv().is_err());

    channel.unpause();
    let got = recv_message(&mut rx).await;
    assert_eq!(got.body, b"held");
}
