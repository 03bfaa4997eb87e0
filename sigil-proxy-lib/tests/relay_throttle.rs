use std::time::{Duration, Instant};

use sigil_proxy_lib::limit::ThrottledStream;
use sigil_proxy_lib::relay::relay;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const IDLE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn relays_both_directions_and_counts_bytes() {
    let (mut client, a) = tokio::io::duplex(4096);
    let (b, mut server) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    let session = tokio::spawn(relay(a, b, cancel, IDLE));

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    server.write_all(b"world!").await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world!");

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();

    let counts = session.await.unwrap();
    assert_eq!(counts.a_to_b, 5);
    assert_eq!(counts.b_to_a, 6);
    assert_eq!(counts.total(), 11);
}

#[tokio::test]
async fn half_close_lets_the_other_direction_finish() {
    let (mut client, a) = tokio::io::duplex(4096);
    let (b, mut server) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    let session = tokio::spawn(relay(a, b, cancel, IDLE));

    client.write_all(b"request").await.unwrap();
    let mut buf = [0u8; 7];
    server.read_exact(&mut buf).await.unwrap();

    // Client finishes sending; the server must observe EOF...
    client.shutdown().await.unwrap();
    let mut end = [0u8; 1];
    assert_eq!(server.read(&mut end).await.unwrap(), 0);

    // ...and can still deliver its response afterwards.
    server.write_all(b"response").await.unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"response");

    server.shutdown().await.unwrap();
    let counts = session.await.unwrap();
    assert_eq!(counts.a_to_b, 7);
    assert_eq!(counts.b_to_a, 8);
}

#[tokio::test]
async fn cancellation_tears_the_session_down() {
    let (mut client, a) = tokio::io::duplex(4096);
    let (b, _server) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    let session = tokio::spawn(relay(a, b, cancel.clone(), IDLE));

    client.write_all(b"data").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let counts = tokio::time::timeout(Duration::from_secs(1), session)
        .await
        .expect("relay must return promptly after cancel")
        .unwrap();
    // Bytes moved before the cancel are still reported.
    assert_eq!(counts.a_to_b, 4);
}

#[tokio::test]
async fn idle_deadline_closes_a_stalled_session() {
    let (_client, a) = tokio::io::duplex(4096);
    let (b, _server) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();

    let counts = tokio::time::timeout(
        Duration::from_secs(2),
        relay(a, b, cancel, Duration::from_millis(50)),
    )
    .await
    .expect("idle deadline must fire");
    assert_eq!(counts.total(), 0);
}

#[tokio::test]
async fn throttle_at_zero_is_pass_through() {
    let (a, mut b) = tokio::io::duplex(4096);
    let mut throttled = ThrottledStream::new(a, 0);

    throttled.write_all(b"unpaced").await.unwrap();
    let mut buf = [0u8; 7];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"unpaced");

    b.write_all(b"reply").await.unwrap();
    let mut buf = [0u8; 5];
    throttled.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"reply");
}

#[tokio::test]
async fn throttle_paces_past_the_initial_burst() {
    // 1 Mbps -> 131072-byte bucket. Pushing 256 KiB spends the burst and
    // forces roughly a second of pacing for the rest.
    const TOTAL: usize = 256 * 1024;
    let (a, mut b) = tokio::io::duplex(64 * 1024);
    let mut throttled = ThrottledStream::new(a, 1);

    let started = Instant::now();
    let writer = tokio::spawn(async move {
        let chunk = vec![0xabu8; 8 * 1024];
        let mut sent = 0;
        while sent < TOTAL {
            throttled.write_all(&chunk).await.unwrap();
            sent += chunk.len();
        }
        throttled.shutdown().await.unwrap();
    });

    let mut received = 0;
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = b.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received += n;
    }
    writer.await.unwrap();

    assert_eq!(received, TOTAL);
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "transfer finished implausibly fast for the configured rate"
    );
}
