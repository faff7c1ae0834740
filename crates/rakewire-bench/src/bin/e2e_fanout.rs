//! End-to-end fan-out benchmark for Rakewire.
//!
//! Connects a set of subscribers to a running server and relays `message`
//! frames from one publisher through a shared channel, counting deliveries
//! over real WebSocket I/O.
//!
//! ```bash
//! JWT_SECRET=... cargo run --release -p rakewire-server
//! JWT_SECRET=... cargo run --release -p rakewire-bench --bin e2e_fanout -- 256
//! ```

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use rakewire_core::{Claims, Role};
use rakewire_protocol::{codec, ClientFrame, ServerFrame};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const CHANNEL: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_subscribers = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(64);

    let secret = std::env::var("JWT_SECRET").unwrap_or_default();
    if secret.is_empty() {
        eprintln!("JWT_SECRET must match the server's secret");
        std::process::exit(1);
    }

    println!("Rakewire end-to-end fan-out benchmark");
    println!("  server: {SERVER_URL}");
    println!("  subscribers: {num_subscribers}, warmup: {WARMUP_SECS}s, measurement: {BENCH_SECS}s");
    println!();

    if let Err(e) = run_fanout_benchmark(num_subscribers, &secret).await {
        eprintln!("Benchmark failed: {e}");
        std::process::exit(1);
    }
}

async fn run_fanout_benchmark(num_subscribers: usize, secret: &str) -> Result<(), BoxError> {
    let deliveries = Arc::new(AtomicU64::new(0));
    let published = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_subscribers + 2));

    let mut handles = Vec::new();

    for subscriber_id in 0..num_subscribers {
        let token = mint_token(secret, &format!("bench-sub-{subscriber_id}"))?;
        let deliveries = Arc::clone(&deliveries);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_subscriber(token, deliveries, barrier).await {
                eprintln!("Subscriber {subscriber_id} error: {e}");
            }
        }));
    }

    let token = mint_token(secret, "bench-publisher")?;
    let publisher_count = Arc::clone(&published);
    let publisher_barrier = Arc::clone(&barrier);
    handles.push(tokio::spawn(async move {
        if let Err(e) = run_publisher(token, publisher_count, publisher_barrier).await {
            eprintln!("Publisher error: {e}");
        }
    }));

    barrier.wait().await;
    println!("All {num_subscribers} subscribers started on {CHANNEL}");

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    deliveries.store(0, Ordering::SeqCst);
    published.store(0, Ordering::SeqCst);
    let start = Instant::now();

    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let delivered = deliveries.load(Ordering::SeqCst);
    let sent = published.load(Ordering::SeqCst);

    println!();
    println!("Results");
    println!("  duration:        {elapsed:>12.2}s");
    println!("  published:       {sent:>12}");
    println!("  delivered:       {delivered:>12}");
    println!("  publish rate:    {:>12.0} msg/s", sent as f64 / elapsed);
    println!("  delivery rate:   {:>12.0} msg/s", delivered as f64 / elapsed);
    if sent > 0 {
        println!(
            "  fan-out ratio:   {:>12.2}",
            delivered as f64 / sent as f64
        );
    }

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

fn mint_token(secret: &str, user_id: &str) -> Result<String, BoxError> {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + 3600;
    let claims = Claims {
        user_id: user_id.to_string(),
        role: Some(Role::User),
        exp,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Connect and wait for the subscribe ack.
async fn join(
    token: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    BoxError,
> {
    let (mut ws, _) = connect_async(format!("{SERVER_URL}?token={token}")).await?;

    let subscribe = codec::encode_client(&ClientFrame::subscribe(CHANNEL))?;
    ws.send(Message::Text(subscribe)).await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => match codec::decode_server(&text)? {
                ServerFrame::Subscribed { .. } => return Ok(ws),
                ServerFrame::Error { message } => return Err(message.into()),
                _ => {}
            },
            Message::Close(frame) => return Err(format!("closed: {frame:?}").into()),
            _ => {}
        }
    }
    Err("connection ended before subscribe ack".into())
}

async fn run_subscriber(
    token: String,
    deliveries: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    // Every task reaches the barrier, joined or not.
    let joined = join(&token).await;
    barrier.wait().await;
    let mut ws = joined?;

    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg? {
            if let Ok(ServerFrame::Message { .. }) = codec::decode_server(&text) {
                deliveries.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    Ok(())
}

async fn run_publisher(
    token: String,
    published: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let joined = join(&token).await;
    barrier.wait().await;
    let (mut sender, mut receiver) = joined?.split();

    // The publisher is a member too; keep its echoes from backing up.
    let drain = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    let frame = ClientFrame::message(CHANNEL, json!({"rakeId": 1, "lat": 19.07, "lng": 72.87}));
    let text = codec::encode_client(&frame)?;

    loop {
        if sender.send(Message::Text(text.clone())).await.is_err() {
            break;
        }
        published.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
    }

    drain.abort();
    Ok(())
}
