use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const BASE: i64 = 4_102_444_800_000; // 2100-01-01T00:00:00Z

async fn connect(host: &str, port: u16, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("gatehouse")
        .user("bench")
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn ts(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .expect("timestamp in range")
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Slot `n` hours after the base, one hour minus a second long.
fn slot(n: i64) -> (String, String) {
    let start = BASE + n * HOUR;
    (ts(start), ts(start + HOUR - 1000))
}

async fn create_place(client: &Client, label: &str) -> String {
    let rows = client
        .simple_query(&format!(
            r#"INSERT INTO places (name, address, city, state, gates) VALUES ('{label} {}', '1 Bench Rd', 'Loadtown', 'LT', '[{{"name":"Main"}}]')"#,
            Ulid::new()
        ))
        .await
        .unwrap();
    rows.into_iter()
        .find_map(|m| match m {
            tokio_postgres::SimpleQueryMessage::Row(r) => r.get("id").map(str::to_string),
            _ => None,
        })
        .expect("place row")
}

async fn insert_event(client: &Client, place: &str, n: i64) -> Result<(), tokio_postgres::Error> {
    let (start, end) = slot(n);
    client
        .batch_execute(&format!(
            "INSERT INTO events (place_id, event, email, phone, type, date_start, date_end) \
             VALUES ('{place}', 'bench {}', 'bench@load.test', '555-0199', 'bench', '{start}', '{end}')",
            Ulid::new()
        ))
        .await
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(host: &str, port: u16, password: &str) {
    let client = connect(host, port, password).await;
    let place = create_place(&client, "sequential").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        insert_event(&client, &place, i).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} events in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("admission latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16, password: &str) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let (host, password) = (host.to_string(), password.to_string());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let place = create_place(&client, "concurrent").await;
            for j in 0..n_per_task {
                insert_event(&client, &place, j).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} places x {n_per_task} events = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Many clients race for the same window at one place; one must win.
async fn phase3_contention(host: &str, port: u16, password: &str) {
    let setup = connect(host, port, password).await;
    let place = Arc::new(create_place(&setup, "contended").await);
    let rounds = 50;
    let racers = 20;
    let mut violations = 0;

    let start = Instant::now();
    for round in 0..rounds {
        let winners = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..racers {
            let (host, password) = (host.to_string(), password.to_string());
            let (place, winners) = (place.clone(), winners.clone());
            handles.push(tokio::spawn(async move {
                let client = connect(&host, port, &password).await;
                if insert_event(&client, &place, round).await.is_ok() {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        if winners.load(Ordering::Relaxed) != 1 {
            violations += 1;
        }
    }
    println!(
        "  {rounds} rounds x {racers} racers in {:.2}s, rounds without exactly one winner: {violations}",
        start.elapsed().as_secs_f64()
    );
}

async fn phase4_list_under_load(host: &str, port: u16, password: &str) {
    let setup = connect(host, port, password).await;
    let place = create_place(&setup, "listed").await;
    for i in 0..200 {
        insert_event(&setup, &place, i).await.unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let (host, password) = (host.to_string(), password.to_string());
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let own = create_place(&client, "writer").await;
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = insert_event(&client, &own, i).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let (host, password, place) = (host.to_string(), password.to_string(), place.clone());
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let page = (i % 10) + 1;
                let order = if r % 2 == 0 { "date_start desc" } else { "event asc" };
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM events WHERE place_id = '{place}' AND "order" = '{order}' AND page = {page} AND "limit" = 20"#
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("paged list query", &mut all_latencies);
}

async fn phase5_connection_storm(host: &str, port: u16, password: &str) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let (host, password) = (host.to_string(), password.to_string());
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let place = create_place(&client, "storm").await;
            for i in 0..ops_per_conn {
                insert_event(&client, &place, i).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("GATEHOUSE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("GATEHOUSE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid GATEHOUSE_PORT");
    let password = std::env::var("GATEHOUSE_PASSWORD").unwrap_or_else(|_| "gatehouse".into());

    println!("=== gatehouse stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Every phase works on freshly named places, so runs can repeat against
    // the same server.

    println!("[phase 1] sequential admission throughput");
    phase1_sequential(&host, port, &password).await;

    println!("\n[phase 2] concurrent admission across places");
    phase2_concurrent(&host, port, &password).await;

    println!("\n[phase 3] contention on one window");
    phase3_contention(&host, port, &password).await;

    println!("\n[phase 4] list latency under write load");
    phase4_list_under_load(&host, port, &password).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port, &password).await;

    println!("\n=== benchmark complete ===");
}
