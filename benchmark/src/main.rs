use clap::Parser;
use hdrhistogram::Histogram;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// INTERVAL ms
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:4000")]
    server: String,

    /// Number of distinct keys
    #[arg(short, long, default_value = "10000")]
    keys: u64,

    /// Percentage of requests that are GETs
    #[arg(short, long, default_value = "50")]
    read_ratio: u8,
}

fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Reads one reply and fails on an error reply.
async fn read_reply(reader: &mut BufReader<TcpStream>) -> anyhow::Result<()> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        anyhow::bail!("connection closed");
    }
    match line.as_bytes().first() {
        Some(b'-') => anyhow::bail!("{}", line.trim_end()),
        Some(b'$') => {
            let len: i64 = line[1..].trim_end().parse()?;
            if len >= 0 {
                let mut body = vec![0u8; len as usize + 2];
                reader.read_exact(&mut body).await?;
            }
        }
        Some(b'+') | Some(b':') => {}
        _ => anyhow::bail!("unexpected reply {:?}", line),
    }
    Ok(())
}

async fn run_client(
    args: Arc<Args>,
    histogram: Arc<Mutex<Histogram<u64>>>,
    total_requests: Arc<Mutex<u64>>,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect(&args.server).await?;
    let mut stream = BufReader::new(stream);
    let value = vec![b'x'; 64];

    loop {
        let (key, is_read) = {
            let mut rng = rand::thread_rng();
            let key = format!("kbench:{}", rng.gen_range(0..args.keys.max(1)));
            (key, rng.gen_range(0..100u8) < args.read_ratio)
        };
        let request = if is_read {
            encode_command(&[&b"GET"[..], key.as_bytes()])
        } else {
            encode_command(&[&b"SET"[..], key.as_bytes(), &value[..]])
        };

        let start = Instant::now();
        stream.get_mut().write_all(&request).await?;
        match read_reply(&mut stream).await {
            Ok(()) => {
                let duration = start.elapsed();
                let mut hist = histogram.lock().await;
                hist.record(duration.as_micros() as u64)?;
                let mut total = total_requests.lock().await;
                *total += 1;
            }
            Err(e) => eprintln!("Request failed: {}", e),
        }

        if args.interval > 0 {
            sleep(Duration::from_millis(args.interval)).await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arc::new(Args::parse());

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, target INTERVAL: {}",
        args.concurrency, args.interval
    );

    // Spawn client tasks
    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let args = args.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(args, histogram, total_requests).await {
                eprintln!("Client stopped: {}", e);
            }
        }));
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    // Print statistics
    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration.max(1) as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
