use std::path::{Path, PathBuf};

use bagplay_format::BagMetadata;
use bagplay_player::{FileSource, OptionsUpdate, Player};
use clap::Parser;
use eyre::Context;

#[derive(Debug, clap::Parser)]
#[clap(version, about = "Inspect and play back ROS bag v2.0 files")]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Print the connections and chunk layout of a bag file.
    Info {
        bag: PathBuf,
        /// Dump the full metadata as JSON instead of a summary.
        #[clap(long)]
        json: bool,
    },
    /// Decode the bag and stream its messages to stdout as JSON lines.
    Play {
        bag: PathBuf,
        /// Bag seconds advanced per wall-clock second.
        #[clap(long, default_value_t = 1.0)]
        speed: f64,
        /// Seconds of bag time decoded ahead of the play head.
        #[clap(long, default_value_t = 10.0)]
        prefetch: f64,
        /// Stop at the end of the bag instead of looping.
        #[clap(long)]
        no_loop: bool,
        /// Start offset in seconds from the beginning of the bag.
        #[clap(long)]
        start: Option<f64>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    set_up_tracing().wrap_err("failed to set up tracing subscriber")?;

    match Args::parse().command {
        Command::Info { bag, json } => info(bag, json).await,
        Command::Play {
            bag,
            speed,
            prefetch,
            no_loop,
            start,
        } => play(bag, speed, prefetch, no_loop, start).await,
    }
}

async fn info(bag: PathBuf, json: bool) -> eyre::Result<()> {
    let source = FileSource::open(&bag)
        .await
        .wrap_err_with(|| format!("failed to open {}", bag.display()))?;
    let handle = Player::spawn();
    let metadata = handle
        .load_file(source)
        .await
        .wrap_err_with(|| format!("failed to load {}", bag.display()))?;
    handle.destroy().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&*metadata)?);
        return Ok(());
    }
    print_summary(&bag, &metadata);
    Ok(())
}

fn print_summary(bag: &Path, metadata: &BagMetadata) {
    println!("file:      {}", bag.display());
    println!(
        "duration:  {:.3}s ({} .. {})",
        metadata.duration_secs(),
        metadata.start_time,
        metadata.end_time
    );
    let span: u64 = metadata.chunks_info.iter().map(|c| c.span_bytes()).sum();
    println!(
        "chunks:    {} ({:.1} MiB on disk)",
        metadata.chunks_info.len(),
        span as f64 / (1024.0 * 1024.0)
    );

    let counts = metadata.message_counts();
    let mut connections: Vec<_> = metadata.connections.values().collect();
    connections.sort_by_key(|connection| connection.conn);
    println!("connections:");
    for connection in connections {
        println!(
            "  #{:<4} {:<40} {:<30} {} msgs",
            connection.conn,
            connection.topic,
            connection.message_type,
            counts.get(&connection.conn).copied().unwrap_or(0)
        );
    }
}

async fn play(
    bag: PathBuf,
    speed: f64,
    prefetch: f64,
    no_loop: bool,
    start: Option<f64>,
) -> eyre::Result<()> {
    let source = FileSource::open(&bag)
        .await
        .wrap_err_with(|| format!("failed to open {}", bag.display()))?;
    let handle = Player::spawn();
    let metadata = handle
        .load_file(source)
        .await
        .wrap_err_with(|| format!("failed to load {}", bag.display()))?;
    tracing::info!(
        topics = metadata.connections.len(),
        duration = metadata.duration_secs(),
        "playing {}",
        bag.display()
    );

    handle
        .update_options(OptionsUpdate {
            speed: Some(speed),
            prefetch_secs: Some(prefetch),
            looping: Some(!no_loop),
        })
        .await;
    let mut messages_rx = handle.subscribe_messages().await;
    if let Some(offset) = start {
        handle.seek(metadata.start_time.add_secs(offset)).await;
    }
    handle.play().await;

    loop {
        tokio::select! {
            batch = messages_rx.recv() => {
                let Some(batch) = batch else {
                    break;
                };
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                for message in batch.iter() {
                    use std::io::Write;
                    serde_json::to_writer(&mut lock, message)?;
                    writeln!(lock)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, stopping playback");
                break;
            }
        }
    }
    handle.destroy().await;
    Ok(())
}

fn set_up_tracing() -> eyre::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_log = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let subscriber = tracing_subscriber::Registry::default()
        .with(filter)
        .with(stderr_log);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing global subscriber")
}
