use std::{error::Error, io::BufRead, net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use mitosis::{
    broker::Broker,
    config::{BrokerConfig, ControllerConfig, WorkerConfig},
    controller::{pgm::PgmImages, Controller, Event},
    net::BROKER_PORT,
    worker::Worker,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "mitosis",
    about = "Distributed Game of Life over QUIC",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Coordinate runs across registered workers.
    Broker(BrokerArgs),
    /// Compute partitions for a broker.
    Worker(WorkerArgs),
    /// Run a simulation from a PGM image. Keys on stdin: p, s, q, k.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct BrokerArgs {
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], BROKER_PORT)))]
    listen: SocketAddr,
    /// Per-partition deadline in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    dispatch_timeout_ms: u64,
    #[arg(long, default_value_t = 1)]
    turn_retries: u32,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], 0)))]
    listen: SocketAddr,
    /// Address the broker should dial back, if not the listen address.
    #[arg(long)]
    advertise: Option<String>,
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], BROKER_PORT)))]
    broker: SocketAddr,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], BROKER_PORT)))]
    broker: SocketAddr,
    #[arg(long, default_value_t = 512)]
    width: u32,
    /// Defaults to the width.
    #[arg(long)]
    height: Option<u32>,
    #[arg(long, default_value_t = 100)]
    turns: u32,
    /// Directory holding `{width}x{height}.pgm`.
    #[arg(long, default_value = "images")]
    images: PathBuf,
    #[arg(long, default_value = "out")]
    out: PathBuf,
}

async fn broker(args: BrokerArgs) -> Result<(), Box<dyn Error>> {
    let config = BrokerConfig::builder()
        .listen(args.listen)
        .dispatch_timeout(Duration::from_millis(args.dispatch_timeout_ms))
        .turn_retries(args.turn_retries)
        .build();
    Broker::bind(config)?.serve().await?;
    Ok(())
}

async fn worker(args: WorkerArgs) -> Result<(), Box<dyn Error>> {
    let config = match args.advertise {
        Some(advertise) => WorkerConfig::builder()
            .listen(args.listen)
            .broker(args.broker)
            .advertise(advertise)
            .build(),
        None => WorkerConfig::builder()
            .listen(args.listen)
            .broker(args.broker)
            .build(),
    };
    Worker::run(config).await?;
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let config = ControllerConfig::builder()
        .broker(args.broker)
        .width(args.width)
        .height(args.height.unwrap_or(args.width))
        .turns(args.turns)
        .build();

    let (keys_tx, keys_rx) = mpsc::channel(16);
    // a plain thread, so a blocked stdin read never holds up exit
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { return };
            for c in line.chars().filter(|c| !c.is_whitespace()) {
                if keys_tx.blocking_send(c).is_err() {
                    return;
                }
            }
        }
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                Event::StateChange { turn, state } => {
                    println!("turn {turn}: {state:?}")
                }
                Event::AliveCellsCount { turn, count } => {
                    println!("turn {turn}: {count} cells alive")
                }
                Event::ImageOutputComplete { turn, filename } => {
                    println!("turn {turn}: wrote {filename}.pgm")
                }
                Event::FinalTurnComplete { turn, alive } => {
                    println!("finished after {turn} turns with {} cells alive", alive.len())
                }
            }
        }
    });

    let images = PgmImages::new(args.images, args.out);
    let controller = Controller::new(config, images.clone(), images, events_tx);
    let report = controller.run(keys_rx).await?;
    drop(controller);
    if printer.await.is_err() {
        warn!("event printer panicked");
    }
    info!(turns = report.completed_turns, status = ?report.status, "done");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Commands::Broker(args) => broker(args).await,
        Commands::Worker(args) => worker(args).await,
        Commands::Run(args) => run(args).await,
    }
}
