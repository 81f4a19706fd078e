use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use mitosis::{
    broker::Broker,
    client::{BrokerClient, ClientError},
    config::{BrokerConfig, ControllerConfig, WorkerConfig},
    controller::{Controller, Event, InputSource, OutputSink},
    grid::Grid,
    net::wire::{Key, RemoteErrorKind, RunStatus, SubmitRun},
    worker::Worker,
};
use tokio::{sync::mpsc, task::JoinHandle};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn start_broker() -> (Arc<Broker>, SocketAddr, JoinHandle<()>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let broker = Broker::bind(
        BrokerConfig::builder()
            .listen(loopback())
            .dispatch_timeout(Duration::from_secs(2))
            .shutdown_grace(Duration::from_secs(1))
            .build(),
    )
    .unwrap();
    let addr = broker.endpoint().unwrap().local_addr().unwrap();
    let serving = tokio::spawn({
        let broker = broker.clone();
        async move { broker.serve().await.unwrap() }
    });
    (broker, addr, serving)
}

async fn start_worker(broker: SocketAddr) -> (Arc<Worker>, JoinHandle<()>) {
    let worker = Worker::bind(WorkerConfig::builder().listen(loopback()).build()).unwrap();
    let serving = tokio::spawn(worker.clone().serve());
    worker.register(broker).await.unwrap();
    (worker, serving)
}

fn vertical_blinker() -> Grid {
    Grid::with_alive(5, 5, &[(2, 1), (2, 2), (2, 3)]).unwrap()
}

fn submit(grid: &Grid, turns: u32) -> SubmitRun {
    SubmitRun {
        rows: grid.to_rows(),
        width: grid.width() as u32,
        height: grid.height() as u32,
        turns,
    }
}

#[tokio::test]
async fn blinker_over_quic() {
    let (broker, addr, _serving) = start_broker().await;
    let _a = start_worker(addr).await;
    let _b = start_worker(addr).await;
    assert_eq!(broker.registry().live_count().await, 2);

    let client = BrokerClient::connect(addr).await.unwrap();
    let before = client.query_alive().await.unwrap();
    assert_eq!((before.turn, before.alive), (0, 0));

    let report = client.submit_run(submit(&vertical_blinker(), 3)).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.completed_turns, 3);
    let grid = Grid::try_from(report.grid).unwrap();
    assert_eq!(
        grid,
        Grid::with_alive(5, 5, &[(1, 2), (2, 2), (3, 2)]).unwrap()
    );
    assert_eq!(report.alive, grid.alive_cells());

    let after = client.query_alive().await.unwrap();
    assert_eq!((after.turn, after.alive), (3, 3));

    let saved = client.send_key(Key::Save).await.unwrap();
    assert_eq!(saved.turn, 3);
    assert_eq!(Grid::try_from(saved.grid.unwrap()).unwrap(), grid);
}

#[tokio::test]
async fn remote_errors_keep_their_kind() {
    let (_broker, addr, _serving) = start_broker().await;
    let client = BrokerClient::connect(addr).await.unwrap();

    match client.send_key(Key::Pause).await {
        Err(ClientError::Remote(e)) => assert_eq!(e.kind, RemoteErrorKind::NoActiveRun),
        other => panic!("expected a remote error, got {other:?}"),
    }
    match client.submit_run(submit(&vertical_blinker(), 1)).await {
        Err(ClientError::Remote(e)) => assert_eq!(e.kind, RemoteErrorKind::NoWorkers),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn kill_stops_broker_and_workers() {
    let (_broker, addr, serving) = start_broker().await;
    let (worker, worker_serving) = start_worker(addr).await;

    let client = BrokerClient::connect(addr).await.unwrap();
    client.submit_run(submit(&vertical_blinker(), 2)).await.unwrap();
    client.send_key(Key::Kill).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), worker.stopped())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker_serving)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap();
}

/// Images kept in memory, keyed by name.
#[derive(Clone, Default)]
struct Images(Arc<Mutex<HashMap<String, Grid>>>);

impl InputSource for Images {
    type Error = io::Error;

    fn read_grid(&self, name: &str, _: usize, _: usize) -> Result<Grid, io::Error> {
        self.0
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

impl OutputSink for Images {
    type Error = io::Error;

    fn write_grid(&self, name: &str, grid: &Grid) -> Result<(), io::Error> {
        self.0.lock().unwrap().insert(name.to_string(), grid.clone());
        Ok(())
    }
}

#[tokio::test]
async fn controller_runs_an_image_to_completion() {
    let (_broker, addr, _serving) = start_broker().await;
    let _a = start_worker(addr).await;
    let _b = start_worker(addr).await;

    let glider = Grid::with_alive(8, 8, &[(1, 0), (2, 1), (0, 2), (1, 2), (2, 2)]).unwrap();
    let images = Images::default();
    images.write_grid("8x8", &glider).unwrap();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_keys_tx, keys_rx) = mpsc::channel(1);
    let controller = Controller::new(
        ControllerConfig::builder()
            .broker(addr)
            .width(8)
            .height(8)
            .turns(32)
            .build(),
        images.clone(),
        images.clone(),
        events_tx,
    );
    let report = controller.run(keys_rx).await.unwrap();
    drop(controller);
    assert_eq!(report.completed_turns, 32);

    // after 32 turns a glider is back where it started, shifted by (8, 8)
    let output = images.0.lock().unwrap().get("8x8x32").cloned().unwrap();
    assert_eq!(output, glider);

    let mut events = Vec::new();
    while let Some(event) = events_rx.recv().await {
        events.push(event);
    }
    assert!(events.contains(&Event::ImageOutputComplete {
        turn: 32,
        filename: "8x8x32".into(),
    }));
    assert!(events.contains(&Event::FinalTurnComplete {
        turn: 32,
        alive: glider.alive_cells(),
    }));
}
