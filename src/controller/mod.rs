// The local side of a run: loads the starting grid, submits it to the
// broker, reports progress on a timer and turns key presses into control
// commands. Everything the controller learns goes out as an `Event`.

pub mod pgm;

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    broker::control::ControlState,
    client::{BrokerClient, ClientError},
    config::ControllerConfig,
    grid::{Cell, Grid, GridError},
    net::wire::{Key, RunReport, SubmitRun},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where the starting grid comes from.
pub trait InputSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read_grid(&self, name: &str, width: usize, height: usize) -> Result<Grid, Self::Error>;
}

/// Where saved and final grids go.
pub trait OutputSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn write_grid(&self, name: &str, grid: &Grid) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StateChange { turn: u32, state: ControlState },
    AliveCellsCount { turn: u32, count: u64 },
    ImageOutputComplete { turn: u32, filename: String },
    FinalTurnComplete { turn: u32, alive: Vec<Cell> },
}

#[derive(Debug)]
pub enum ControllerError {
    Client(ClientError),
    Input(BoxError),
    Output(BoxError),
    /// The broker sent back a grid that doesn't hold together.
    Grid(GridError),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Client(e) => write!(f, "{e}"),
            ControllerError::Input(e) => write!(f, "could not read input: {e}"),
            ControllerError::Output(e) => write!(f, "could not write output: {e}"),
            ControllerError::Grid(e) => write!(f, "broker returned a bad grid: {e}"),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ClientError> for ControllerError {
    fn from(e: ClientError) -> Self {
        Self::Client(e)
    }
}

impl From<GridError> for ControllerError {
    fn from(e: GridError) -> Self {
        Self::Grid(e)
    }
}

/// Maps a key press to a command. `p` toggles, so it depends on whether the
/// run is currently paused.
pub fn key_for(c: char, paused: bool) -> Option<Key> {
    match c {
        'p' if paused => Some(Key::Resume),
        'p' => Some(Key::Pause),
        's' => Some(Key::Save),
        'q' => Some(Key::Quit),
        'k' => Some(Key::Kill),
        _ => None,
    }
}

pub struct Controller<I, O> {
    config: ControllerConfig,
    input: I,
    output: O,
    events: mpsc::UnboundedSender<Event>,
}

impl<I, O> Controller<I, O>
where
    I: InputSource,
    O: OutputSink,
{
    pub fn new(
        config: ControllerConfig,
        input: I,
        output: O,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            input,
            output,
            events,
        }
    }

    fn emit(&self, event: Event) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn stem(&self) -> String {
        format!("{}x{}", self.config.width, self.config.height)
    }

    fn save(&self, grid: &Grid, turn: u32) -> Result<(), ControllerError> {
        let filename = format!("{}x{turn}", self.stem());
        self.output
            .write_grid(&filename, grid)
            .map_err(|e| ControllerError::Output(Box::new(e)))?;
        info!(%filename, "image written");
        self.emit(Event::ImageOutputComplete { turn, filename });
        Ok(())
    }

    /// Runs one simulation on the broker, reading key presses from `keys`
    /// until it finishes.
    pub async fn run(&self, mut keys: mpsc::Receiver<char>) -> Result<RunReport, ControllerError> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let grid = self
            .input
            .read_grid(&self.stem(), width, height)
            .map_err(|e| ControllerError::Input(Box::new(e)))?;

        let client = BrokerClient::connect(self.config.broker)
            .await
            .map_err(ClientError::from)?;
        self.emit(Event::StateChange {
            turn: 0,
            state: ControlState::Executing,
        });

        let req = SubmitRun {
            rows: grid.to_rows(),
            width: self.config.width,
            height: self.config.height,
            turns: self.config.turns,
        };
        let submit = client.submit_run(req);
        tokio::pin!(submit);

        let mut ticker = tokio::time::interval(self.config.tick);
        // the first tick fires immediately
        ticker.tick().await;
        let mut paused = false;
        let mut keys_open = true;

        let report = loop {
            tokio::select! {
                report = &mut submit => break report?,
                _ = ticker.tick() => match client.query_alive().await {
                    Ok(alive) => self.emit(Event::AliveCellsCount {
                        turn: alive.turn,
                        count: alive.alive,
                    }),
                    Err(e) => warn!("alive query failed: {}", e),
                },
                key = keys.recv(), if keys_open => match key {
                    Some(c) => {
                        if let Err(e) = self.press(&client, c, &mut paused).await {
                            warn!(key = %c, "key press failed: {}", e);
                        }
                    }
                    None => keys_open = false,
                },
            }
        };

        let turn = report.completed_turns;
        info!(turn, status = ?report.status, "run returned");
        self.emit(Event::FinalTurnComplete {
            turn,
            alive: report.alive.clone(),
        });
        let last = Grid::try_from(report.grid.clone())?;
        self.save(&last, turn)?;
        self.emit(Event::StateChange {
            turn,
            state: ControlState::Quitting,
        });
        client.close();
        Ok(report)
    }

    async fn press(
        &self,
        client: &BrokerClient,
        c: char,
        paused: &mut bool,
    ) -> Result<(), ControllerError> {
        let Some(key) = key_for(c, *paused) else {
            debug!(key = %c, "ignoring key");
            return Ok(());
        };
        let report = client.send_key(key).await?;
        match key {
            Key::Pause | Key::Resume => {
                *paused = key == Key::Pause;
                let state = if *paused {
                    ControlState::Paused
                } else {
                    ControlState::Executing
                };
                self.emit(Event::StateChange {
                    turn: report.turn,
                    state,
                });
            }
            Key::Save => {
                if let Some(frame) = report.grid {
                    self.save(&Grid::try_from(frame)?, report.turn)?;
                }
            }
            Key::Quit | Key::Kill => self.emit(Event::StateChange {
                turn: report.turn,
                state: ControlState::Quitting,
            }),
        }
        Ok(())
    }
}
