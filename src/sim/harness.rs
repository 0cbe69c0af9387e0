//! CLI entry point for the simulation harness: plans a move list against
//! the simulated step executor and writes the executed blocks as CSV plus a
//! JSON summary.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use step_planner::config::{self, Config};
use step_planner::motion::kinematics::KinematicsType;
use step_planner::{AxisArray, Block, BlockQueue, EnqueueOutcome, Planner, SimulatedStepper};

type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Runs moves through the planner and a simulated step executor.")]
struct Cli {
    /// Path to a TOML config file (overrides defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for blocks.csv and summary.json
    #[arg(short, long, default_value = "./sim_output")]
    output: PathBuf,

    /// CSV move list with columns x,y,z,e,feed (absolute mm, mm/s)
    #[arg(long)]
    moves: Option<PathBuf>,

    /// Built-in move list used when --moves is not given
    #[arg(long, value_enum, default_value_t = Scenario::Square)]
    scenario: Scenario,

    /// Override the configured kinematics
    #[arg(long)]
    kinematics: Option<KinematicsType>,

    /// Number of moves generated for built-in scenarios
    #[arg(long, default_value_t = 200)]
    count: usize,

    /// Seed for the random scenario
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Simulated seconds per executor tick
    #[arg(long, default_value_t = 0.0005)]
    tick: f64,

    /// Simulated time per wall-clock time
    #[arg(long, default_value_t = 50.0)]
    time_scale: f64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available built-in scenarios
    ListScenarios,
    /// Run a single scenario (default)
    Run,
    /// Write the effective configuration as TOML
    DumpConfig { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Extruding perimeter of a 40 mm square
    Square,
    /// Short alternating segments that exercise look-ahead
    Zigzag,
    /// Back-and-forth travel on X
    Reversal,
    /// Seeded random travel
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
struct MoveRecord {
    x: f64,
    y: f64,
    z: f64,
    e: f64,
    feed: f64,
}

#[derive(Debug, Serialize)]
struct BlockRecord {
    index: usize,
    steps_x: u32,
    steps_y: u32,
    steps_z: u32,
    steps_e: u32,
    step_event_count: u32,
    millimeters: f64,
    nominal_speed: f64,
    entry_speed: f64,
    max_entry_speed: f64,
    nominal_rate: u32,
    initial_rate: u32,
    final_rate: u32,
    accelerate_until: u32,
    decelerate_after: u32,
    full_halt: bool,
}

impl BlockRecord {
    fn new(index: usize, block: &Block) -> Self {
        use step_planner::{Axis, BlockFlags};
        Self {
            index,
            steps_x: block.steps[Axis::X],
            steps_y: block.steps[Axis::Y],
            steps_z: block.steps[Axis::Z],
            steps_e: block.steps[Axis::E],
            step_event_count: block.step_event_count,
            millimeters: block.millimeters,
            nominal_speed: block.nominal_speed,
            entry_speed: block.entry_speed,
            max_entry_speed: block.max_entry_speed,
            nominal_rate: block.nominal_rate,
            initial_rate: block.initial_rate,
            final_rate: block.final_rate,
            accelerate_until: block.accelerate_until,
            decelerate_after: block.decelerate_after,
            full_halt: block.flags.contains(BlockFlags::START_FROM_FULL_HALT),
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    moves_requested: usize,
    moves_absorbed: usize,
    blocks_executed: u64,
    step_events: u64,
    simulated_seconds: f64,
    peak_step_rate: f64,
    executor_position: [i64; 4],
    planner_position: [i64; 4],
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            config::load_config(path)?
        }
        None => Config::default(),
    };
    if let Some(kinematics) = cli.kinematics {
        tracing::info!("Kinematics override: {:?}", kinematics);
        config.planner.kinematics = kinematics;
    }

    match &cli.command {
        Some(Commands::ListScenarios) => {
            println!("Available scenarios: square, zigzag, reversal, random");
            return Ok(());
        }
        Some(Commands::DumpConfig { path }) => {
            config::save_config(&config, path)?;
            tracing::info!("Configuration written to {}", path.display());
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let moves = match &cli.moves {
        Some(path) => read_moves(path)?,
        None => generate_moves(cli.scenario, cli.count, cli.seed),
    };
    tracing::info!("Running {} moves", moves.len());

    std::fs::create_dir_all(&cli.output)?;
    let (summary, blocks) = run(config, moves, cli.tick, cli.time_scale).await?;

    write_blocks(&cli.output.join("blocks.csv"), &blocks)?;
    std::fs::write(
        cli.output.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    tracing::info!(
        "Executed {} blocks ({} step events) in {:.3} s simulated",
        summary.blocks_executed,
        summary.step_events,
        summary.simulated_seconds
    );
    if summary.executor_position != summary.planner_position {
        tracing::warn!(
            "Executor ended at {:?}, planner expected {:?}",
            summary.executor_position,
            summary.planner_position
        );
    }
    Ok(())
}

async fn run(
    config: Config,
    moves: Vec<MoveRecord>,
    tick: f64,
    time_scale: f64,
) -> Result<(Summary, Vec<Block>), BoxError> {
    let queue = Arc::new(BlockQueue::new(config.planner.block_buffer_size));
    let stepper = SimulatedStepper::new(queue.clone()).with_history();
    let producer_done = Arc::new(AtomicBool::new(false));

    let executor = {
        let stepper = stepper.clone();
        let done = producer_done.clone();
        let per_interval = ((0.001 * time_scale / tick).ceil() as usize).max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1));
            loop {
                interval.tick().await;
                for _ in 0..per_interval {
                    stepper.tick(tick);
                }
                if done.load(Ordering::Acquire) && stepper.is_idle() {
                    break;
                }
            }
        })
    };

    let producer = {
        let stepper = stepper.clone();
        let done = producer_done.clone();
        tokio::task::spawn_blocking(move || {
            let result = plan_all(&config, queue, stepper, &moves);
            done.store(true, Ordering::Release);
            result
        })
    };

    let (requested, absorbed, planner_position) = producer.await??;
    executor.await?;

    let stats = stepper.stats();
    let summary = Summary {
        moves_requested: requested,
        moves_absorbed: absorbed,
        blocks_executed: stats.completed_blocks,
        step_events: stats.step_events,
        simulated_seconds: stats.elapsed,
        peak_step_rate: stats.peak_step_rate,
        executor_position: stepper.position().into_inner(),
        planner_position,
    };
    Ok((summary, stepper.take_history()))
}

fn plan_all(
    config: &Config,
    queue: Arc<BlockQueue>,
    stepper: SimulatedStepper,
    moves: &[MoveRecord],
) -> Result<(usize, usize, [i64; 4]), BoxError> {
    let mut planner = Planner::new(config, queue, stepper)?;
    planner.set_idle_hook(|| std::thread::sleep(Duration::from_micros(200)));

    let mut absorbed = 0;
    for mv in moves {
        let target = AxisArray::new(mv.x, mv.y, mv.z, mv.e);
        if planner.enqueue(target, mv.feed, 0)? == EnqueueOutcome::Absorbed {
            absorbed += 1;
        }
    }
    // The executor reports actuator steps.
    let actuator = planner.actuator_position()?;
    Ok((moves.len(), absorbed, actuator.into_inner()))
}

fn read_moves(path: &Path) -> Result<Vec<MoveRecord>, BoxError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut moves = Vec::new();
    for record in reader.deserialize() {
        let record: MoveRecord = record?;
        moves.push(record);
    }
    Ok(moves)
}

fn write_blocks(path: &Path, blocks: &[Block]) -> Result<(), BoxError> {
    let mut writer = csv::Writer::from_path(path)?;
    for (index, block) in blocks.iter().enumerate() {
        writer.serialize(BlockRecord::new(index, block))?;
    }
    writer.flush()?;
    Ok(())
}

fn generate_moves(scenario: Scenario, count: usize, seed: u64) -> Vec<MoveRecord> {
    let mut moves = Vec::with_capacity(count);
    match scenario {
        Scenario::Square => {
            let corners = [(40.0, 0.0), (40.0, 40.0), (0.0, 40.0), (0.0, 0.0)];
            let mut e = 0.0;
            for i in 0..count {
                let (x, y) = corners[i % corners.len()];
                e += 40.0 * 0.05;
                moves.push(MoveRecord { x, y, z: 0.2, e, feed: 60.0 });
            }
        }
        Scenario::Zigzag => {
            for i in 0..count {
                let y = if i % 2 == 0 { 0.5 } else { 0.0 };
                moves.push(MoveRecord { x: i as f64 * 0.5, y, z: 0.0, e: 0.0, feed: 80.0 });
            }
        }
        Scenario::Reversal => {
            for i in 0..count {
                let x = if i % 2 == 0 { 10.0 } else { 0.0 };
                moves.push(MoveRecord { x, y: 0.0, z: 0.0, e: 0.0, feed: 100.0 });
            }
        }
        Scenario::Random => {
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..count {
                moves.push(MoveRecord {
                    x: rng.random_range(0.0..200.0),
                    y: rng.random_range(0.0..200.0),
                    z: 0.0,
                    e: 0.0,
                    feed: rng.random_range(10.0..150.0),
                });
            }
        }
    }
    moves
}
