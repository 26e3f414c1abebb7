use clap::Parser;
use env_logger::{Env, Target};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use splatflow::demo::generate_demo_splats;
use splatflow::parser::dot_splat::SplatChunks;
use splatflow::parser::ply::{load_ply_file, AttributeEncoding};
use splatflow::splat::SplatAttributes;
use splatflow::worker::BootstrapStrategy;
use splatflow::{
    ChannelConfig, FrameOrchestrator, SchedulerConfig, SplatDataStore, StoreConfig, WorkerChannel,
};

mod input;
mod terminal_setup;
mod viewer;

use terminal_setup::{cleanup_terminal, enter_terminal, install_panic_hook};
use viewer::{Source, Viewer};

pub type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Parser)]
#[command(name = "splatflow", version, about = "Streams and depth-sorts Gaussian splat scenes")]
struct Cli {
    /// Path to a .ply or .splat scene file (runs demo if omitted)
    input: Option<PathBuf>,
    #[arg(long, value_name = "N", default_value_t = 30_000, help = "Points in the demo scene")]
    demo_points: usize,
    #[arg(long, help = "Seed for the demo scene")]
    seed: Option<u64>,
    #[arg(long, value_name = "MS", default_value_t = 0, help = "Per-call worker timeout, 0 waits forever")]
    timeout_ms: u64,
    #[arg(long, value_name = "MS", default_value_t = 200, help = "Minimum time between sorts")]
    interval_ms: u64,
    #[arg(long, value_name = "MS", default_value_t = 3000, help = "Re-sort period while the view is still")]
    stable_ms: u64,
    #[arg(long, value_name = "PX", default_value_t = 4096, help = "Largest texture edge")]
    max_texture_size: u32,
    #[arg(long, help = "Drop points outside the view frustum when sorting")]
    cull: bool,
    #[arg(long, value_name = "N", default_value_t = 65_536, help = "Points per .splat chunk")]
    chunk_points: u32,
    #[arg(long, value_name = "N", help = "Threads in the compute pool")]
    threads: Option<usize>,
    #[arg(long, help = "Worker bootstrap: dedicated-thread or shared-pool")]
    strategy: Option<BootstrapStrategy>,
    #[arg(long, help = "Send PLY data with log scales and separate alphas")]
    compressed: bool,
    #[arg(long, value_name = "N", help = "Run N frames without a terminal and print a summary")]
    frames: Option<u64>,
}

fn open_source(cli: &Cli) -> AppResult<Source> {
    let Some(path) = cli.input.as_deref() else {
        let seed = cli.seed.unwrap_or_else(rand::random);
        log::info!("generating {} demo points (seed {seed})", cli.demo_points);
        let splats = generate_demo_splats(&mut StdRng::seed_from_u64(seed), cli.demo_points);
        return Ok(Source::Attributes(SplatAttributes::from_splats(&splats)));
    };

    match extension(path).as_str() {
        "splat" => Ok(Source::Stream(SplatChunks::open(path, cli.chunk_points.max(1))?)),
        "ply" => {
            let encoding = if cli.compressed {
                AttributeEncoding::Compressed
            } else {
                AttributeEncoding::Geometry
            };
            Ok(Source::Attributes(load_ply_file(path, encoding)?))
        }
        _ => Err(format!("Unsupported input '{}'. Use a .ply or .splat file", path.display()).into()),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn detect_truecolor() -> bool {
    match std::env::var("COLORTERM") {
        Ok(val) => !val.is_empty() && (val == "truecolor" || val == "24bit"),
        Err(_) => match std::env::var("TERM_PROGRAM") {
            Ok(prog) => prog != "Apple_Terminal",
            Err(_) => match std::env::var("TERM") {
                Ok(term) => term.contains("ghostty") || term.contains("kitty") || term.contains("wezterm"),
                Err(_) => false,
            },
        },
    }
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .target(Target::Stderr)
        .init();

    let channel = Arc::new(WorkerChannel::new(ChannelConfig {
        timeout: Some(Duration::from_millis(cli.timeout_ms)),
        strategy: cli.strategy,
        pool_threads: cli.threads,
    }));
    log::info!("compute unit bootstrapped with {:?}", channel.strategy());

    let mut store = SplatDataStore::with_channel(
        StoreConfig {
            max_texture_size: cli.max_texture_size.max(1),
            frustum_culling: cli.cull,
            ..StoreConfig::default()
        },
        channel,
    );
    let source = open_source(&cli)?;
    store.set_point_count(source.point_count());

    let orchestrator = FrameOrchestrator::new(
        store,
        SchedulerConfig {
            interval: Duration::from_millis(cli.interval_ms),
            stable_window: Duration::from_millis(cli.stable_ms),
        },
    );
    let mut viewer = Viewer::new(orchestrator, source, detect_truecolor());

    if let Some(frames) = cli.frames {
        let mut stdout = io::stdout().lock();
        return viewer::run_headless(&mut viewer, frames, &mut stdout);
    }

    install_panic_hook();
    let mut stdout = BufWriter::with_capacity(1024 * 1024, io::stdout());
    enter_terminal(&mut stdout)?;
    let input_rx = input::spawn_input_thread();

    let run_result = viewer::run_terminal(&mut viewer, &input_rx, &mut stdout);
    let cleanup_result = cleanup_terminal(&mut stdout);

    run_result?;
    cleanup_result
}
