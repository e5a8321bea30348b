//! # TESSERA Demo
//!
//! Runs the engine loop headless for a few seconds and reports what the
//! graphics side saw.
//!
//! ```text
//! tessera_demo [config.toml] [seconds]
//! RUST_LOG=debug tessera_demo
//! ```

use std::process;
use std::time::{Duration, Instant};

use tessera::{Engine, FrameEvent, HeadlessBackend, HeadlessConfig, MovingEntityScene, SceneEvent};
use tessera_core::{BufferHandle, EngineConfig, EntityInstance, SyncResult};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match EngineConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("{}", e);
                process::exit(2);
            }
        },
        None => EngineConfig::default(),
    };
    let seconds = args.next().and_then(|s| s.parse().ok()).unwrap_or(3);

    if let Err(e) = run(config, Duration::from_secs(seconds)) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(config: EngineConfig, duration: Duration) -> SyncResult<()> {
    let backend = HeadlessBackend::with_config(HeadlessConfig {
        fence_latency_frames: 2,
        fail_init: None,
    });
    let engine = Engine::new(config, backend, MovingEntityScene::new(0, [1.0, 0.0, 0.5]))?;

    // Scenery arrives as events before the first cycle
    let notifier = engine.context().notifier().clone();
    for id in 1..=64u32 {
        let position = [(id % 8) as f32 * 4.0, 0.0, (id / 8) as f32 * 4.0];
        notifier.notify(SceneEvent::EntityAdded(EntityInstance::new(id, position, id % 4, BufferHandle(id))))?;
    }
    notifier.notify(SceneEvent::SceneInitialized)?;

    let handle = engine.start()?;
    let events = handle.context().frame_events().receiver();
    let commands = handle.context().commands();

    let start = Instant::now();
    let mut frames = 0u64;
    let mut stale = 0u64;
    let mut last_generation = 0u64;
    while start.elapsed() < duration {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(FrameEvent::Drawn(result)) => {
                frames += 1;
                if !result.fresh {
                    stale += 1;
                }
                last_generation = result.generation;

                // Round trip through the graphics thread now and then
                if frames % 240 == 0 {
                    let thread = commands
                        .calculate(|| std::thread::current().name().map(str::to_owned))
                        .wait()?;
                    tracing::debug!("graphics thread is {:?}", thread);
                }
            }
            Ok(FrameEvent::ContextLost) | Err(_) => {}
        }
    }

    tracing::info!(
        "{} frames drawn ({} stale), last generation {}, {} simulation cycles",
        frames,
        stale,
        last_generation,
        handle.simulation_cycles()
    );
    let stats = handle.context().buffer().stats();
    tracing::info!(
        "triple buffer: {} commits, {} parked, {} promoted, {} fence waits",
        stats.commits,
        stats.parked_commits,
        stats.true_swaps,
        stats.fence_waits
    );
    handle.shutdown()
}
