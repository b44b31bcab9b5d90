//! camwatchd - camera pipeline daemon
//!
//! This daemon:
//! 1. Captures frames from the configured source and publishes an annotated
//!    MJPEG stream
//! 2. Runs the enabled detector families on the latest frame
//! 3. Records cooldown-gated access events with snapshot images
//! 4. Serves the HTTP API until Ctrl-C or a capture failure

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camwatch::{
    api::{ApiContext, ApiServer},
    build_detectors, build_overlay,
    config::CamwatchConfig,
    event_log::{AccessLogStore, EventRecorder},
    open_source, CaptureLoop, DetectionLoop, PipelineStats, SharedFrameState, Supervisor,
    ToggleState,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file (overrides CAMWATCH_CONFIG).
    #[arg(long, env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Frame source URI (stub://…, dir:///path, /dev/videoN).
    #[arg(long)]
    source: Option<String>,
    /// HTTP listen address.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = CamwatchConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        cfg.source.uri = source;
    }
    if let Some(addr) = args.addr {
        cfg.api_addr = addr;
    }

    let state = Arc::new(SharedFrameState::new());
    let toggles = Arc::new(ToggleState::new(cfg.initial_toggles()));
    let stats = Arc::new(PipelineStats::new());
    let overlay = Arc::new(build_overlay(&cfg)?);

    let store = Arc::new(AccessLogStore::open(
        &cfg.access_log.db_path,
        &cfg.access_log.images_dir,
        cfg.access_log.max_entries,
    )?);
    store.reconcile()?;
    let recorder = EventRecorder::new(store.clone(), overlay.clone(), cfg.recorder_config());

    let mut source = open_source(&cfg.source)?;
    source.connect()?;

    let registry = build_detectors(&cfg)?;
    let capture = CaptureLoop::new(
        source,
        state.clone(),
        overlay,
        stats.clone(),
        cfg.capture_config(),
    );
    let detection = DetectionLoop::new(
        state.clone(),
        toggles.clone(),
        registry,
        stats.clone(),
        cfg.detection_config(),
    )
    .with_recorder(recorder);

    let api = ApiServer::new(
        cfg.api_config(),
        ApiContext {
            frames: state,
            toggles,
            access_log: store,
            stats: stats.clone(),
        },
    )
    .spawn()?;
    let supervisor = Supervisor::start(capture, detection)?.with_api(api);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;
    }

    log::info!(
        "camwatchd running: source={} access_log={}",
        cfg.source.uri,
        cfg.access_log.db_path
    );

    let mut last_health_log = Instant::now();
    while !interrupted.load(Ordering::SeqCst) {
        if !supervisor.capture_alive() {
            log::error!("capture loop exited; shutting down");
            break;
        }
        if !supervisor.detection_alive() {
            log::error!("detection loop exited; shutting down");
            break;
        }
        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let snapshot = stats.snapshot();
            log::info!(
                "health frames={} encoded={} detections={} events={} viewers={}",
                snapshot.frames_captured,
                snapshot.frames_encoded,
                snapshot.detection_iterations,
                snapshot.events_recorded,
                supervisor.api().map_or(0, |api| api.viewers())
            );
            last_health_log = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    if interrupted.load(Ordering::SeqCst) {
        log::info!("shutdown requested");
    }
    // A dead capture or detection loop surfaces its error here and exits non-zero.
    supervisor.stop()
}
