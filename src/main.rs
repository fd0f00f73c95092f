use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fletsv6_companion::board::RouterBoard;
use fletsv6_companion::config::{self, NdMode, RaMode};
use fletsv6_companion::error::Result;
use fletsv6_companion::nd::NdWorker;
use fletsv6_companion::ra::RaWorker;
use fletsv6_companion::reactor::Reactor;
use fletsv6_companion::ros::RosClient;
use fletsv6_companion::store::RouterInfoStore;
use fletsv6_companion::supervisor::{self, Shutdown, Supervisor};

fn main() {
    // Use RUST_LOG if set, otherwise default to info for this crate.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fletsv6_companion=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    info!("Initializing fletsv6-companion");

    let ra_cfg = config::load_ra_config()?;
    let (nd_cfg, nd_needs_board) = config::load_nd_config(&ra_cfg)?;
    ra_cfg.dump();
    nd_cfg.dump();

    if ra_cfg.mode == RaMode::Off && nd_cfg.mode == NdMode::Off {
        info!("Both workers disabled, nothing to do");
        return Ok(0);
    }

    let shutdown = Shutdown::new();
    supervisor::install_signals(&shutdown)?;

    let board: Option<Arc<dyn RouterBoard>> = if ra_cfg.mode == RaMode::Ros || nd_needs_board {
        let ros_cfg = config::load_ros_config()?;
        Some(Arc::new(RosClient::connect(ros_cfg, &shutdown)?))
    } else {
        None
    };

    let reactor = Reactor::new()?;
    reactor.start()?;
    let store = Arc::new(RouterInfoStore::new());

    let mut supervisor = Supervisor::new(shutdown.clone());
    if ra_cfg.mode != RaMode::Off {
        info!("Starting router advertisement worker");
        let mut worker = RaWorker::new(
            ra_cfg.clone(),
            board.clone(),
            Arc::clone(&store),
            Arc::clone(&reactor),
            shutdown.clone(),
        );
        supervisor.spawn("ra", move || worker.run_once())?;
    }
    if nd_cfg.mode != NdMode::Off {
        info!("Starting neighbor discovery worker");
        let mut worker = NdWorker::new(
            nd_cfg,
            board.clone(),
            Arc::clone(&store),
            Arc::clone(&reactor),
            shutdown.clone(),
        );
        supervisor.spawn("nd", move || worker.run_once())?;
    }

    Ok(supervisor.run())
}
