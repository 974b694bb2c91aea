//! ClearGuard daemon entry point.
//!
//! Loads the policy config, wires the platform seams into the engine, and
//! follows the master toggle until shutdown.

use anyhow::Result;
use clearguard::{platform, EngineConfig, FilterEngine, HostSeams};
use clearguard_net::SeedBlocklist;
use clearguard_overlay::LogOverlay;
use clearguard_policy::{PolicyConfig, PolicyStore};
use clearguard_vision::capture::NoForegroundInspector;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    info!("ClearGuard starting...");

    let policy_config = match std::env::args().nth(1) {
        Some(path) => {
            info!("loading policy from {}", path);
            PolicyConfig::load(&path)?
        }
        None => PolicyConfig::default(),
    };
    let policy = PolicyStore::new(policy_config.into_state());

    let seams = HostSeams {
        tunnel: platform::default_provider(),
        blocklist: Arc::new(SeedBlocklist::new()),
        overlay: Arc::new(LogOverlay),
        // Screen capture needs a host display integration; the reference
        // daemon runs the network path only.
        capture: None,
        foreground: Arc::new(NoForegroundInspector),
    };
    let engine = FilterEngine::new(policy.clone(), EngineConfig::default(), seams);

    if policy.snapshot().protection_enabled {
        if let Err(err) = engine.start().await {
            error!("failed to start protection: {}", err);
            // Half-running is worse than off: surface the disabled state.
            policy.set_protection_enabled(false);
            warn!("protection disabled");
            return Err(err.into());
        }
    } else {
        info!("protection disabled in config; set protection_enabled = true to filter");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    engine.stop().await;

    info!("ClearGuard stopped");
    Ok(())
}
