use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use wasm_build_sync::api::{self, AppState};
use wasm_build_sync::build::{library_builder_for, LazyLibraryBuilder};
use wasm_build_sync::utils;
use wasm_build_sync::{Compiler, Context, SessionDirectoryManager};

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();

    let config = utils::config::load_config()?;

    info!("Starting wasm-build-sync v{}", env!("CARGO_PKG_VERSION"));
    info!("CPU cores available: {}", num_cpus::get());
    info!(
        "Source {} -> {}, artifacts under {}",
        config.volume_mapped_src.display(),
        config.sync_dst.display(),
        config.build_root.display()
    );

    let builder = library_builder_for(&config);
    let sessions = Arc::new(SessionDirectoryManager::new(&config.session_root, config.worker_lease));
    let context = Arc::new(Context::new(config));
    let compiler = Arc::new(Compiler::new(context.clone(), builder.clone()));

    // Bring the library tree up to date without blocking startup
    let startup = compiler.clone();
    tokio::task::spawn_blocking(move || {
        let config = startup.context().config().clone();
        if config.volume_mapped_src.is_dir() {
            if let Err(e) = startup.update_src(None, true) {
                warn!("Initial source sync failed: {}", e);
            }
        } else {
            info!("No mounted source at {}, checking library freshness", config.volume_mapped_src.display());
            let lazy = LazyLibraryBuilder::new(startup.context().timestamp_manager(), builder, config.archive_mode);
            let report = lazy.build_all_libraries_if_needed(&config.build_modes, false);
            info!("Startup library check: {:?}", report);
        }
    });

    let (gc_shutdown_tx, gc_shutdown_rx) = watch::channel(false);
    let gc_interval = context.config().gc_interval;
    let gc_task = tokio::spawn(sessions.clone().run_gc_loop(gc_interval, gc_shutdown_rx));

    let state = AppState { compiler, sessions };
    let app = Router::new()
        .nest("/api", api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], context.config().port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(context.clone()))
        .await?;

    let _ = gc_shutdown_tx.send(true);
    if let Err(e) = gc_task.await {
        warn!("Session GC task ended abnormally: {}", e);
    }
    context.shutdown();

    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal(context: Arc<Context>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, interrupting in-flight syncs");
    context.interrupt();
}
