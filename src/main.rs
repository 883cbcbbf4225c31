use std::sync::Arc;

use mux_bus::{MediaBackend, SoftwareBackend};
use tokio_util::sync::CancellationToken;

use crate::config::BackendKind;

mod api;
mod config;
mod handler;
mod service;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("mux_bus", log::LevelFilter::Debug)
        .filter_module("lite_recorder", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

fn backend(kind: BackendKind) -> anyhow::Result<Arc<dyn MediaBackend>> {
    match kind {
        BackendKind::Software => Ok(Arc::new(SoftwareBackend::new())),
        #[cfg(feature = "ffmpeg")]
        BackendKind::Ffmpeg => Ok(Arc::new(mux_bus::ffmpeg::FfmpegBackend::new()?)),
        #[cfg(not(feature = "ffmpeg"))]
        BackendKind::Ffmpeg => anyhow::bail!("built without the ffmpeg feature"),
    }
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();
    let backend = backend(config.backend).unwrap_or_else(|e| {
        eprintln!("Error creating media backend: {}", e);
        std::process::exit(1);
    });
    log::info!("using {} backend", backend.name());
    let service = service::RecorderService::new(config.session.clone(), backend);

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    let server = api::start_api_server(config.listen.clone(), service.clone(), cancel_clone);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    // finalize the container before exiting
    match service.stop().await {
        Ok(summary) if summary.path.is_some() => log::info!("recording finalized: {:?}", summary),
        Ok(_) => {}
        Err(e) => log::error!("Error stopping session: {}", e),
    }
    let _ = server.await;

    std::process::exit(0);
}
