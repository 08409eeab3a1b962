//! Argus robot-camera streaming driver.
//!
//! Default mode runs on the robot: per-sensor streaming workers, the
//! panoramic window worker, the stdin control channel and the camera-select
//! listener. `argus receive [server]` runs the headset-side diagnostic
//! front end instead: clock sync, receiver pipelines and periodic stream
//! health logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use argus::clock::ClockSync;
use argus::pipeline::{control, panoramic, supervisor};
use argus::receiver::Player;
use argus::{ConfigCell, StreamingConfig};
use color_eyre::Result;
use gstreamer as gst;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "argus=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    gst::init()?;

    match std::env::args().nth(1).as_deref() {
        Some("receive") => run_receiver(std::env::args().nth(2)).await,
        _ => run_driver().await,
    }
}

async fn run_driver() -> Result<()> {
    info!("argus streaming driver starting");

    let config = Arc::new(ConfigCell::new());
    let stop = Arc::new(AtomicBool::new(false));
    let (select_tx, select_rx) = flume::bounded(16);

    let mut workers = Vec::new();
    for sensor_id in 0..2u8 {
        let ctx = supervisor::WorkerContext {
            sensor_id,
            config: config.clone(),
            stop: stop.clone(),
        };
        workers.push(
            std::thread::Builder::new()
                .name(format!("sensor-{sensor_id}"))
                .spawn(move || supervisor::run_sensor_worker(ctx))?,
        );
    }
    let pano_ctx = supervisor::WorkerContext {
        sensor_id: 0,
        config: config.clone(),
        stop: stop.clone(),
    };
    workers.push(
        std::thread::Builder::new()
            .name("panoramic".into())
            .spawn(move || panoramic::run_panoramic_worker(pano_ctx, select_rx))?,
    );

    let select_task = tokio::spawn(panoramic::camera_select_listener(select_tx));
    let mut control_task = tokio::spawn(control::run_control_loop(config.clone(), stop.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = &mut control_task => {}
    }
    stop.store(true, Ordering::Relaxed);
    control_task.abort();
    select_task.abort();

    tokio::task::spawn_blocking(move || {
        for worker in workers {
            let _ = worker.join();
        }
    })
    .await?;

    info!("argus streaming driver stopped");
    Ok(())
}

async fn run_receiver(server: Option<String>) -> Result<()> {
    let defaults = StreamingConfig::default();
    let server = server.unwrap_or_else(|| defaults.host.clone());
    info!(%server, "argus receiver starting");

    let sync = ClockSync::spawn(server, None);
    let mut player = Player::new(sync.handle());
    player.reconfigure(&defaults)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                for output in player.outputs() {
                    let snap = output.stats.averaged_snapshot();
                    info!(
                        stream = output.id.label(),
                        fps = format_args!("{:.1}", snap.fps),
                        total_latency_us = snap.total_latency,
                        frame_id = snap.frame_id,
                        packets = snap.packets_per_frame,
                        clock_healthy = sync.handle().is_healthy(),
                        "stream health"
                    );
                }
            }
        }
    }

    player.teardown();
    sync.shutdown().await;
    info!("argus receiver stopped");
    Ok(())
}
