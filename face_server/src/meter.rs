use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    detections: AtomicU64,
    dropped_ticks: AtomicU64,
    streamed_frames: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            detections: AtomicU64::new(0),
            dropped_ticks: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_dropped(&self) {
        self.dropped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_detections(&self) -> u64 {
        self.detections.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_dropped(&self) -> u64 {
        self.dropped_ticks.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_streamed(&self) -> u64 {
        self.streamed_frames.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let detections = METER.get_reset_detections();
            let dropped = METER.get_reset_dropped();
            let streamed = METER.get_reset_streamed();
            let elapsed = start.elapsed().as_secs_f32();

            if detections > 0 {
                let rate = detections as f32 / elapsed;
                log::info!("Detections per second: {rate:.2}")
            }
            if dropped > 0 {
                log::info!("Ticks dropped while busy: {dropped}")
            }
            if streamed > 0 {
                let fps = streamed as f32 / elapsed;
                log::info!("Streamed frames per second: {fps:.2}")
            }
        }
    })
}
