//! Lifecycle events of the mount and CCD executions
//!
//! Both executions report through an [`ExecutionObserver`] so a console host
//! and an interactive host can share the same orchestration.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

use skybridge_imaging::ImageProperty;

use crate::mount::MountCommand;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExecutionEvent {
    // Mount
    MountStarted {
        command: MountCommand,
        target_ra: f64,
        current_ra: f64,
        target_dec: f64,
        current_dec: f64,
    },
    MountProgress {
        target_ra: f64,
        current_ra: f64,
        target_dec: f64,
        current_dec: f64,
    },
    MountEnded,

    // CCD acquisition
    AcquisitionStarted,
    NewExposure { number: u32, count: u32 },
    ExposureDelayStarted { total_secs: f64 },
    ExposureDelay { elapsed_secs: f64 },
    ExposureDelayEnded,
    ExposureStarted { number: u32, count: u32, exposure_time: f64 },
    /// `elapsed_secs` of `exposure_time`
    ExposureProgress { number: u32, count: u32, elapsed_secs: f64 },
    ExposureError { message: String },
    ExposureEnded { number: u32 },
    WaitingForServer,
    NewFrame {
        path: PathBuf,
        properties: Vec<ImageProperty>,
    },
    PlateSolved { path: PathBuf, solved: bool },
    AcquisitionEnded,

    Aborted,
}

/// Receives execution events
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);

    /// Asked before a differential correction moves the target across the
    /// meridian. Returning false cancels the correction.
    fn confirm_meridian_crossing(&self, current_hour_angle: f64, new_hour_angle: f64) -> bool {
        let _ = (current_hour_angle, new_hour_angle);
        true
    }
}

/// Console presentation: every event goes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ExecutionObserver for LogObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::MountStarted {
                command,
                target_ra,
                target_dec,
                ..
            } => tracing::info!(
                "Mount {:?}: target RA {:.6} h, Dec {:.6} deg",
                command,
                target_ra,
                target_dec
            ),
            ExecutionEvent::MountProgress {
                current_ra,
                current_dec,
                ..
            } => tracing::debug!("Mount at RA {:.6} h, Dec {:.6} deg", current_ra, current_dec),
            ExecutionEvent::NewExposure { number, count } => {
                tracing::info!("Exposure {} of {}", number + 1, count)
            }
            ExecutionEvent::ExposureProgress { elapsed_secs, .. } => {
                tracing::debug!("Exposing: {:.1} s", elapsed_secs)
            }
            ExecutionEvent::ExposureError { message } => tracing::error!("Exposure failed: {}", message),
            ExecutionEvent::WaitingForServer => tracing::debug!("Waiting for INDI server"),
            ExecutionEvent::NewFrame { path, .. } => tracing::info!("New frame: {}", path.display()),
            ExecutionEvent::Aborted => tracing::warn!("Execution aborted"),
            other => tracing::debug!("{:?}", other),
        }
    }
}

/// Forwards events to broadcast subscribers
pub struct ChannelObserver {
    event_tx: broadcast::Sender<ExecutionEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }
}

impl ExecutionObserver for ChannelObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event.clone());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Everything received so far
    pub fn drain(rx: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_channel_observer_fans_out() {
        let observer = ChannelObserver::new(16);
        let mut a = observer.subscribe();
        let mut b = observer.subscribe();
        observer.on_event(&ExecutionEvent::AcquisitionStarted);
        observer.on_event(&ExecutionEvent::AcquisitionEnded);

        assert_eq!(
            drain(&mut a),
            vec![ExecutionEvent::AcquisitionStarted, ExecutionEvent::AcquisitionEnded]
        );
        assert_eq!(drain(&mut b).len(), 2);
    }

    #[test]
    fn test_events_serialize() {
        let json = serde_json::to_value(ExecutionEvent::NewExposure { number: 0, count: 3 }).unwrap();
        assert_eq!(json["NewExposure"]["count"], 3);
        assert!(LogObserver.confirm_meridian_crossing(-0.5, 0.5));
    }
}
