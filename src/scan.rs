//! 2D grid scan engine.
//!
//! Drives two stage motors and one or more scaler channels through the
//! facade — exactly as any other caller — to produce a grid of intensity
//! samples. Execution is row-major: position the slow (y) axis, sweep the
//! fast (x) axis, and at every point gate each scaler for the dwell time.
//! Scalers are distinct devices, so their counts at one point are collected
//! concurrently.
//!
//! Progress streams on a broadcast channel; an abort flag checked between
//! points stops the scan at the next boundary (work already issued
//! completes — nothing is cut off mid-command).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ScanSettings;
use crate::core::{Operation, ResponsePayload};
use crate::error::{DeviceError, DeviceResult};
use crate::facade::DeviceFacade;

/// Progress notification from a running scan.
#[derive(Clone, Debug)]
pub enum ScanEvent {
    /// The slow axis reached a new row.
    RowStarted {
        /// Zero-based row index.
        row: usize,
        /// Slow-axis position of the row.
        y: f64,
    },
    /// One grid point was measured.
    PointMeasured(ScanPoint),
    /// All points of a row are done.
    RowFinished {
        /// Zero-based row index.
        row: usize,
    },
    /// The whole grid is done.
    Finished,
    /// The abort flag stopped the scan.
    Aborted {
        /// Row that was in progress when the scan stopped.
        row: usize,
    },
}

/// One measured grid point.
#[derive(Clone, Debug)]
pub struct ScanPoint {
    /// Fast-axis position.
    pub x: f64,
    /// Slow-axis position.
    pub y: f64,
    /// Counts per scaler, in the order of [`ScanSettings::scalers`].
    pub counts: Vec<f64>,
    /// When the point finished measuring.
    pub measured_at: DateTime<Utc>,
}

/// Completed scan: row-major grid of intensity samples.
#[derive(Clone, Debug)]
pub struct ScanGrid {
    /// Scaler device names, defining the order of per-point counts.
    pub scalers: Vec<String>,
    /// Rows in slow-axis order, each row in fast-axis order.
    pub rows: Vec<Vec<ScanPoint>>,
}

impl ScanGrid {
    /// Intensity matrix for one scaler channel (rows × columns).
    pub fn intensity(&self, scaler: &str) -> Option<Vec<Vec<f64>>> {
        let index = self.scalers.iter().position(|s| s == scaler)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.iter().map(|point| point.counts[index]).collect())
                .collect(),
        )
    }
}

/// Executes grid scans through a device facade.
pub struct ScanEngine {
    facade: DeviceFacade,
    events: broadcast::Sender<ScanEvent>,
    abort: Arc<AtomicBool>,
}

impl ScanEngine {
    /// Create a scan engine over the given facade.
    pub fn new(facade: DeviceFacade) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            facade,
            events,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to scan progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Request the running scan to stop at the next point boundary.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Shareable abort flag, for wiring to signal handlers.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Run a full grid scan. Returns the completed grid, or
    /// [`DeviceError::Cancelled`] if aborted part-way.
    pub async fn run(&self, scan: &ScanSettings) -> DeviceResult<ScanGrid> {
        scan.validate()?;
        self.abort.store(false, Ordering::SeqCst);

        let x_steps = scan.x_steps();
        let y_steps = scan.y_steps();
        info!(
            x_motor = %scan.x_motor,
            y_motor = %scan.y_motor,
            rows = y_steps,
            columns = x_steps,
            "starting grid scan"
        );

        // Program every scaler's gate time up front.
        let dwell_s = scan.dwell.as_secs_f64();
        for scaler in &scan.scalers {
            self.facade
                .send_wait(
                    scaler,
                    Operation::SetParameter {
                        name: "dwell".into(),
                        value: serde_json::json!(dwell_s),
                    },
                )
                .await?;
        }

        let mut rows = Vec::with_capacity(y_steps);

        for row in 0..y_steps {
            if self.aborted(row) {
                return Err(DeviceError::Cancelled);
            }

            let y = scan.y_start + scan.y_step * row as f64;
            self.facade
                .send_wait(&scan.y_motor, Operation::Move { target: y })
                .await?;
            self.emit(ScanEvent::RowStarted { row, y });

            let mut points = Vec::with_capacity(x_steps);
            for column in 0..x_steps {
                if self.aborted(row) {
                    return Err(DeviceError::Cancelled);
                }

                let x = scan.x_start + scan.x_step * column as f64;
                self.facade
                    .send_wait(&scan.x_motor, Operation::Move { target: x })
                    .await?;

                let counts = self.count_scalers(&scan.scalers).await?;
                let point = ScanPoint {
                    x,
                    y,
                    counts,
                    measured_at: Utc::now(),
                };
                debug!(row, column, x, y, "point measured");
                self.emit(ScanEvent::PointMeasured(point.clone()));
                points.push(point);
            }

            rows.push(points);
            self.emit(ScanEvent::RowFinished { row });
        }

        self.emit(ScanEvent::Finished);
        info!(rows = y_steps, columns = x_steps, "grid scan finished");

        Ok(ScanGrid {
            scalers: scan.scalers.clone(),
            rows,
        })
    }

    /// Gate every scaler concurrently and collect counts in config order.
    async fn count_scalers(&self, scalers: &[String]) -> DeviceResult<Vec<f64>> {
        let reads = scalers.iter().map(|scaler| {
            self.facade.send_wait(
                scaler,
                Operation::Custom {
                    name: "count".into(),
                    args: serde_json::Value::Null,
                },
            )
        });

        let payloads = try_join_all(reads).await?;
        payloads
            .into_iter()
            .zip(scalers)
            .map(|(payload, scaler)| match payload {
                ResponsePayload::Scalar { value, .. } => Ok(value),
                other => Err(DeviceError::Protocol(format!(
                    "scaler '{scaler}' returned non-scalar counts: {other:?}"
                ))),
            })
            .collect()
    }

    fn aborted(&self, row: usize) -> bool {
        if self.abort.load(Ordering::SeqCst) {
            warn!(row, "scan aborted");
            self.emit(ScanEvent::Aborted { row });
            true
        } else {
            false
        }
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.events.send(event);
    }
}
