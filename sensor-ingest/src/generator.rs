use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sensor_common::event::{CandidateEvent, EventSource, Point, Severity};
use sensor_common::geofence::{Geofence, GeofenceError};

use crate::config::SimulatorConfig;
use crate::health::HealthHandle;
use crate::metrics::SIMULATOR_TICKS;
use crate::pipeline::{Admission, Pipeline};

pub const DEVICE_ID: &str = "sensor-simulator";

// Common events are more frequent.
const TITLES: &[(&str, u32)] = &[
    ("Smoke detected", 5),
    ("Ranger alert", 4),
    ("Tree disease detected", 3),
    ("Forest fire", 2),
    ("Illegal logging", 1),
];

// Mostly low and medium, critical is rare.
const SEVERITIES: &[(Severity, u32)] = &[
    (Severity::Low, 5),
    (Severity::Medium, 3),
    (Severity::High, 2),
    (Severity::Critical, 1),
];

#[derive(Debug)]
pub enum TickOutcome {
    Submitted(Admission),
    /// No boundary is loaded, nothing to sample from.
    NoBoundary,
    /// No sampled point fell inside the boundary.
    Exhausted,
    GeofenceFailed(GeofenceError),
}

impl TickOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Submitted(_) => "submitted",
            TickOutcome::NoBoundary => "no_boundary",
            TickOutcome::Exhausted => "exhausted",
            TickOutcome::GeofenceFailed(_) => "geofence_failed",
        }
    }
}

/// Periodically synthesizes a plausible event inside the geofence and submits it to the
/// pipeline. Ticks never overlap: the next one is scheduled after the previous completes.
pub struct SyntheticGenerator {
    geofence: Arc<dyn Geofence>,
    pipeline: Pipeline,
    rng: StdRng,
    interval: Duration,
    max_attempts: u32,
}

impl SyntheticGenerator {
    pub fn new(geofence: Arc<dyn Geofence>, pipeline: Pipeline, config: &SimulatorConfig) -> Self {
        Self {
            geofence,
            pipeline,
            rng: StdRng::from_entropy(),
            interval: config.interval.0,
            max_attempts: config.max_attempts,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Rejection sampling: draw uniformly in the bounding box until a point is inside the
    /// boundary, giving up after `max_attempts` draws.
    pub async fn sample_point(&mut self) -> Result<Option<Point>, GeofenceError> {
        let bbox = self.geofence.bounding_box().await?;

        for _ in 0..self.max_attempts {
            let lng = self.rng.gen_range(bbox.lng_min..=bbox.lng_max);
            let lat = self.rng.gen_range(bbox.lat_min..=bbox.lat_max);
            let Ok(point) = Point::new(lat, lng) else {
                continue;
            };

            if self.geofence.contains(point).await? {
                return Ok(Some(point));
            }
        }

        Ok(None)
    }

    fn pick_title(&mut self) -> &'static str {
        TITLES
            .choose_weighted(&mut self.rng, |(_, weight)| *weight)
            .map(|(title, _)| *title)
            .unwrap_or(TITLES[0].0)
    }

    fn pick_severity(&mut self) -> Severity {
        SEVERITIES
            .choose_weighted(&mut self.rng, |(_, weight)| *weight)
            .map(|(severity, _)| *severity)
            .unwrap_or_default()
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let point = match self.sample_point().await {
            Ok(Some(point)) => point,
            Ok(None) => {
                warn!(
                    attempts = self.max_attempts,
                    "no sampled point fell inside the geofence, skipping tick"
                );
                return TickOutcome::Exhausted;
            }
            Err(GeofenceError::NoBoundary) => {
                warn!("no geofence boundary loaded, skipping tick");
                return TickOutcome::NoBoundary;
            }
            Err(err) => {
                warn!(reason = %err, "geofence query failed, skipping tick");
                return TickOutcome::GeofenceFailed(err);
            }
        };

        let title = self.pick_title();
        let severity = self.pick_severity();
        let candidate = match CandidateEvent::new(EventSource::Simulator, DEVICE_ID, point) {
            Ok(candidate) => candidate.with_title(title).with_severity(severity),
            // The device id is a non-blank constant, so this cannot happen.
            Err(err) => {
                warn!(reason = %err, "failed to build simulated event");
                return TickOutcome::Exhausted;
            }
        };

        debug!(title, severity = %severity, location = %point, "simulated event");
        TickOutcome::Submitted(self.pipeline.admit(candidate).await)
    }

    pub async fn run(mut self, liveness: HealthHandle, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "sensor simulator started");

        loop {
            liveness.report_healthy();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            // A tick that started is never interrupted.
            let outcome = self.tick().await;
            metrics::counter!(SIMULATOR_TICKS, "outcome" => outcome.as_str()).increment(1);
        }

        info!("sensor simulator stopped");
    }
}
