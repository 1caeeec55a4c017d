//! Position source that plays back an imported track

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::external::{Clock, PositionSource, SourceEvent};
use crate::models::LocationSample;

/// Replays recorded samples in real time, scaled by `speed`
///
/// Timestamps are rebased onto the clock at start while keeping the recorded
/// spacing, so a replay at 10x still reports the original pace. A restart
/// picks up at the first sample not yet delivered.
pub struct ReplaySource {
    samples: Arc<Vec<LocationSample>>,
    speed: f64,
    clock: Arc<dyn Clock>,
    cursor: Arc<AtomicUsize>,
    last_emitted: Arc<AtomicI64>,
    task: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new(samples: Vec<LocationSample>, speed: f64, clock: Arc<dyn Clock>) -> Self {
        let speed = if speed.is_finite() && speed > 0.0 {
            speed
        } else {
            1.0
        };

        Self {
            samples: Arc::new(samples),
            speed,
            clock,
            cursor: Arc::new(AtomicUsize::new(0)),
            last_emitted: Arc::new(AtomicI64::new(i64::MIN)),
            task: None,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples handed to the consumer so far
    pub fn delivered(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.delivered() >= self.samples.len()
    }

    /// Shareable view of delivery progress, valid after the source is moved
    pub fn progress(&self) -> ReplayProgress {
        ReplayProgress {
            cursor: self.cursor.clone(),
            total: self.samples.len(),
        }
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayProgress {
    cursor: Arc<AtomicUsize>,
    total: usize,
}

impl ReplayProgress {
    pub fn delivered(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_finished(&self) -> bool {
        self.delivered() >= self.total
    }
}

impl PositionSource for ReplaySource {
    fn is_available(&self) -> bool {
        !self.samples.is_empty()
    }

    fn start(&mut self, events: mpsc::Sender<SourceEvent>) -> Result<(), SourceError> {
        if self.samples.is_empty() {
            return Err(SourceError::Unavailable {
                reason: "replay track is empty".to_string(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            SourceError::Unavailable {
                reason: format!("replay needs a tokio runtime: {}", e),
            }
        })?;
        self.abort_task();

        let start = self.cursor.load(Ordering::SeqCst);
        if start >= self.samples.len() {
            debug!("Replay already finished, nothing to restart");
            return Ok(());
        }

        // Anchor the next sample at now, but never behind what was delivered
        let anchor = self.samples[start].timestamp;
        let gap = match start {
            0 => 0,
            _ => anchor - self.samples[start - 1].timestamp,
        };
        let last = self.last_emitted.load(Ordering::SeqCst);
        let base = match last {
            i64::MIN => self.clock.now_ms(),
            last => self.clock.now_ms().max(last + gap.max(1)),
        };

        let samples = self.samples.clone();
        let cursor = self.cursor.clone();
        let last_emitted = self.last_emitted.clone();
        let speed = self.speed;

        info!(from = start, total = samples.len(), speed, "Starting track replay");
        self.task = Some(runtime.spawn(async move {
            let mut previous = anchor;
            for sample in &samples[start..] {
                let delta = (sample.timestamp - previous).max(0) as f64;
                if delta > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delta / 1000.0 / speed)).await;
                }
                previous = sample.timestamp;

                let mut rebased = sample.clone();
                rebased.timestamp = base + (sample.timestamp - anchor);
                let timestamp = rebased.timestamp;

                if events.send(SourceEvent::Sample(rebased)).await.is_err() {
                    debug!("Replay consumer went away");
                    return;
                }
                last_emitted.store(timestamp, Ordering::SeqCst);
                cursor.fetch_add(1, Ordering::SeqCst);
            }
            info!("Track replay finished");
        }));

        Ok(())
    }

    fn stop(&mut self) {
        self.abort_task();
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.abort_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ManualClock;

    fn track() -> Vec<LocationSample> {
        (0..4)
            .map(|i| LocationSample::new(52.0 + i as f64 * 0.0001, 13.0, 5.0, 500_000 + i * 2_000))
            .collect()
    }

    async fn collect(rx: &mut mpsc::Receiver<SourceEvent>, n: usize) -> Vec<i64> {
        let mut timestamps = Vec::new();
        while timestamps.len() < n {
            match rx.recv().await {
                Some(SourceEvent::Sample(sample)) => timestamps.push(sample.timestamp),
                Some(SourceEvent::Failed(reason)) => panic!("unexpected failure: {}", reason),
                None => break,
            }
        }
        timestamps
    }

    #[tokio::test]
    async fn test_rebases_and_keeps_spacing() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let mut source = ReplaySource::new(track(), 1_000.0, clock);
        let (tx, mut rx) = mpsc::channel(16);

        let progress = source.progress();
        source.start(tx).unwrap();
        let timestamps = collect(&mut rx, 4).await;
        assert_eq!(progress.total(), 4);

        assert_eq!(
            timestamps,
            vec![
                1_700_000_000_000,
                1_700_000_002_000,
                1_700_000_004_000,
                1_700_000_006_000
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_continues_without_going_backwards() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let mut source = ReplaySource::new(track(), 1_000.0, clock.clone());

        // Small buffer so the task blocks after the second sample
        let (tx, mut rx) = mpsc::channel(1);
        source.start(tx).unwrap();
        let first = collect(&mut rx, 2).await;
        source.stop();
        drop(rx);

        let delivered = source.delivered();
        assert!(delivered >= 2);

        let (tx, mut rx) = mpsc::channel(16);
        source.start(tx).unwrap();
        let rest = collect(&mut rx, 4 - delivered).await;

        assert!(rest[0] > first[1]);
        assert!(rest.windows(2).all(|w| w[1] - w[0] == 2_000));
    }

    #[test]
    fn test_empty_track_is_unavailable() {
        let clock = Arc::new(ManualClock::new(0));
        let mut source = ReplaySource::new(Vec::new(), 1.0, clock);
        let (tx, _rx) = mpsc::channel(1);

        assert!(!source.is_available());
        assert!(matches!(
            source.start(tx),
            Err(SourceError::Unavailable { .. })
        ));
    }
}
