//! Background beat analysis
//!
//! Each load spawns a named thread that runs the beat grid estimator over
//! the track and sends the grid back tagged with the track's id. Results
//! for a track that is no longer current are dropped by the engine.

use crate::buffer::{Track, TrackId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use riff_analysis::{BeatGrid, BeatGridAnalyzer};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Finished analysis for one track
#[derive(Debug)]
pub struct AnalysisResult {
    pub track: TrackId,
    pub grid: BeatGrid,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct JobState {
    /// Track whose grid is wanted
    current: Option<TrackId>,
    in_flight: usize,
}

pub struct AnalysisWorker {
    tx: Sender<AnalysisResult>,
    rx: Receiver<AnalysisResult>,
    state: Arc<Mutex<JobState>>,
}

impl Default for AnalysisWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisWorker {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            state: Arc::new(Mutex::new(JobState::default())),
        }
    }

    /// Start analysing `track`; supersedes any earlier request
    pub fn spawn(&self, track: Arc<Track>) {
        let id = track.id();
        {
            let mut state = self.state.lock();
            state.current = Some(id);
            state.in_flight += 1;
        }

        let tx = self.tx.clone();
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name(format!("riff-analysis-{}", id.get()))
            .spawn(move || {
                let superseded = state.lock().current != Some(id);
                if !superseded {
                    let started = Instant::now();
                    let buffer = track.buffer();
                    let mono = buffer.mono_mix();
                    let grid = BeatGridAnalyzer::new(buffer.sample_rate()).analyze(&mono);
                    let _ = tx.send(AnalysisResult {
                        track: id,
                        grid,
                        elapsed: started.elapsed(),
                    });
                } else {
                    debug!(track = %id, "analysis skipped, track replaced before start");
                }
                let mut state = state.lock();
                state.in_flight = state.in_flight.saturating_sub(1);
            });

        if let Err(e) = spawned {
            warn!(track = %id, error = %e, "failed to spawn analysis thread");
            self.state.lock().in_flight -= 1;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().in_flight > 0
    }

    /// Next finished result, if any
    pub fn try_recv(&self) -> Option<AnalysisResult> {
        self.rx.try_recv().ok()
    }

    /// Block up to `timeout` for the next finished result
    pub fn recv_timeout(&self, timeout: Duration) -> Option<AnalysisResult> {
        self.rx.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AudioBuffer;

    #[test]
    fn test_result_is_tagged_with_track() {
        let buffer = AudioBuffer::new(vec![0.0; 44100 * 5], 44100, 1).unwrap();
        let track = Arc::new(Track::new(TrackId(42), buffer));

        let worker = AnalysisWorker::new();
        worker.spawn(track);
        let result = worker.recv_timeout(Duration::from_secs(30)).unwrap();

        assert_eq!(result.track, TrackId(42));
        // Silence falls back to the default grid
        assert!(!result.grid.is_detected());
    }
}
