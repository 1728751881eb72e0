//! Weighted cross-level progress, three-stage ETA sampling, and cooperative
//! cancellation routing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::WorkerStatus;

/// Severity passed to the host's `on_log` callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Host-supplied hooks. None of these are required; a silent batch run
/// just passes `Callbacks::default()`.
#[derive(Default)]
pub struct Callbacks {
    /// Returns `false` to request cooperative cancellation.
    pub on_progress: Option<Box<dyn FnMut(f64) -> bool + Send>>,
    pub on_detail: Option<Box<dyn FnMut(&str) + Send>>,
    pub on_log: Option<Box<dyn FnMut(LogLevel, &str) + Send>>,
}

/// Minimum wall-clock spacing between `on_progress` emissions.
const EMIT_INTERVAL: Duration = Duration::from_millis(100);

enum EtaStage {
    Bootstrap,
    Refine,
    Stable,
}

/// Three-stage ETA sampler: bootstrap, refine, then stable running-mean
/// throughput.
struct EtaSampler {
    sample_size: u64,
    stage: EtaStage,
    completed: u64,
    stage_boundary_completed: u64,
    stage_boundary_time: Instant,
    build_start: Instant,
    speed_tasks_per_sec: Option<f64>,
}

impl EtaSampler {
    fn new(sample_size: u32, seeded_speed: Option<f64>) -> Self {
        let sample_size = sample_size.clamp(1, 100) as u64;
        let now = Instant::now();
        match seeded_speed {
            Some(speed) if speed > 0.0 => EtaSampler {
                sample_size,
                stage: EtaStage::Stable,
                completed: 0,
                stage_boundary_completed: 0,
                stage_boundary_time: now,
                build_start: now,
                speed_tasks_per_sec: Some(speed),
            },
            _ => EtaSampler {
                sample_size,
                stage: EtaStage::Bootstrap,
                completed: 0,
                stage_boundary_completed: 0,
                stage_boundary_time: now,
                build_start: now,
                speed_tasks_per_sec: None,
            },
        }
    }

    fn record_completion(&mut self) {
        self.completed += 1;
        let window = match self.stage {
            EtaStage::Bootstrap => self.sample_size,
            EtaStage::Refine => self.sample_size * 2,
            EtaStage::Stable => {
                // Stage 3 (stable): speed is a running mean over the whole build.
                let elapsed = self.build_start.elapsed().as_secs_f64().max(1e-6);
                self.speed_tasks_per_sec = Some(self.completed as f64 / elapsed);
                return;
            }
        };

        let into_stage = self.completed - self.stage_boundary_completed;
        if into_stage >= window {
            let elapsed = self.stage_boundary_time.elapsed().as_secs_f64().max(1e-6);
            self.speed_tasks_per_sec = Some(into_stage as f64 / elapsed);
            self.stage = match self.stage {
                EtaStage::Bootstrap => EtaStage::Refine,
                EtaStage::Refine => EtaStage::Stable,
                EtaStage::Stable => EtaStage::Stable,
            };
            self.stage_boundary_completed = self.completed;
            self.stage_boundary_time = Instant::now();
        }
    }

    fn eta(&self, remaining_tasks: u64) -> Option<Duration> {
        let speed = self.speed_tasks_per_sec?;
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_tasks as f64 / speed))
    }
}

struct State {
    callbacks: Callbacks,
    /// Normalized weight contributed by each output level.
    level_share: Vec<f64>,
    level_out_counts: Vec<u64>,
    level_done: Vec<u64>,
    last_emit: Instant,
}

impl State {
    fn percentage(&self) -> f64 {
        let mut acc = 0.0;
        for i in 0..self.level_share.len() {
            let total = self.level_out_counts[i].max(1) as f64;
            let done = self.level_done[i] as f64;
            acc += self.level_share[i] * (done / total).min(1.0);
        }
        (acc * 100.0).min(100.0)
    }

    fn remaining_tasks(&self) -> u64 {
        self.level_out_counts
            .iter()
            .zip(self.level_done.iter())
            .map(|(total, done)| total.saturating_sub(*done))
            .sum()
    }
}

/// Aggregates weighted progress across levels, drives the ETA sampler, and
/// owns the cooperative-cancellation flag shared with workers.
pub struct ProgressCoordinator {
    cancel_flag: Arc<AtomicBool>,
    state: Mutex<State>,
    eta: Mutex<EtaSampler>,
}

impl ProgressCoordinator {
    /// Builds a coordinator with no level weighting configured yet. Logging
    /// and cancellation are available immediately, so this can be built
    /// before the input sequence has even been scanned; call
    /// `configure_levels` once the per-level slice counts are known.
    pub fn new(callbacks: Option<Callbacks>, sample_size: u32, seeded_speed: Option<f64>) -> Self {
        ProgressCoordinator {
            cancel_flag: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(State {
                callbacks: callbacks.unwrap_or_default(),
                level_share: Vec::new(),
                level_out_counts: Vec::new(),
                level_done: Vec::new(),
                last_emit: Instant::now(),
            }),
            eta: Mutex::new(EtaSampler::new(sample_size, seeded_speed)),
        }
    }

    /// Sets the per-level weighting once the plan is known. `level_in_counts[i]`
    /// is the slice count of the input level that produces output level `i + 1`.
    pub fn configure_levels(&self, level_in_counts: &[u64]) {
        let mut weights: Vec<f64> = level_in_counts.iter().map(|&n| 2.0 * n as f64).collect();
        if let Some(first) = weights.first_mut() {
            *first *= 1.5;
        }
        let total: f64 = weights.iter().sum::<f64>().max(f64::MIN_POSITIVE);
        let level_share: Vec<f64> = weights.iter().map(|w| w / total).collect();
        let level_out_counts: Vec<u64> = level_in_counts.iter().map(|&n| n.div_ceil(2)).collect();

        let mut state = self.state.lock();
        state.level_share = level_share;
        state.level_out_counts = level_out_counts;
        state.level_done = vec![0; level_in_counts.len()];
    }

    /// Shared cancellation flag, to be polled from worker checkpoints.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    /// Requests cooperative cancellation. Never blocks on in-flight workers;
    /// they observe the flag at their own checkpoints.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Records one task's completion and (rate-limited) emits progress.
    /// `level_index` is 1-based: level 0 is the source sequence itself and
    /// is never reported through here.
    pub fn report(&self, level_index: u32, _out_index: u64, status: &WorkerStatus) {
        if let WorkerStatus::Failed(e) = status {
            if e.is_cancelled() {
                return;
            }
        }

        let idx = (level_index.saturating_sub(1)) as usize;
        let mut state = self.state.lock();
        if idx < state.level_done.len() {
            state.level_done[idx] += 1;
        }
        let remaining = state.remaining_tasks();

        let eta = {
            let mut sampler = self.eta.lock();
            sampler.record_completion();
            sampler.eta(remaining)
        };

        self.maybe_emit(&mut state, eta, false);
    }

    /// Forces an emission regardless of the rate limit; used at level
    /// boundaries so a host always sees a tick when one level finishes and
    /// the next begins.
    pub fn emit_boundary(&self, detail: &str) {
        let mut state = self.state.lock();
        if let Some(cb) = state.callbacks.on_detail.as_mut() {
            cb(detail);
        }
        let remaining = state.remaining_tasks();
        let eta = self.eta.lock().eta(remaining);
        self.maybe_emit(&mut state, eta, true);
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let mut state = self.state.lock();
        if let Some(cb) = state.callbacks.on_log.as_mut() {
            cb(level, message);
        }
    }

    fn maybe_emit(&self, state: &mut State, eta: Option<Duration>, force: bool) {
        let now = Instant::now();
        let percentage = state.percentage();
        if !force && now.duration_since(state.last_emit) < EMIT_INTERVAL && percentage < 100.0 {
            return;
        }
        state.last_emit = now;
        if let Some(cb) = state.callbacks.on_progress.as_mut() {
            let keep_going = cb(percentage);
            if !keep_going {
                self.cancel_flag.store(true, Ordering::SeqCst);
            }
        }
        let _ = eta; // ETA text formatting is the host's responsibility; see `eta_text`.
    }

    /// Renders the current ETA as host-facing text, `"estimating"` while the
    /// sampler hasn't left bootstrap.
    pub fn eta_text(&self) -> String {
        let remaining = self.state.lock().remaining_tasks();
        match self.eta.lock().eta(remaining) {
            Some(d) => format_duration(d),
            None => "estimating".to_string(),
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn percentage_is_monotonic_and_weighted_to_early_levels() {
        let coordinator = ProgressCoordinator::new(None, 20, None);
        coordinator.configure_levels(&[8, 4]);
        for i in 0..4u64 {
            coordinator.report(1, i, &WorkerStatus::Generated);
        }
        let after_level1 = coordinator.state.lock().percentage();
        for i in 0..2u64 {
            coordinator.report(2, i, &WorkerStatus::Generated);
        }
        let after_level2 = coordinator.state.lock().percentage();
        assert!(after_level2 > after_level1);
        assert!((after_level2 - 100.0).abs() < 1e-6);
    }

    #[test]
    fn cancelled_outcomes_do_not_advance_progress() {
        let coordinator = ProgressCoordinator::new(None, 20, None);
        coordinator.configure_levels(&[4]);
        coordinator.report(1, 0, &WorkerStatus::Failed(ErrorKind::Cancelled));
        assert_eq!(coordinator.state.lock().percentage(), 0.0);
    }

    #[test]
    fn eta_is_estimating_until_bootstrap_completes() {
        let coordinator = ProgressCoordinator::new(None, 20, None);
        coordinator.configure_levels(&[100]);
        for i in 0..19u64 {
            coordinator.report(1, i, &WorkerStatus::Generated);
        }
        assert_eq!(coordinator.eta_text(), "estimating");
        coordinator.report(1, 19, &WorkerStatus::Generated);
        assert_ne!(coordinator.eta_text(), "estimating");
    }

    #[test]
    fn seeded_speed_skips_bootstrap() {
        let coordinator = ProgressCoordinator::new(None, 20, Some(50.0));
        coordinator.configure_levels(&[100]);
        assert_ne!(coordinator.eta_text(), "estimating");
    }

    #[test]
    fn cancel_is_observed_via_shared_handle() {
        let coordinator = ProgressCoordinator::new(None, 20, None);
        coordinator.configure_levels(&[4]);
        let handle = coordinator.cancel_handle();
        assert!(!handle.load(Ordering::SeqCst));
        coordinator.cancel();
        assert!(handle.load(Ordering::SeqCst));
    }
}
