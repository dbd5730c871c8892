use std::time::Duration;

use cinder_core::{ResultCode, Verdict};

pub const PROGRESS_MAX: u8 = 255;

/// Coarse phase reported alongside numeric progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Preparing,
    Waiting,
    Caching,
    Executing,
    RollingBack,
}

impl ProgressState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Waiting => "waiting",
            Self::Caching => "caching",
            Self::Executing => "executing",
            Self::RollingBack => "rolling-back",
        }
    }
}

/// Observer every performer reports through. The verdict returned from
/// `on_progress` is the only cooperative-cancellation channel from the UI
/// into a running performer.
pub trait ProgressObserver {
    fn on_progress(&mut self, position: u8) -> Verdict;
    fn on_progress_detail(&mut self, _position: u8) {}
    fn on_state_change(&mut self, _state: ProgressState) {}
    fn on_state_change_detail(&mut self, _state: ProgressState, _detail: &str) {}
    fn on_reboot_pending(&mut self) {}
    fn finished(&mut self, _result: ResultCode) {}
}

/// Observer that swallows everything and never cancels.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressObserver for NullProgress {
    fn on_progress(&mut self, _position: u8) -> Verdict {
        Verdict::Continue
    }
}

/// Maps N sequential per-item phases, weighted by estimated install time,
/// onto a single 0–255 scale. Reports are clamped monotone non-decreasing
/// even when an inner phase resets to zero.
pub struct WeightedObserver<'a> {
    inner: &'a mut dyn ProgressObserver,
    total_weight: u64,
    completed_weight: u64,
    current_weight: u64,
    last_reported: u8,
}

impl<'a> WeightedObserver<'a> {
    pub fn new(inner: &'a mut dyn ProgressObserver, total_weight: u64) -> Self {
        Self {
            inner,
            total_weight: total_weight.max(1),
            completed_weight: 0,
            current_weight: 0,
            last_reported: 0,
        }
    }

    pub fn begin_item(&mut self, weight: u32) {
        self.current_weight = u64::from(weight);
    }

    pub fn complete_item(&mut self) -> Verdict {
        self.completed_weight = (self.completed_weight + self.current_weight).min(self.total_weight);
        self.current_weight = 0;
        self.report(PROGRESS_MAX)
    }

    pub fn position(&self) -> u8 {
        self.last_reported
    }

    fn overall(&self, sub_position: u8) -> u8 {
        let numerator =
            self.completed_weight * 255 + self.current_weight * u64::from(sub_position);
        (numerator / self.total_weight).min(255) as u8
    }

    fn report(&mut self, sub_position: u8) -> Verdict {
        let overall = self.overall(sub_position).max(self.last_reported);
        self.last_reported = overall;
        self.inner.on_progress(overall)
    }
}

impl ProgressObserver for WeightedObserver<'_> {
    fn on_progress(&mut self, position: u8) -> Verdict {
        self.report(position)
    }

    fn on_progress_detail(&mut self, position: u8) {
        self.inner.on_progress_detail(position);
    }

    fn on_state_change(&mut self, state: ProgressState) {
        self.inner.on_state_change(state);
    }

    fn on_state_change_detail(&mut self, state: ProgressState, detail: &str) {
        self.inner.on_state_change_detail(state, detail);
    }

    fn on_reboot_pending(&mut self) {
        self.inner.on_reboot_pending();
    }
}

/// Subdivides one item's multi-step internal work (e.g. several target
/// products for a single patch) across the item's own 0–255 range, evenly
/// or by explicit per-phase weights.
pub struct PhasedObserver<'a> {
    inner: &'a mut dyn ProgressObserver,
    weights: Vec<u32>,
    phase: usize,
    last_reported: u8,
}

impl<'a> PhasedObserver<'a> {
    pub fn even(inner: &'a mut dyn ProgressObserver, phase_count: usize) -> Self {
        Self::weighted(inner, vec![1; phase_count.max(1)])
    }

    pub fn weighted(inner: &'a mut dyn ProgressObserver, weights: Vec<u32>) -> Self {
        let weights = if weights.is_empty() { vec![1] } else { weights };
        Self {
            inner,
            weights,
            phase: 0,
            last_reported: 0,
        }
    }

    pub fn next_phase(&mut self) -> Verdict {
        let verdict = self.report(PROGRESS_MAX);
        if self.phase + 1 < self.weights.len() {
            self.phase += 1;
        }
        verdict
    }

    fn total_weight(&self) -> u64 {
        self.weights.iter().map(|weight| u64::from(*weight)).sum::<u64>().max(1)
    }

    fn completed_weight(&self) -> u64 {
        self.weights[..self.phase]
            .iter()
            .map(|weight| u64::from(*weight))
            .sum()
    }

    fn report(&mut self, sub_position: u8) -> Verdict {
        let current = u64::from(self.weights[self.phase]);
        let numerator = self.completed_weight() * 255 + current * u64::from(sub_position);
        let overall = ((numerator / self.total_weight()).min(255) as u8).max(self.last_reported);
        self.last_reported = overall;
        self.inner.on_progress(overall)
    }
}

impl ProgressObserver for PhasedObserver<'_> {
    fn on_progress(&mut self, position: u8) -> Verdict {
        self.report(position)
    }

    fn on_progress_detail(&mut self, position: u8) {
        self.inner.on_progress_detail(position);
    }

    fn on_state_change(&mut self, state: ProgressState) {
        self.inner.on_state_change(state);
    }

    fn on_state_change_detail(&mut self, state: ProgressState, detail: &str) {
        self.inner.on_state_change_detail(state, detail);
    }

    fn on_reboot_pending(&mut self) {
        self.inner.on_reboot_pending();
    }
}

/// Maps forward 0–255 progress of a rollback pass onto the shrinking
/// region between the failure point and zero, so the overall bar visibly
/// unwinds. Deliberately not monotone.
pub struct RollbackObserver<'a> {
    inner: &'a mut dyn ProgressObserver,
    start: u8,
}

impl<'a> RollbackObserver<'a> {
    pub fn new(inner: &'a mut dyn ProgressObserver, start: u8) -> Self {
        Self { inner, start }
    }
}

impl ProgressObserver for RollbackObserver<'_> {
    fn on_progress(&mut self, position: u8) -> Verdict {
        let consumed = (u32::from(self.start) * u32::from(position) / 255) as u8;
        self.inner.on_progress(self.start - consumed)
    }

    fn on_state_change(&mut self, _state: ProgressState) {
        self.inner.on_state_change(ProgressState::RollingBack);
    }

    fn on_state_change_detail(&mut self, _state: ProgressState, detail: &str) {
        self.inner
            .on_state_change_detail(ProgressState::RollingBack, detail);
    }

    fn on_reboot_pending(&mut self) {
        self.inner.on_reboot_pending();
    }
}

/// Two parallel progress streams (download and install) reduced by plain
/// averaging. This is the one place the monotonicity contract is waived.
#[derive(Debug, Default, Clone, Copy)]
pub struct AveragedStreams {
    download: u8,
    install: u8,
}

impl AveragedStreams {
    pub fn set_download(&mut self, position: u8) {
        self.download = position;
    }

    pub fn set_install(&mut self, position: u8) {
        self.install = position;
    }

    pub fn combined(&self) -> u8 {
        ((u16::from(self.download) + u16::from(self.install)) / 2) as u8
    }
}

/// Time-based progress approximation for children that report nothing: a
/// sigmoid over expected duration, fast through the middle and flat at the
/// tails, capped short of completion until the child actually exits.
pub fn time_curve_position(elapsed: Duration, expected: Duration) -> u8 {
    let expected_secs = expected.as_secs_f64().max(1.0);
    let normalized = elapsed.as_secs_f64() / expected_secs;
    let sigmoid = 1.0 / (1.0 + (-6.0 * (normalized - 0.5)).exp());
    let position = (sigmoid * 255.0) as u16;
    position.min(250) as u8
}
