use std::collections::VecDeque;

use log::debug;

use crate::{
    observation::ObservationEpoch,
    settings::{PositioningMode, ProcessingOptions},
    utils::seconds_between,
};

/// Base epochs retained while no rover epoch is pending
const MAX_BASE_EPOCHS: usize = 32;

/// Rover epoch, with the base epoch it was paired with (if any)
#[derive(Debug, Clone, PartialEq)]
pub struct Matched {
    pub rover: ObservationEpoch,
    pub base: Option<ObservationEpoch>,
}

/// Pairs rover epochs with time-aligned base epochs.
/// Every rover epoch is released exactly once, in order.
#[derive(Debug, Clone)]
pub struct EpochMatcher {
    mode: PositioningMode,
    tolerance_s: f64,
    timeout_s: f64,
    /// Rover epochs, with time spent waiting (s)
    rovers: VecDeque<(ObservationEpoch, f64)>,
    bases: VecDeque<ObservationEpoch>,
}

impl EpochMatcher {
    pub fn new(options: &ProcessingOptions) -> Self {
        Self {
            mode: options.mode,
            tolerance_s: options.base_tolerance_ms as f64 / 1000.0,
            timeout_s: options.base_timeout_ms as f64 / 1000.0,
            rovers: VecDeque::with_capacity(8),
            bases: VecDeque::with_capacity(MAX_BASE_EPOCHS),
        }
    }

    pub fn push_rover(&mut self, epoch: ObservationEpoch) {
        self.rovers.push_back((epoch, 0.0));
    }

    pub fn push_base(&mut self, epoch: ObservationEpoch) {
        if self.mode == PositioningMode::Single {
            return;
        }

        if self.bases.len() == MAX_BASE_EPOCHS {
            self.bases.pop_front();
        }
        self.bases.push_back(epoch);
    }

    /// Rover epochs waiting for their base epoch
    pub fn pending(&self) -> usize {
        self.rovers.len()
    }

    /// Nearest base epoch within tolerance
    fn nearest_base(&self, rover: &ObservationEpoch) -> Option<&ObservationEpoch> {
        self.bases
            .iter()
            .map(|base| (base, seconds_between(rover.epoch, base.epoch).abs()))
            .filter(|(_, dt)| *dt <= self.tolerance_s)
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(base, _)| base)
    }

    /// True when the base stream already moved past this rover epoch
    fn base_is_ahead(&self, rover: &ObservationEpoch) -> bool {
        self.bases
            .back()
            .is_some_and(|base| seconds_between(base.epoch, rover.epoch) > self.tolerance_s)
    }

    /// Releases rover epochs that are ready to be solved.
    /// Waiting epochs are aged by `elapsed_s`. A rover epoch is released without
    /// base epoch in [PositioningMode::Single], when the base stream is not delivering,
    /// when the base stream is ahead of it, or once it waited too long.
    pub fn poll(&mut self, elapsed_s: f64, base_active: bool) -> Vec<Matched> {
        let mut released = Vec::with_capacity(self.rovers.len());

        for (_, waited) in self.rovers.iter_mut() {
            *waited += elapsed_s;
        }

        while let Some((rover, waited)) = self.rovers.front() {
            let base = if self.mode == PositioningMode::Single {
                None
            } else if let Some(base) = self.nearest_base(rover) {
                Some(base.clone())
            } else if !base_active || self.base_is_ahead(rover) || *waited >= self.timeout_s {
                debug!("{} - no base epoch (waited {:.3}s)", rover.epoch, waited);
                None
            } else {
                break;
            };

            if let Some((rover, _)) = self.rovers.pop_front() {
                released.push(Matched { rover, base });
            }
        }

        if let Some((oldest, _)) = self.rovers.front() {
            let oldest = oldest.epoch;
            let tolerance_s = self.tolerance_s;
            self.bases
                .retain(|base| seconds_between(oldest, base.epoch) <= tolerance_s);
        }

        released
    }
}
