//! Bisection search for the DAC codes that produce target ADC readings.
//!
//! Both DAC channels are searched at once: every iteration drives one
//! candidate per channel, takes a single averaged two-channel capture, and
//! narrows each channel's interval independently. A channel that reaches
//! tolerance keeps its code while the other one continues.
//!
//! The ADC reading is assumed to increase monotonically with the DAC code,
//! which holds for the loopback path of the calibration switch matrix.

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::{CHANNELS, RAW_MAX, RAW_MIN};

/// Drive/measure access needed by the search.
pub trait DacLoopback {
    /// Drive one raw code on each DAC channel and wait for it to settle.
    fn drive(&mut self, codes: [i16; CHANNELS]) -> Result<()>;

    /// Averaged, offset-corrected ADC reading of each channel.
    fn measure(&mut self, samples: usize) -> Result<[f64; CHANNELS]>;
}

/// Parameters of one search.
#[derive(Debug, Clone, PartialEq)]
pub struct FineTuneRequest {
    /// Center of the search interval per channel
    pub start: [i16; CHANNELS],
    /// Interval width; the search covers `start ± span / 2`
    pub span: u16,
    /// Target ADC reading per channel, offset-corrected
    pub targets: [f64; CHANNELS],
    /// Samples averaged per measurement
    pub samples: usize,
    /// Accepted absolute error, ADC raw units
    pub tolerance: f64,
    /// Iteration budget
    pub max_iterations: u32,
}

/// Result of a search.
#[derive(Debug, Clone, PartialEq)]
pub enum FineTuneOutcome {
    /// Every channel reached tolerance.
    Converged {
        /// DAC codes found
        codes: [i16; CHANNELS],
        /// Iterations used
        iterations: u32,
    },
    /// Budget or interval exhausted; best codes seen so far.
    NotConverged {
        /// Closest DAC codes
        codes: [i16; CHANNELS],
        /// Error remaining at those codes, ADC raw units
        residuals: [f64; CHANNELS],
        /// Iterations used
        iterations: u32,
    },
    /// Cancellation observed before an iteration.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct ChannelSearch {
    low: i32,
    high: i32,
    best: i32,
    best_error: f64,
    converged: bool,
}

impl ChannelSearch {
    fn new(start: i16, span: u16) -> Self {
        let half = i32::from(span) / 2;
        let start = i32::from(start);
        Self {
            low: (start - half).max(RAW_MIN),
            high: (start + half).min(RAW_MAX),
            best: start,
            best_error: f64::INFINITY,
            converged: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.low > self.high
    }

    fn active(&self) -> bool {
        !self.converged && !self.exhausted()
    }

    fn candidate(&self) -> i32 {
        if self.active() {
            // Floor division keeps the midpoint inside [low, high] for negatives
            (self.low + self.high).div_euclid(2)
        } else {
            self.best
        }
    }

    fn update(&mut self, candidate: i32, error: f64, tolerance: f64) {
        if error.abs() < self.best_error {
            self.best = candidate;
            self.best_error = error.abs();
        }
        if error.abs() <= tolerance {
            self.converged = true;
            self.best = candidate;
            self.best_error = error.abs();
        } else if error < 0.0 {
            self.low = candidate + 1;
        } else {
            self.high = candidate - 1;
        }
    }
}

/// Search for the DAC codes whose averaged ADC readback matches the targets.
///
/// The cancel token is checked before each iteration, so a pre-set token
/// returns [`FineTuneOutcome::Cancelled`] without driving anything.
pub fn fine_tune(
    probe: &mut dyn DacLoopback,
    cancel: &CancelToken,
    request: &FineTuneRequest,
) -> Result<FineTuneOutcome> {
    let mut channels = request.start.map(|start| ChannelSearch::new(start, request.span));
    let mut iterations = 0;

    while iterations < request.max_iterations && channels.iter().any(ChannelSearch::active) {
        if cancel.is_cancelled() {
            info!("Fine-tune cancelled after {} iterations", iterations);
            return Ok(FineTuneOutcome::Cancelled);
        }
        iterations += 1;

        let candidates = channels.map(|c| c.candidate());
        probe.drive(candidates.map(|c| c as i16))?;
        let readings = probe.measure(request.samples)?;

        for ch in 0..CHANNELS {
            if channels[ch].active() {
                let error = readings[ch] - request.targets[ch];
                channels[ch].update(candidates[ch], error, request.tolerance);
            }
        }

        debug!(
            "Fine-tune iteration {}: codes {:?} readings [{:.3}, {:.3}]",
            iterations, candidates, readings[0], readings[1]
        );
    }

    let codes = channels.map(|c| c.best as i16);
    if channels.iter().all(|c| c.converged) {
        info!(
            "Fine-tune converged in {} iterations: {:?}",
            iterations, codes
        );
        return Ok(FineTuneOutcome::Converged { codes, iterations });
    }

    let residuals = channels.map(|c| c.best_error);
    warn!(
        "Fine-tune did not converge after {} iterations: codes {:?}, residuals {:?}",
        iterations, codes, residuals
    );
    Ok(FineTuneOutcome::NotConverged {
        codes,
        residuals,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CalibrationError;

    /// Linear loopback: reading = (code - zero) * slope.
    struct LinearLoopback {
        zero: [f64; CHANNELS],
        slope: [f64; CHANNELS],
        driven: [i16; CHANNELS],
        drives: usize,
        fail_measure: bool,
    }

    impl LinearLoopback {
        fn new(zero: [f64; CHANNELS], slope: [f64; CHANNELS]) -> Self {
            Self {
                zero,
                slope,
                driven: [0; CHANNELS],
                drives: 0,
                fail_measure: false,
            }
        }
    }

    impl DacLoopback for LinearLoopback {
        fn drive(&mut self, codes: [i16; CHANNELS]) -> Result<()> {
            self.driven = codes;
            self.drives += 1;
            Ok(())
        }

        fn measure(&mut self, _samples: usize) -> Result<[f64; CHANNELS]> {
            if self.fail_measure {
                return Err(CalibrationError::Capture {
                    message: "short read".into(),
                });
            }
            Ok([0, 1].map(|ch| (self.driven[ch] as f64 - self.zero[ch]) * self.slope[ch]))
        }
    }

    fn request(start: [i16; CHANNELS]) -> FineTuneRequest {
        FineTuneRequest {
            start,
            span: 1024,
            targets: [0.0, 0.0],
            samples: 16,
            tolerance: 0.5,
            max_iterations: 16,
        }
    }

    #[test]
    fn test_target_at_midpoint_converges_in_one_iteration() {
        let mut probe = LinearLoopback::new([40.0, -25.0], [1.0, 1.0]);
        let outcome = fine_tune(&mut probe, &CancelToken::new(), &request([40, -25])).unwrap();

        assert_eq!(
            outcome,
            FineTuneOutcome::Converged {
                codes: [40, -25],
                iterations: 1
            }
        );
        assert_eq!(probe.drives, 1);
    }

    #[test]
    fn test_bisection_finds_offsets() {
        let mut probe = LinearLoopback::new([137.0, -301.0], [1.02, 0.97]);
        let outcome = fine_tune(&mut probe, &CancelToken::new(), &request([0, 0])).unwrap();

        match outcome {
            FineTuneOutcome::Converged { codes, iterations } => {
                assert_eq!(codes, [137, -301]);
                assert!(iterations <= 11, "took {} iterations", iterations);
            }
            other => panic!("expected convergence, got {:?}", other),
        }
    }

    #[test]
    fn test_preset_cancel_drives_nothing() {
        let mut probe = LinearLoopback::new([0.0, 0.0], [1.0, 1.0]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = fine_tune(&mut probe, &cancel, &request([0, 0])).unwrap();
        assert_eq!(outcome, FineTuneOutcome::Cancelled);
        assert_eq!(probe.drives, 0);
    }

    #[test]
    fn test_unreachable_target_reports_best() {
        // Zero crossing lies outside start ± span/2
        let mut probe = LinearLoopback::new([900.0, 0.0], [1.0, 1.0]);
        let outcome = fine_tune(&mut probe, &CancelToken::new(), &request([0, 0])).unwrap();

        match outcome {
            FineTuneOutcome::NotConverged {
                codes, residuals, ..
            } => {
                assert_eq!(codes, [512, 0]);
                assert!((residuals[0] - 388.0).abs() < 1e-9);
                assert_eq!(residuals[1], 0.0);
            }
            other => panic!("expected NotConverged, got {:?}", other),
        }
    }

    #[test]
    fn test_iteration_budget_exhausted() {
        let mut probe = LinearLoopback::new([300.0, 300.0], [1.0, 1.0]);
        let mut req = request([0, 0]);
        req.max_iterations = 2;

        let outcome = fine_tune(&mut probe, &CancelToken::new(), &req).unwrap();
        match outcome {
            FineTuneOutcome::NotConverged { iterations, .. } => assert_eq!(iterations, 2),
            other => panic!("expected NotConverged, got {:?}", other),
        }
        assert_eq!(probe.drives, 2);
    }

    #[test]
    fn test_step_larger_than_tolerance() {
        // Each DAC code moves the reading by 3 ADC units: 0.5 is unreachable
        let mut probe = LinearLoopback::new([10.3, 10.3], [3.0, 3.0]);
        let outcome = fine_tune(&mut probe, &CancelToken::new(), &request([0, 0])).unwrap();

        match outcome {
            FineTuneOutcome::NotConverged {
                codes, residuals, ..
            } => {
                assert_eq!(codes, [10, 10]);
                assert!((residuals[0] - 0.9).abs() < 1e-9);
            }
            other => panic!("expected NotConverged, got {:?}", other),
        }
    }

    #[test]
    fn test_measure_error_propagates() {
        let mut probe = LinearLoopback::new([0.0, 0.0], [1.0, 1.0]);
        probe.fail_measure = true;
        let err = fine_tune(&mut probe, &CancelToken::new(), &request([5, 5])).unwrap_err();
        assert!(matches!(err, CalibrationError::Capture { .. }));
    }

    #[test]
    fn test_interval_clamped_to_raw_range() {
        let search = ChannelSearch::new(2000, 1024);
        assert_eq!(search.high, RAW_MAX);
        assert_eq!(search.low, 2000 - 512);
    }
}
