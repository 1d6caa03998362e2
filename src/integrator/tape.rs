//! Forward-trajectory taping for adjoint integration.
//!
//! During a taped forward sweep the solver records every accepted step as a
//! `(t, xz, xzdot)` frame. The backward sweep never re-runs the forward
//! problem: whenever a backward residual or Jacobian needs the forward state
//! at some interior time, it is reconstructed from the bracketing frames by
//! cubic Hermite interpolation (or linear interpolation in polynomial mode).

use nalgebra::DVector;

use super::Interpolation;

#[derive(Debug, Clone)]
struct TapeRecord {
    t: f64,
    yy: DVector<f64>,
    yp: DVector<f64>,
}

/// The recorded forward trajectory.
#[derive(Debug, Clone)]
pub(crate) struct Tape {
    records: Vec<TapeRecord>,
    interp: Interpolation,
    steps_per_checkpoint: usize,
}

impl Tape {
    pub fn new(steps_per_checkpoint: usize, interp: Interpolation) -> Self {
        Tape {
            records: Vec::with_capacity(steps_per_checkpoint.max(1)),
            interp,
            steps_per_checkpoint: steps_per_checkpoint.max(1),
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Appends a frame. Frames must arrive in increasing time order; a frame
    /// at (numerically) the same time replaces the previous one.
    pub fn record(&mut self, t: f64, yy: &DVector<f64>, yp: &DVector<f64>) {
        if let Some(last) = self.records.last() {
            if (t - last.t).abs() <= 1e-14 * t.abs().max(1.0) {
                self.records.pop();
            }
        }
        self.records.push(TapeRecord {
            t,
            yy: yy.clone(),
            yp: yp.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of checkpoints the tape represents, one per
    /// `steps_per_checkpoint` stored frames.
    pub fn ncheckpoints(&self) -> usize {
        self.records.len().div_ceil(self.steps_per_checkpoint)
    }

    /// Time range covered by the tape, if any frames exist.
    pub fn span(&self) -> Option<(f64, f64)> {
        match (self.records.first(), self.records.last()) {
            (Some(a), Some(b)) => Some((a.t, b.t)),
            _ => None,
        }
    }

    /// Reconstructs the forward state at time `t` into the output slices.
    ///
    /// Returns false if the tape is empty or `t` lies outside the recorded
    /// span (beyond a small relative slack).
    pub fn interpolate(&self, t: f64, yy: &mut [f64], yp: &mut [f64]) -> bool {
        let (t_first, t_last) = match self.span() {
            Some(span) => span,
            None => return false,
        };
        let slack = 1e-9 * (t_last - t_first).abs().max(1.0);
        if t < t_first - slack || t > t_last + slack {
            return false;
        }
        let t = t.clamp(t_first, t_last);

        // Index of the first record with record.t >= t
        let hi = self.records.partition_point(|r| r.t < t);
        if hi == 0 {
            copy_frame(&self.records[0], yy, yp);
            return true;
        }
        if hi == self.records.len() {
            copy_frame(&self.records[hi - 1], yy, yp);
            return true;
        }
        let lo = &self.records[hi - 1];
        let hi = &self.records[hi];
        let dt = hi.t - lo.t;
        if dt.abs() <= f64::EPSILON * hi.t.abs().max(1.0) {
            copy_frame(hi, yy, yp);
            return true;
        }
        let s = (t - lo.t) / dt;

        match self.interp {
            Interpolation::Hermite => {
                // Cubic Hermite basis on [0, 1]
                let h00 = (1.0 + 2.0 * s) * (1.0 - s) * (1.0 - s);
                let h10 = s * (1.0 - s) * (1.0 - s);
                let h01 = s * s * (3.0 - 2.0 * s);
                let h11 = s * s * (s - 1.0);
                // Derivatives of the basis wrt t
                let d00 = 6.0 * s * (s - 1.0) / dt;
                let d10 = (3.0 * s * s - 4.0 * s + 1.0) / dt;
                let d01 = 6.0 * s * (1.0 - s) / dt;
                let d11 = (3.0 * s * s - 2.0 * s) / dt;
                for i in 0..yy.len() {
                    yy[i] = h00 * lo.yy[i]
                        + h10 * dt * lo.yp[i]
                        + h01 * hi.yy[i]
                        + h11 * dt * hi.yp[i];
                    yp[i] = d00 * lo.yy[i]
                        + d10 * dt * lo.yp[i]
                        + d01 * hi.yy[i]
                        + d11 * dt * hi.yp[i];
                }
            }
            Interpolation::Polynomial => {
                for i in 0..yy.len() {
                    yy[i] = (1.0 - s) * lo.yy[i] + s * hi.yy[i];
                    yp[i] = (1.0 - s) * lo.yp[i] + s * hi.yp[i];
                }
            }
        }
        true
    }
}

fn copy_frame(record: &TapeRecord, yy: &mut [f64], yp: &mut [f64]) {
    yy.copy_from_slice(record.yy.as_slice());
    yp.copy_from_slice(record.yp.as_slice());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic_tape(interp: Interpolation) -> Tape {
        // y(t) = t^2, yp(t) = 2t, framed at t = 0, 1, 2
        let mut tape = Tape::new(1, interp);
        for i in 0..3 {
            let t = i as f64;
            tape.record(
                t,
                &DVector::from_column_slice(&[t * t]),
                &DVector::from_column_slice(&[2.0 * t]),
            );
        }
        tape
    }

    #[test]
    fn test_hermite_reproduces_cubics_exactly() {
        let tape = quadratic_tape(Interpolation::Hermite);
        let mut yy = [0.0];
        let mut yp = [0.0];
        for &t in &[0.25, 0.5, 1.3, 1.9] {
            assert!(tape.interpolate(t, &mut yy, &mut yp));
            assert!((yy[0] - t * t).abs() < 1e-12, "y({t}) = {}", yy[0]);
            assert!((yp[0] - 2.0 * t).abs() < 1e-12, "yp({t}) = {}", yp[0]);
        }
    }

    #[test]
    fn test_out_of_span_is_rejected() {
        let tape = quadratic_tape(Interpolation::Hermite);
        let mut yy = [0.0];
        let mut yp = [0.0];
        assert!(!tape.interpolate(-0.5, &mut yy, &mut yp));
        assert!(!tape.interpolate(2.5, &mut yy, &mut yp));
        assert!(tape.interpolate(2.0, &mut yy, &mut yp));
        assert_eq!(yy[0], 4.0);
    }

    #[test]
    fn test_same_time_frame_replaces() {
        let mut tape = Tape::new(1, Interpolation::Hermite);
        let y = DVector::from_column_slice(&[1.0]);
        let yp = DVector::from_column_slice(&[0.0]);
        tape.record(0.0, &y, &yp);
        tape.record(0.0, &DVector::from_column_slice(&[2.0]), &yp);
        assert_eq!(tape.len(), 1);
        let mut out = [0.0];
        let mut outp = [0.0];
        assert!(tape.interpolate(0.0, &mut out, &mut outp));
        assert_eq!(out[0], 2.0);
    }

    #[test]
    fn test_checkpoint_counting() {
        let mut tape = Tape::new(4, Interpolation::Hermite);
        let yp = DVector::from_column_slice(&[0.0]);
        for i in 0..10 {
            tape.record(i as f64, &DVector::from_column_slice(&[i as f64]), &yp);
        }
        assert_eq!(tape.len(), 10);
        assert_eq!(tape.ncheckpoints(), 3);
    }
}
