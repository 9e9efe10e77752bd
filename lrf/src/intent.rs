//! Short-window trajectory model over chunk accesses. The predictor keeps
//! the last few seconds of `(cx, cz)` samples and extrapolates a probability
//! cone of coordinates the mover is likely to need next.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// How far back samples participate in the velocity estimate.
const HISTORY_WINDOW: Duration = Duration::from_secs(3);

/// Hard cap on retained samples.
const HISTORY_CAP: usize = 64;

/// Minimum samples for a meaningful direction; below this the caller falls
/// back to its spatial heuristics.
const MIN_SAMPLES: usize = 3;

struct Sample {
    cx: i32,
    cz: i32,
    at: Instant,
}

/// The movement-intent predictor for one region engine.
pub struct IntentPredictor {
    samples: VecDeque<Sample>,
}

impl IntentPredictor {

    pub fn new() -> Self {
        Self { samples: VecDeque::new() }
    }

    /// Record a chunk access. Consecutive accesses to the same chunk only
    /// refresh the window, they are not movement.
    pub fn record(&mut self, cx: i32, cz: i32) {
        self.record_at(cx, cz, Instant::now());
    }

    fn record_at(&mut self, cx: i32, cz: i32, at: Instant) {
        self.prune(at);
        if let Some(last) = self.samples.back_mut() {
            if last.cx == cx && last.cz == cz {
                last.at = at;
                return;
            }
        }
        if self.samples.len() == HISTORY_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { cx, cz, at });
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > HISTORY_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of samples currently inside the window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Produce up to `lookahead` distinct coordinates in priority order,
    /// nearest to the mover first. Returns empty when the history is too
    /// short to carry a direction.
    pub fn predict(&mut self, cx: i32, cz: i32, lookahead: usize) -> Vec<(i32, i32)> {
        self.predict_at(cx, cz, lookahead, Instant::now())
    }

    fn predict_at(&mut self, cx: i32, cz: i32, lookahead: usize, now: Instant) -> Vec<(i32, i32)> {

        self.prune(now);
        if self.samples.len() < MIN_SAMPLES || lookahead == 0 {
            return Vec::new();
        }

        // Mean per-step velocity and an L1 directional variance over the
        // consecutive deltas of the window.
        let mut sum = (0.0f64, 0.0f64);
        let mut deltas = Vec::with_capacity(self.samples.len() - 1);
        for pair in self.samples.make_contiguous().windows(2) {
            let dx = (pair[1].cx - pair[0].cx) as f64;
            let dz = (pair[1].cz - pair[0].cz) as f64;
            sum.0 += dx;
            sum.1 += dz;
            deltas.push((dx, dz));
        }
        let n = deltas.len() as f64;
        let (vx, vz) = (sum.0 / n, sum.1 / n);

        let speed = (vx * vx + vz * vz).sqrt();
        if speed < 0.1 {
            return Vec::new();
        }

        let variance = deltas.iter()
            .map(|(dx, dz)| ((dx - vx).abs() + (dz - vz).abs()) / 2.0)
            .sum::<f64>() / n;

        // Lateral spread is perpendicular to the primary direction and
        // widens with both distance and observed variance.
        let (ux, uz) = (vx / speed, vz / speed);
        let (px, pz) = (-uz, ux);

        let mut seen = HashSet::new();
        let mut cone = Vec::new();
        let mut push = |x: i32, z: i32| {
            if (x, z) != (cx, cz) && seen.insert((x, z)) {
                cone.push((x, z));
            }
        };

        for k in 1..=lookahead {
            let fx = cx as f64 + vx * k as f64;
            let fz = cz as f64 + vz * k as f64;
            push(fx.round() as i32, fz.round() as i32);
            let spread = ((variance * k as f64).ceil() as usize).min(k);
            for j in 1..=spread {
                push((fx + px * j as f64).round() as i32, (fz + pz * j as f64).round() as i32);
                push((fx - px * j as f64).round() as i32, (fz - pz * j as f64).round() as i32);
            }
        }

        cone.sort_by_key(|&(x, z)| {
            let (dx, dz) = ((x - cx) as i64, (z - cz) as i64);
            dx * dx + dz * dz
        });
        cone.truncate(lookahead);
        cone

    }

}

impl Default for IntentPredictor {
    fn default() -> Self {
        Self::new()
    }
}
