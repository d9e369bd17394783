//! Local outlier factor over `(entry, runtime)` points.
//!
//! Neighbour search is exhaustive. A point whose local reachability density
//! is well below that of its neighbours gets a factor above 1; the highest
//! factors up to the contamination budget are labelled anomalous.

use crate::config::{LofConfig, Metric};

use super::{Label, Sample};

/// Added to the mean reachability distance so duplicate points keep a finite density.
const DENSITY_EPS: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct Lof {
    n_neighbors: usize,
    metric: Metric,
    contamination: f64,
}

impl Lof {
    pub fn new(cfg: &LofConfig) -> Self {
        Self {
            n_neighbors: cfg.n_neighbors.max(1),
            metric: cfg.metric,
            contamination: cfg.contamination,
        }
    }

    fn distance(&self, a: &Sample, b: &Sample) -> f64 {
        let dx = (a.entry - b.entry).abs();
        let dy = (a.runtime - b.runtime).abs();
        match self.metric {
            Metric::Euclidean => dx.hypot(dy),
            Metric::Manhattan => dx + dy,
            Metric::Chebyshev => dx.max(dy),
        }
    }

    /// Local outlier factor of every sample. Empty for fewer than two samples.
    pub fn factors(&self, samples: &[Sample]) -> Vec<f64> {
        let n = samples.len();
        if n < 2 {
            return Vec::new();
        }
        let k = self.n_neighbors.min(n - 1);

        // k nearest neighbours of each point, closest first.
        let mut neighbors: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
        for (i, a) in samples.iter().enumerate() {
            let mut dists: Vec<(usize, f64)> = samples
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, b)| (j, self.distance(a, b)))
                .collect();
            dists.sort_by(|x, y| x.1.total_cmp(&y.1));
            dists.truncate(k);
            neighbors.push(dists);
        }

        let k_distance: Vec<f64> = neighbors
            .iter()
            .map(|nn| nn.last().map(|(_, d)| *d).unwrap_or(0.0))
            .collect();

        let lrd: Vec<f64> = neighbors
            .iter()
            .map(|nn| {
                let reach: f64 = nn.iter().map(|(j, d)| d.max(k_distance[*j])).sum();
                1.0 / (reach / nn.len() as f64 + DENSITY_EPS)
            })
            .collect();

        neighbors
            .iter()
            .enumerate()
            .map(|(i, nn)| {
                let ratio: f64 = nn.iter().map(|(j, _)| lrd[*j] / lrd[i]).sum();
                ratio / nn.len() as f64
            })
            .collect()
    }

    /// Outlier scores; larger magnitude means more anomalous.
    pub fn scores(&self, samples: &[Sample]) -> Vec<f64> {
        self.factors(samples).into_iter().map(|f| -f).collect()
    }

    pub fn classify(&self, samples: &[Sample]) -> Vec<Label> {
        let mut labels = vec![Label::Normal; samples.len()];
        let factors = self.factors(samples);
        if factors.is_empty() {
            return labels;
        }

        let budget = (self.contamination * samples.len() as f64).ceil() as usize;
        let mut order: Vec<usize> = (0..factors.len()).collect();
        order.sort_by(|a, b| factors[*b].total_cmp(&factors[*a]));

        for i in order.into_iter().take(budget) {
            if factors[i] > 1.0 {
                labels[i] = Label::Anomalous;
            }
        }
        labels
    }
}
