//! In-memory classification data and a Gaussian-cluster generator.

use crate::config::SyntheticDataConfig;
use crate::training::collaborators::{Batch, DataSource};
use crate::training::rng::{LoaderRngs, StreamRng};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Labelled examples served in fixed-size batches; the last batch may be short.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    examples: Vec<(Vec<f64>, usize)>,
    batch_size: usize,
    shuffle: bool,
    augment_noise: f64,
}

impl InMemoryDataset {
    pub fn new(examples: Vec<(Vec<f64>, usize)>, batch_size: usize) -> Self {
        Self {
            examples,
            batch_size: batch_size.max(1),
            shuffle: false,
            augment_noise: 0.0,
        }
    }

    /// Reorder examples every pass using the shuffle stream.
    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    /// Add Gaussian jitter with this standard deviation to every feature.
    pub fn with_augmentation(mut self, noise: f64) -> Self {
        self.augment_noise = noise;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl DataSource for InMemoryDataset {
    fn num_examples(&self) -> usize {
        self.examples.len()
    }

    fn batches<'a>(&'a self, rngs: LoaderRngs<'a>) -> Box<dyn Iterator<Item = Batch> + 'a> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if self.shuffle {
            order.shuffle(rngs.shuffle);
        }
        let augment = rngs.augment;
        let noise = self.augment_noise;
        let batch_size = self.batch_size;

        Box::new((0..order.len()).step_by(batch_size).map(move |start| {
            let end = (start + batch_size).min(order.len());
            let mut inputs = Vec::with_capacity(end - start);
            let mut targets = Vec::with_capacity(end - start);
            for &idx in &order[start..end] {
                let (features, target) = &self.examples[idx];
                let row = if noise > 0.0 {
                    features
                        .iter()
                        .map(|x| x + noise * standard_normal(augment))
                        .collect()
                } else {
                    features.clone()
                };
                inputs.push(row);
                targets.push(*target);
            }
            Batch { inputs, targets }
        }))
    }
}

/// Box–Muller sample from N(0, 1).
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.r#gen::<f64>();
    let u2: f64 = rng.r#gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Train and validation splits drawn around shared class centres.
///
/// The content depends only on `config`, never on the run seed, so a resumed
/// run sees the same examples.
pub fn gaussian_clusters(
    config: &SyntheticDataConfig,
    batch_size: usize,
) -> (InMemoryDataset, InMemoryDataset) {
    let mut rng = StreamRng::seed_from_u64(config.seed);
    let centres: Vec<Vec<f64>> = (0..config.num_classes)
        .map(|_| {
            (0..config.num_features)
                .map(|_| rng.gen_range(-3.0..3.0))
                .collect()
        })
        .collect();

    let sample = |count: usize, rng: &mut StreamRng| -> Vec<(Vec<f64>, usize)> {
        (0..count)
            .map(|i| {
                let class = i % config.num_classes;
                let features = centres[class]
                    .iter()
                    .map(|c| c + config.cluster_spread * standard_normal(rng))
                    .collect();
                (features, class)
            })
            .collect()
    };

    rng.jump();
    let train = sample(config.train_examples, &mut rng);
    rng.jump();
    let val = sample(config.val_examples, &mut rng);

    (
        InMemoryDataset::new(train, batch_size)
            .shuffled()
            .with_augmentation(config.augment_noise),
        InMemoryDataset::new(val, batch_size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::rng::RngStreams;

    fn examples(n: usize) -> Vec<(Vec<f64>, usize)> {
        (0..n).map(|i| (vec![i as f64], i % 2)).collect()
    }

    fn first_column(ds: &InMemoryDataset, rngs: &mut RngStreams) -> Vec<f64> {
        let (loader, _) = rngs.split();
        ds.batches(loader)
            .flat_map(|b| b.inputs.into_iter().map(|row| row[0]))
            .collect()
    }

    #[test]
    fn test_partial_last_batch() {
        let ds = InMemoryDataset::new(examples(35), 10);
        let mut rngs = RngStreams::seeded(0);
        let (loader, _) = rngs.split();
        let sizes: Vec<usize> = ds.batches(loader).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![10, 10, 10, 5]);
    }

    #[test]
    fn test_unshuffled_keeps_order_and_rngs() {
        let ds = InMemoryDataset::new(examples(4), 3);
        let mut rngs = RngStreams::seeded(0);
        let before = rngs.clone();
        assert_eq!(first_column(&ds, &mut rngs), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(rngs, before);
    }

    #[test]
    fn test_shuffle_is_reproducible_from_rng_state() {
        let ds = InMemoryDataset::new(examples(20), 6).shuffled();
        let mut a = RngStreams::seeded(3);
        let mut b = RngStreams::seeded(3);
        assert_eq!(first_column(&ds, &mut a), first_column(&ds, &mut b));

        let second_a = first_column(&ds, &mut a);
        let mut restored = RngStreams::seeded(0);
        restored.restore(&b);
        assert_eq!(first_column(&ds, &mut restored), second_a);
    }

    #[test]
    fn test_augmentation_draws_from_array_stream() {
        let ds = InMemoryDataset::new(examples(4), 4).with_augmentation(0.1);
        let mut rngs = RngStreams::seeded(9);
        let before = rngs.clone();
        let jittered = first_column(&ds, &mut rngs);
        assert_ne!(jittered, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(rngs.general, before.general);
        assert_ne!(rngs.array, before.array);
    }

    #[test]
    fn test_gaussian_clusters_are_deterministic() {
        let config = SyntheticDataConfig::default();
        let (train_a, val_a) = gaussian_clusters(&config, 16);
        let (train_b, _) = gaussian_clusters(&config, 16);
        assert_eq!(train_a.num_examples(), config.train_examples);
        assert_eq!(val_a.num_examples(), config.val_examples);
        assert_eq!(train_a.examples, train_b.examples);
    }
}
