//! Token sampling for autoregressive generation.
//!
//! Logits are first restricted to their `k` largest entries, `k` being derived from a
//! filter threshold: a threshold of `0.9` keeps the top 10% of the vocabulary.
use candle::{DType, Error, Result, Tensor};
use rand::{distributions::Distribution, Rng, SeedableRng};

/// Number of logits kept by [`top_k`] for a vocabulary of `num_logits` entries.
pub fn top_k_count(num_logits: usize, thres: f64) -> usize {
    let k = ((1. - thres) * num_logits as f64) as usize;
    usize::max(k, 1)
}

/// Keeps the `k` largest values of each row, the others are set to `-inf`.
pub fn top_k(logits: &[f32], thres: f64) -> Vec<f32> {
    let k = top_k_count(logits.len(), thres);
    let mut argsort_indices = (0..logits.len()).collect::<Vec<_>>();
    argsort_indices.sort_by(|&i, &j| logits[j].total_cmp(&logits[i]));
    let mut filtered = vec![f32::NEG_INFINITY; logits.len()];
    for &index in argsort_indices.iter().take(k) {
        filtered[index] = logits[index]
    }
    filtered
}

pub struct TopKSampler {
    rng: rand::rngs::StdRng,
    filter_thres: f64,
    temperature: f64,
}

impl TopKSampler {
    pub fn new(seed: u64, filter_thres: f64, temperature: f64) -> Self {
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
            filter_thres,
            temperature,
        }
    }

    fn rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
        match logits.rank() {
            1 => Ok(vec![logits.to_dtype(DType::F32)?.to_vec1()?]),
            2 => logits.to_dtype(DType::F32)?.to_vec2(),
            rank => candle::bail!("expected logits of rank 1 or 2, got {rank}"),
        }
    }

    /// Gumbel-max sampling over the filtered logits, one token per row.
    pub fn sample_gumbel(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let temperature = f64::max(self.temperature, 1e-10);
        let mut tokens = vec![];
        for row in Self::rows(logits)? {
            let filtered = top_k(&row, self.filter_thres);
            let mut best = None;
            for (index, &logit) in filtered.iter().enumerate() {
                if logit == f32::NEG_INFINITY {
                    continue;
                }
                let u: f64 = self.rng.gen();
                let noise = -(-(u + 1e-20).ln() + 1e-20).ln();
                let score = logit as f64 / temperature + noise;
                match best {
                    Some((_, best_score)) if best_score >= score => {}
                    _ => best = Some((index, score)),
                }
            }
            match best {
                Some((index, _)) => tokens.push(index as u32),
                None => candle::bail!("no finite logit to sample from"),
            }
        }
        Ok(tokens)
    }

    /// Samples from `softmax(filtered / temperature)`, one token per row.
    pub fn sample_multinomial(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let temperature = f64::max(self.temperature, 1e-10);
        let mut tokens = vec![];
        for row in Self::rows(logits)? {
            let filtered = top_k(&row, self.filter_thres);
            let max = filtered
                .iter()
                .copied()
                .fold(f32::NEG_INFINITY, f32::max);
            let prs: Vec<f64> = filtered
                .iter()
                .map(|&l| ((l - max) as f64 / temperature).exp())
                .collect();
            let distr = rand::distributions::WeightedIndex::new(&prs).map_err(Error::wrap)?;
            tokens.push(distr.sample(&mut self.rng) as u32)
        }
        Ok(tokens)
    }
}
