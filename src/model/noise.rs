use serde::{Deserialize, Serialize};

/// What the denoiser is trained to predict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// Discrete diffusion noise schedule
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    prediction_type: PredictionType,
}

impl NoiseSchedule {
    /// Schedule from explicit betas
    pub fn from_betas(betas: Vec<f64>, prediction_type: PredictionType) -> Self {
        let alphas_cumprod = cumprod(&betas);
        Self {
            betas,
            alphas_cumprod,
            prediction_type,
        }
    }

    /// "scaled_linear" schedule: betas linear in sqrt space
    pub fn scaled_linear(timesteps: usize, beta_start: f64, beta_end: f64) -> Self {
        let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
        let betas = (0..timesteps)
            .map(|t| {
                let frac = if timesteps > 1 {
                    t as f64 / (timesteps - 1) as f64
                } else {
                    0.0
                };
                let b = start + (end - start) * frac;
                b * b
            })
            .collect();
        Self::from_betas(betas, PredictionType::Epsilon)
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    /// Signal-to-noise ratio at the last timestep
    pub fn terminal_snr(&self) -> f64 {
        match self.alphas_cumprod.last() {
            Some(&a) if a < 1.0 => a / (1.0 - a),
            _ => f64::INFINITY,
        }
    }

    /// Shift and scale `sqrt(alphas_cumprod)` so the last timestep carries no
    /// signal while the first stays unchanged.
    pub fn rescale_to_zero_terminal_snr(&mut self) {
        if self.alphas_cumprod.len() < 2 {
            return;
        }
        let mut sqrt_bar: Vec<f64> = self.alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let first = sqrt_bar[0];
        let last = sqrt_bar[sqrt_bar.len() - 1];
        let scale = first / (first - last);
        for s in &mut sqrt_bar {
            *s = (*s - last) * scale;
        }

        let alphas_bar: Vec<f64> = sqrt_bar.iter().map(|s| s * s).collect();
        let mut alphas = Vec::with_capacity(alphas_bar.len());
        alphas.push(alphas_bar[0]);
        alphas.extend(alphas_bar.windows(2).map(|w| w[1] / w[0]));

        self.betas = alphas.iter().map(|a| 1.0 - a).collect();
        self.alphas_cumprod = alphas_bar;
    }

    /// Train on v-prediction targets
    pub fn force_v_prediction(&mut self) {
        self.prediction_type = PredictionType::VPrediction;
    }
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self::scaled_linear(1000, 0.00085, 0.012)
    }
}

fn cumprod(betas: &[f64]) -> Vec<f64> {
    betas
        .iter()
        .scan(1.0, |acc, beta| {
            *acc *= 1.0 - beta;
            Some(*acc)
        })
        .collect()
}
