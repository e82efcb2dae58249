/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: Optimizer::DEFAULT_LEARNING_RATE,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// The update rule applied to trainable weights.
///
/// The executor pushes the optimizer into every weight data source before a
/// training run; the data source owns the momentum and velocity state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Optimizer {
    Adam(AdamParams),
    Sgd { learning_rate: f32, momentum: f32 },
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer::Adam(AdamParams::default())
    }
}

impl Optimizer {
    pub const DEFAULT_LEARNING_RATE: f32 = 1e-3;

    pub fn adam(learning_rate: f32) -> Self {
        Optimizer::Adam(AdamParams {
            learning_rate,
            ..Default::default()
        })
    }

    pub fn sgd(learning_rate: f32, momentum: f32) -> Self {
        Optimizer::Sgd {
            learning_rate,
            momentum,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Optimizer::Adam(_) => "Adam",
            Optimizer::Sgd { .. } => "SGD",
        }
    }

    pub fn learning_rate(&self) -> f32 {
        match self {
            Optimizer::Adam(p) => p.learning_rate,
            Optimizer::Sgd { learning_rate, .. } => *learning_rate,
        }
    }

    pub fn with_learning_rate(self, learning_rate: f32) -> Self {
        match self {
            Optimizer::Adam(p) => Optimizer::Adam(AdamParams { learning_rate, ..p }),
            Optimizer::Sgd { momentum, .. } => Optimizer::Sgd {
                learning_rate,
                momentum,
            },
        }
    }

    /// Apply one update step. `step` starts at 1.
    pub(crate) fn update(
        &self,
        step: u64,
        value: &mut [f32],
        momentum: &mut [f32],
        velocity: &mut [f32],
        gradient: &[f32],
    ) {
        debug_assert_eq!(value.len(), gradient.len());
        match *self {
            Optimizer::Adam(AdamParams {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            }) => {
                let t = step.max(1) as i32;
                let c1 = 1.0 - beta1.powi(t);
                let c2 = 1.0 - beta2.powi(t);
                for i in 0..value.len() {
                    let g = gradient[i];
                    momentum[i] = beta1 * momentum[i] + (1.0 - beta1) * g;
                    velocity[i] = beta2 * velocity[i] + (1.0 - beta2) * g * g;
                    let m = momentum[i] / c1;
                    let v = velocity[i] / c2;
                    value[i] -= learning_rate * m / (v.sqrt() + epsilon);
                }
            }
            Optimizer::Sgd {
                learning_rate,
                momentum: mu,
            } => {
                for i in 0..value.len() {
                    momentum[i] = mu * momentum[i] - learning_rate * gradient[i];
                    value[i] += momentum[i];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adam_moves_against_gradient() {
        let opt = Optimizer::default();
        let mut w = vec![1.0, -1.0];
        let mut m = vec![0.0; 2];
        let mut v = vec![0.0; 2];
        opt.update(1, &mut w, &mut m, &mut v, &[0.5, -0.5]);
        assert!((w[0] - (1.0 - 1e-3)).abs() < 1e-5);
        assert!((w[1] - (-1.0 + 1e-3)).abs() < 1e-5);
    }

    #[test]
    fn sgd_step() {
        let opt = Optimizer::sgd(0.1, 0.0);
        let mut w = vec![1.0];
        let mut m = vec![0.0];
        let mut v = vec![0.0];
        opt.update(1, &mut w, &mut m, &mut v, &[2.0]);
        assert!((w[0] - 0.8).abs() < 1e-6);
    }
}
