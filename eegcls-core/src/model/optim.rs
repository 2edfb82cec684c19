//! Adam optimizer over flat parameter slices.

use serde::{Deserialize, Serialize};

/// Optimizer settings, as reported by the trainable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub name: String,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl OptimizerConfig {
    pub fn adam(learning_rate: f64) -> Self {
        Self {
            name: "Adam".to_string(),
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Adam with bias correction. Moment buffers are sized on the first step.
#[derive(Debug, Clone)]
pub struct Adam {
    config: OptimizerConfig,
    step: u64,
    first_moment: Vec<Vec<f64>>,
    second_moment: Vec<Vec<f64>>,
}

impl Adam {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            step: 0,
            first_moment: Vec::new(),
            second_moment: Vec::new(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Apply one update. `params[i]` and `grads[i]` must have equal lengths.
    pub fn step(&mut self, params: &mut [&mut [f32]], grads: &[&[f32]]) {
        if self.first_moment.len() != params.len() {
            self.first_moment = params.iter().map(|p| vec![0.0; p.len()]).collect();
            self.second_moment = params.iter().map(|p| vec![0.0; p.len()]).collect();
        }
        self.step += 1;

        let OptimizerConfig {
            learning_rate,
            beta1,
            beta2,
            eps,
            ..
        } = self.config;
        let t = self.step as i32;
        let correction1 = 1.0 - beta1.powi(t);
        let correction2 = 1.0 - beta2.powi(t);

        for (group, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            let m = &mut self.first_moment[group];
            let v = &mut self.second_moment[group];
            for i in 0..param.len() {
                let g = f64::from(grad[i]);
                m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                let m_hat = m[i] / correction1;
                let v_hat = v[i] / correction2;
                param[i] -= (learning_rate * m_hat / (v_hat.sqrt() + eps)) as f32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(OptimizerConfig::adam(0.1));
        let mut w = vec![1.0f32, -1.0];
        let grads: [&[f32]; 1] = [&[0.5, -2.0]];
        adam.step(&mut [w.as_mut_slice()], &grads);
        // With bias correction the first step is lr * sign(g).
        assert!((w[0] - 0.9).abs() < 1e-5);
        assert!((w[1] + 0.9).abs() < 1e-5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_minimises_quadratic() {
        let mut adam = Adam::new(OptimizerConfig::adam(0.05));
        let mut x = vec![3.0f32];
        for _ in 0..500 {
            let grad = [2.0 * x[0]];
            let grads: [&[f32]; 1] = [&grad];
            adam.step(&mut [x.as_mut_slice()], &grads);
        }
        assert!(x[0].abs() < 0.1, "x = {}", x[0]);
    }
}
