//! 방향성 확률을 내는 소형 로지스틱 모델.
//!
//! 피처 `[ret1, ret5, rsi14/100, zscore20]`에 대한 가중치와 편향만 가지며,
//! 가중치는 봇 상태와 함께 저장됩니다.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::indicators::{features_at, rsi, zscore};

/// 피처 개수.
pub const FEATURE_COUNT: usize = 4;

/// 학습에 필요한 최소 종가 수.
pub const MIN_TRAIN_CANDLES: usize = 40;

/// 로지스틱 마이크로 모델.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroModel {
    /// 가중치
    pub weights: Vec<f64>,
    /// 편향
    #[serde(default)]
    pub bias: f64,
}

impl Default for MicroModel {
    fn default() -> Self {
        Self {
            weights: vec![0.0; FEATURE_COUNT],
            bias: 0.0,
        }
    }
}

impl MicroModel {
    /// 작은 정규 분포 가중치로 초기화.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let weights = (0..FEATURE_COUNT)
            .map(|_| {
                // Box-Muller
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen();
                (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos() * 0.01
            })
            .collect();
        Self { weights, bias: 0.0 }
    }

    /// 상승 확률. 피처 길이가 맞지 않으면 0.5.
    pub fn predict(&self, features: &[f64]) -> f64 {
        if features.len() != self.weights.len() {
            return 0.5;
        }
        let z = self.bias
            + self
                .weights
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>();
        sigmoid(z)
    }

    /// 교차 엔트로피 경사 하강 (다음 봉 상승 여부를 레이블로 사용).
    ///
    /// 종가가 `MIN_TRAIN_CANDLES`보다 적으면 아무것도 하지 않습니다.
    pub fn fit(&mut self, close: &[f64], lr: f64, epochs: usize) {
        if close.len() < MIN_TRAIN_CANDLES {
            return;
        }
        let rsi14 = rsi(close, 14);
        let z20 = zscore(close, 20);
        let dataset: Vec<([f64; FEATURE_COUNT], f64)> = (21..close.len() - 1)
            .filter_map(|i| {
                let label = if close[i + 1] > close[i] { 1.0 } else { 0.0 };
                features_at(close, &rsi14, &z20, i).map(|f| (f, label))
            })
            .collect();

        for _ in 0..epochs {
            for (features, label) in &dataset {
                let grad = self.predict(features) - label;
                for (w, x) in self.weights.iter_mut().zip(features) {
                    *w -= lr * grad * x;
                }
                self.bias -= lr * grad;
            }
        }
    }
}

/// 수치 안정성을 위해 |x| > 20 구간을 잘라낸 시그모이드.
fn sigmoid(x: f64) -> f64 {
    if x > 20.0 {
        1.0
    } else if x < -20.0 {
        0.0
    } else {
        1.0 / (1.0 + (-x).exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_rejects_wrong_feature_len() {
        let model = MicroModel::random();
        assert_eq!(model.predict(&[1.0, 2.0]), 0.5);
    }

    #[test]
    fn test_sigmoid_clamps() {
        assert_eq!(sigmoid(25.0), 1.0);
        assert_eq!(sigmoid(-25.0), 0.0);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fit_learns_uptrend_bias() {
        let close: Vec<f64> = (0..120).map(|i| 100.0 + i as f64 * 0.5).collect();
        let mut model = MicroModel::default();
        model.fit(&close, 0.1, 20);
        assert!(model.bias > 0.0);
    }

    #[test]
    fn test_fit_skips_short_history() {
        let mut model = MicroModel::default();
        model.fit(&[1.0; 10], 0.1, 5);
        assert_eq!(model, MicroModel::default());
    }

    #[test]
    fn test_model_serde_round_trip() {
        let model = MicroModel {
            weights: vec![0.1, -0.2, 0.3, 0.0],
            bias: 0.05,
        };
        let json = serde_json::to_string(&model).unwrap();
        let back: MicroModel = serde_json::from_str(&json).unwrap();
        assert_eq!(model, back);
    }
}
