//! 확률 임계값 시그널.
//!
//! 마이크로 모델의 상승 확률을 매수/매도 임계값과 비교하여 방향을 정하고,
//! 선택적으로 EMA(4)/EMA(8) 국면 필터를 적용합니다.

use serde::{Deserialize, Serialize};
use tracing::debug;
use trader_core::{Candle, Decision, SignalDirection};

use crate::indicators::{closes, ema, features_at, rsi, zscore};
use crate::micro_model::MIN_TRAIN_CANDLES;
use crate::{MicroModel, SignalSource};

/// 임계값 시그널 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// 이 확률을 넘으면 매수
    pub buy_threshold: f64,
    /// 이 확률 미만이면 매도
    pub sell_threshold: f64,
    /// EMA 국면 필터 사용 여부
    pub use_ma_filter: bool,
    /// N번 판단마다 재학습 (0이면 비활성)
    pub fit_every: u32,
    /// 학습률
    pub fit_lr: f64,
    /// 재학습 에폭 수
    pub fit_epochs: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            buy_threshold: 0.55,
            sell_threshold: 0.45,
            use_ma_filter: false,
            fit_every: 0,
            fit_lr: 0.05,
            fit_epochs: 4,
        }
    }
}

/// EMA 국면 판정.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    Bullish,
    Bearish,
    Neutral,
}

/// 확률 임계값 시그널 소스.
pub struct ThresholdSignal {
    config: ThresholdConfig,
    model: MicroModel,
    decisions: u32,
}

impl ThresholdSignal {
    pub fn new(config: ThresholdConfig, model: MicroModel) -> Self {
        Self {
            config,
            model,
            decisions: 0,
        }
    }

    /// EMA(4)/EMA(8) 교차 형태로 국면을 판정.
    fn regime(close: &[f64]) -> Regime {
        let i = close.len() - 1;
        let (fast, slow) = (ema(close, 4), ema(close, 8));
        let gap = |k: usize| slow[k] - fast[k];

        let (g0, g2, g3) = (gap(i), gap(i - 2), gap(i - 3));
        let low_bottom = g3 > 0.0 && -g2 > -g3 && -g0 < -g2 && g0 > 0.0;
        let high_peak = g3 < 0.0 && g2 > g3 && g0 < g2 && g0 < 0.0;
        let down_going_up = g0 > 0.0 && g0 < g3 && g3 > 0.0;
        let up_going_down = g0 < 0.0 && -g0 < -g3 && g3 < 0.0;

        if low_bottom {
            Regime::Bullish
        } else if high_peak {
            Regime::Bearish
        } else if down_going_up {
            Regime::Bullish
        } else if up_going_down {
            Regime::Bearish
        } else {
            Regime::Neutral
        }
    }
}

impl SignalSource for ThresholdSignal {
    fn name(&self) -> &str {
        "threshold"
    }

    fn decide(&mut self, candles: &[Candle]) -> Decision {
        if candles.len() < MIN_TRAIN_CANDLES {
            return Decision::flat(0.0);
        }
        let close = closes(candles);

        self.decisions = self.decisions.wrapping_add(1);
        if self.config.fit_every > 0 && self.decisions % self.config.fit_every == 0 {
            self.model.fit(&close, self.config.fit_lr, self.config.fit_epochs);
            debug!(weights = ?self.model.weights, bias = self.model.bias, "모델 재학습");
        }

        let i = close.len() - 1;
        let rsi14 = rsi(&close, 14);
        let z20 = zscore(&close, 20);
        let Some(features) = features_at(&close, &rsi14, &z20, i) else {
            return Decision::flat(0.5);
        };
        let p_up = self.model.predict(&features);

        let regime = if self.config.use_ma_filter {
            Self::regime(&close)
        } else {
            Regime::Neutral
        };
        let buy_ok = !self.config.use_ma_filter || regime == Regime::Bullish;
        let sell_ok = !self.config.use_ma_filter || regime == Regime::Bearish;

        let signal = if p_up > self.config.buy_threshold && buy_ok {
            SignalDirection::Buy
        } else if p_up < self.config.sell_threshold && sell_ok {
            SignalDirection::Sell
        } else {
            SignalDirection::Flat
        };
        debug!(p_up, signal = %signal, regime = ?regime, "시그널 판단");
        Decision { signal, p_up }
    }

    fn model(&self) -> Option<&MicroModel> {
        Some(&self.model)
    }

    fn restore_model(&mut self, model: MicroModel) {
        self.model = model;
    }
}
