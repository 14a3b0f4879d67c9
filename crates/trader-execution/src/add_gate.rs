//! 추가 진입 게이트.
//!
//! 두 가지 독립적인 진입 전략을 다룹니다.
//!
//! - **역행 피라미딩**: 같은 방향에 로트가 있을 때, 마지막 추가 이후 최소 시간이
//!   지났고 최신 진입가 대비 유효 역행 폭 이상 불리하게 움직였을 때만 추가합니다.
//!   유효 역행 폭은 경과 분에 따라 지수 감쇠하며, 하한 도달 시간의 두 배가 지나면
//!   관측된 최악 가격이 게이트로 고정(latch)됩니다.
//! - **자산 변동 트리거**: 마지막 추가 시점의 자산 대비 ±N% 변동 시 여유 재고의
//!   단계별 비율(25/50/75/100%)로 진입하고, 새 로트를 즉시 러너로 지정합니다.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use trader_core::{Side, SidePair, SignalDirection};

use crate::config::{EquityTriggerConfig, PyramidConfig};
use crate::sizing::{floor_to_step, to_f64, OrderSize};

// =============================================================================
// 피라미딩 타이머
// =============================================================================

/// 방향별 피라미딩 상태.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidTimers {
    /// 마지막 추가 시각
    pub last_add: Option<DateTime<Utc>>,
    /// 마지막 추가 이후 최악 가격 (매수는 저점, 매도는 고점). 0이면 미관측.
    pub watermark: Decimal,
    /// 고정된 게이트 가격. 0이면 미고정.
    pub latched_gate: Decimal,
}

impl PyramidTimers {
    /// 새 로트 추가 시 재설정.
    pub fn on_add(&mut self, now: DateTime<Utc>, price: Decimal) {
        self.last_add = Some(now);
        self.watermark = price;
        self.latched_gate = Decimal::ZERO;
    }

    /// 가장 최근 로트가 청산되었을 때 재기준.
    pub fn reanchor(&mut self, now: DateTime<Utc>) {
        self.last_add = Some(now);
        self.watermark = Decimal::ZERO;
        self.latched_gate = Decimal::ZERO;
    }
}

/// 마지막 추가 이후 최악 가격 추적 (매수 저점, 매도 고점).
pub fn track_watermarks(timers: &mut SidePair<PyramidTimers>, price: Decimal) {
    let buy = &mut timers.buy;
    if buy.last_add.is_some() && (buy.watermark.is_zero() || price < buy.watermark) {
        buy.watermark = price;
    }
    let sell = &mut timers.sell;
    if sell.last_add.is_some() && (sell.watermark.is_zero() || price > sell.watermark) {
        sell.watermark = price;
    }
}

// =============================================================================
// 역행 게이트
// =============================================================================

/// 감쇠된 유효 역행 폭 (%)과 하한 도달 시간 (분).
///
/// 감쇠가 없거나 하한이 기준 이상이면 하한 도달 시간은 None.
pub fn decay_schedule(cfg: &PyramidConfig, elapsed_min: f64) -> (f64, Option<f64>) {
    let base = cfg.min_adverse_pct;
    let lambda = cfg.decay_lambda;
    let floor = cfg.decay_min_pct;
    if lambda <= 0.0 {
        return (base, None);
    }
    let eff = (base * (-lambda * elapsed_min).exp()).max(floor);
    let t_floor = (base > floor && floor > 0.0).then(|| (base / floor).ln() / lambda);
    (eff, t_floor)
}

/// 피라미딩 게이트 계산 결과 (진입 근거 문자열에도 사용).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidGate {
    pub gate_price: Decimal,
    pub latched: Decimal,
    pub eff_pct: f64,
    pub base_pct: f64,
    pub elapsed_min: f64,
}

/// 피라미딩 게이트 판정.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PyramidVerdict {
    /// 추가 허용
    Pass(PyramidGate),
    /// 최소 간격 미달
    Spacing { elapsed_sec: i64, need_sec: i64 },
    /// 역행 폭 미달
    Adverse(PyramidGate),
}

/// 역행 피라미딩 게이트.
///
/// `last_entry`는 해당 방향 최신 로트의 진입가입니다. 게이트는 관측된 최악 가격보다
/// 느슨해지지 않도록 클램프됩니다.
pub fn evaluate_pyramid(
    cfg: &PyramidConfig,
    side: Side,
    timers: &mut PyramidTimers,
    last_entry: Decimal,
    price: Decimal,
    now: DateTime<Utc>,
) -> PyramidVerdict {
    let elapsed = timers.last_add.map(|t| now - t);
    if let Some(elapsed) = elapsed {
        if elapsed.num_seconds() < cfg.min_seconds_between {
            debug!(side = %side, elapsed_sec = elapsed.num_seconds(), need_sec = cfg.min_seconds_between, "피라미딩 간격 미달");
            return PyramidVerdict::Spacing {
                elapsed_sec: elapsed.num_seconds(),
                need_sec: cfg.min_seconds_between,
            };
        }
    }

    let elapsed_min = elapsed.map(|e| e.num_milliseconds() as f64 / 60_000.0).unwrap_or(0.0);
    let (eff_pct, t_floor) = decay_schedule(cfg, elapsed_min);

    // 하한 도달 이후에만 최악 가격을 기록하고, 두 배가 지나면 고정
    match t_floor {
        Some(tf) if elapsed_min >= tf => {
            let worse = match side {
                Side::Buy => price < timers.watermark,
                Side::Sell => price > timers.watermark,
            };
            if timers.watermark.is_zero() || worse {
                timers.watermark = price;
            }
            if timers.latched_gate.is_zero() && elapsed_min >= 2.0 * tf && !timers.watermark.is_zero() {
                timers.latched_gate = timers.watermark;
                debug!(side = %side, latched = %timers.latched_gate, elapsed_min, t_floor_min = tf, "게이트 고정");
            }
        }
        _ => timers.watermark = Decimal::ZERO,
    }

    let eff = Decimal::from_f64(eff_pct).unwrap_or(Decimal::ZERO) / dec!(100);
    let mut gate_price = if timers.latched_gate > Decimal::ZERO {
        timers.latched_gate
    } else {
        match side {
            Side::Buy => last_entry * (Decimal::ONE - eff),
            Side::Sell => last_entry * (Decimal::ONE + eff),
        }
    };

    let passed = match side {
        Side::Buy => {
            let mut clamp = last_entry;
            if timers.watermark > Decimal::ZERO && timers.watermark < clamp {
                clamp = timers.watermark;
            }
            gate_price = gate_price.min(clamp);
            price <= gate_price
        }
        Side::Sell => {
            let mut clamp = last_entry;
            if timers.watermark > clamp {
                clamp = timers.watermark;
            }
            gate_price = gate_price.max(clamp);
            price >= gate_price
        }
    };

    let gate = PyramidGate {
        gate_price,
        latched: timers.latched_gate,
        eff_pct,
        base_pct: cfg.min_adverse_pct,
        elapsed_min,
    };
    debug!(
        side = %side,
        price = %price,
        last = %last_entry,
        gate = %gate_price,
        latched = %timers.latched_gate,
        eff_pct,
        elapsed_min,
        passed,
        "피라미딩 역행 게이트"
    );
    if passed {
        PyramidVerdict::Pass(gate)
    } else {
        PyramidVerdict::Adverse(gate)
    }
}

/// 피라미딩 진입 근거 문자열.
pub fn pyramid_reason(p_up: f64, gate: Option<&PyramidGate>) -> String {
    let (gate_price, latched, eff, base, elapsed_hr) = match gate {
        Some(g) => (
            to_f64(g.gate_price),
            to_f64(g.latched),
            g.eff_pct,
            g.base_pct,
            g.elapsed_min / 60.0,
        ),
        None => (0.0, 0.0, 0.0, 0.0, 0.0),
    };
    format!(
        "pUp={p_up:.5}|gatePrice={gate_price:.3}|latched={latched:.3}|effPct={eff:.3}|basePct={base:.3}|elapsedHr={elapsed_hr:.1}"
    )
}

// =============================================================================
// 자산 변동 트리거
// =============================================================================

/// 자산 변동 트리거 감지.
///
/// - 매도: 매도 기준 자산 대비 `up_pct`% 이상 증가 + 매도 시그널
/// - 매수: 매수 기준 자산 대비 `down_pct`% 이상 감소 + 매수 시그널
///
/// 트리거되면 단위로 내린 여유 재고(매도는 기준 자산, 매수는 호가 자산)를 반환합니다.
pub fn detect_equity_trigger(
    cfg: &EquityTriggerConfig,
    signal: SignalDirection,
    equity: Decimal,
    baselines: &SidePair<Decimal>,
    spare: Decimal,
    step: Decimal,
) -> Option<Decimal> {
    if !cfg.enable {
        return None;
    }
    let side = signal.side()?;
    let baseline = baselines[side];
    if baseline <= Decimal::ZERO {
        return None;
    }
    let hit = match side {
        Side::Sell => equity >= baseline * (Decimal::ONE + cfg.up_pct / dec!(100)),
        Side::Buy => equity <= baseline * (Decimal::ONE - cfg.down_pct / dec!(100)),
    };
    if !hit {
        return None;
    }
    let amount = floor_to_step(spare.max(Decimal::ZERO), step);
    debug!(side = %side, equity = %equity, baseline = %baseline, spare = %amount, "자산 변동 트리거");
    (amount > Decimal::ZERO).then_some(amount)
}

/// 자산 변동 트리거 진입 근거 문자열.
pub fn equity_reason(side: Side, equity: Decimal, baseline: Decimal, spare: Decimal) -> String {
    let ratio = if baseline > Decimal::ZERO {
        to_f64(equity) / to_f64(baseline)
    } else {
        0.0
    };
    let (equity, baseline, spare) = (to_f64(equity), to_f64(baseline), to_f64(spare));
    match side {
        Side::Sell => format!(
            "EQUITY Trading: equityUSD={equity:.2} lastAddEquitySell={baseline:.2} pct_diff_sell={ratio:.6} equitySpareBase={spare:.8}"
        ),
        Side::Buy => format!(
            "EQUITY Trading: equityUSD={equity:.2} lastAddEquityBuy={baseline:.2} pct_diff_buy={ratio:.6} equitySpareQuote={spare:.2}"
        ),
    }
}

/// 단계별 크기 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedSize {
    pub size: OrderSize,
    /// 사용한 단계
    pub stage: usize,
    /// 다음에 시작할 단계
    pub next_stage: usize,
}

fn clamp_stage(idx: usize, n: usize) -> usize {
    idx.min(n.saturating_sub(1))
}

/// 현재 단계부터 최소 주문 금액을 만족하는 첫 단계로 크기 산정.
///
/// 매도는 `spare`가 기준 자산, 매수는 호가 자산입니다. 만족하는 단계가 없으면 None.
pub fn staged_size(
    stages: &[Decimal],
    stage: usize,
    side: Side,
    spare: Decimal,
    step: Decimal,
    price: Decimal,
    min_notional: Decimal,
) -> Option<StagedSize> {
    if stages.is_empty() || price <= Decimal::ZERO {
        return None;
    }
    let start = clamp_stage(stage, stages.len());
    for (s, fraction) in stages.iter().enumerate().skip(start) {
        let amount = floor_to_step(spare * fraction, step);
        if amount <= Decimal::ZERO || amount > spare {
            continue;
        }
        let size = match side {
            Side::Sell => OrderSize {
                base: amount,
                quote: amount * price,
            },
            Side::Buy => OrderSize {
                quote: amount,
                base: amount / price,
            },
        };
        if size.quote >= min_notional {
            return Some(StagedSize {
                size,
                stage: s,
                next_stage: clamp_stage(s + 1, stages.len()),
            });
        }
    }
    None
}
