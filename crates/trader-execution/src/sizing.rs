//! 주문 크기 산정과 여유 재고 게이트.
//!
//! 일반 진입은 `equity × risk%`를 최소 주문 금액으로 하한 처리하고,
//! 반대 방향 로트를 청산하는 데 필요한 재고와 대기 주문 몫을 예약한 뒤
//! 남은 여유 재고 안에서만 주문합니다.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use trader_core::{PendingOpen, Side, SideBook, SidePair};

use crate::config::{DecayMode, RampConfig, RampMode, ScalpTpConfig};

/// 여유 재고 비교 허용 오차.
pub const SPARE_EPS: Decimal = dec!(0.000000001);

// =============================================================================
// 스냅
// =============================================================================

/// 단위로 내림. 단위가 0 이하이면 그대로, 결과가 0 이하이면 0.
pub fn floor_to_step(x: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return x;
    }
    let n = (x / step).floor();
    if n <= Decimal::ZERO {
        Decimal::ZERO
    } else {
        n * step
    }
}

/// 단위로 올림. 단위가 0 이하이면 그대로.
pub fn ceil_to_step(x: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return x;
    }
    (x / step).ceil() * step
}

/// 내림 결과가 0이면 원래 값을 유지하는 스냅.
fn floor_keep_positive(x: Decimal, step: Decimal) -> Decimal {
    let n = floor_to_step(x, step);
    if n > Decimal::ZERO {
        n
    } else {
        x
    }
}

/// 현재가에서 유리한 방향으로 오프셋한 메이커 지정가.
///
/// 매수는 호가 단위로 내림, 매도는 올림합니다.
pub fn limit_price(side: Side, mark: Decimal, offset_bps: Decimal, tick: Decimal) -> Decimal {
    let off = offset_bps / dec!(10000);
    match side {
        Side::Buy => floor_to_step(mark * (Decimal::ONE - off), tick),
        Side::Sell => ceil_to_step(mark * (Decimal::ONE + off), tick),
    }
}

// =============================================================================
// 리스크 크기
// =============================================================================

/// 같은 방향 기존 로트 수 `k`에 따른 램프 리스크 비율 (%).
///
/// 램프 결과가 0 이하이면 기본 리스크를 그대로 사용합니다.
pub fn ramp_risk_pct(ramp: &RampConfig, base_risk_pct: Decimal, k: usize) -> Decimal {
    if !ramp.enable {
        return base_risk_pct;
    }
    let f = match ramp.mode {
        RampMode::Exp => {
            let g = if ramp.growth <= 0.0 { 1.0 } else { ramp.growth };
            let f = ramp.start_pct * g.powi(k as i32);
            if ramp.max_pct > 0.0 {
                f.min(ramp.max_pct)
            } else {
                f
            }
        }
        RampMode::Linear => {
            let f = (ramp.start_pct + k as f64 * ramp.step_pct).max(0.0);
            if ramp.max_pct > 0.0 {
                f.min(ramp.max_pct)
            } else {
                f
            }
        }
    };
    match Decimal::from_f64(f) {
        Some(pct) if pct > Decimal::ZERO => pct,
        _ => base_risk_pct,
    }
}

/// `equity × risk%`, 최소 주문 금액으로 하한.
pub fn base_quote(equity: Decimal, risk_pct: Decimal, min_notional: Decimal) -> Decimal {
    (risk_pct / dec!(100) * equity).max(min_notional)
}

/// 기존 스캘프 수 `k`에 따라 감쇠된 익절 폭 (%).
pub fn scalp_take_pct(cfg: &ScalpTpConfig, k: usize) -> f64 {
    let pct = match cfg.mode {
        DecayMode::Exp => cfg.take_profit_pct * cfg.factor.powi(k as i32),
        DecayMode::Linear => cfg.take_profit_pct - k as f64 * cfg.dec_pct,
    };
    pct.max(cfg.min_pct)
}

/// 진입가 기준 미리보기 익절가.
pub fn preview_take(side: Side, price: Decimal, take_pct: f64) -> Decimal {
    let pct = Decimal::from_f64(take_pct).unwrap_or(Decimal::ZERO) / dec!(100);
    match side {
        Side::Buy => price * (Decimal::ONE + pct),
        Side::Sell => price * (Decimal::ONE - pct),
    }
}

/// f64 변환 (로그/감쇠 계산용).
pub(crate) fn to_f64(x: Decimal) -> f64 {
    x.to_f64().unwrap_or(0.0)
}

// =============================================================================
// 예약 / 여유 재고
// =============================================================================

/// 열린 로트 청산과 대기 주문을 위해 예약된 재고.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reservations {
    /// 숏 로트 환매에 필요한 호가 자산 (수수료 포함) + 대기 매수 몫
    pub quote: Decimal,
    /// 롱 로트 청산에 필요한 기준 자산 + 대기 매도 몫
    pub base: Decimal,
}

impl Reservations {
    /// 현재 북과 대기 주문으로부터 예약량 계산.
    pub fn compute(
        books: &SidePair<SideBook>,
        pending: &SidePair<Option<PendingOpen>>,
        mark: Decimal,
        fee_rate: Decimal,
        require_base_for_short: bool,
    ) -> Self {
        let fee_mult = Decimal::ONE + fee_rate;

        let mut quote: Decimal = books
            .sell
            .lots
            .iter()
            .map(|lot| lot.size_base * mark * fee_mult)
            .sum();
        if let Some(p) = &pending.buy {
            quote += p.quote * fee_mult;
        }

        let mut base = books.buy.total_size();
        if require_base_for_short {
            if let Some(p) = &pending.sell {
                base += p.base_at_limit;
            }
        }
        Self { quote, base }
    }

    /// 가용 호가 자산 중 여유분 (음수면 0).
    pub fn spare_quote(&self, available: Decimal) -> Decimal {
        (available - self.quote).max(Decimal::ZERO)
    }

    /// 가용 기준 자산 중 여유분 (음수면 0).
    pub fn spare_base(&self, available: Decimal) -> Decimal {
        (available - self.base).max(Decimal::ZERO)
    }
}

/// 여유 재고 부족.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundsShortfall {
    pub need: Decimal,
    pub spare: Decimal,
    /// 최소 주문 금액으로 올린 뒤 부족했는지 여부
    pub at_min_notional: bool,
}

/// 확정된 주문 크기.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSize {
    pub quote: Decimal,
    pub base: Decimal,
}

/// 매수 주문 금액을 단위로 내리고 여유 호가 자산과 최소 금액을 확인.
pub fn gate_buy_spare(
    quote: Decimal,
    spare: Decimal,
    quote_step: Decimal,
    min_notional: Decimal,
    price: Decimal,
) -> Result<OrderSize, FundsShortfall> {
    let spare = spare.max(Decimal::ZERO);
    let mut need = floor_keep_positive(quote, quote_step);
    if spare + SPARE_EPS < need {
        return Err(FundsShortfall {
            need,
            spare,
            at_min_notional: false,
        });
    }
    if need < min_notional {
        need = ceil_to_step(min_notional, quote_step);
        if spare + SPARE_EPS < need {
            return Err(FundsShortfall {
                need,
                spare,
                at_min_notional: true,
            });
        }
    }
    Ok(OrderSize {
        quote: need,
        base: need / price,
    })
}

/// 매도 수량을 단위로 내리고 여유 기준 자산과 최소 금액을 확인.
pub fn gate_sell_spare(
    base: Decimal,
    spare: Decimal,
    base_step: Decimal,
    min_notional: Decimal,
    price: Decimal,
) -> Result<OrderSize, FundsShortfall> {
    let spare = spare.max(Decimal::ZERO);
    let need = floor_keep_positive(base, base_step);
    if spare + SPARE_EPS < need {
        return Err(FundsShortfall {
            need,
            spare,
            at_min_notional: false,
        });
    }

    let mut size = OrderSize {
        quote: need * price,
        base: need,
    };
    if size.quote < min_notional {
        let b = floor_keep_positive(min_notional / price, base_step);
        size = OrderSize {
            quote: b * price,
            base: b,
        };
        if spare + SPARE_EPS < size.base {
            return Err(FundsShortfall {
                need: size.base,
                spare,
                at_min_notional: true,
            });
        }
    }
    Ok(size)
}
