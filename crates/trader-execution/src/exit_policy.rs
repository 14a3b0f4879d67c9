//! 프로핏 게이트 기반 청산 분류기.
//!
//! 매 틱 모든 로트에 대해 수수료를 반영한 순손익을 계산하고, 순손익이
//! 프로핏 게이트에 미달하면 청산 장치를 해제합니다. 게이트를 넘은 로트는
//! (러너 여부, 비러너 순위)로 청산 방식을 분류한 뒤 트레일링 또는 고정 익절
//! 상태 기계를 갱신합니다.
//!
//! 한 틱에 최대 한 로트만 청산 대상으로 선택되며, 매수 북을 먼저 스캔합니다.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use trader_core::{ExitMode, Lot, Side, SideBook, SidePair};

use crate::config::TraderConfig;

// =============================================================================
// 파라미터
// =============================================================================

/// 청산 평가에 필요한 파라미터 묶음.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitParams {
    /// 수수료율 (비율)
    pub fee_rate: Decimal,
    pub profit_gate: Decimal,
    pub scalp_trailing_slots: usize,
    pub runner_activate_usd: Decimal,
    pub runner_distance_pct: Decimal,
    pub scalp_activate_usd: Decimal,
    pub scalp_distance_pct: Decimal,
    pub tp_maker_offset_bps: Decimal,
    /// 이보다 작은 명목 금액의 청산은 보류
    pub min_notional: Decimal,
}

impl ExitParams {
    /// 설정에서 생성. 활성화 USD가 0 이하이면 프로핏 게이트로 대체합니다.
    pub fn from_config(config: &TraderConfig) -> Self {
        let exit = &config.exit;
        let or_gate = |v: Decimal| if v > Decimal::ZERO { v } else { exit.profit_gate_usd };
        Self {
            fee_rate: config.fee_rate(),
            profit_gate: exit.profit_gate_usd,
            scalp_trailing_slots: exit.scalp_trailing_slots,
            runner_activate_usd: or_gate(exit.trail_activate_usd_runner),
            runner_distance_pct: exit.trail_distance_pct_runner,
            scalp_activate_usd: or_gate(exit.trail_activate_usd_scalp),
            scalp_distance_pct: exit.trail_distance_pct_scalp,
            tp_maker_offset_bps: exit.tp_maker_offset_bps,
            min_notional: config.order_min_usd,
        }
    }

    /// 트레일링 방식의 (활성화 USD, 거리 %). 고정 익절이면 None.
    pub fn trail_params(&self, mode: ExitMode) -> Option<(Decimal, Decimal)> {
        match mode {
            ExitMode::RunnerTrailing => Some((self.runner_activate_usd, self.runner_distance_pct)),
            ExitMode::ScalpTrailing => Some((self.scalp_activate_usd, self.scalp_distance_pct)),
            ExitMode::ScalpFixedTp => None,
        }
    }
}

/// 청산 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TrailingStop,
    TakeProfit,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 이번 틱에 청산할 로트.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitCandidate {
    pub side: Side,
    pub idx: usize,
    pub lot_id: u64,
    pub reason: ExitReason,
    pub notional: Decimal,
}

// =============================================================================
// 순손익 / 활성화 가격
// =============================================================================

/// 주어진 가격에서의 (순손익, 추정 청산 수수료).
pub fn net_at(lot: &Lot, price: Decimal, fee_rate: Decimal) -> (Decimal, Decimal) {
    let est_exit_fee = lot.size_base * price * fee_rate;
    (lot.gross_pnl(price) - lot.entry_fee - est_exit_fee, est_exit_fee)
}

/// 현재가 기준 순손익을 계산해 로트에 기록하고 반환.
pub fn evaluate_net(lot: &mut Lot, mark: Decimal, fee_rate: Decimal) -> Decimal {
    let (net, est_exit_fee) = net_at(lot, mark, fee_rate);
    lot.est_exit_fee_usd = est_exit_fee;
    lot.unrealized_pnl_usd = net;
    net
}

/// 프로핏 게이트 확인. 미달이면 청산 장치를 해제하고 false.
pub fn apply_profit_gate(lot: &mut Lot, net: Decimal, gate: Decimal) -> bool {
    if net < gate {
        if lot.trail_active || lot.fixed_tp_working {
            debug!(lot_id = lot.lot_id, side = %lot.side, net = %net, gate = %gate, "게이트 미달, 청산 장치 해제");
        }
        lot.disarm();
        return false;
    }
    true
}

/// 순손익이 정확히 `gate`가 되는 현재가 (수수료 반영).
///
/// - 롱: `(open + (gate + entry_fee) / size) / (1 - fee_rate)`
/// - 숏: `(open - (gate + entry_fee) / size) / (1 + fee_rate)`
pub fn activation_price(lot: &Lot, gate: Decimal, fee_rate: Decimal) -> Option<Decimal> {
    if lot.size_base <= Decimal::ZERO {
        return None;
    }
    let per_unit = (gate + lot.entry_fee) / lot.size_base;
    let price = match lot.side {
        Side::Buy => {
            let denom = Decimal::ONE - fee_rate;
            if denom <= Decimal::ZERO {
                return None;
            }
            (lot.open_price + per_unit) / denom
        }
        Side::Sell => (lot.open_price - per_unit) / (Decimal::ONE + fee_rate),
    };
    (price > Decimal::ZERO).then_some(price)
}

// =============================================================================
// 분류
// =============================================================================

/// 러너는 RunnerTrailing, 비러너 중 앞의 `slots`개는 ScalpTrailing, 나머지는 ScalpFixedTp.
pub fn classify(book: &SideBook, idx: usize, slots: usize) -> ExitMode {
    if book.is_runner(idx) {
        return ExitMode::RunnerTrailing;
    }
    let rank = (0..idx).filter(|j| !book.is_runner(*j)).count();
    if rank < slots {
        ExitMode::ScalpTrailing
    } else {
        ExitMode::ScalpFixedTp
    }
}

/// 방식이 바뀌었거나 비어 있는 트레일링 파라미터를 채웁니다.
fn assign_mode(lot: &mut Lot, mode: ExitMode, params: &ExitParams) {
    let changed = lot.exit_mode != mode;
    lot.exit_mode = mode;
    if let Some((activate, distance)) = params.trail_params(mode) {
        if changed || lot.trail_activate_gate_usd <= Decimal::ZERO {
            lot.trail_activate_gate_usd = activate;
        }
        if changed || lot.trail_distance_pct <= Decimal::ZERO {
            lot.trail_distance_pct = distance;
        }
    }
}

// =============================================================================
// 상태 기계
// =============================================================================

/// 트레일링 상태 갱신. 스톱이 뚫리면 true.
///
/// 비활성 상태에서 순손익이 활성화 USD에 도달하면 현재가로 고점을 시드하고,
/// 활성 이후 고점은 유리한 방향으로만, 스톱은 조이는 방향으로만 움직입니다.
pub fn update_trail(
    lot: &mut Lot,
    mark: Decimal,
    net: Decimal,
    activate_usd: Decimal,
    distance_pct: Decimal,
) -> bool {
    let d = distance_pct / dec!(100);

    if !lot.trail_active {
        if net < activate_usd {
            return false;
        }
        lot.trail_active = true;
        lot.trail_peak = mark;
        lot.trail_stop = match lot.side {
            Side::Buy => mark * (Decimal::ONE - d),
            Side::Sell => mark * (Decimal::ONE + d),
        };
        debug!(lot_id = lot.lot_id, side = %lot.side, peak = %lot.trail_peak, stop = %lot.trail_stop, net = %net, "트레일링 활성화");
    } else {
        match lot.side {
            Side::Buy if mark > lot.trail_peak => {
                lot.trail_peak = mark;
                let stop = mark * (Decimal::ONE - d);
                if stop > lot.trail_stop {
                    debug!(lot_id = lot.lot_id, old = %lot.trail_stop, new = %stop, "트레일링 스톱 상향");
                    lot.trail_stop = stop;
                }
            }
            Side::Sell if mark < lot.trail_peak || lot.trail_peak <= Decimal::ZERO => {
                lot.trail_peak = mark;
                let stop = mark * (Decimal::ONE + d);
                if lot.trail_stop <= Decimal::ZERO || stop < lot.trail_stop {
                    debug!(lot_id = lot.lot_id, old = %lot.trail_stop, new = %stop, "트레일링 스톱 하향");
                    lot.trail_stop = stop;
                }
            }
            _ => {}
        }
    }

    let triggered = lot.trail_stop > Decimal::ZERO
        && match lot.side {
            Side::Buy => mark <= lot.trail_stop,
            Side::Sell => mark >= lot.trail_stop,
        };
    if triggered {
        debug!(lot_id = lot.lot_id, side = %lot.side, mark = %mark, stop = %lot.trail_stop, "트레일링 스톱 발동");
    }
    triggered
}

/// 고정 익절 에뮬레이션. 현재가가 목표가를 넘으면 true.
///
/// 게이트가 유지되는 동안 현재가 근처(메이커 오프셋만큼 유리한 쪽)에 목표가를
/// 다시 게시하며, 목표가는 현재가 쪽으로만 당겨집니다.
pub fn update_fixed_take(lot: &mut Lot, mark: Decimal, offset_bps: Decimal) -> bool {
    let off = offset_bps / dec!(10000);
    let tp = match lot.side {
        Side::Buy => mark * (Decimal::ONE + off),
        Side::Sell => mark * (Decimal::ONE - off),
    };
    let improves = match lot.side {
        Side::Buy => tp < lot.take,
        Side::Sell => tp > lot.take,
    };
    if !lot.fixed_tp_working || improves {
        lot.take = tp;
        lot.fixed_tp_working = true;
        debug!(lot_id = lot.lot_id, side = %lot.side, take = %tp, "고정 익절 게시");
    }

    lot.take > Decimal::ZERO
        && match lot.side {
            Side::Buy => mark >= lot.take,
            Side::Sell => mark <= lot.take,
        }
}

/// 로트 하나를 평가해 청산 사유를 반환.
pub fn evaluate_lot(book: &mut SideBook, idx: usize, mark: Decimal, params: &ExitParams) -> Option<ExitReason> {
    let mode = classify(book, idx, params.scalp_trailing_slots);
    let lot = book.lots.get_mut(idx)?;
    assign_mode(lot, mode, params);
    let net = evaluate_net(lot, mark, params.fee_rate);

    // 미리보기 청산가: 트레일링은 활성화 가격, 고정 익절은 게시 전까지 게이트 가격
    if mode.is_trailing() {
        if let Some(price) = activation_price(lot, lot.trail_activate_gate_usd, params.fee_rate) {
            lot.take = price;
        }
    } else if !lot.fixed_tp_working {
        if let Some(price) = activation_price(lot, params.profit_gate, params.fee_rate) {
            lot.take = price;
        }
    }

    if !apply_profit_gate(lot, net, params.profit_gate) {
        return None;
    }

    if mode.is_trailing() {
        let (activate, distance) = (lot.trail_activate_gate_usd, lot.trail_distance_pct);
        update_trail(lot, mark, net, activate, distance).then_some(ExitReason::TrailingStop)
    } else {
        update_fixed_take(lot, mark, params.tp_maker_offset_bps).then_some(ExitReason::TakeProfit)
    }
}

/// 양쪽 북을 스캔해 첫 번째 청산 대상을 찾습니다 (매수 → 매도).
///
/// 최소 주문 금액에 미달하는 청산은 보류하고 스캔을 계속합니다.
pub fn scan_for_exit(books: &mut SidePair<SideBook>, mark: Decimal, params: &ExitParams) -> Option<ExitCandidate> {
    for side in Side::ALL {
        let book = &mut books[side];
        for idx in 0..book.len() {
            let Some(reason) = evaluate_lot(book, idx, mark, params) else {
                continue;
            };
            let lot = &book.lots[idx];
            let notional = lot.size_base * mark;
            if notional < params.min_notional {
                warn!(
                    side = %side,
                    lot_id = lot.lot_id,
                    base = %lot.size_base,
                    notional = %notional,
                    min = %params.min_notional,
                    "[CLOSE-SKIP] 최소 주문 금액 미달, 청산 보류"
                );
                continue;
            }
            return Some(ExitCandidate {
                side,
                idx,
                lot_id: lot.lot_id,
                reason,
                notional,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn params() -> ExitParams {
        ExitParams {
            fee_rate: dec!(0.001),
            profit_gate: dec!(0.50),
            scalp_trailing_slots: 4,
            runner_activate_usd: dec!(1.00),
            runner_distance_pct: dec!(0.40),
            scalp_activate_usd: dec!(0.50),
            scalp_distance_pct: dec!(0.20),
            tp_maker_offset_bps: dec!(5),
            min_notional: dec!(5),
        }
    }

    fn long(id: u64, open: Decimal) -> Lot {
        Lot {
            lot_id: id,
            open_price: open,
            side: Side::Buy,
            size_base: dec!(1),
            entry_fee: dec!(0.1),
            ..Default::default()
        }
    }

    #[test]
    fn test_evaluate_net_matches_formula() {
        let mut lot = long(1, dec!(100));
        let net = evaluate_net(&mut lot, dec!(101), dec!(0.001));
        assert_eq!(lot.est_exit_fee_usd, dec!(0.101));
        assert_eq!(net, dec!(1) - dec!(0.1) - dec!(0.101));
        assert_eq!(lot.unrealized_pnl_usd, net);
    }

    #[test]
    fn test_activation_price_reaches_gate_exactly() {
        let lot = long(1, dec!(100));
        let p = activation_price(&lot, dec!(0.5), dec!(0.001)).unwrap();
        let (net, _) = net_at(&lot, p, dec!(0.001));
        assert!((net - dec!(0.5)).abs() < dec!(0.000000001));
        // 100.70 근처에서 게이트가 정확히 충족
        assert!((p - dec!(100.70)).abs() < dec!(0.001));

        let short = Lot {
            side: Side::Sell,
            ..long(2, dec!(100))
        };
        let p = activation_price(&short, dec!(0.5), dec!(0.001)).unwrap();
        let (net, _) = net_at(&short, p, dec!(0.001));
        assert!((net - dec!(0.5)).abs() < dec!(0.000000001));
        assert!(p < dec!(100));
    }

    #[test]
    fn test_activation_price_rejects_empty_lot() {
        let lot = Lot::default();
        assert!(activation_price(&lot, dec!(0.5), dec!(0.001)).is_none());
    }

    #[test]
    fn test_profit_gate_disarms() {
        let mut lot = long(1, dec!(100));
        lot.trail_active = true;
        lot.trail_peak = dec!(102);
        lot.trail_stop = dec!(101);
        assert!(!apply_profit_gate(&mut lot, dec!(0.49), dec!(0.5)));
        assert!(!lot.trail_active);
        assert_eq!(lot.trail_stop, Decimal::ZERO);
        assert!(apply_profit_gate(&mut lot, dec!(0.5), dec!(0.5)));
    }

    #[test]
    fn test_classify_by_runner_and_rank() {
        let mut book = SideBook::default();
        for i in 0..7 {
            book.push(long(i, dec!(100)));
        }
        book.set_runner(2);
        assert_eq!(classify(&book, 2, 4), ExitMode::RunnerTrailing);
        assert_eq!(classify(&book, 0, 4), ExitMode::ScalpTrailing);
        // 인덱스 4는 비러너 순위 3 (0,1,3 다음)
        assert_eq!(classify(&book, 4, 4), ExitMode::ScalpTrailing);
        assert_eq!(classify(&book, 5, 4), ExitMode::ScalpFixedTp);
        assert_eq!(classify(&book, 1, 1), ExitMode::ScalpFixedTp);
    }

    #[test]
    fn test_long_trail_arms_tightens_and_triggers() {
        let mut lot = long(1, dec!(100));
        assert!(!update_trail(&mut lot, dec!(101), dec!(0.4), dec!(0.5), dec!(1)));
        assert!(!lot.trail_active);

        assert!(!update_trail(&mut lot, dec!(101), dec!(0.8), dec!(0.5), dec!(1)));
        assert!(lot.trail_active);
        assert_eq!(lot.trail_stop, dec!(99.99));

        assert!(!update_trail(&mut lot, dec!(102), dec!(1.8), dec!(0.5), dec!(1)));
        assert_eq!(lot.trail_peak, dec!(102));
        assert_eq!(lot.trail_stop, dec!(100.98));

        // 하락해도 스톱은 내려가지 않음
        assert!(!update_trail(&mut lot, dec!(101.5), dec!(1.3), dec!(0.5), dec!(1)));
        assert_eq!(lot.trail_stop, dec!(100.98));

        assert!(update_trail(&mut lot, dec!(100.98), dec!(0.7), dec!(0.5), dec!(1)));
    }

    #[test]
    fn test_short_trail_follows_trough() {
        let mut lot = Lot {
            side: Side::Sell,
            ..long(1, dec!(100))
        };
        assert!(!update_trail(&mut lot, dec!(99), dec!(0.8), dec!(0.5), dec!(1)));
        assert_eq!(lot.trail_stop, dec!(99.99));
        assert!(!update_trail(&mut lot, dec!(98), dec!(1.8), dec!(0.5), dec!(1)));
        assert_eq!(lot.trail_stop, dec!(98.98));
        assert!(update_trail(&mut lot, dec!(99), dec!(0.8), dec!(0.5), dec!(1)));
    }

    #[test]
    fn test_fixed_take_follows_mark_down_and_fills_on_cross() {
        let mut lot = long(1, dec!(100));
        assert!(!update_fixed_take(&mut lot, dec!(102), dec!(10)));
        assert_eq!(lot.take, dec!(102.102));

        // 가격 하락 시 목표가가 따라 내려옴
        assert!(!update_fixed_take(&mut lot, dec!(101), dec!(10)));
        assert_eq!(lot.take, dec!(101.101));

        // 상승해도 목표가는 올라가지 않고, 넘으면 체결
        assert!(update_fixed_take(&mut lot, dec!(101.2), dec!(10)));
        assert_eq!(lot.take, dec!(101.101));
    }

    #[test]
    fn test_scan_closes_at_most_one_lot_buy_first() {
        let mut books: SidePair<SideBook> = SidePair::default();
        for i in 0..2 {
            let mut lot = long(i, dec!(100));
            lot.trail_active = true;
            lot.trail_peak = dec!(103);
            lot.trail_stop = dec!(102.5);
            lot.trail_activate_gate_usd = dec!(0.5);
            lot.trail_distance_pct = dec!(0.2);
            books.buy.push(lot);
        }
        let out = scan_for_exit(&mut books, dec!(102), &params()).unwrap();
        assert_eq!(out.side, Side::Buy);
        assert_eq!(out.idx, 0);
        assert_eq!(out.reason, ExitReason::TrailingStop);
        // 두 번째 로트는 이번 틱에 평가되지 않음
        assert!(books.buy.lots[1].trail_active);
    }

    #[test]
    fn test_scan_skips_below_min_notional_and_continues() {
        let mut books: SidePair<SideBook> = SidePair::default();
        // 순손익은 게이트를 넘지만 명목 금액이 3 USD
        let mut tiny = long(1, dec!(100));
        tiny.size_base = dec!(0.02);
        tiny.entry_fee = Decimal::ZERO;
        books.buy.push(tiny);

        books.sell.push(Lot {
            side: Side::Sell,
            ..long(2, dec!(200))
        });

        let mut p = params();
        p.scalp_trailing_slots = 0;
        p.tp_maker_offset_bps = Decimal::ZERO;
        let out = scan_for_exit(&mut books, dec!(150), &p).unwrap();
        assert_eq!(out.side, Side::Sell);
        assert_eq!(out.reason, ExitReason::TakeProfit);
        assert_eq!(books.buy.len(), 1);
    }

    #[test]
    fn test_gate_failure_keeps_preview_take() {
        let mut book = SideBook::default();
        book.push(long(1, dec!(100)));
        assert!(evaluate_lot(&mut book, 0, dec!(100.1), &params()).is_none());
        let lot = &book.lots[0];
        assert_eq!(lot.exit_mode, ExitMode::ScalpTrailing);
        assert_eq!(lot.trail_activate_gate_usd, dec!(0.50));
        assert!(lot.take > dec!(100.6));
    }
}
