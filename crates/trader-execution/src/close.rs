//! 로트 청산 주문.
//!
//! 고정 익절 로트는 먼저 post-only 지정가를 잠시 걸어 보고, 미체결이면 취소 후
//! 시장가로 청산합니다. 체결 반영은 [`TraderState::apply_exit`](crate::TraderState::apply_exit)가 담당합니다.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use trader_core::{ExitMode, FilledOrder, Lot, Side};

use crate::error::ExecutionResult;
use crate::exit_policy::ExitCandidate;
use crate::sizing::{ceil_to_step, floor_to_step};
use crate::trader::{HoldReason, TickOutcome, Trader};

/// 청산 메이커 지정가.
///
/// 롱 청산(매도)은 `max(take, mark × (1 + off))`를 올림, 숏 청산(매수)은
/// `min(take, mark × (1 − off))`를 내림하여 현재가를 가로지르지 않게 합니다.
pub fn exit_limit_price(lot: &Lot, mark: Decimal, offset_bps: Decimal, tick: Decimal) -> Decimal {
    let off = offset_bps / dec!(10000);
    match lot.side {
        Side::Buy => ceil_to_step(lot.take.max(mark * (Decimal::ONE + off)), tick),
        Side::Sell => floor_to_step(lot.take.min(mark * (Decimal::ONE - off)), tick),
    }
}

impl Trader {
    /// 청산 후보 로트를 청산하고 결과를 반영.
    ///
    /// 거래소 호출 동안 잠금을 풀기 때문에 다시 잠근 뒤 로트 ID로 위치를 찾습니다.
    pub(crate) async fn close_lot(&self, candidate: ExitCandidate, mark: Decimal) -> ExecutionResult<TickOutcome> {
        let inner = &self.inner;
        let config = &inner.config;
        let side = candidate.side;
        let reason = candidate.reason.as_str();

        let lot = {
            let state = inner.state.lock().await;
            let book = &state.books[side];
            match book.position_of(candidate.lot_id) {
                Some(idx) => book.lots[idx].clone(),
                None => {
                    warn!(side = %side, lot_id = candidate.lot_id, "청산 대상 로트 없음");
                    return Ok(TickOutcome::Hold(HoldReason::LotMissing));
                }
            }
        };
        let notional = lot.size_base * mark;
        if notional < config.order_min_usd {
            warn!(side = %side, lot_id = lot.lot_id, notional = %notional, min = %config.order_min_usd, "[CLOSE-SKIP] 최소 주문 금액 미달");
            return Ok(TickOutcome::Hold(HoldReason::ExitBelowMinimum));
        }

        let fill = if config.dry_run {
            None
        } else {
            let wants_maker = lot.exit_mode == ExitMode::ScalpFixedTp
                && config.maker.limit_timeout_sec > 0
                && lot.take > Decimal::ZERO;
            let maker_fill = if wants_maker {
                self.try_close_maker(&lot, mark).await
            } else {
                None
            };
            match maker_fill {
                Some(fill) => Some(fill),
                None => Some(self.close_market(&lot, mark).await?),
            }
        };

        let now = Utc::now();
        let mut state = inner.state.lock().await;
        let Some(idx) = state.books[side].position_of(lot.lot_id) else {
            warn!(side = %side, lot_id = lot.lot_id, "청산 체결 후 로트가 사라짐");
            return Ok(TickOutcome::Hold(HoldReason::LotMissing));
        };
        let Some(record) = state.apply_exit(side, idx, fill.as_ref(), mark, reason, now) else {
            return Ok(TickOutcome::Hold(HoldReason::LotMissing));
        };
        inner.persist(&state);
        Ok(TickOutcome::Closed(record))
    }

    /// 청산 지정가를 걸고 마감까지 폴링. 체결분이 없으면 None.
    async fn try_close_maker(&self, lot: &Lot, mark: Decimal) -> Option<FilledOrder> {
        let inner = &self.inner;
        let config = &inner.config;
        let product_id = config.product_id.as_str();
        let exit_side = lot.side.opposite();

        let limit = exit_limit_price(lot, mark, config.exit.tp_maker_offset_bps, config.price_tick);
        if limit <= Decimal::ZERO {
            return None;
        }
        let order_id = match inner
            .broker
            .place_limit_post_only(product_id, exit_side, limit, lot.size_base)
            .await
        {
            Ok(id) if !id.trim().is_empty() => id,
            Ok(_) => return None,
            Err(e) => {
                warn!(lot_id = lot.lot_id, limit = %limit, error = %e, "청산 메이커 주문 실패, 시장가로 진행");
                return None;
            }
        };
        debug!(lot_id = lot.lot_id, order_id = %order_id, limit = %limit, "청산 메이커 주문 게시");

        let deadline = Utc::now() + Duration::seconds(config.maker.limit_timeout_sec);
        let poll = StdDuration::from_millis(config.maker.poll_interval_ms.max(1));
        while Utc::now() < deadline {
            match inner.broker.get_order(product_id, &order_id).await {
                Ok(order) if order.is_filled() => {
                    info!(lot_id = lot.lot_id, order_id = %order_id, "청산 메이커 주문 체결");
                    return Some(order);
                }
                Ok(order) if order.status.is_some_and(|s| s.is_terminal()) => break,
                Ok(_) => {}
                Err(e) => debug!(order_id = %order_id, error = %e, "청산 주문 조회 실패"),
            }
            tokio::time::sleep(poll).await;
        }

        if let Err(e) = inner.broker.cancel_order(product_id, &order_id).await {
            warn!(order_id = %order_id, error = %e, "청산 메이커 주문 취소 실패");
        }
        match inner.broker.get_order(product_id, &order_id).await {
            Ok(order) if order.has_fill() => {
                warn!(lot_id = lot.lot_id, order_id = %order_id, filled = %order.base_size, "청산 메이커 주문 부분 체결");
                Some(order)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "청산 메이커 주문 최종 조회 실패");
                None
            }
        }
    }

    /// 시장가 청산. 실패는 그대로 반환합니다.
    async fn close_market(&self, lot: &Lot, mark: Decimal) -> ExecutionResult<FilledOrder> {
        let config = &self.inner.config;
        let quote = lot.size_base * mark;
        let fill = self
            .inner
            .broker
            .place_market_quote(&config.product_id, lot.side.opposite(), quote)
            .await?;
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lot(side: Side, take: Decimal) -> Lot {
        Lot {
            side,
            open_price: dec!(100),
            size_base: dec!(1),
            take,
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_limit_keeps_take_when_above_mark() {
        let price = exit_limit_price(&lot(Side::Buy, dec!(101.237)), dec!(100), dec!(5), dec!(0.01));
        assert_eq!(price, dec!(101.24));
    }

    #[test]
    fn test_exit_limit_moves_off_mark_when_take_crossed() {
        // 현재가가 목표가를 넘었으면 현재가 위 5bps
        let price = exit_limit_price(&lot(Side::Buy, dec!(100)), dec!(102), dec!(5), dec!(0.01));
        assert_eq!(price, dec!(102.06));

        let price = exit_limit_price(&lot(Side::Sell, dec!(100)), dec!(98), dec!(5), dec!(0.01));
        assert_eq!(price, dec!(97.95));
    }
}
