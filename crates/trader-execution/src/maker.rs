//! 메이커 우선 진입 주문의 비동기 생명주기.
//!
//! post-only 지정가를 게시한 뒤 백그라운드 작업이 마감 시각까지 체결을 폴링하고,
//! 가드레일을 모두 통과할 때만 재호가합니다. 결과는 방향별 단일 슬롯
//! [`CompletionSlot`]으로 메인 틱에 전달되며, 메인 틱이 이를 로트로 반영합니다.
//!
//! # 세션 체결 누적
//!
//! 재호가로 주문 ID가 바뀌어도 이전 주문들의 체결분은 `PendingOpen.accum_*`에
//! 누적되어, 최종 완료 결과는 세션 전체의 VWAP으로 보고됩니다.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trader_core::{BestBidAsk, FilledOrder, OpenResult, OrderStatus, PendingOpen, Side};

use crate::config::RepriceConfig;
use crate::sizing::{ceil_to_step, floor_to_step};
use crate::trader::TraderInner;

// =============================================================================
// 완료 슬롯
// =============================================================================

/// 방향별 단일 슬롯 완료 우편함.
///
/// 게시와 수거 모두 대기하지 않습니다. 이미 체결 결과가 들어 있으면 이후의
/// 미체결 결과로 덮어쓰지 않습니다.
#[derive(Debug, Default)]
pub struct CompletionSlot {
    slot: Mutex<Option<OpenResult>>,
}

impl CompletionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 결과 게시. 반영되었으면 true.
    pub fn post(&self, result: OpenResult) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let accept = match slot.as_ref() {
            None => true,
            Some(existing) => !existing.filled && result.filled,
        };
        if accept {
            *slot = Some(result);
        } else {
            debug!(side = %result.side, order_id = %result.order_id, "완료 슬롯 점유 중, 결과 폐기");
        }
        accept
    }

    /// 결과 수거.
    pub fn take(&self) -> Option<OpenResult> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

// =============================================================================
// 재호가 판정
// =============================================================================

/// 재호가 후보 계산 입력.
#[derive(Debug, Clone, Copy)]
pub struct RepriceInput {
    pub side: Side,
    /// 현재가
    pub mark: Decimal,
    /// 최우선 호가 (use_bbo이고 조회에 성공한 경우)
    pub bbo: Option<BestBidAsk>,
    /// 현재가 기준 오프셋 (bps)
    pub offset_bps: Decimal,
    /// 현재 걸려 있는 지정가
    pub last_limit: Decimal,
    /// 최초 지정가
    pub initial_limit: Decimal,
    /// 아직 체결되지 않은 목표 금액
    pub remaining_quote: Decimal,
    pub tick: Decimal,
    pub base_step: Decimal,
    pub min_notional: Decimal,
}

/// 재호가를 건너뛴 이유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepriceSkip {
    /// 한 틱 이상 변하지 않음
    Unchanged,
    /// 최초 지정가 대비 드리프트 초과
    Drift { bps: Decimal },
    /// 유리한 방향 개선 틱 부족
    Improvement { ticks: Decimal },
    /// USD 기준 개선 폭 부족
    Edge { usd: Decimal },
    /// 새 수량이 최소 주문 금액 미달
    MinNotional,
}

/// 재호가 판정 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepriceDecision {
    Reprice { limit: Decimal, base: Decimal },
    Skip(RepriceSkip),
}

/// 새 지정가 후보를 계산하고 모든 가드레일을 검사.
pub fn evaluate_reprice(cfg: &RepriceConfig, input: &RepriceInput) -> RepriceDecision {
    let side = input.side;
    let tick = input.tick;
    let bbo = input.bbo.filter(BestBidAsk::is_valid);

    let raw = match bbo {
        Some(bbo) if cfg.use_bbo => bbo.maker_touch(side),
        _ => {
            let off = input.offset_bps / dec!(10000);
            match side {
                Side::Buy => input.mark * (Decimal::ONE - off),
                Side::Sell => input.mark * (Decimal::ONE + off),
            }
        }
    };
    let mut limit = match side {
        Side::Buy => floor_to_step(raw, tick),
        Side::Sell => ceil_to_step(raw, tick),
    };
    // post-only 유지: 반대편 호가에 닿지 않도록 한 틱 물림
    if let Some(bbo) = bbo {
        match side {
            Side::Buy if limit >= bbo.ask => limit = bbo.ask - tick.max(Decimal::ZERO),
            Side::Sell if limit <= bbo.bid => limit = bbo.bid + tick.max(Decimal::ZERO),
            _ => {}
        }
    }

    let moved = (limit - input.last_limit).abs();
    let changed = if tick > Decimal::ZERO {
        moved >= tick
    } else {
        limit != input.last_limit
    };
    if !changed || limit <= Decimal::ZERO {
        return RepriceDecision::Skip(RepriceSkip::Unchanged);
    }

    if cfg.max_drift_bps > Decimal::ZERO && input.initial_limit > Decimal::ZERO {
        let bps = ((limit - input.initial_limit) / input.initial_limit).abs() * dec!(10000);
        if bps > cfg.max_drift_bps {
            return RepriceDecision::Skip(RepriceSkip::Drift { bps });
        }
    }

    if tick > Decimal::ZERO && cfg.min_improv_ticks > 1 {
        let ticks = (moved / tick).floor();
        let favorable = match side {
            Side::Buy => limit < input.last_limit,
            Side::Sell => limit > input.last_limit,
        };
        if !favorable || ticks < Decimal::from(cfg.min_improv_ticks) {
            return RepriceDecision::Skip(RepriceSkip::Improvement { ticks });
        }
    }

    let base = floor_to_step(input.remaining_quote.max(Decimal::ZERO) / limit, input.base_step);

    if cfg.min_edge_usd > Decimal::ZERO && base > Decimal::ZERO {
        let usd = moved * base;
        if usd < cfg.min_edge_usd {
            return RepriceDecision::Skip(RepriceSkip::Edge { usd });
        }
    }

    if base <= Decimal::ZERO || base * limit < input.min_notional {
        return RepriceDecision::Skip(RepriceSkip::MinNotional);
    }
    RepriceDecision::Reprice { limit, base }
}

// =============================================================================
// 세션 체결 집계
// =============================================================================

/// 체결 수량/금액/수수료 합계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FillTally {
    base: Decimal,
    quote: Decimal,
    fee: Decimal,
}

impl FillTally {
    /// 주문 조회 결과에서 지난 조회 이후 증가분만 누적.
    fn absorb(&mut self, seen: &mut FillTally, order: &FilledOrder) {
        let delta_base = order.base_size - seen.base;
        let delta_quote = order.quote_spent - seen.quote;
        let delta_fee = order.commission - seen.fee;
        if delta_base > Decimal::ZERO {
            self.base += delta_base;
        }
        if delta_quote > Decimal::ZERO {
            self.quote += delta_quote;
        }
        if delta_fee > Decimal::ZERO {
            self.fee += delta_fee;
        }
        *seen = FillTally {
            base: order.base_size.max(seen.base),
            quote: order.quote_spent.max(seen.quote),
            fee: order.commission.max(seen.fee),
        };
    }

    fn has_fill(&self) -> bool {
        self.base > Decimal::ZERO
    }

    fn from_pending(pending: &PendingOpen) -> Self {
        Self {
            base: pending.accum_base,
            quote: pending.accum_quote,
            fee: pending.accum_fee,
        }
    }

    /// 세션 VWAP 체결 정보.
    fn to_fill(self, order_id: &str) -> FilledOrder {
        FilledOrder {
            order_id: order_id.to_string(),
            price: if self.base > Decimal::ZERO {
                self.quote / self.base
            } else {
                Decimal::ZERO
            },
            base_size: self.base,
            quote_spent: self.quote,
            commission: self.fee,
            status: Some(OrderStatus::Filled),
        }
    }
}

/// 저장된 누적 체결과 현재 주문 조회 결과를 합친 세션 체결. 체결이 없으면 None.
pub(crate) fn session_fill(pending: &PendingOpen, order: &FilledOrder) -> Option<FilledOrder> {
    let mut session = FillTally::from_pending(pending);
    session.absorb(&mut FillTally::default(), order);
    session.has_fill().then(|| session.to_fill(&pending.order_id))
}

// =============================================================================
// MakerTask
// =============================================================================

/// 한 방향 대기 주문을 관리하는 백그라운드 작업.
pub struct MakerTask {
    inner: Arc<TraderInner>,
    side: Side,
    token: CancellationToken,
    base_step: Decimal,
}

/// 폴링 루프 한 바퀴의 결과.
enum Step {
    Continue,
    Done,
}

impl MakerTask {
    pub(crate) fn new(inner: Arc<TraderInner>, side: Side, token: CancellationToken, base_step: Decimal) -> Self {
        Self {
            inner,
            side,
            token,
            base_step,
        }
    }

    /// tokio 작업으로 실행.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 마감 시각까지 체결 폴링과 재호가를 반복.
    ///
    /// 토큰이 취소되면 [`MakerTask::abandon`] 규칙에 따라 주문을 남기거나 취소합니다.
    /// 종료 시에는 대기 상태가 남아 있으므로 주문이 유지되고 재시작 때 복구됩니다.
    pub async fn run(self) {
        let side = self.side;
        let Some(pending) = self.inner.state.lock().await.pending[side].clone() else {
            debug!(side = %side, "대기 주문 없음, 메이커 작업 종료");
            return;
        };

        let cfg = &self.inner.config.maker;
        let product_id = pending.product_id.clone();
        let mut order_id = pending.order_id.clone();
        let mut last_limit = pending.limit_price;
        let initial_limit = if pending.initial_limit_price > Decimal::ZERO {
            pending.initial_limit_price
        } else {
            pending.limit_price
        };
        let mut reprice_count = pending.reprice_count;
        let mut session = FillTally::from_pending(&pending);
        let mut seen = FillTally::default();
        let mut last_reprice = Instant::now();
        let poll = StdDuration::from_millis(cfg.poll_interval_ms.max(1));

        info!(side = %side, order_id = %order_id, limit = %last_limit, deadline = %pending.deadline, "메이커 작업 시작");

        while Utc::now() < pending.deadline {
            if self.token.is_cancelled() {
                self.abandon(&product_id, &order_id).await;
                return;
            }

            match self.inner.broker.get_order(&product_id, &order_id).await {
                Ok(order) => {
                    session.absorb(&mut seen, &order);
                    if order.is_filled() {
                        info!(side = %side, order_id = %order_id, base = %session.base, quote = %session.quote, "메이커 주문 체결");
                        self.post_fill(&order_id, session);
                        return;
                    }
                    if let Some(status) = order.status.filter(|s| s.is_terminal()) {
                        warn!(side = %side, order_id = %order_id, status = ?status, "메이커 주문 종료");
                        self.finish(&order_id, session, format!("order {status:?}")).await;
                        return;
                    }
                }
                Err(e) => warn!(side = %side, order_id = %order_id, error = %e, "메이커 주문 조회 실패"),
            }

            let reprice_due = cfg.reprice.enable
                && last_reprice.elapsed() >= StdDuration::from_millis(cfg.reprice.interval_ms)
                && (cfg.reprice.max_count == 0 || reprice_count < cfg.reprice.max_count);
            if reprice_due {
                last_reprice = Instant::now();
                let ctx = RepriceContext {
                    product_id: &product_id,
                    quote: pending.quote,
                    initial_limit,
                };
                match self
                    .reprice_once(&ctx, &mut order_id, &mut last_limit, &mut session, &mut seen)
                    .await
                {
                    Step::Continue => {}
                    Step::Done => return,
                }
                reprice_count = self
                    .inner
                    .state
                    .lock()
                    .await
                    .pending[side]
                    .as_ref()
                    .map(|p| p.reprice_count)
                    .unwrap_or(reprice_count);
            }

            tokio::select! {
                _ = self.token.cancelled() => {
                    self.abandon(&product_id, &order_id).await;
                    return;
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }

        if self.token.is_cancelled() {
            self.abandon(&product_id, &order_id).await;
            return;
        }

        // 마감: 취소 후 마지막 조회로 늦은 체결분 반영
        if let Err(e) = self.inner.broker.cancel_order(&product_id, &order_id).await {
            warn!(side = %side, order_id = %order_id, error = %e, "마감 취소 실패");
        }
        match self.inner.broker.get_order(&product_id, &order_id).await {
            Ok(order) => session.absorb(&mut seen, &order),
            Err(e) => warn!(side = %side, order_id = %order_id, error = %e, "마감 후 주문 조회 실패"),
        }
        info!(side = %side, order_id = %order_id, filled_base = %session.base, "메이커 주문 마감");
        self.finish(&order_id, session, "timeout".to_string()).await;
    }

    /// 재호가 한 번 시도.
    async fn reprice_once(
        &self,
        ctx: &RepriceContext<'_>,
        order_id: &mut String,
        last_limit: &mut Decimal,
        session: &mut FillTally,
        seen: &mut FillTally,
    ) -> Step {
        let side = self.side;
        let config = &self.inner.config;
        let broker = &self.inner.broker;

        let mark = match broker.now_price(ctx.product_id).await {
            Ok(p) if p > Decimal::ZERO => p,
            Ok(_) => return Step::Continue,
            Err(e) => {
                debug!(side = %side, error = %e, "재호가용 현재가 조회 실패");
                return Step::Continue;
            }
        };
        let bbo = if config.maker.reprice.use_bbo {
            broker.best_bid_ask(ctx.product_id).await.ok()
        } else {
            None
        };

        let input = RepriceInput {
            side,
            mark,
            bbo,
            offset_bps: config.maker.limit_price_offset_bps,
            last_limit: *last_limit,
            initial_limit: ctx.initial_limit,
            remaining_quote: ctx.quote - session.quote,
            tick: config.price_tick,
            base_step: self.base_step,
            min_notional: config.order_min_usd,
        };
        let (limit, base) = match evaluate_reprice(&config.maker.reprice, &input) {
            RepriceDecision::Reprice { limit, base } => (limit, base),
            RepriceDecision::Skip(reason) => {
                debug!(side = %side, order_id = %order_id, last_limit = %last_limit, mark = %mark, reason = ?reason, "재호가 건너뜀");
                return Step::Continue;
            }
        };

        if let Err(e) = broker.cancel_order(ctx.product_id, order_id).await {
            warn!(side = %side, order_id = %order_id, error = %e, "재호가 취소 실패");
            return Step::Continue;
        }
        // 취소 직전 체결분 확인
        if let Ok(order) = broker.get_order(ctx.product_id, order_id).await {
            session.absorb(seen, &order);
            if order.is_filled() {
                info!(side = %side, order_id = %order_id, "취소 전 전량 체결");
                self.post_fill(order_id, *session);
                return Step::Done;
            }
        }
        let base = floor_to_step((ctx.quote - session.quote).max(Decimal::ZERO) / limit, self.base_step).min(base);
        if base <= Decimal::ZERO || base * limit < config.order_min_usd {
            debug!(side = %side, order_id = %order_id, "남은 금액이 최소 주문 미달, 세션 종료");
            self.finish(order_id, *session, "remaining below minimum".to_string()).await;
            return Step::Done;
        }

        let new_id = match broker.place_limit_post_only(ctx.product_id, side, limit, base).await {
            Ok(id) if !id.trim().is_empty() => id,
            Ok(_) => {
                warn!(side = %side, "재호가 주문 ID 없음");
                return Step::Continue;
            }
            Err(e) => {
                // 취소된 이전 주문은 다음 조회에서 종료 상태로 처리됨
                warn!(side = %side, limit = %limit, error = %e, "재호가 주문 실패");
                return Step::Continue;
            }
        };

        let mut state = self.inner.state.lock().await;
        let owned = state.pending[side].as_ref().is_some_and(|p| p.owns_order(order_id));
        if !owned || self.token.is_cancelled() {
            drop(state);
            warn!(side = %side, new_id = %new_id, "대기 주문이 사라짐, 새 주문 취소");
            if let Err(e) = broker.cancel_order(ctx.product_id, &new_id).await {
                warn!(side = %side, order_id = %new_id, error = %e, "새 주문 취소 실패");
            }
            return Step::Done;
        }
        if let Some(p) = state.pending[side].as_mut() {
            p.replace_order(new_id.clone(), limit, base);
            p.accum_base = session.base;
            p.accum_quote = session.quote;
            p.accum_fee = session.fee;
        }
        self.inner.persist(&state);
        drop(state);

        debug!(side = %side, old_id = %order_id, new_id = %new_id, limit = %limit, base = %base, "재호가");
        *order_id = new_id;
        *last_limit = limit;
        *seen = FillTally::default();
        Step::Continue
    }

    /// 토큰 취소 처리.
    ///
    /// 대기 상태가 아직 이 주문을 가리키면 (종료, 작업 교체) 주문을 남겨 둡니다.
    /// 대기 상태가 다른 주문으로 바뀌었거나 비었으면 거래소에서 취소합니다.
    async fn abandon(&self, product_id: &str, order_id: &str) {
        let side = self.side;
        let tracked = self.inner.state.lock().await.pending[side]
            .as_ref()
            .is_some_and(|p| p.owns_order(order_id));
        if tracked {
            debug!(side = %side, order_id = %order_id, "대기 상태가 주문을 유지, 취소하지 않음");
            return;
        }
        match self.inner.broker.cancel_order(product_id, order_id).await {
            Ok(()) => info!(side = %side, order_id = %order_id, "대체된 메이커 주문 취소"),
            Err(e) => warn!(side = %side, order_id = %order_id, error = %e, "대체된 메이커 주문 취소 실패"),
        }
    }

    fn post_fill(&self, order_id: &str, session: FillTally) {
        let result = OpenResult::filled(self.side, session.to_fill(order_id));
        self.inner.completions[self.side].post(result);
    }

    /// 종료 처리. 부분 체결이 있으면 체결로, 없으면 미체결로 알리고 재확인 플래그 설정.
    async fn finish(&self, order_id: &str, session: FillTally, why: String) {
        if session.has_fill() {
            self.post_fill(order_id, session);
            return;
        }
        {
            let mut state = self.inner.state.lock().await;
            // 다른 주문의 대기 상태에는 재확인 플래그를 남기지 않음
            if state.pending[self.side].as_ref().is_some_and(|p| p.owns_order(order_id)) {
                state.recheck[self.side] = true;
                self.inner.persist(&state);
            }
        }
        self.inner.completions[self.side].post(OpenResult::not_filled(self.side, order_id, Some(why)));
    }
}

/// 재호가 계산에 필요한 고정 값.
struct RepriceContext<'a> {
    product_id: &'a str,
    quote: Decimal,
    initial_limit: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reprice_cfg() -> RepriceConfig {
        RepriceConfig {
            enable: true,
            interval_ms: 0,
            max_count: 10,
            max_drift_bps: dec!(20),
            min_improv_ticks: 1,
            min_edge_usd: Decimal::ZERO,
            use_bbo: false,
        }
    }

    fn input(side: Side, mark: Decimal) -> RepriceInput {
        RepriceInput {
            side,
            mark,
            bbo: None,
            offset_bps: Decimal::ZERO,
            last_limit: dec!(100),
            initial_limit: dec!(100),
            remaining_quote: dec!(50),
            tick: dec!(0.01),
            base_step: dec!(0.0001),
            min_notional: dec!(5),
        }
    }

    #[test]
    fn test_completion_slot_keeps_fill() {
        let slot = CompletionSlot::new();
        assert!(slot.post(OpenResult::not_filled(Side::Buy, "a", None)));
        let fill = FilledOrder {
            order_id: "b".into(),
            price: dec!(100),
            base_size: dec!(0.1),
            quote_spent: dec!(10),
            ..Default::default()
        };
        assert!(slot.post(OpenResult::filled(Side::Buy, fill)));
        assert!(!slot.post(OpenResult::not_filled(Side::Buy, "c", None)));

        let taken = slot.take().unwrap();
        assert!(taken.filled);
        assert_eq!(taken.order_id, "b");
        assert!(slot.is_empty());
    }

    #[test]
    fn test_reprice_follows_mark_within_drift() {
        let d = evaluate_reprice(&reprice_cfg(), &input(Side::Buy, dec!(100.1)));
        assert_eq!(
            d,
            RepriceDecision::Reprice {
                limit: dec!(100.1),
                base: dec!(0.4995)
            }
        );
    }

    #[test]
    fn test_reprice_rejects_drift() {
        // 100 → 100.5 = 50bps > 20bps
        let d = evaluate_reprice(&reprice_cfg(), &input(Side::Buy, dec!(100.5)));
        assert!(matches!(d, RepriceDecision::Skip(RepriceSkip::Drift { .. })));
    }

    #[test]
    fn test_reprice_requires_tick_move() {
        let d = evaluate_reprice(&reprice_cfg(), &input(Side::Sell, dec!(100.001)));
        // 매도는 올림: 100.01 → 한 틱 이동
        assert!(matches!(d, RepriceDecision::Reprice { .. }));
        let d = evaluate_reprice(&reprice_cfg(), &input(Side::Buy, dec!(100.009)));
        assert_eq!(d, RepriceDecision::Skip(RepriceSkip::Unchanged));
    }

    #[test]
    fn test_reprice_min_improvement_is_directional() {
        let cfg = RepriceConfig {
            min_improv_ticks: 3,
            ..reprice_cfg()
        };
        // 매수 지정가 상승은 유리하지 않음
        let d = evaluate_reprice(&cfg, &input(Side::Buy, dec!(100.05)));
        assert!(matches!(d, RepriceDecision::Skip(RepriceSkip::Improvement { .. })));
        let d = evaluate_reprice(&cfg, &input(Side::Buy, dec!(99.95)));
        assert!(matches!(d, RepriceDecision::Reprice { .. }));
        let d = evaluate_reprice(&cfg, &input(Side::Buy, dec!(99.99)));
        assert!(matches!(d, RepriceDecision::Skip(RepriceSkip::Improvement { .. })));
    }

    #[test]
    fn test_reprice_edge_and_min_notional() {
        let cfg = RepriceConfig {
            min_edge_usd: dec!(1),
            ..reprice_cfg()
        };
        let d = evaluate_reprice(&cfg, &input(Side::Buy, dec!(100.1)));
        assert!(matches!(d, RepriceDecision::Skip(RepriceSkip::Edge { .. })));

        let mut small = input(Side::Buy, dec!(100.1));
        small.remaining_quote = dec!(3);
        let d = evaluate_reprice(&reprice_cfg(), &small);
        assert_eq!(d, RepriceDecision::Skip(RepriceSkip::MinNotional));
    }

    #[test]
    fn test_reprice_bbo_anti_cross() {
        let cfg = RepriceConfig {
            use_bbo: true,
            max_drift_bps: Decimal::ZERO,
            ..reprice_cfg()
        };
        let mut i = input(Side::Sell, dec!(100));
        i.bbo = Some(BestBidAsk {
            bid: dec!(100.2),
            ask: dec!(100.3),
        });
        assert_eq!(
            evaluate_reprice(&cfg, &i),
            RepriceDecision::Reprice {
                limit: dec!(100.3),
                base: dec!(0.4985)
            }
        );

        // 역전 호가는 무시하고 현재가 기준
        i.bbo = Some(BestBidAsk {
            bid: dec!(101),
            ask: dec!(100),
        });
        assert_eq!(evaluate_reprice(&cfg, &i), RepriceDecision::Skip(RepriceSkip::Unchanged));
    }

    #[test]
    fn test_fill_tally_accumulates_deltas() {
        let mut session = FillTally {
            base: dec!(0.1),
            quote: dec!(10),
            fee: dec!(0.03),
        };
        let mut seen = FillTally::default();
        let mut order = FilledOrder {
            order_id: "x".into(),
            base_size: dec!(0.05),
            quote_spent: dec!(5.5),
            commission: dec!(0.0165),
            ..Default::default()
        };
        session.absorb(&mut seen, &order);
        session.absorb(&mut seen, &order);
        assert_eq!(session.base, dec!(0.15));

        order.base_size = dec!(0.1);
        order.quote_spent = dec!(11);
        session.absorb(&mut seen, &order);
        assert_eq!(session.base, dec!(0.2));
        assert_eq!(session.quote, dec!(21));

        let fill = session.to_fill("x");
        assert_eq!(fill.price, dec!(105));
        assert!(fill.is_filled());
    }
}
