//! 로트 트레이더.
//!
//! 한 번의 틱은 다음 순서로 진행됩니다.
//!
//! 1. 일일 손익 기준일 갱신, 메이커 작업 완료 결과 반영
//! 2. 양쪽 북을 스캔해 최대 한 로트 청산
//! 3. 시그널 판단 → 대기 주문/잔고/게이트 확인 → 크기 산정
//! 4. 메이커 우선(비동기) 또는 시장가로 최대 한 건 진입
//!
//! 상태는 `tokio::sync::Mutex` 하나로 보호하며, 거래소 호출 동안에는 잠금을
//! 풀었다가 다시 잡습니다. 다시 잡은 뒤에는 인덱스 대신 로트 ID로 대상을 찾습니다.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trader_core::{
    AssetBalance, Broker, Decision, ExitRecord, FilledOrder, Lot, OpenResult, OrderStatus, PendingOpen, Side,
    SideBook, SidePair,
};
use trader_strategy::SignalSource;

use crate::add_gate::{
    detect_equity_trigger, equity_reason, evaluate_pyramid, pyramid_reason, staged_size, track_watermarks,
    PyramidTimers, PyramidVerdict,
};
use crate::config::TraderConfig;
use crate::error::{ExecutionError, ExecutionResult};
use crate::exit_policy::{scan_for_exit, ExitParams};
use crate::maker::{CompletionSlot, MakerTask};
use crate::persistence::{backfill_trailing_params, BotState, StateStore};
use crate::sizing::{
    base_quote, floor_to_step, gate_buy_spare, gate_sell_spare, limit_price, preview_take, ramp_risk_pct,
    scalp_take_pct, OrderSize, Reservations, SPARE_EPS,
};

// =============================================================================
// 틱 결과
// =============================================================================

/// 진입 보류 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// 가격/잔고 조회 실패 (다음 틱 재시도)
    BrokerUnavailable,
    /// 여유 재고 부족
    FundsExhausted,
    /// 피라미딩 최소 간격 미달
    Spacing,
    /// 역행 폭 미달
    AdverseGate,
    /// 피라미딩 비활성 상태에서 같은 방향 로트 보유
    PyramidingDisabled,
    /// 최대 로트 수 도달
    LotCap,
    /// 일일 손실 한도 도달
    DailyLoss,
    /// 메이커 주문 게시 실패 (다음 틱 시장가 허용)
    MakerRetry,
    /// 청산 명목 금액이 최소 주문 미만
    ExitBelowMinimum,
    /// 청산 대상 로트가 사라짐
    LotMissing,
}

impl HoldReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HoldReason::BrokerUnavailable => "broker_unavailable",
            HoldReason::FundsExhausted => "funds_exhausted",
            HoldReason::Spacing => "spacing",
            HoldReason::AdverseGate => "adverse_gate",
            HoldReason::PyramidingDisabled => "pyramiding_disabled",
            HoldReason::LotCap => "lot_cap",
            HoldReason::DailyLoss => "daily_loss",
            HoldReason::MakerRetry => "maker_retry",
            HoldReason::ExitBelowMinimum => "exit_below_minimum",
            HoldReason::LotMissing => "lot_missing",
        }
    }
}

/// 한 틱의 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// 캔들 없음
    NoData,
    /// 진입 방향 없음
    Flat { why: &'static str },
    /// 진입 보류
    Hold(HoldReason),
    /// 해당 방향 메이커 주문이 아직 진행 중
    OpenPending { side: Side },
    /// 메이커 주문 게시
    MakerPosted { side: Side, order_id: String, limit: Decimal },
    /// 시장가(또는 드라이런) 진입
    Opened { side: Side, lot_id: u64, price: Decimal, base: Decimal },
    /// 청산
    Closed(ExitRecord),
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickOutcome::NoData => write!(f, "NO_DATA"),
            TickOutcome::Flat { why } => write!(f, "FLAT [{why}]"),
            TickOutcome::Hold(reason) => write!(f, "HOLD [{}]", reason.as_str()),
            TickOutcome::OpenPending { side } => write!(f, "OPEN-PENDING side={side}"),
            TickOutcome::MakerPosted { side, order_id, limit } => {
                write!(f, "MAKER-POSTED side={side} order_id={order_id} limit={limit}")
            }
            TickOutcome::Opened { side, lot_id, price, base } => {
                write!(f, "OPEN side={side} lot={lot_id} price={price} base={base}")
            }
            TickOutcome::Closed(rec) => write!(
                f,
                "EXIT side={} lot={} reason={} pnl={:.4}",
                rec.side, rec.lot_id, rec.reason, rec.pnl_usd
            ),
        }
    }
}

// =============================================================================
// 진입 계획
// =============================================================================

/// 게이트와 크기 산정을 통과한 진입 계획.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPlan {
    pub side: Side,
    /// 계획 시점의 현재가
    pub price: Decimal,
    pub size: OrderSize,
    /// 미리보기 청산가
    pub take: Decimal,
    pub reason: String,
    pub equity_trigger: bool,
    /// 자산 변동 트리거가 사용한 뒤의 다음 단계
    pub next_stage: Option<usize>,
}

/// 진입 계획 입력.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub side: Side,
    pub decision: &'a Decision,
    pub base: &'a AssetBalance,
    pub quote: &'a AssetBalance,
    pub mark: Decimal,
    pub now: DateTime<Utc>,
}

/// 로트 생성에 필요한 진입 메타데이터.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LotSeed {
    pub side: Side,
    pub take: Decimal,
    pub reason: String,
    pub equity_trigger: bool,
    /// 요청 수량 (부분 체결 감지용)
    pub requested_base: Option<Decimal>,
}

// =============================================================================
// TraderState
// =============================================================================

/// 잠금으로 보호되는 트레이더 상태.
pub struct TraderState {
    pub equity: Decimal,
    pub daily_start: Option<NaiveDate>,
    pub daily_pnl: Decimal,
    pub books: SidePair<SideBook>,
    pub timers: SidePair<PyramidTimers>,
    pub equity_baseline: SidePair<Decimal>,
    pub equity_stage: SidePair<usize>,
    pub exit_history: VecDeque<ExitRecord>,
    pub pending: SidePair<Option<PendingOpen>>,
    pub recheck: SidePair<bool>,
    pub next_lot_seq: u64,
    /// 이익 청산 수
    pub wins: u64,
    /// 손실 청산 수
    pub losses: u64,
    pub(crate) tokens: SidePair<Option<CancellationToken>>,
    signal: Box<dyn SignalSource>,
    fee_rate: Decimal,
    history_cap: usize,
}

impl TraderState {
    /// 저장된 스냅샷에서 상태 구성.
    pub fn from_snapshot(snapshot: BotState, mut signal: Box<dyn SignalSource>, config: &TraderConfig) -> Self {
        if let Some(model) = snapshot.model {
            signal.restore_model(model);
        }
        let history_cap = config.exit_history_cap();
        let mut exit_history: VecDeque<ExitRecord> = snapshot.exit_history.into();
        while exit_history.len() > history_cap {
            exit_history.pop_front();
        }
        Self {
            equity: snapshot.equity_usd,
            daily_start: snapshot.daily_start,
            daily_pnl: snapshot.daily_pnl,
            books: snapshot.books,
            timers: snapshot.timers,
            equity_baseline: snapshot.equity_baseline,
            equity_stage: snapshot.equity_stage,
            exit_history,
            pending: snapshot.pending,
            recheck: snapshot.recheck,
            next_lot_seq: snapshot.next_lot_seq.max(1),
            wins: snapshot.wins,
            losses: snapshot.losses,
            tokens: SidePair::default(),
            signal,
            fee_rate: config.fee_rate(),
            history_cap,
        }
    }

    /// 현재 상태의 스냅샷.
    pub fn snapshot(&self) -> BotState {
        BotState {
            equity_usd: self.equity,
            daily_start: self.daily_start,
            daily_pnl: self.daily_pnl,
            books: self.books.clone(),
            timers: self.timers.clone(),
            equity_baseline: self.equity_baseline.clone(),
            equity_stage: self.equity_stage.clone(),
            exit_history: self.exit_history.iter().cloned().collect(),
            pending: self.pending.clone(),
            recheck: self.recheck.clone(),
            next_lot_seq: self.next_lot_seq,
            wins: self.wins,
            losses: self.losses,
            model: self.signal.model().cloned(),
            saved_at: Some(Utc::now()),
        }
    }

    pub fn lot_count(&self) -> usize {
        self.books.buy.len() + self.books.sell.len()
    }

    /// UTC 날짜가 바뀌면 일일 손익 초기화. 바뀌었으면 true.
    pub fn roll_daily(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.daily_start == Some(today) {
            return false;
        }
        if self.daily_start.is_some() {
            info!(date = %today, previous_pnl = %self.daily_pnl, "일일 손익 초기화");
        }
        self.daily_start = Some(today);
        self.daily_pnl = Decimal::ZERO;
        true
    }

    /// 일일 손실 한도 도달 여부.
    pub fn daily_loss_tripped(&self, max_daily_loss_pct: Decimal) -> bool {
        max_daily_loss_pct > Decimal::ZERO && self.daily_pnl <= -(max_daily_loss_pct / dec!(100)) * self.equity
    }

    fn cancel_token(&mut self, side: Side) {
        if let Some(token) = self.tokens[side].take() {
            token.cancel();
        }
    }

    /// 메이커 작업 완료 결과 반영. 상태가 바뀌었으면 true.
    ///
    /// 체결은 현재 주문 ID나 이전 재호가 주문 ID와 일치할 때 로트로 추가하며,
    /// 대기 주문이 없는데 도착한 체결도 재고가 유실되지 않도록 받아들입니다.
    pub fn absorb_completion(&mut self, result: OpenResult, now: DateTime<Utc>) -> bool {
        let side = result.side;
        if let Some(p) = &self.pending[side] {
            if !p.owns_order(&result.order_id) {
                warn!(side = %side, order_id = %result.order_id, pending_id = %p.order_id, "대기 주문과 일치하지 않는 완료 결과 무시");
                return false;
            }
        }
        let pending = self.pending[side].take();
        self.cancel_token(side);

        match (result.filled, result.fill) {
            (true, Some(fill)) => {
                let seed = match &pending {
                    Some(p) => LotSeed {
                        side,
                        take: p.take,
                        reason: p.reason.clone(),
                        equity_trigger: p.equity_trigger,
                        requested_base: Some(p.base_at_limit),
                    },
                    None => {
                        warn!(side = %side, order_id = %fill.order_id, "대기 주문 없이 체결 도착, 로트로 반영");
                        LotSeed {
                            side,
                            take: Decimal::ZERO,
                            reason: "orphan maker fill".to_string(),
                            equity_trigger: false,
                            requested_base: None,
                        }
                    }
                };
                self.append_lot(seed, &fill, now);
            }
            _ => {
                warn!(
                    side = %side,
                    order_id = %result.order_id,
                    error = result.error.as_deref().unwrap_or("-"),
                    "메이커 주문 미체결, 다음 틱 시장가 허용"
                );
                self.recheck[side] = true;
            }
        }
        true
    }

    /// 체결 정보로 로트 추가. 추가된 로트 ID 반환.
    pub(crate) fn append_lot(&mut self, seed: LotSeed, fill: &FilledOrder, now: DateTime<Utc>) -> u64 {
        let side = seed.side;
        let mut price = fill.price;
        if price <= Decimal::ZERO && fill.base_size > Decimal::ZERO {
            price = fill.quote_spent / fill.base_size;
        }
        let base = if fill.base_size > Decimal::ZERO {
            fill.base_size
        } else if price > Decimal::ZERO {
            fill.quote_spent / price
        } else {
            Decimal::ZERO
        };
        let quote = if fill.quote_spent > Decimal::ZERO {
            fill.quote_spent
        } else {
            base * price
        };
        let fee = if fill.commission > Decimal::ZERO {
            fill.commission
        } else {
            warn!(side = %side, order_id = %fill.order_id, "거래소 수수료 미보고, 수수료율로 추정");
            quote * self.fee_rate
        };
        if let Some(requested) = seed.requested_base {
            if base + SPARE_EPS < requested {
                warn!(side = %side, order_id = %fill.order_id, filled = %base, requested = %requested, "진입 부분 체결");
            }
        }

        let lot_id = self.next_lot_seq;
        self.next_lot_seq += 1;
        let lot = Lot {
            lot_id,
            entry_order_id: fill.order_id.clone(),
            open_price: price,
            side,
            size_base: base,
            open_time: now,
            entry_fee: fee,
            open_notional_usd: quote,
            take: seed.take,
            reason: seed.reason,
            ..Default::default()
        };
        let book = &mut self.books[side];
        let idx = book.push(lot);
        if seed.equity_trigger {
            book.set_runner(idx);
            book.lots[idx].reset_trailing();
        }
        self.timers[side].on_add(now, price);
        self.equity_baseline[side] = self.equity;

        info!(
            side = %side,
            lot_id,
            price = %price,
            base = %base,
            fee = %fee,
            runner = seed.equity_trigger,
            lots = self.books[side].len(),
            "로트 추가"
        );
        lot_id
    }

    /// 청산 체결 반영. 부분 체결이면 로트를 줄이고, 전량이면 제거합니다.
    ///
    /// `fill`이 없으면(드라이런) 현재가로 전량 청산한 것으로 계산합니다.
    pub fn apply_exit(
        &mut self,
        side: Side,
        idx: usize,
        fill: Option<&FilledOrder>,
        mark: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<ExitRecord> {
        let fee_rate = self.fee_rate;
        let lot = self.books[side].lots.get(idx)?.clone();
        let requested = lot.size_base;

        let exec_price = match fill {
            Some(f) if f.price > Decimal::ZERO => f.price,
            Some(f) if f.base_size > Decimal::ZERO && f.quote_spent > Decimal::ZERO => f.quote_spent / f.base_size,
            _ => mark,
        };
        let filled = match fill {
            Some(f) if f.base_size > Decimal::ZERO => f.base_size,
            Some(f) if f.quote_spent > Decimal::ZERO => f.quote_spent / exec_price,
            _ => requested,
        }
        .min(requested);
        let prorated_entry = if requested > Decimal::ZERO {
            lot.entry_fee * filled / requested
        } else {
            Decimal::ZERO
        };
        let exit_fee = match fill {
            Some(f) if f.commission > Decimal::ZERO => f.commission,
            Some(f) => {
                warn!(side = %side, order_id = %f.order_id, "청산 수수료 미보고, 수수료율로 추정");
                filled * exec_price * fee_rate
            }
            None => filled * exec_price * fee_rate,
        };
        let gross = match side {
            Side::Buy => (exec_price - lot.open_price) * filled,
            Side::Sell => (lot.open_price - exec_price) * filled,
        };
        let pnl = gross - prorated_entry - exit_fee;
        self.equity += pnl;
        self.daily_pnl += pnl;

        let partial = filled + SPARE_EPS < requested;
        let was_runner = self.books[side].is_runner(idx);
        if partial {
            warn!(side = %side, lot_id = lot.lot_id, filled = %filled, requested = %requested, "청산 부분 체결, 로트 축소");
            let l = &mut self.books[side].lots[idx];
            l.size_base -= filled;
            l.entry_fee = (l.entry_fee - prorated_entry).max(Decimal::ZERO);
        } else if let Some(removed) = self.books[side].remove(idx) {
            if removed.was_newest {
                self.timers[side].reanchor(now);
            }
            if removed.was_runner {
                self.equity_stage[side] = self.equity_stage[side].saturating_sub(1);
            }
            if self.books[side].is_empty() {
                self.equity_stage[side] = 0;
            }
            if let Some(p) = removed.promoted {
                debug!(side = %side, lot_id = self.books[side].lots[p].lot_id, "러너 승계");
            }
        }

        let record = ExitRecord {
            time: now,
            side,
            open_price: lot.open_price,
            close_price: exec_price,
            size_base: filled,
            entry_fee_usd: prorated_entry,
            exit_fee_usd: exit_fee,
            pnl_usd: pnl,
            reason: reason.to_string(),
            exit_mode: lot.exit_mode,
            was_runner,
            lot_id: lot.lot_id,
            entry_order_id: lot.entry_order_id.clone(),
            exit_order_id: fill.map(|f| f.order_id.clone()).unwrap_or_default(),
        };
        self.exit_history.push_back(record.clone());
        while self.exit_history.len() > self.history_cap {
            self.exit_history.pop_front();
        }

        if pnl >= Decimal::ZERO {
            self.wins += 1;
            info!(side = %side, lot_id = lot.lot_id, pnl = %pnl, reason, partial, equity = %self.equity, "청산 (이익)");
        } else {
            self.losses += 1;
            warn!(side = %side, lot_id = lot.lot_id, pnl = %pnl, reason, partial, equity = %self.equity, "청산 (손실)");
        }
        Some(record)
    }

    /// 게이트와 크기 산정을 거쳐 진입 계획 생성.
    pub fn plan_open(&mut self, config: &TraderConfig, req: OpenRequest<'_>) -> Result<OpenPlan, HoldReason> {
        let side = req.side;
        let price = req.mark;
        let min_notional = config.order_min_usd;

        let reserved = Reservations::compute(
            &self.books,
            &self.pending,
            price,
            self.fee_rate,
            config.require_base_for_short,
        );
        let (spare, step) = match side {
            Side::Buy => (reserved.spare_quote(req.quote.available), req.quote.step),
            Side::Sell => (reserved.spare_base(req.base.available), req.base.step),
        };

        // 자산 변동 트리거 + 단계별 크기
        let mut staged = None;
        if let Some(amount) = detect_equity_trigger(
            &config.equity_trigger,
            req.decision.signal,
            self.equity,
            &self.equity_baseline,
            spare,
            step,
        ) {
            match staged_size(
                &config.equity_trigger.stages,
                self.equity_stage[side],
                side,
                amount,
                step,
                price,
                min_notional,
            ) {
                Some(s) => staged = Some((amount, s)),
                None => debug!(side = %side, spare = %amount, "자산 변동 트리거: 최소 주문을 만족하는 단계 없음"),
            }
        }
        let trigger = staged.is_some();

        if !trigger && self.lot_count() >= config.pyramid.max_concurrent_lots {
            debug!(lots = self.lot_count(), cap = config.pyramid.max_concurrent_lots, "최대 로트 수 도달");
            return Err(HoldReason::LotCap);
        }
        if self.daily_loss_tripped(config.max_daily_loss_pct) {
            warn!(daily_pnl = %self.daily_pnl, equity = %self.equity, "일일 손실 한도 도달, 신규 진입 중단");
            return Err(HoldReason::DailyLoss);
        }

        let mut gate = None;
        if !trigger && !self.books[side].is_empty() {
            if !config.pyramid.allow_pyramiding {
                return Err(HoldReason::PyramidingDisabled);
            }
            let last = self.books[side].lots.last().map(|l| l.open_price).unwrap_or_default();
            if last > Decimal::ZERO {
                match evaluate_pyramid(&config.pyramid, side, &mut self.timers[side], last, price, req.now) {
                    PyramidVerdict::Pass(g) => gate = Some(g),
                    PyramidVerdict::Spacing { .. } => return Err(HoldReason::Spacing),
                    PyramidVerdict::Adverse(_) => return Err(HoldReason::AdverseGate),
                }
            }
        }

        let (size, reason, next_stage) = match staged {
            Some((amount, s)) => {
                info!(side = %side, stage = s.stage, spare = %amount, base = %s.size.base, quote = %s.size.quote, "자산 변동 트리거 진입");
                (
                    s.size,
                    equity_reason(side, self.equity, self.equity_baseline[side], amount),
                    Some(s.next_stage),
                )
            }
            None => {
                let risk = ramp_risk_pct(&config.ramp, config.risk_per_trade_pct, self.books[side].len());
                let quote = base_quote(self.equity, risk, min_notional);
                (
                    OrderSize {
                        quote,
                        base: quote / price,
                    },
                    pyramid_reason(req.decision.p_up, gate.as_ref()),
                    None,
                )
            }
        };

        let gated = match side {
            Side::Buy => gate_buy_spare(size.quote, spare, req.quote.step, min_notional, price),
            Side::Sell if config.require_base_for_short => {
                gate_sell_spare(size.base, spare, req.base.step, min_notional, price)
            }
            Side::Sell => Ok(size),
        };
        let size = match gated {
            Ok(size) => size,
            Err(short) => {
                warn!(
                    side = %side,
                    need = %short.need,
                    spare = %short.spare,
                    at_min_notional = short.at_min_notional,
                    available_quote = %req.quote.available,
                    available_base = %req.base.available,
                    reserved_quote = %reserved.quote,
                    reserved_base = %reserved.base,
                    "여유 재고 부족, 진입 보류"
                );
                return Err(HoldReason::FundsExhausted);
            }
        };

        let take = if config.scalp_tp.enable && !trigger {
            let book = &self.books[side];
            let k = (0..book.len()).filter(|i| !book.is_runner(*i)).count();
            preview_take(side, price, scalp_take_pct(&config.scalp_tp, k))
        } else {
            Decimal::ZERO
        };

        Ok(OpenPlan {
            side,
            price,
            size,
            take,
            reason,
            equity_trigger: trigger,
            next_stage,
        })
    }
}

// =============================================================================
// Trader
// =============================================================================

/// 트레이더와 메이커 작업이 공유하는 내부 상태.
pub(crate) struct TraderInner {
    pub(crate) config: TraderConfig,
    pub(crate) exit_params: ExitParams,
    pub(crate) broker: Arc<dyn Broker>,
    store: Option<StateStore>,
    pub(crate) state: Mutex<TraderState>,
    pub(crate) completions: SidePair<CompletionSlot>,
}

impl TraderInner {
    /// 잠금을 잡은 상태에서 스냅샷 저장. 실패는 경고만 남깁니다.
    pub(crate) fn persist(&self, state: &TraderState) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&state.snapshot()) {
            warn!(error = %e, path = %store.path().display(), "상태 저장 실패");
        }
    }
}

/// 메이커 진입 시도 결과.
enum MakerAttempt {
    Posted(TickOutcome),
    /// 게시 실패, 재확인 플래그 설정됨
    Failed,
    /// 최소 주문 금액 미달로 건너뜀
    BelowMinimum,
}

/// 로트 트레이더 핸들.
#[derive(Clone)]
pub struct Trader {
    pub(crate) inner: Arc<TraderInner>,
}

impl Trader {
    /// 설정 검증 후 저장된 상태를 불러와 트레이더 생성.
    ///
    /// 대기 주문 복구는 [`Trader::rehydrate_pending`]을 따로 호출해야 합니다.
    pub fn new(
        config: TraderConfig,
        broker: Arc<dyn Broker>,
        signal: Box<dyn SignalSource>,
    ) -> ExecutionResult<Self> {
        config.validate()?;
        let exit_params = ExitParams::from_config(&config);
        let store = config.persist_state.then(|| StateStore::new(&config.state_file));

        let mut snapshot = match &store {
            Some(store) => store.load()?.unwrap_or_default(),
            None => BotState::default(),
        };
        if snapshot.equity_usd <= Decimal::ZERO || config.dry_run || config.use_live_equity {
            snapshot.equity_usd = config.usd_equity;
        }
        let filled = backfill_trailing_params(&mut snapshot.books, &exit_params);
        if filled > 0 {
            info!(lots = filled, "트레일링 파라미터 보충");
        }
        snapshot.warm_up(Utc::now());

        let state = TraderState::from_snapshot(snapshot, signal, &config);
        info!(
            product = %config.product_id,
            broker = broker.name(),
            dry_run = config.dry_run,
            equity = %state.equity,
            buy_lots = state.books.buy.len(),
            sell_lots = state.books.sell.len(),
            "트레이더 초기화"
        );

        Ok(Self {
            inner: Arc::new(TraderInner {
                config,
                exit_params,
                broker,
                store,
                state: Mutex::new(state),
                completions: SidePair::from_fn(|_| CompletionSlot::new()),
            }),
        })
    }

    pub fn config(&self) -> &TraderConfig {
        &self.inner.config
    }

    /// 현재 자산.
    pub async fn equity(&self) -> Decimal {
        self.inner.state.lock().await.equity
    }

    /// 자산 재설정 (실잔고 기준 자산 모드).
    pub async fn set_equity(&self, equity: Decimal) {
        let mut state = self.inner.state.lock().await;
        if state.equity == equity {
            return;
        }
        debug!(old = %state.equity, new = %equity, "자산 갱신");
        state.equity = equity;
        self.inner.persist(&state);
    }

    /// 최근 청산 기록 최대 `n`개 (오래된 순).
    pub async fn last_exits(&self, n: usize) -> Vec<ExitRecord> {
        let state = self.inner.state.lock().await;
        let skip = state.exit_history.len().saturating_sub(n);
        state.exit_history.iter().skip(skip).cloned().collect()
    }

    /// 현재 상태 스냅샷.
    pub async fn snapshot(&self) -> BotState {
        self.inner.state.lock().await.snapshot()
    }

    /// 모든 메이커 작업을 멈추고 상태를 저장합니다.
    ///
    /// 걸려 있는 주문은 취소하지 않으며, 다음 시작 때 복구됩니다.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        for side in Side::ALL {
            if let Some(token) = state.tokens[side].take() {
                token.cancel();
            }
        }
        self.inner.persist(&state);
        info!("트레이더 종료");
    }

    /// 메이커 작업 생성. 잠금을 잡은 상태에서 호출합니다.
    pub(crate) fn spawn_maker(&self, state: &mut TraderState, side: Side, base_step: Decimal) {
        if let Some(old) = state.tokens[side].take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        state.tokens[side] = Some(token.clone());
        MakerTask::new(Arc::clone(&self.inner), side, token, base_step).spawn();
    }

    /// 한 틱 실행.
    pub async fn tick(&self) -> ExecutionResult<TickOutcome> {
        let inner = &self.inner;
        let config = &inner.config;
        let product_id = config.product_id.as_str();

        let candles = match inner
            .broker
            .recent_candles(product_id, &config.granularity, config.candle_limit)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                warn!(error = %e, "캔들 조회 실패");
                return Ok(TickOutcome::Hold(HoldReason::BrokerUnavailable));
            }
        };
        let Some(mark) = candles.last().map(|c| c.close).filter(|p| *p > Decimal::ZERO) else {
            return Ok(TickOutcome::NoData);
        };
        let now = Utc::now();

        // 1~2단계: 완료 결과 반영, 청산 스캔, 시그널 판단
        let decision = {
            let mut state = inner.state.lock().await;
            let mut dirty = state.roll_daily(now);
            for side in Side::ALL {
                if let Some(result) = inner.completions[side].take() {
                    dirty |= state.absorb_completion(result, now);
                }
            }
            let exit = scan_for_exit(&mut state.books, mark, &inner.exit_params);
            if dirty {
                inner.persist(&state);
            }
            match exit {
                Some(candidate) => Err(candidate),
                None => {
                    track_watermarks(&mut state.timers, mark);
                    Ok(state.signal.decide(&candles))
                }
            }
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(candidate) => return self.close_lot(candidate, mark).await,
        };

        // 3단계: 진입 판단
        let Some(side) = decision.signal.side() else {
            return Ok(TickOutcome::Flat { why: "signal" });
        };
        if side == Side::Sell && config.long_only {
            return Ok(TickOutcome::Flat { why: "long-only" });
        }
        {
            let mut state = inner.state.lock().await;
            if let Some(expired) = state.pending[side].as_ref().map(|p| p.is_expired(Utc::now())) {
                // 마감이 지났어도 완료 결과가 반영될 때까지는 대기 상태
                let watched = state.tokens[side].as_ref().is_some_and(|t| !t.is_cancelled());
                if expired && !watched {
                    warn!(side = %side, "감시 작업 없는 만료 주문, 마감 처리 작업 재시작");
                    self.spawn_maker(&mut state, side, Decimal::ZERO);
                }
                return Ok(TickOutcome::OpenPending { side });
            }
        }

        let (base, quote) = tokio::join!(
            inner.broker.available_base(product_id),
            inner.broker.available_quote(product_id)
        );
        let (base, quote) = match (base, quote) {
            (Ok(b), Ok(q)) => (b, q),
            (Err(e), _) | (_, Err(e)) => {
                warn!(side = %side, error = %e, "잔고 조회 실패");
                return Ok(TickOutcome::Hold(HoldReason::BrokerUnavailable));
            }
        };
        for balance in [&base, &quote] {
            if balance.step <= Decimal::ZERO {
                return Err(ExecutionError::InvalidStep {
                    asset: balance.asset.clone(),
                    step: balance.step,
                });
            }
        }

        let plan = {
            let mut state = inner.state.lock().await;
            let req = OpenRequest {
                side,
                decision: &decision,
                base: &base,
                quote: &quote,
                mark,
                now,
            };
            match state.plan_open(config, req) {
                Ok(plan) => plan,
                Err(reason) => return Ok(TickOutcome::Hold(reason)),
            }
        };
        debug!(side = %side, quote = %plan.size.quote, base = %plan.size.base, take = %plan.take, reason = %plan.reason, "진입 계획");

        // 4단계: 주문 라우팅
        if config.dry_run {
            return self.open_market(plan, quote.step).await;
        }
        let recheck = std::mem::take(&mut inner.state.lock().await.recheck[side]);
        if config.maker.wants_limit() && !recheck {
            match self.try_open_maker(&plan, base.step).await {
                MakerAttempt::Posted(outcome) => return Ok(outcome),
                MakerAttempt::Failed => return Ok(TickOutcome::Hold(HoldReason::MakerRetry)),
                MakerAttempt::BelowMinimum => {
                    debug!(side = %side, "메이커 수량이 최소 주문 미달, 시장가로 진행");
                }
            }
        } else if recheck {
            debug!(side = %side, "재확인 플래그 소비, 이번 틱은 시장가");
        }
        self.open_market(plan, quote.step).await
    }

    /// post-only 지정가를 게시하고 백그라운드 작업을 시작.
    async fn try_open_maker(&self, plan: &OpenPlan, base_step: Decimal) -> MakerAttempt {
        let inner = &self.inner;
        let config = &inner.config;
        let side = plan.side;

        let limit = limit_price(side, plan.price, config.maker.limit_price_offset_bps, config.price_tick);
        let base = if limit > Decimal::ZERO {
            floor_to_step(plan.size.quote / limit, base_step)
        } else {
            Decimal::ZERO
        };
        if base <= Decimal::ZERO || base * limit < config.order_min_usd {
            return MakerAttempt::BelowMinimum;
        }

        let placed = inner
            .broker
            .place_limit_post_only(&config.product_id, side, limit, base)
            .await;
        let order_id = match placed {
            Ok(id) if !id.trim().is_empty() => id,
            other => {
                let error = other.err().map(|e| e.to_string()).unwrap_or_else(|| "empty order id".to_string());
                warn!(side = %side, limit = %limit, base = %base, error = %error, "메이커 주문 게시 실패, 다음 틱 시장가 허용");
                let mut state = inner.state.lock().await;
                state.recheck[side] = true;
                inner.persist(&state);
                return MakerAttempt::Failed;
            }
        };

        let now = Utc::now();
        let pending = PendingOpen {
            side,
            product_id: config.product_id.clone(),
            order_id: order_id.clone(),
            history: Vec::new(),
            limit_price: limit,
            initial_limit_price: limit,
            base_at_limit: base,
            quote: plan.size.quote,
            take: plan.take,
            reason: plan.reason.clone(),
            created_at: now,
            deadline: now + Duration::seconds(config.maker.limit_timeout_sec),
            equity_trigger: plan.equity_trigger,
            reprice_count: 0,
            accum_base: Decimal::ZERO,
            accum_quote: Decimal::ZERO,
            accum_fee: Decimal::ZERO,
        };

        let mut state = inner.state.lock().await;
        if let Some(stage) = plan.next_stage {
            state.equity_stage[side] = stage;
        }
        state.pending[side] = Some(pending);
        self.spawn_maker(&mut state, side, base_step);
        inner.persist(&state);
        info!(side = %side, order_id = %order_id, limit = %limit, base = %base, timeout_sec = config.maker.limit_timeout_sec, "메이커 주문 게시");

        MakerAttempt::Posted(TickOutcome::MakerPosted {
            side,
            order_id,
            limit,
        })
    }

    /// 시장가 진입 (드라이런이면 현재가로 체결 가정).
    ///
    /// 잔고 부족이면 최소 주문 금액으로 한 번만 재시도합니다.
    async fn open_market(&self, plan: OpenPlan, quote_step: Decimal) -> ExecutionResult<TickOutcome> {
        let inner = &self.inner;
        let config = &inner.config;
        let side = plan.side;
        let min_notional = config.order_min_usd;

        let fill = if config.dry_run {
            FilledOrder {
                order_id: String::new(),
                price: plan.price,
                base_size: plan.size.base,
                quote_spent: plan.size.quote,
                commission: plan.size.quote * config.fee_rate(),
                status: Some(OrderStatus::Filled),
            }
        } else {
            match inner
                .broker
                .place_market_quote(&config.product_id, side, plan.size.quote)
                .await
            {
                Ok(fill) => fill,
                Err(e) if e.is_insufficient_funds() && plan.size.quote > min_notional => {
                    warn!(side = %side, quote = %plan.size.quote, min = %min_notional, error = %e, "잔고 부족, 최소 주문 금액으로 재시도");
                    let retry_quote = floor_to_step(min_notional, quote_step).max(min_notional);
                    inner
                        .broker
                        .place_market_quote(&config.product_id, side, retry_quote)
                        .await?
                }
                Err(e) => return Err(e.into()),
            }
        };

        let now = Utc::now();
        let mut state = inner.state.lock().await;
        if !config.dry_run && config.maker.wants_limit() {
            state.recheck[side] = false;
        }
        if let Some(stage) = plan.next_stage {
            state.equity_stage[side] = stage;
        }
        let seed = LotSeed {
            side,
            take: plan.take,
            reason: plan.reason,
            equity_trigger: plan.equity_trigger,
            requested_base: Some(plan.size.base),
        };
        let lot_id = state.append_lot(seed, &fill, now);
        if config.dry_run {
            let fee = state.books[side].lots.last().map(|l| l.entry_fee).unwrap_or_default();
            state.equity -= fee;
        }
        inner.persist(&state);

        let lot = state.books[side].lots.last();
        Ok(TickOutcome::Opened {
            side,
            lot_id,
            price: lot.map(|l| l.open_price).unwrap_or(plan.price),
            base: lot.map(|l| l.size_base).unwrap_or(plan.size.base),
        })
    }

    /// 방향별 로트 북 사본.
    pub async fn book(&self, side: Side) -> SideBook {
        self.inner.state.lock().await.books[side].clone()
    }
}

#[cfg(test)]
mod tests {
    use trader_core::{Candle, SignalDirection};
    use trader_strategy::MicroModel;

    use super::*;

    struct Fixed(SignalDirection);

    impl SignalSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn decide(&mut self, _candles: &[Candle]) -> Decision {
            Decision {
                signal: self.0,
                p_up: 0.5,
            }
        }

        fn model(&self) -> Option<&MicroModel> {
            None
        }
    }

    fn config() -> TraderConfig {
        TraderConfig {
            persist_state: false,
            ..Default::default()
        }
    }

    fn state() -> TraderState {
        let snapshot = BotState {
            equity_usd: dec!(1000),
            next_lot_seq: 1,
            ..Default::default()
        };
        TraderState::from_snapshot(snapshot, Box::new(Fixed(SignalDirection::Buy)), &config())
    }

    fn fill(id: &str, price: Decimal, base: Decimal) -> FilledOrder {
        FilledOrder {
            order_id: id.into(),
            price,
            base_size: base,
            quote_spent: price * base,
            commission: Decimal::ZERO,
            status: Some(OrderStatus::Filled),
        }
    }

    fn balance(asset: &str, available: Decimal, step: Decimal) -> AssetBalance {
        AssetBalance {
            asset: asset.into(),
            available,
            step,
        }
    }

    fn seed(side: Side) -> LotSeed {
        LotSeed {
            side,
            take: Decimal::ZERO,
            reason: "test".into(),
            equity_trigger: false,
            requested_base: None,
        }
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(TickOutcome::OpenPending { side: Side::Buy }.to_string(), "OPEN-PENDING side=BUY");
        assert_eq!(TickOutcome::Hold(HoldReason::LotCap).to_string(), "HOLD [lot_cap]");
        assert_eq!(TickOutcome::Flat { why: "long-only" }.to_string(), "FLAT [long-only]");
    }

    #[test]
    fn test_append_lot_estimates_fee_and_sets_timers() {
        let mut s = state();
        let now = Utc::now();
        let id = s.append_lot(seed(Side::Buy), &fill("m-1", dec!(100), dec!(0.1)), now);
        assert_eq!(id, 1);
        assert_eq!(s.next_lot_seq, 2);

        let lot = &s.books.buy.lots[0];
        assert_eq!(lot.entry_fee, dec!(0.03));
        assert_eq!(lot.entry_order_id, "m-1");
        assert_eq!(s.books.buy.runner, None);
        assert_eq!(s.timers.buy.last_add, Some(now));
        assert_eq!(s.timers.buy.watermark, dec!(100));
        assert_eq!(s.equity_baseline.buy, dec!(1000));
    }

    #[test]
    fn test_equity_trigger_lot_becomes_runner() {
        let mut s = state();
        let now = Utc::now();
        s.append_lot(seed(Side::Buy), &fill("a", dec!(100), dec!(0.1)), now);
        let mut trig = seed(Side::Buy);
        trig.equity_trigger = true;
        s.append_lot(trig, &fill("b", dec!(99), dec!(0.1)), now);
        assert_eq!(s.books.buy.runner, Some(1));
        assert_eq!(s.books.buy.lots[1].trail_peak, dec!(99));
    }

    #[test]
    fn test_absorb_completion_matches_history_and_rejects_foreign() {
        let mut s = state();
        let now = Utc::now();
        s.pending.buy = Some(PendingOpen {
            side: Side::Buy,
            product_id: "BTC-USD".into(),
            order_id: "new".into(),
            history: vec!["old".into()],
            limit_price: dec!(100),
            initial_limit_price: dec!(100),
            base_at_limit: dec!(0.1),
            quote: dec!(10),
            take: dec!(101),
            reason: "maker".into(),
            created_at: now,
            deadline: now + Duration::seconds(30),
            equity_trigger: false,
            reprice_count: 1,
            accum_base: Decimal::ZERO,
            accum_quote: Decimal::ZERO,
            accum_fee: Decimal::ZERO,
        });

        let foreign = OpenResult::filled(Side::Buy, fill("zzz", dec!(100), dec!(0.1)));
        assert!(!s.absorb_completion(foreign, now));
        assert!(s.pending.buy.is_some());

        let ok = OpenResult::filled(Side::Buy, fill("old", dec!(100), dec!(0.1)));
        assert!(s.absorb_completion(ok, now));
        assert!(s.pending.buy.is_none());
        assert_eq!(s.books.buy.lots[0].take, dec!(101));
        assert_eq!(s.books.buy.lots[0].reason, "maker");
    }

    #[test]
    fn test_non_fill_completion_arms_recheck() {
        let mut s = state();
        let result = OpenResult::not_filled(Side::Sell, "x", Some("timeout".into()));
        assert!(s.absorb_completion(result, Utc::now()));
        assert!(s.recheck.sell);
        assert!(s.books.sell.is_empty());
    }

    #[test]
    fn test_apply_exit_partial_prorates_fee() {
        let mut s = state();
        let now = Utc::now();
        s.append_lot(seed(Side::Buy), &fill("a", dec!(100), dec!(1)), now);
        s.books.buy.set_runner(0);

        let partial = FilledOrder {
            order_id: "x".into(),
            price: dec!(110),
            base_size: dec!(0.25),
            quote_spent: dec!(27.5),
            commission: dec!(0.05),
            status: Some(OrderStatus::PartiallyFilled),
        };
        let rec = s.apply_exit(Side::Buy, 0, Some(&partial), dec!(110), "trailing_stop", now).unwrap();
        // 진입 수수료 0.3 중 1/4 = 0.075
        assert_eq!(rec.entry_fee_usd, dec!(0.075));
        assert_eq!(rec.pnl_usd, dec!(2.5) - dec!(0.075) - dec!(0.05));
        let lot = &s.books.buy.lots[0];
        assert_eq!(lot.size_base, dec!(0.75));
        assert_eq!(lot.entry_fee, dec!(0.225));
        assert_eq!(s.books.buy.runner, Some(0));
        assert_eq!(s.equity, dec!(1000) + rec.pnl_usd);
    }

    #[test]
    fn test_apply_exit_full_runner_close_rolls_stage() {
        let mut s = state();
        let now = Utc::now();
        s.append_lot(seed(Side::Buy), &fill("a", dec!(100), dec!(0.1)), now);
        s.append_lot(seed(Side::Buy), &fill("b", dec!(99), dec!(0.1)), now);
        s.books.buy.set_runner(0);
        s.equity_stage.buy = 2;

        let rec = s.apply_exit(Side::Buy, 0, None, dec!(102), "trailing_stop", now).unwrap();
        assert!(rec.was_runner);
        assert_eq!(s.equity_stage.buy, 1);
        assert_eq!(s.books.buy.runner, Some(0));
        assert_eq!(s.books.buy.lots[0].lot_id, 2);

        s.apply_exit(Side::Buy, 0, None, dec!(102), "take_profit", now).unwrap();
        assert_eq!(s.equity_stage.buy, 0);
        assert_eq!(s.timers.buy.watermark, Decimal::ZERO);
        assert_eq!(s.exit_history.len(), 2);
    }

    #[test]
    fn test_daily_roll_and_breaker() {
        let mut s = state();
        let now = Utc::now();
        assert!(s.roll_daily(now));
        assert!(!s.roll_daily(now));
        s.daily_pnl = dec!(-20);
        assert!(s.daily_loss_tripped(dec!(2)));
        assert!(!s.daily_loss_tripped(dec!(3)));
        assert!(!s.daily_loss_tripped(Decimal::ZERO));
        assert!(s.roll_daily(now + Duration::days(1)));
        assert_eq!(s.daily_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_plan_open_reserves_inventory_for_open_shorts() {
        let mut s = state();
        let now = Utc::now();
        // 숏 로트 1개 (환매에 약 100.3 USD 필요)
        s.append_lot(seed(Side::Sell), &fill("s", dec!(100), dec!(1)), now);
        let decision = Decision {
            signal: SignalDirection::Buy,
            p_up: 0.7,
        };
        let base = balance("BTC", dec!(0), dec!(0.0001));
        let quote = balance("USD", dec!(103), dec!(0.01));
        let req = OpenRequest {
            side: Side::Buy,
            decision: &decision,
            base: &base,
            quote: &quote,
            mark: dec!(100),
            now,
        };
        assert_eq!(s.plan_open(&config(), req), Err(HoldReason::FundsExhausted));

        let quote = balance("USD", dec!(200), dec!(0.01));
        let req = OpenRequest { quote: &quote, ..req };
        let plan = s.plan_open(&config(), req).unwrap();
        assert_eq!(plan.size.quote, dec!(5));
        assert!(plan.reason.starts_with("pUp=0.70000|gatePrice=0.000"));
    }

    #[test]
    fn test_plan_open_lot_cap_and_daily_loss() {
        let mut s = state();
        let now = Utc::now();
        let mut cfg = config();
        cfg.pyramid.max_concurrent_lots = 1;
        s.append_lot(seed(Side::Sell), &fill("s", dec!(100), dec!(0.01)), now);

        let decision = Decision {
            signal: SignalDirection::Buy,
            p_up: 0.7,
        };
        let base = balance("BTC", dec!(0), dec!(0.0001));
        let quote = balance("USD", dec!(500), dec!(0.01));
        let req = OpenRequest {
            side: Side::Buy,
            decision: &decision,
            base: &base,
            quote: &quote,
            mark: dec!(100),
            now,
        };
        assert_eq!(s.plan_open(&cfg, req), Err(HoldReason::LotCap));

        cfg.pyramid.max_concurrent_lots = 10;
        cfg.max_daily_loss_pct = dec!(1);
        s.daily_pnl = dec!(-15);
        assert_eq!(s.plan_open(&cfg, req), Err(HoldReason::DailyLoss));
    }

    #[test]
    fn test_plan_open_equity_trigger_bypasses_pyramid_gate() {
        let mut s = state();
        let now = Utc::now();
        let mut cfg = config();
        cfg.long_only = false;
        s.append_lot(seed(Side::Sell), &fill("s", dec!(100), dec!(0.05)), now);
        s.equity_baseline.sell = dec!(1000);
        s.equity = dec!(1015);

        let decision = Decision {
            signal: SignalDirection::Sell,
            p_up: 0.2,
        };
        // 보유 기준 자산 1.05, 예약 없음 (매수 로트 없음)
        let base = balance("BTC", dec!(1.05), dec!(0.001));
        let quote = balance("USD", dec!(0), dec!(0.01));
        let req = OpenRequest {
            side: Side::Sell,
            decision: &decision,
            base: &base,
            quote: &quote,
            mark: dec!(100),
            now,
        };
        let plan = s.plan_open(&cfg, req).unwrap();
        assert!(plan.equity_trigger);
        // 1단계 25% → floor(1.05 × 0.25, 0.001) = 0.262
        assert_eq!(plan.size.base, dec!(0.262));
        assert_eq!(plan.next_stage, Some(1));
        assert!(plan.reason.starts_with("EQUITY Trading:"));
    }

    fn maker_trader(broker: &Arc<trader_exchange::PaperBroker>) -> Trader {
        let mut cfg = TraderConfig {
            persist_state: false,
            dry_run: false,
            risk_per_trade_pct: dec!(50),
            ..Default::default()
        };
        cfg.maker.order_type = crate::config::OrderType::Limit;
        cfg.maker.limit_timeout_sec = 30;
        cfg.maker.poll_interval_ms = 20;
        Trader::new(cfg, broker.clone(), Box::new(Fixed(SignalDirection::Buy))).unwrap()
    }

    fn paper() -> Arc<trader_exchange::PaperBroker> {
        Arc::new(trader_exchange::PaperBroker::new(trader_exchange::PaperConfig {
            initial_price: dec!(100),
            quote_balance: dec!(1000),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_superseded_maker_task_cancels_its_order() {
        let broker = paper();
        let trader = maker_trader(&broker);
        let TickOutcome::MakerPosted { order_id, .. } = trader.tick().await.unwrap() else {
            panic!("메이커 주문이 게시되어야 함");
        };
        assert_eq!(broker.open_order_ids().await, vec![order_id]);

        // 대기 상태가 더 이상 이 주문을 가리키지 않는 상태에서 작업 취소
        {
            let mut state = trader.inner.state.lock().await;
            state.pending[Side::Buy] = None;
            state.cancel_token(Side::Buy);
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(broker.open_order_ids().await.is_empty());
        assert_eq!(broker.stats().await.cancels, 1);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_tracked_order_resting() {
        let broker = paper();
        let trader = maker_trader(&broker);
        let TickOutcome::MakerPosted { order_id, .. } = trader.tick().await.unwrap() else {
            panic!("메이커 주문이 게시되어야 함");
        };
        trader.shutdown().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(broker.open_order_ids().await, vec![order_id]);
        assert_eq!(broker.stats().await.cancels, 0);
    }
}
