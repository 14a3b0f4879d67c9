//! 페이퍼 브로커.
//!
//! 외부 호출 없이 마지막 가격으로 체결을 시뮬레이션하는 인메모리 브로커입니다.
//!
//! # 핵심 기능
//!
//! - 시장가 주문: 현재가로 즉시 체결, 수수료는 설정된 수수료율로 계산
//! - post-only 지정가: 현재가를 가로지르면 거부, 아니면 대기 큐 등록
//! - 가격 갱신: 대기 주문 중 지정가에 닿은 주문을 지정가로 체결
//! - 취소: 멱등 (이미 체결/취소된 주문이나 모르는 주문도 성공)
//! - 장애 주입: 테스트에서 특정 호출이 실패하도록 에러를 미리 등록

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use trader_core::{
    split_product_id, AssetBalance, BestBidAsk, Broker, BrokerError, Candle, FilledOrder,
    OrderStatus, Side,
};

/// 보관하는 최대 캔들 수.
const MAX_CANDLES: usize = 1_000;

// ==================== 설정 ====================

/// 페이퍼 브로커 설정.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// 브로커 이름
    pub name: String,
    /// 시작 가격
    pub initial_price: Decimal,
    /// 수수료율 (비율, 0.003 = 0.3%)
    pub fee_rate: Decimal,
    /// 기준 자산 초기 잔고
    pub base_balance: Decimal,
    /// 호가 자산 초기 잔고
    pub quote_balance: Decimal,
    /// 기준 자산 수량 단위
    pub base_step: Decimal,
    /// 호가 자산 금액 단위
    pub quote_step: Decimal,
    /// 잔고 부족 시 주문 거부 여부
    pub enforce_balances: bool,
    /// 주문 조회 시 상태 보고 여부 (false면 상태 없이 수량만 반환)
    pub report_status: bool,
    /// 최우선 호가 스프레드 (bps). 0이면 best_bid_ask 미지원.
    pub spread_bps: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            name: "paper".to_string(),
            initial_price: dec!(108000),
            fee_rate: dec!(0.003),
            base_balance: Decimal::ZERO,
            quote_balance: dec!(1000),
            base_step: dec!(0.00000001),
            quote_step: dec!(0.01),
            enforce_balances: true,
            report_status: true,
            spread_bps: Decimal::ZERO,
        }
    }
}

/// 장애 주입 대상 호출.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    NowPrice,
    Candles,
    MarketOrder,
    LimitOrder,
    GetOrder,
    CancelOrder,
    Balance,
}

/// 호출 횟수 통계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperStats {
    pub market_orders: u32,
    pub limit_orders: u32,
    pub cancels: u32,
    pub get_orders: u32,
}

// ==================== 내부 상태 ====================

#[derive(Debug, Clone)]
struct PaperOrder {
    side: Side,
    limit_price: Decimal,
    base_size: Decimal,
    filled_base: Decimal,
    filled_quote: Decimal,
    commission: Decimal,
    status: OrderStatus,
}

impl PaperOrder {
    fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    fn avg_price(&self) -> Decimal {
        if self.filled_base > Decimal::ZERO {
            self.filled_quote / self.filled_base
        } else {
            self.limit_price
        }
    }
}

#[derive(Debug)]
struct PaperState {
    price: Decimal,
    candles: VecDeque<Candle>,
    orders: HashMap<String, PaperOrder>,
    next_order_id: u64,
    base_balance: Decimal,
    quote_balance: Decimal,
    failures: HashMap<PaperOp, VecDeque<BrokerError>>,
    stats: PaperStats,
}

impl PaperState {
    fn take_failure(&mut self, op: PaperOp) -> Result<(), BrokerError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn generate_order_id(&mut self) -> String {
        let id = format!("PAPER-{:08}", self.next_order_id);
        self.next_order_id += 1;
        id
    }

    /// 체결분을 잔고에 반영.
    fn settle(&mut self, side: Side, base: Decimal, quote: Decimal, commission: Decimal) {
        match side {
            Side::Buy => {
                self.base_balance += base;
                self.quote_balance -= quote + commission;
            }
            Side::Sell => {
                self.base_balance -= base;
                self.quote_balance += quote - commission;
            }
        }
    }
}

// ==================== PaperBroker ====================

/// 인메모리 페이퍼 브로커.
pub struct PaperBroker {
    config: PaperConfig,
    state: RwLock<PaperState>,
}

impl PaperBroker {
    /// 새 브로커 생성.
    pub fn new(config: PaperConfig) -> Self {
        let state = PaperState {
            price: config.initial_price,
            candles: VecDeque::from([Candle::flat(Utc::now(), config.initial_price)]),
            orders: HashMap::new(),
            next_order_id: 1,
            base_balance: config.base_balance,
            quote_balance: config.quote_balance,
            failures: HashMap::new(),
            stats: PaperStats::default(),
        };
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    /// 가격 갱신.
    ///
    /// 새 캔들을 추가하고 지정가에 닿은 대기 주문을 지정가로 전량 체결합니다.
    pub async fn set_price(&self, price: Decimal) {
        self.push_candle(Candle::flat(Utc::now(), price)).await;
    }

    /// 과거 캔들 재생. 종가를 현재가로 삼아 [`PaperBroker::set_price`]와 같이 체결합니다.
    pub async fn push_candle(&self, candle: Candle) {
        let fee_rate = self.config.fee_rate;
        let price = candle.close;
        let mut state = self.state.write().await;
        state.price = price;
        state.candles.push_back(candle);
        while state.candles.len() > MAX_CANDLES {
            state.candles.pop_front();
        }

        let mut settlements = Vec::new();
        for (order_id, order) in state.orders.iter_mut() {
            if !order.is_open() {
                continue;
            }
            let crossed = match order.side {
                Side::Buy => price <= order.limit_price,
                Side::Sell => price >= order.limit_price,
            };
            if !crossed {
                continue;
            }
            let base = order.base_size - order.filled_base;
            let quote = base * order.limit_price;
            let commission = quote * fee_rate;
            order.filled_base += base;
            order.filled_quote += quote;
            order.commission += commission;
            order.status = OrderStatus::Filled;
            info!(order_id = %order_id, side = %order.side, price = %order.limit_price, "[Paper] 지정가 체결");
            settlements.push((order.side, base, quote, commission));
        }
        for (side, base, quote, commission) in settlements {
            state.settle(side, base, quote, commission);
        }
    }

    /// 대기 주문의 일부만 지정가로 체결 (부분 체결 시뮬레이션).
    pub async fn partial_fill(&self, order_id: &str, base: Decimal) -> Result<(), BrokerError> {
        let fee_rate = self.config.fee_rate;
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;
        if !order.is_open() {
            return Err(BrokerError::Api(format!("주문이 이미 종료됨: {order_id}")));
        }
        let base = base.min(order.base_size - order.filled_base);
        let quote = base * order.limit_price;
        let commission = quote * fee_rate;
        order.filled_base += base;
        order.filled_quote += quote;
        order.commission += commission;
        order.status = if order.filled_base >= order.base_size {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let side = order.side;
        state.settle(side, base, quote, commission);
        Ok(())
    }

    /// 다음 호출 하나가 주어진 에러로 실패하도록 등록.
    pub async fn inject_failure(&self, op: PaperOp, error: BrokerError) {
        self.state
            .write()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// 현재 대기 중인(미종료) 주문 ID 목록.
    pub async fn open_order_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .orders
            .iter()
            .filter(|(_, order)| order.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 주문의 지정가 조회.
    pub async fn order_limit_price(&self, order_id: &str) -> Option<Decimal> {
        self.state
            .read()
            .await
            .orders
            .get(order_id)
            .map(|order| order.limit_price)
    }

    /// 호출 통계.
    pub async fn stats(&self) -> PaperStats {
        self.state.read().await.stats
    }

    /// 현재 잔고 (기준, 호가).
    pub async fn balances(&self) -> (Decimal, Decimal) {
        let state = self.state.read().await;
        (state.base_balance, state.quote_balance)
    }

    fn assets(&self, product_id: &str) -> (String, String) {
        match split_product_id(product_id) {
            Some((base, quote)) => (base.to_string(), quote.to_string()),
            None => ("BASE".to_string(), "QUOTE".to_string()),
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn now_price(&self, _product_id: &str) -> Result<Decimal, BrokerError> {
        let mut state = self.state.write().await;
        state.take_failure(PaperOp::NowPrice)?;
        Ok(state.price)
    }

    async fn recent_candles(
        &self,
        _product_id: &str,
        _granularity: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        let mut state = self.state.write().await;
        state.take_failure(PaperOp::Candles)?;
        let skip = state.candles.len().saturating_sub(limit);
        Ok(state.candles.iter().skip(skip).cloned().collect())
    }

    async fn place_market_quote(
        &self,
        product_id: &str,
        side: Side,
        quote: Decimal,
    ) -> Result<FilledOrder, BrokerError> {
        let mut state = self.state.write().await;
        state.take_failure(PaperOp::MarketOrder)?;
        state.stats.market_orders += 1;

        if quote <= Decimal::ZERO {
            return Err(BrokerError::Api("주문 금액은 0보다 커야 합니다".to_string()));
        }
        let price = state.price;
        let base = quote / price;
        let commission = quote * self.config.fee_rate;

        if self.config.enforce_balances {
            match side {
                Side::Buy if quote + commission > state.quote_balance => {
                    return Err(BrokerError::InsufficientFunds(format!(
                        "{product_id}: 필요 {} > 가용 {}",
                        quote + commission,
                        state.quote_balance
                    )));
                }
                Side::Sell if base > state.base_balance => {
                    return Err(BrokerError::InsufficientFunds(format!(
                        "{product_id}: 필요 {base} > 가용 {}",
                        state.base_balance
                    )));
                }
                _ => {}
            }
        }

        let order_id = state.generate_order_id();
        state.settle(side, base, quote, commission);
        info!(order_id = %order_id, side = %side, price = %price, quote = %quote, "[Paper] 시장가 체결");

        Ok(FilledOrder {
            order_id,
            price,
            base_size: base,
            quote_spent: quote,
            commission,
            status: Some(OrderStatus::Filled),
        })
    }

    async fn place_limit_post_only(
        &self,
        _product_id: &str,
        side: Side,
        limit_price: Decimal,
        base_size: Decimal,
    ) -> Result<String, BrokerError> {
        let mut state = self.state.write().await;
        state.take_failure(PaperOp::LimitOrder)?;
        state.stats.limit_orders += 1;

        if limit_price <= Decimal::ZERO || base_size <= Decimal::ZERO {
            return Err(BrokerError::Api("지정가와 수량은 0보다 커야 합니다".to_string()));
        }
        let would_cross = match side {
            Side::Buy => limit_price >= state.price,
            Side::Sell => limit_price <= state.price,
        };
        if would_cross {
            return Err(BrokerError::Api(format!(
                "post-only 주문이 현재가 {}를 가로지름",
                state.price
            )));
        }

        let order_id = state.generate_order_id();
        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                side,
                limit_price,
                base_size,
                filled_base: Decimal::ZERO,
                filled_quote: Decimal::ZERO,
                commission: Decimal::ZERO,
                status: OrderStatus::New,
            },
        );
        debug!(order_id = %order_id, side = %side, limit = %limit_price, base = %base_size, "[Paper] 지정가 등록");
        Ok(order_id)
    }

    async fn get_order(&self, _product_id: &str, order_id: &str) -> Result<FilledOrder, BrokerError> {
        let mut state = self.state.write().await;
        state.take_failure(PaperOp::GetOrder)?;
        state.stats.get_orders += 1;

        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;
        trace!(order_id, status = ?order.status, filled = %order.filled_base, "[Paper] 주문 조회");

        Ok(FilledOrder {
            order_id: order_id.to_string(),
            price: order.avg_price(),
            base_size: order.filled_base,
            quote_spent: order.filled_quote,
            commission: order.commission,
            status: self.config.report_status.then_some(order.status),
        })
    }

    async fn cancel_order(&self, _product_id: &str, order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        state.take_failure(PaperOp::CancelOrder)?;
        state.stats.cancels += 1;

        if let Some(order) = state.orders.get_mut(order_id) {
            if order.is_open() {
                order.status = OrderStatus::Canceled;
                debug!(order_id, "[Paper] 주문 취소");
            }
        }
        Ok(())
    }

    async fn available_base(&self, product_id: &str) -> Result<AssetBalance, BrokerError> {
        let mut state = self.state.write().await;
        state.take_failure(PaperOp::Balance)?;
        let (base, _) = self.assets(product_id);
        Ok(AssetBalance {
            asset: base,
            available: state.base_balance,
            step: self.config.base_step,
        })
    }

    async fn available_quote(&self, product_id: &str) -> Result<AssetBalance, BrokerError> {
        let mut state = self.state.write().await;
        state.take_failure(PaperOp::Balance)?;
        let (_, quote) = self.assets(product_id);
        Ok(AssetBalance {
            asset: quote,
            available: state.quote_balance,
            step: self.config.quote_step,
        })
    }

    async fn best_bid_ask(&self, product_id: &str) -> Result<BestBidAsk, BrokerError> {
        if self.config.spread_bps <= Decimal::ZERO {
            return Err(BrokerError::Unsupported(format!("{}: best_bid_ask ({product_id})", self.config.name)));
        }
        let price = self.state.read().await.price;
        let half = price * self.config.spread_bps / dec!(20000);
        Ok(BestBidAsk {
            bid: price - half,
            ask: price + half,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT: &str = "BTC-USD";

    fn broker() -> PaperBroker {
        PaperBroker::new(PaperConfig {
            initial_price: dec!(100),
            fee_rate: dec!(0.001),
            base_balance: dec!(1),
            quote_balance: dec!(1000),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_market_buy_fills_at_price() {
        let broker = broker();
        let fill = broker.place_market_quote(PRODUCT, Side::Buy, dec!(50)).await.unwrap();
        assert_eq!(fill.price, dec!(100));
        assert_eq!(fill.base_size, dec!(0.5));
        assert_eq!(fill.commission, dec!(0.05));

        let (base, quote) = broker.balances().await;
        assert_eq!(base, dec!(1.5));
        assert_eq!(quote, dec!(949.95));
    }

    #[tokio::test]
    async fn test_market_buy_insufficient_funds() {
        let broker = broker();
        let err = broker
            .place_market_quote(PRODUCT, Side::Buy, dec!(5000))
            .await
            .unwrap_err();
        assert!(err.is_insufficient_funds());
    }

    #[tokio::test]
    async fn test_post_only_rejects_crossing_price() {
        let broker = broker();
        let err = broker
            .place_limit_post_only(PRODUCT, Side::Buy, dec!(100), dec!(0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Api(_)));
    }

    #[tokio::test]
    async fn test_limit_fills_when_price_crosses() {
        let broker = broker();
        let id = broker
            .place_limit_post_only(PRODUCT, Side::Buy, dec!(99), dec!(0.1))
            .await
            .unwrap();

        let open = broker.get_order(PRODUCT, &id).await.unwrap();
        assert!(!open.has_fill());
        assert_eq!(open.status, Some(OrderStatus::New));

        broker.set_price(dec!(98.5)).await;
        let filled = broker.get_order(PRODUCT, &id).await.unwrap();
        assert!(filled.is_filled());
        assert_eq!(filled.price, dec!(99));
        assert_eq!(filled.quote_spent, dec!(9.9));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let broker = broker();
        let id = broker
            .place_limit_post_only(PRODUCT, Side::Sell, dec!(101), dec!(0.1))
            .await
            .unwrap();
        broker.cancel_order(PRODUCT, &id).await.unwrap();
        broker.cancel_order(PRODUCT, &id).await.unwrap();
        broker.cancel_order(PRODUCT, "unknown").await.unwrap();

        let order = broker.get_order(PRODUCT, &id).await.unwrap();
        assert_eq!(order.status, Some(OrderStatus::Canceled));
        assert!(broker.open_order_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_fill_then_status() {
        let broker = broker();
        let id = broker
            .place_limit_post_only(PRODUCT, Side::Buy, dec!(99), dec!(0.2))
            .await
            .unwrap();
        broker.partial_fill(&id, dec!(0.05)).await.unwrap();
        let order = broker.get_order(PRODUCT, &id).await.unwrap();
        assert_eq!(order.status, Some(OrderStatus::PartiallyFilled));
        assert_eq!(order.base_size, dec!(0.05));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let broker = broker();
        broker
            .inject_failure(PaperOp::NowPrice, BrokerError::Network("timeout".into()))
            .await;
        assert!(broker.now_price(PRODUCT).await.is_err());
        assert_eq!(broker.now_price(PRODUCT).await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_best_bid_ask_requires_spread() {
        let broker = broker();
        assert!(matches!(
            broker.best_bid_ask(PRODUCT).await,
            Err(BrokerError::Unsupported(_))
        ));

        let broker = PaperBroker::new(PaperConfig {
            initial_price: dec!(100),
            spread_bps: dec!(10),
            ..Default::default()
        });
        let bbo = broker.best_bid_ask(PRODUCT).await.unwrap();
        assert_eq!(bbo.bid, dec!(99.95));
        assert_eq!(bbo.ask, dec!(100.05));
    }

    #[tokio::test]
    async fn test_push_candle_replays_history() {
        let broker = broker();
        let id = broker
            .place_limit_post_only(PRODUCT, Side::Buy, dec!(99), dec!(0.1))
            .await
            .unwrap();

        let time = chrono::DateTime::parse_from_rfc3339("2024-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let candle = Candle {
            time,
            open: dec!(100),
            high: dec!(100.5),
            low: dec!(98.2),
            close: dec!(98.5),
            volume: dec!(12),
        };
        broker.push_candle(candle.clone()).await;

        assert_eq!(broker.now_price(PRODUCT).await.unwrap(), dec!(98.5));
        let candles = broker.recent_candles(PRODUCT, "ONE_MINUTE", 10).await.unwrap();
        assert_eq!(candles.last(), Some(&candle));
        assert!(broker.get_order(PRODUCT, &id).await.unwrap().is_filled());
    }
}
