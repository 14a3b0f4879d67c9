//! 거래소 중립 타입 정의.
//!
//! 브로커 구현체(페이퍼, 실거래 어댑터 등)가 반환하는 데이터를
//! 통일된 형식으로 표현하기 위한 중립 타입입니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

// =============================================================================
// OHLCV (캔들 데이터)
// =============================================================================

/// 거래소 중립 OHLCV 캔들.
///
/// 마지막 캔들의 `close`가 매 틱의 마크 가격으로 사용됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// 캔들 시각
    pub time: DateTime<Utc>,
    /// 시가
    pub open: Decimal,
    /// 고가
    pub high: Decimal,
    /// 저가
    pub low: Decimal,
    /// 종가
    pub close: Decimal,
    /// 거래량
    pub volume: Decimal,
}

impl Candle {
    /// 단일 가격으로 평평한 캔들 생성 (틱 가격 반영, 테스트용).
    pub fn flat(time: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ZERO,
        }
    }
}

// =============================================================================
// 주문 상태 / 체결 결과
// =============================================================================

/// 거래소 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 접수됨 (미체결)
    New,
    /// 부분 체결
    PartiallyFilled,
    /// 전량 체결
    Filled,
    /// 취소 진행 중
    PendingCancel,
    /// 취소됨
    Canceled,
    /// 거부됨
    Rejected,
    /// 만료됨
    Expired,
}

impl OrderStatus {
    /// 더 이상 체결될 수 없는 종료 상태인지 여부.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// 정규화된 주문 체결 정보 (시장가/지정가 공통).
///
/// `base_size`와 `quote_spent`가 모두 0이면 아직 체결되지 않은 주문입니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilledOrder {
    /// 주문 ID
    pub order_id: String,
    /// 평균 체결가
    pub price: Decimal,
    /// 체결된 기준 자산 수량
    pub base_size: Decimal,
    /// 사용된 호가 자산 금액
    pub quote_spent: Decimal,
    /// 거래소가 보고한 수수료 (USD). 0이면 설정된 수수료율로 추정합니다.
    pub commission: Decimal,
    /// 주문 상태 (보고하지 않는 거래소는 None)
    #[serde(default)]
    pub status: Option<OrderStatus>,
}

impl FilledOrder {
    /// 체결 수량이 하나라도 있는지 여부.
    pub fn has_fill(&self) -> bool {
        self.base_size > Decimal::ZERO || self.quote_spent > Decimal::ZERO
    }

    /// 전량 체결 여부.
    ///
    /// 상태를 보고하지 않는 거래소는 체결 수량이 있으면 체결로 간주합니다.
    pub fn is_filled(&self) -> bool {
        match self.status {
            Some(status) => status == OrderStatus::Filled,
            None => self.has_fill(),
        }
    }
}

// =============================================================================
// 잔고 / 호가
// =============================================================================

/// 자산 가용 잔고와 주문 수량 단위.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// 자산 심볼 (예: BTC, USD)
    pub asset: String,
    /// 주문 가능 수량
    pub available: Decimal,
    /// 주문 수량 단위 (0 이하이면 잘못된 설정)
    pub step: Decimal,
}

/// 최우선 매수/매도 호가.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestBidAsk {
    /// 최우선 매수 호가
    pub bid: Decimal,
    /// 최우선 매도 호가
    pub ask: Decimal,
}

impl BestBidAsk {
    /// 정상 호가인지 확인 (0 < bid < ask).
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > self.bid
    }

    /// 방향에 맞는 메이커 측 호가 (매수는 bid, 매도는 ask).
    pub fn maker_touch(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }
}

/// "BASE-QUOTE" 형식의 상품 ID를 (base, quote)로 분리.
pub fn split_product_id(product_id: &str) -> Option<(&str, &str)> {
    let (base, quote) = product_id.trim().split_once('-')?;
    let (base, quote) = (base.trim(), quote.trim());
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}
