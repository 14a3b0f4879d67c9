//! 브로커 기능 추상화.
//!
//! 트레이더 코어가 거래소에 요구하는 최소 기능 집합을 정의합니다.
//! 가격 조회, 캔들 조회, 시장가/지정가 주문, 주문 조회와 취소, 잔고 조회만
//! 다루며 거래소별 프로토콜과 인증은 구현체의 몫입니다.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use super::{AssetBalance, BestBidAsk, Candle, FilledOrder, Side};

// =============================================================================
// 에러 타입
// =============================================================================

/// Broker 에러.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// 네트워크 에러 (일시적)
    #[error("네트워크 에러: {0}")]
    Network(String),

    /// 잔고 부족
    #[error("잔고 부족: {0}")]
    InsufficientFunds(String),

    /// 주문을 찾을 수 없음
    #[error("주문을 찾을 수 없음: {0}")]
    OrderNotFound(String),

    /// API 에러
    #[error("API 에러: {0}")]
    Api(String),

    /// 지원하지 않는 기능
    #[error("지원하지 않는 기능: {0}")]
    Unsupported(String),

    /// 기타 에러
    #[error("기타 에러: {0}")]
    Other(String),
}

impl BrokerError {
    /// 재시도하면 성공할 수 있는 일시적 에러인지 여부.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Network(_))
    }

    /// 잔고 부족 계열 에러인지 여부.
    ///
    /// 거래소가 잔고 부족을 일반 API 에러로 돌려주는 경우가 있어
    /// 메시지 문구도 함께 검사합니다.
    pub fn is_insufficient_funds(&self) -> bool {
        match self {
            BrokerError::InsufficientFunds(_) => true,
            BrokerError::Api(msg) | BrokerError::Other(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("insufficient") || msg.contains("funds") || msg.contains("400")
            }
            _ => false,
        }
    }
}

// =============================================================================
// Broker Trait
// =============================================================================

/// 거래소 기능 trait.
///
/// 모든 메서드는 상품 ID(예: `BTC-USD`)를 받으며, 구현체는 어떤 전송 방식을
/// 사용해도 됩니다. 트레이더는 이 호출들을 항상 상태 잠금 밖에서 수행합니다.
#[async_trait]
pub trait Broker: Send + Sync {
    /// 브로커 이름. 구현체는 값을 가공하지 않고 그대로 반환해야 합니다.
    fn name(&self) -> &str;

    /// 현재가 조회.
    async fn now_price(&self, product_id: &str) -> Result<Decimal, BrokerError>;

    /// 최근 캔들 조회 (오래된 순).
    async fn recent_candles(
        &self,
        product_id: &str,
        granularity: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, BrokerError>;

    /// 호가 자산 금액 기준 시장가 주문.
    async fn place_market_quote(
        &self,
        product_id: &str,
        side: Side,
        quote: Decimal,
    ) -> Result<FilledOrder, BrokerError>;

    /// post-only 지정가 주문. 주문 ID를 반환합니다.
    async fn place_limit_post_only(
        &self,
        product_id: &str,
        side: Side,
        limit_price: Decimal,
        base_size: Decimal,
    ) -> Result<String, BrokerError>;

    /// 주문 조회. 체결 수량이 0이면 아직 미체결입니다.
    async fn get_order(&self, product_id: &str, order_id: &str) -> Result<FilledOrder, BrokerError>;

    /// 주문 취소. 이미 체결/취소된 주문에 대해서도 에러 없이 성공해야 합니다.
    async fn cancel_order(&self, product_id: &str, order_id: &str) -> Result<(), BrokerError>;

    /// 기준 자산 가용 잔고와 수량 단위.
    async fn available_base(&self, product_id: &str) -> Result<AssetBalance, BrokerError>;

    /// 호가 자산 가용 잔고와 금액 단위.
    async fn available_quote(&self, product_id: &str) -> Result<AssetBalance, BrokerError>;

    /// 최우선 호가. 지원하지 않는 브로커는 기본 구현을 그대로 사용합니다.
    async fn best_bid_ask(&self, product_id: &str) -> Result<BestBidAsk, BrokerError> {
        Err(BrokerError::Unsupported(format!(
            "{}: best_bid_ask ({product_id})",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_classification() {
        assert!(BrokerError::InsufficientFunds("quote".into()).is_insufficient_funds());
        assert!(BrokerError::Api("HTTP 400 Bad Request".into()).is_insufficient_funds());
        assert!(BrokerError::Other("Insufficient balance".into()).is_insufficient_funds());
        assert!(!BrokerError::Network("timeout".into()).is_insufficient_funds());
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(BrokerError::Network("reset".into()).is_transient());
        assert!(!BrokerError::OrderNotFound("abc".into()).is_transient());
    }
}
