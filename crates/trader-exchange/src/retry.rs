//! 브로커 조회 재시도 유틸리티.
//!
//! 네트워크 오류 같은 일시적인 오류에 대해 자동 재시도를 수행합니다.
//! 주문 생성은 멱등하지 않으므로 재시도하지 않고, 조회와 취소만 감쌉니다.
//!
//! # 예시
//!
//! ```rust,ignore
//! use trader_exchange::retry::{RetryConfig, with_retry};
//!
//! let config = RetryConfig::default();
//! let price = with_retry(&config, || async {
//!     broker.now_price("BTC-USD").await
//! }).await;
//! ```

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use trader_core::{AssetBalance, BestBidAsk, Broker, BrokerError, Candle, FilledOrder, Side};

/// 재시도 설정.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 최대 재시도 횟수 (초기 시도 제외).
    pub max_retries: u32,
    /// 기본 대기 시간.
    pub base_delay: Duration,
    /// 최대 대기 시간.
    pub max_delay: Duration,
    /// 백오프 배수.
    pub backoff_multiplier: f64,
    /// 재시도 시 지터(무작위 지연) 추가 여부.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// 재시도 없음 (단일 시도).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// 대기 시간 계산 (지수 백오프, ±25% 지터).
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay = Duration::from_secs_f64(self.base_delay.as_secs_f64() * multiplier).min(self.max_delay);

        if self.add_jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            let jitter = rand::thread_rng().gen_range(-1.0..=1.0) * jitter_range;
            Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
        } else {
            delay
        }
    }
}

/// 재시도가 포함된 비동기 작업 실행.
///
/// 일시적 에러(`BrokerError::is_transient`)만 재시도하며,
/// 그 외 에러는 즉시 반환합니다.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, BrokerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut attempt = 0;
    let mut total_delay = Duration::ZERO;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempts = attempt + 1,
                        total_delay_ms = total_delay.as_millis(),
                        "재시도 후 성공"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_transient() {
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    warn!(
                        error = %e,
                        attempts = attempt + 1,
                        max_retries = config.max_retries,
                        "최대 재시도 횟수 초과"
                    );
                    return Err(e);
                }

                let delay = config.calculate_delay(attempt);
                total_delay += delay;

                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis(),
                    "재시도 대기 중"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// =============================================================================
// RetryingBroker
// =============================================================================

/// 조회/취소 호출에 재시도를 적용하는 브로커 래퍼.
///
/// 시장가/지정가 주문은 중복 체결을 막기 위해 한 번만 호출합니다.
pub struct RetryingBroker {
    inner: Arc<dyn Broker>,
    config: RetryConfig,
}

impl RetryingBroker {
    pub fn new(inner: Arc<dyn Broker>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Broker for RetryingBroker {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn now_price(&self, product_id: &str) -> Result<Decimal, BrokerError> {
        with_retry(&self.config, || self.inner.now_price(product_id)).await
    }

    async fn recent_candles(
        &self,
        product_id: &str,
        granularity: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        with_retry(&self.config, || {
            self.inner.recent_candles(product_id, granularity, limit)
        })
        .await
    }

    async fn place_market_quote(
        &self,
        product_id: &str,
        side: Side,
        quote: Decimal,
    ) -> Result<FilledOrder, BrokerError> {
        self.inner.place_market_quote(product_id, side, quote).await
    }

    async fn place_limit_post_only(
        &self,
        product_id: &str,
        side: Side,
        limit_price: Decimal,
        base_size: Decimal,
    ) -> Result<String, BrokerError> {
        self.inner
            .place_limit_post_only(product_id, side, limit_price, base_size)
            .await
    }

    async fn get_order(&self, product_id: &str, order_id: &str) -> Result<FilledOrder, BrokerError> {
        with_retry(&self.config, || self.inner.get_order(product_id, order_id)).await
    }

    async fn cancel_order(&self, product_id: &str, order_id: &str) -> Result<(), BrokerError> {
        with_retry(&self.config, || self.inner.cancel_order(product_id, order_id)).await
    }

    async fn available_base(&self, product_id: &str) -> Result<AssetBalance, BrokerError> {
        with_retry(&self.config, || self.inner.available_base(product_id)).await
    }

    async fn available_quote(&self, product_id: &str) -> Result<AssetBalance, BrokerError> {
        with_retry(&self.config, || self.inner.available_quote(product_id)).await
    }

    async fn best_bid_ask(&self, product_id: &str) -> Result<BestBidAsk, BrokerError> {
        with_retry(&self.config, || self.inner.best_bid_ask(product_id)).await
    }
}
