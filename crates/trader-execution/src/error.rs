//! 실행 계층 에러 타입.

use rust_decimal::Decimal;
use thiserror::Error;
use trader_core::BrokerError;

/// 상태 저장/복원 에러.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("상태 파일 I/O 실패: {0}")]
    Io(#[from] std::io::Error),

    #[error("상태 직렬화 실패: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 트레이더 실행 에러.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("브로커 에러: {0}")]
    Broker(#[from] BrokerError),

    #[error("유효하지 않은 수량 단위: {asset} step={step}")]
    InvalidStep { asset: String, step: Decimal },

    #[error("주문 거부: {0}")]
    OrderRejected(String),

    #[error("설정 오류: {0}")]
    Config(String),

    #[error("상태 저장 오류: {0}")]
    Persistence(#[from] PersistenceError),
}

impl ExecutionError {
    /// 루프를 중단해야 하는 에러인지 여부.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::InvalidStep { .. } | ExecutionError::Config(_))
    }
}

/// 실행 결과 타입.
pub type ExecutionResult<T> = Result<T, ExecutionError>;
