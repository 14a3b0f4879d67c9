//! 브로커 구현체와 재시도 유틸리티.
//!
//! 이 crate는 다음을 제공합니다:
//! - `Broker` trait의 페이퍼 구현체
//! - 일시적 에러 재시도 래퍼

pub mod provider;
pub mod retry;

pub use provider::{PaperBroker, PaperConfig, PaperOp, PaperStats};
pub use retry::{with_retry, RetryConfig, RetryingBroker};
