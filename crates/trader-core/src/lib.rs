//! 트레이더 코어 도메인 타입.
//!
//! 이 crate는 다음을 제공합니다:
//! - 로트/북/청산 기록 데이터 모델
//! - 대기 중인 메이커 주문과 완료 결과
//! - 거래소 중립 타입과 `Broker` 기능 trait

pub mod domain;

pub use domain::*;
