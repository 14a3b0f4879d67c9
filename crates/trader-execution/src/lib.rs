//! 로트 기반 포지션/주문 생명주기.
//!
//! 이 crate는 다음을 제공합니다:
//! - 수수료를 반영한 프로핏 게이트 청산 분류기 (러너/스캘프 트레일링/고정 익절)
//! - 역행 피라미딩 게이트와 자산 변동 트리거, 여유 재고 기반 크기 산정
//! - 메이커 우선 비동기 진입 (재호가, 마감, 시장가 대체)
//! - 원자적 상태 저장과 재시작 후 대기 주문 복구
//!
//! # 예제
//!
//! ```rust,ignore
//! use trader_execution::{Trader, TraderConfig};
//!
//! let trader = Trader::new(TraderConfig::load(None)?, broker, signal)?;
//! trader.rehydrate_pending().await;
//! let outcome = trader.tick().await?;
//! ```

pub mod add_gate;
pub mod close;
pub mod config;
pub mod error;
pub mod exit_policy;
pub mod maker;
pub mod persistence;
pub mod recovery;
pub mod sizing;
pub mod trader;

// 주요 타입 재내보내기
pub use config::{
    DecayMode, EquityTriggerConfig, ExitConfig, MakerConfig, OrderType, PyramidConfig, RampConfig, RampMode,
    RepriceConfig, ScalpTpConfig, TraderConfig,
};
pub use error::{ExecutionError, ExecutionResult, PersistenceError};
pub use exit_policy::{ExitCandidate, ExitParams, ExitReason};
pub use maker::{evaluate_reprice, CompletionSlot, RepriceDecision, RepriceInput, RepriceSkip};
pub use persistence::{BotState, StateStore};
pub use recovery::Rehydration;
pub use trader::{HoldReason, OpenPlan, OpenRequest, TickOutcome, Trader, TraderState};
