//! Broker 구현체.
//!
//! - [`PaperBroker`]: 인메모리 페이퍼 브로커 (드라이런/테스트용)

mod paper;

pub use paper::{PaperBroker, PaperConfig, PaperOp, PaperStats};
