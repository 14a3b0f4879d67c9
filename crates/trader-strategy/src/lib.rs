//! 매매 시그널 소스.
//!
//! 이 crate는 다음을 제공합니다:
//! - [`SignalSource`] trait
//! - 로지스틱 [`MicroModel`]과 [`ThresholdSignal`]
//! - 피처 계산용 지표 함수

pub mod indicators;
pub mod micro_model;
pub mod threshold;
pub mod traits;

pub use micro_model::MicroModel;
pub use threshold::{ThresholdConfig, ThresholdSignal};
pub use traits::SignalSource;
