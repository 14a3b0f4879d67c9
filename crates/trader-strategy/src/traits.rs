//! SignalSource trait 정의.

use trader_core::{Candle, Decision};

use crate::MicroModel;

/// 캔들에서 매매 판단을 만들어내는 시그널 소스.
///
/// 트레이더 상태 잠금 안에서 동기적으로 호출되므로 I/O를 수행하면 안 됩니다.
pub trait SignalSource: Send + Sync {
    /// 시그널 소스 이름 반환.
    fn name(&self) -> &str;

    /// 최근 캔들(오래된 순)로부터 판단 생성.
    fn decide(&mut self, candles: &[Candle]) -> Decision;

    /// 저장할 모델 가중치. 학습 모델이 없으면 None.
    fn model(&self) -> Option<&MicroModel> {
        None
    }

    /// 저장된 모델 가중치 복원.
    fn restore_model(&mut self, _model: MicroModel) {}
}
