//! 시그널 소스가 만들어내는 매매 판단.
//!
//! - `SignalDirection` - 이산 방향 (매수/매도/관망)
//! - `Decision` - 방향과 근거가 된 확률

use serde::{Deserialize, Serialize};

use super::Side;

/// 시그널 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalDirection {
    /// 매수
    Buy,
    /// 매도
    Sell,
    /// 관망
    Flat,
}

impl SignalDirection {
    /// 주문 방향으로 변환. 관망이면 None.
    pub fn side(self) -> Option<Side> {
        match self {
            SignalDirection::Buy => Some(Side::Buy),
            SignalDirection::Sell => Some(Side::Sell),
            SignalDirection::Flat => None,
        }
    }
}

impl std::fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalDirection::Buy => write!(f, "BUY"),
            SignalDirection::Sell => write!(f, "SELL"),
            SignalDirection::Flat => write!(f, "FLAT"),
        }
    }
}

/// 한 틱의 매매 판단.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// 방향
    pub signal: SignalDirection,
    /// 상승 확률 (0.0 ~ 1.0)
    pub p_up: f64,
}

impl Decision {
    /// 관망 판단.
    pub fn flat(p_up: f64) -> Self {
        Self {
            signal: SignalDirection::Flat,
            p_up,
        }
    }
}
