//! 매매 방향과 방향별 쌍(pair) 컨테이너.
//!
//! 모든 상태(북, 대기 주문, 피라미딩 타이머 등)는 Buy/Sell 두 방향에 대해
//! 항상 존재하므로, 일반 맵 대신 고정 2원소 구조체로 표현합니다.

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// 주문/로트 방향.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// 매수 (롱 로트)
    #[default]
    Buy,
    /// 매도 (숏 로트)
    Sell,
}

impl Side {
    /// 스캔 순서 (Buy 먼저, 그 다음 Sell).
    pub const ALL: [Side; 2] = [Side::Buy, Side::Sell];

    /// 반대 방향. 로트 청산 주문의 방향으로 사용됩니다.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// 소문자 라벨 (로그 필드용).
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Buy/Sell 각각에 하나씩 값을 보관하는 컨테이너.
///
/// `pair[Side::Buy]` 형태로 인덱싱하며, 방향 누락이 컴파일 타임에 드러납니다.
/// 직렬화된 값에서 한쪽이 빠져 있으면 기본값으로 채웁니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidePair<T> {
    /// 매수 측 값
    #[serde(default)]
    pub buy: T,
    /// 매도 측 값
    #[serde(default)]
    pub sell: T,
}

impl<T> SidePair<T> {
    /// 두 값으로 생성.
    pub fn new(buy: T, sell: T) -> Self {
        Self { buy, sell }
    }

    /// 방향별로 클로저를 호출하여 생성.
    pub fn from_fn(mut f: impl FnMut(Side) -> T) -> Self {
        Self {
            buy: f(Side::Buy),
            sell: f(Side::Sell),
        }
    }

    /// 방향별 값을 변환.
    pub fn map<U>(self, mut f: impl FnMut(Side, T) -> U) -> SidePair<U> {
        SidePair {
            buy: f(Side::Buy, self.buy),
            sell: f(Side::Sell, self.sell),
        }
    }

    /// (방향, 참조) 순회.
    pub fn iter(&self) -> impl Iterator<Item = (Side, &T)> {
        [(Side::Buy, &self.buy), (Side::Sell, &self.sell)].into_iter()
    }
}

impl<T> Index<Side> for SidePair<T> {
    type Output = T;

    fn index(&self, side: Side) -> &T {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }
}

impl<T> IndexMut<Side> for SidePair<T> {
    fn index_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_serde_uses_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        let side: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(side, Side::Sell);
    }

    #[test]
    fn test_side_pair_indexing() {
        let mut pair = SidePair::new(1, 2);
        pair[Side::Sell] += 10;
        assert_eq!(pair[Side::Buy], 1);
        assert_eq!(pair[Side::Sell], 12);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }
}
