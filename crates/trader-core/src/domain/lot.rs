//! 로트와 방향별 북(book).
//!
//! 로트는 한 방향의 독립적으로 청산 가능한 포지션 단위입니다.
//! `SideBook`은 삽입 순서대로 로트를 보관하고, 그중 하나를 러너로 지정합니다.
//! 러너는 북의 0번 인덱스와 무관하며 명시적으로 지정/승계됩니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

// =============================================================================
// ExitMode
// =============================================================================

/// 로트의 청산 방식. 매 틱 (러너 여부, 비러너 순위)로부터 다시 계산됩니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitMode {
    /// 러너 트레일링
    RunnerTrailing,
    /// 스캘프 트레일링 (비러너 상위 N개)
    #[default]
    ScalpTrailing,
    /// 스캘프 고정 익절
    ScalpFixedTp,
}

impl ExitMode {
    /// 트레일링 계열 여부.
    pub fn is_trailing(self) -> bool {
        matches!(self, ExitMode::RunnerTrailing | ExitMode::ScalpTrailing)
    }
}

impl std::fmt::Display for ExitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitMode::RunnerTrailing => write!(f, "RunnerTrailing"),
            ExitMode::ScalpTrailing => write!(f, "ScalpTrailing"),
            ExitMode::ScalpFixedTp => write!(f, "ScalpFixedTP"),
        }
    }
}

// =============================================================================
// Lot
// =============================================================================

/// 하나의 오픈 로트.
///
/// `size_base`는 북에 존재하는 동안 항상 0보다 큽니다.
/// 누락 필드는 0으로 채워지며, 로드 시 트레일링 파라미터는 순위별로 보충됩니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lot {
    /// 영속 로트 ID
    pub lot_id: u64,
    /// 진입 주문 ID
    pub entry_order_id: String,
    /// 진입가
    pub open_price: Decimal,
    /// 방향
    pub side: Side,
    /// 남은 수량
    pub size_base: Decimal,
    /// 진입 시각
    pub open_time: DateTime<Utc>,
    /// 진입 수수료 (부분 청산 시 비례 차감)
    pub entry_fee: Decimal,
    /// 진입 명목 금액
    pub open_notional_usd: Decimal,
    /// 미리보기 청산가 (의미는 ExitMode에 따라 다름)
    pub take: Decimal,
    /// 현재 청산 방식
    pub exit_mode: ExitMode,
    /// 트레일링 활성 여부
    pub trail_active: bool,
    /// 활성 이후 최고 유리가 (롱은 고점, 숏은 저점)
    pub trail_peak: Decimal,
    /// 트레일링 스톱 가격
    pub trail_stop: Decimal,
    /// 트레일링 활성화 USD 게이트
    pub trail_activate_gate_usd: Decimal,
    /// 트레일링 거리 (%)
    pub trail_distance_pct: Decimal,
    /// 추정 청산 수수료
    pub est_exit_fee_usd: Decimal,
    /// 순 미실현 손익 (gross - 진입 수수료 - 추정 청산 수수료)
    pub unrealized_pnl_usd: Decimal,
    /// 진입 근거
    pub reason: String,
    /// 고정 익절 주문이 게시된 것처럼 동작 중인지 여부 (저장하지 않음)
    #[serde(skip)]
    pub fixed_tp_working: bool,
}

impl Lot {
    /// 주어진 가격에서의 총 손익 (수수료 제외).
    pub fn gross_pnl(&self, mark: Decimal) -> Decimal {
        match self.side {
            Side::Buy => (mark - self.open_price) * self.size_base,
            Side::Sell => (self.open_price - mark) * self.size_base,
        }
    }

    /// 트레일링 상태 초기화 (러너 승계 시).
    pub fn reset_trailing(&mut self) {
        self.trail_active = false;
        self.trail_peak = self.open_price;
        self.trail_stop = Decimal::ZERO;
    }

    /// 프로핏 게이트 미달 시 해제.
    pub fn disarm(&mut self) {
        self.trail_active = false;
        self.trail_peak = Decimal::ZERO;
        self.trail_stop = Decimal::ZERO;
        self.fixed_tp_working = false;
    }
}

// =============================================================================
// SideBook
// =============================================================================

/// 로트 제거 결과.
#[derive(Debug, Clone)]
pub struct RemovedLot {
    /// 제거된 로트
    pub lot: Lot,
    /// 러너였는지 여부
    pub was_runner: bool,
    /// 가장 최근에 추가된 로트였는지 여부
    pub was_newest: bool,
    /// 새로 러너로 승계된 로트의 인덱스
    pub promoted: Option<usize>,
}

/// 한 방향의 로트 목록과 러너.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideBook {
    /// 삽입 순서의 로트 목록
    pub lots: Vec<Lot>,
    /// 러너 로트 인덱스 (없으면 None)
    pub runner: Option<usize>,
}

impl SideBook {
    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lots.len()
    }

    /// 해당 인덱스가 러너인지 여부.
    pub fn is_runner(&self, idx: usize) -> bool {
        self.runner == Some(idx)
    }

    /// 러너 로트 참조.
    pub fn runner_lot(&self) -> Option<&Lot> {
        self.runner.and_then(|idx| self.lots.get(idx))
    }

    /// 로트 ID로 인덱스 조회.
    pub fn position_of(&self, lot_id: u64) -> Option<usize> {
        self.lots.iter().position(|lot| lot.lot_id == lot_id)
    }

    /// 총 보유 수량.
    pub fn total_size(&self) -> Decimal {
        self.lots.iter().map(|lot| lot.size_base).sum()
    }

    /// 로트 추가 후 인덱스 반환.
    pub fn push(&mut self, lot: Lot) -> usize {
        self.lots.push(lot);
        self.lots.len() - 1
    }

    /// 러너 지정.
    pub fn set_runner(&mut self, idx: usize) {
        if idx < self.lots.len() {
            self.runner = Some(idx);
        }
    }

    /// 로트 제거.
    ///
    /// 러너 인덱스를 보정하고, 러너가 제거되면 남은 로트 중 가장 최근 로트를
    /// 러너로 승계하며 그 트레일링 상태를 초기화합니다.
    pub fn remove(&mut self, idx: usize) -> Option<RemovedLot> {
        if idx >= self.lots.len() {
            return None;
        }
        let was_newest = idx + 1 == self.lots.len();
        let lot = self.lots.remove(idx);

        let was_runner = self.runner == Some(idx);
        let mut promoted = None;
        match self.runner {
            Some(r) if r == idx => {
                if self.lots.is_empty() {
                    self.runner = None;
                } else {
                    let newest = self.lots.len() - 1;
                    self.lots[newest].reset_trailing();
                    self.runner = Some(newest);
                    promoted = Some(newest);
                }
            }
            Some(r) if r > idx => self.runner = Some(r - 1),
            _ => {}
        }

        Some(RemovedLot {
            lot,
            was_runner,
            was_newest,
            promoted,
        })
    }

    /// 러너 인덱스가 범위를 벗어나면 제거 (로드 후 정합성 보정).
    pub fn normalize_runner(&mut self) {
        if let Some(r) = self.runner {
            if r >= self.lots.len() {
                self.runner = None;
            }
        }
    }
}

// =============================================================================
// ExitRecord
// =============================================================================

/// 전량/부분 청산 기록.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub time: DateTime<Utc>,
    pub side: Side,
    pub open_price: Decimal,
    pub close_price: Decimal,
    /// 청산된 수량
    pub size_base: Decimal,
    /// 비례 배분된 진입 수수료
    pub entry_fee_usd: Decimal,
    pub exit_fee_usd: Decimal,
    /// 순손익
    pub pnl_usd: Decimal,
    pub reason: String,
    pub exit_mode: ExitMode,
    pub was_runner: bool,
    #[serde(default)]
    pub lot_id: u64,
    #[serde(default)]
    pub entry_order_id: String,
    #[serde(default)]
    pub exit_order_id: String,
}
