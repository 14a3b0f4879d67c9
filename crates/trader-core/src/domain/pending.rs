//! 대기 중인 메이커 진입 주문과 그 완료 결과.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{FilledOrder, Side};

/// 보관하는 이전 주문 ID 개수.
pub const PENDING_HISTORY_CAP: usize = 5;

/// 진행 중인 메이커 우선 진입 요청 (방향당 최대 1개).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOpen {
    pub side: Side,
    pub product_id: String,
    /// 현재 거래소에 걸려 있는 주문 ID
    pub order_id: String,
    /// 재호가로 대체된 이전 주문 ID (최근 것이 뒤)
    #[serde(default)]
    pub history: Vec<String>,
    /// 현재 지정가
    pub limit_price: Decimal,
    /// 최초 지정가 (재호가 드리프트 기준)
    #[serde(default)]
    pub initial_limit_price: Decimal,
    /// 지정가 기준 수량
    pub base_at_limit: Decimal,
    /// 목표 명목 금액
    pub quote: Decimal,
    /// 미리보기 청산가
    pub take: Decimal,
    /// 진입 근거
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// 자산 변동 트리거로 생성되었는지 여부
    #[serde(default)]
    pub equity_trigger: bool,
    /// 재호가 횟수
    #[serde(default)]
    pub reprice_count: u32,
    /// 이전 주문들에서 누적된 체결 수량
    #[serde(default)]
    pub accum_base: Decimal,
    /// 이전 주문들에서 누적된 체결 금액
    #[serde(default)]
    pub accum_quote: Decimal,
    /// 이전 주문들에서 누적된 수수료
    #[serde(default)]
    pub accum_fee: Decimal,
}

impl PendingOpen {
    /// 주문 ID가 현재 주문이거나 이전 주문 중 하나인지 확인.
    pub fn owns_order(&self, order_id: &str) -> bool {
        self.order_id == order_id || self.history.iter().any(|id| id == order_id)
    }

    /// 재호가로 새 주문 ID 적용. 이전 ID는 이력에 보관됩니다.
    pub fn replace_order(&mut self, new_order_id: String, limit_price: Decimal, base_at_limit: Decimal) {
        let old = std::mem::replace(&mut self.order_id, new_order_id);
        if !old.is_empty() {
            self.history.push(old);
            if self.history.len() > PENDING_HISTORY_CAP {
                let overflow = self.history.len() - PENDING_HISTORY_CAP;
                self.history.drain(..overflow);
            }
        }
        self.limit_price = limit_price;
        self.base_at_limit = base_at_limit;
        self.reprice_count += 1;
    }

    /// 마감 시각이 지났는지 여부.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// 메이커 작업이 메인 틱으로 전달하는 완료 결과.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenResult {
    pub side: Side,
    /// 체결 여부
    pub filled: bool,
    /// 체결 정보 (세션 VWAP 기준)
    pub fill: Option<FilledOrder>,
    /// 관련 주문 ID
    pub order_id: String,
    /// 실패 사유
    pub error: Option<String>,
}

impl OpenResult {
    /// 체결 완료 결과.
    pub fn filled(side: Side, fill: FilledOrder) -> Self {
        Self {
            side,
            filled: true,
            order_id: fill.order_id.clone(),
            fill: Some(fill),
            error: None,
        }
    }

    /// 미체결 종료 결과.
    pub fn not_filled(side: Side, order_id: impl Into<String>, error: Option<String>) -> Self {
        Self {
            side,
            filled: false,
            fill: None,
            order_id: order_id.into(),
            error,
        }
    }
}
