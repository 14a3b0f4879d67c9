//! 재시작 후 대기 메이커 주문 복구.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use trader_core::{BrokerError, OpenResult, PendingOpen, Side};

use crate::maker::session_fill;
use crate::trader::Trader;

/// 대기 주문 하나의 복구 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rehydration {
    /// 마감이 지나 폐기
    Expired,
    /// 이미 체결되어 완료 결과 생성
    Filled,
    /// 아직 대기 중, 작업 재시작
    Resumed,
    /// 거래소에 주문이 없거나 체결 없이 종료되어 폐기
    Dropped,
}

impl Trader {
    /// 저장된 대기 주문을 다시 조회해 작업을 재개합니다.
    ///
    /// - 마감이 지났으면 취소를 시도하고, 그 사이 체결분이 있으면 체결로 처리합니다.
    ///   체결분이 없으면 폐기하고 재확인 플래그를 설정합니다.
    /// - 이미 체결되었으면 완료 결과를 바로 만들어 다음 틱에 로트로 반영됩니다.
    /// - 아직 열려 있거나 조회가 일시적으로 실패하면 새 작업을 띄웁니다.
    pub async fn rehydrate_pending(&self) -> Vec<(Side, Rehydration)> {
        let mut out = Vec::new();
        for side in Side::ALL {
            let pending = self.inner.state.lock().await.pending[side].clone();
            let Some(pending) = pending else {
                continue;
            };
            let outcome = self.rehydrate_side(side, pending).await;
            info!(side = %side, outcome = ?outcome, "대기 주문 복구");
            out.push((side, outcome));
        }
        out
    }

    async fn rehydrate_side(&self, side: Side, pending: PendingOpen) -> Rehydration {
        let inner = &self.inner;
        let product_id = pending.product_id.as_str();
        let order_id = pending.order_id.as_str();

        if pending.is_expired(Utc::now()) {
            if let Err(e) = inner.broker.cancel_order(product_id, order_id).await {
                warn!(side = %side, order_id, error = %e, "만료 주문 취소 실패");
            }
            let late = inner.broker.get_order(product_id, order_id).await.ok();
            if let Some(fill) = late.as_ref().and_then(|order| session_fill(&pending, order)) {
                inner.completions[side].post(OpenResult::filled(side, fill));
                return Rehydration::Filled;
            }
            self.discard_pending(side).await;
            return Rehydration::Expired;
        }

        match inner.broker.get_order(product_id, order_id).await {
            Ok(order) if order.is_filled() => {
                if let Some(fill) = session_fill(&pending, &order) {
                    inner.completions[side].post(OpenResult::filled(side, fill));
                    return Rehydration::Filled;
                }
                self.discard_pending(side).await;
                Rehydration::Dropped
            }
            Ok(order) if order.status.is_some_and(|s| s.is_terminal()) => match session_fill(&pending, &order) {
                Some(fill) => {
                    inner.completions[side].post(OpenResult::filled(side, fill));
                    Rehydration::Filled
                }
                None => {
                    self.discard_pending(side).await;
                    Rehydration::Dropped
                }
            },
            Err(BrokerError::OrderNotFound(_)) => {
                warn!(side = %side, order_id, "거래소에 대기 주문 없음");
                self.discard_pending(side).await;
                Rehydration::Dropped
            }
            Ok(_) | Err(_) => {
                let base_step = match inner.broker.available_base(product_id).await {
                    Ok(balance) => balance.step,
                    Err(e) => {
                        warn!(side = %side, error = %e, "수량 단위 조회 실패, 재호가 수량은 스냅하지 않음");
                        Decimal::ZERO
                    }
                };
                let mut state = inner.state.lock().await;
                if state.pending[side].as_ref().is_some_and(|p| p.order_id == pending.order_id) {
                    self.spawn_maker(&mut state, side, base_step);
                }
                Rehydration::Resumed
            }
        }
    }

    async fn discard_pending(&self, side: Side) {
        let mut state = self.inner.state.lock().await;
        state.pending[side] = None;
        state.recheck[side] = true;
        self.inner.persist(&state);
    }
}
