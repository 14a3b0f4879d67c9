//! 봇 상태 스냅샷 저장/복원.
//!
//! 모든 상태 변경 뒤 전체 스냅샷을 임시 파일에 쓰고 원자적으로 이름을 바꿉니다.
//! 이전 스키마에서 누락된 필드는 기본값으로 채워지며, 로드 후 정합성 보정과
//! 트레일링 파라미터 보충을 수행합니다.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use trader_core::{ExitRecord, PendingOpen, SideBook, SidePair};
use trader_strategy::MicroModel;

use crate::add_gate::PyramidTimers;
use crate::error::PersistenceError;
use crate::exit_policy::{classify, ExitParams};

// =============================================================================
// BotState
// =============================================================================

/// 저장되는 전체 봇 상태.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotState {
    /// 자산 (USD)
    pub equity_usd: Decimal,
    /// 일일 손익 집계 기준일 (UTC)
    pub daily_start: Option<NaiveDate>,
    /// 당일 실현 손익
    pub daily_pnl: Decimal,
    /// 방향별 로트 북
    pub books: SidePair<SideBook>,
    /// 방향별 피라미딩 타이머
    pub timers: SidePair<PyramidTimers>,
    /// 방향별 자산 변동 트리거 기준 자산
    pub equity_baseline: SidePair<Decimal>,
    /// 방향별 자산 변동 트리거 단계
    pub equity_stage: SidePair<usize>,
    /// 최근 청산 기록 (오래된 순)
    pub exit_history: Vec<ExitRecord>,
    /// 방향별 대기 메이커 주문
    pub pending: SidePair<Option<PendingOpen>>,
    /// 방향별 시장가 재확인 플래그
    pub recheck: SidePair<bool>,
    /// 다음 로트 ID
    pub next_lot_seq: u64,
    /// 누적 이익/손실 청산 수
    pub wins: u64,
    pub losses: u64,
    /// 시그널 모델 가중치
    pub model: Option<MicroModel>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl BotState {
    /// 로드 후 정합성 보정.
    ///
    /// - 범위를 벗어난 러너 인덱스 제거
    /// - 누락된 `next_lot_seq`를 `max(lot_id) + 1`로 재계산
    pub fn normalize(&mut self) {
        for book in [&mut self.books.buy, &mut self.books.sell] {
            book.normalize_runner();
        }
        let max_id = self
            .books
            .iter()
            .flat_map(|(_, book)| book.lots.iter().map(|lot| lot.lot_id))
            .max()
            .unwrap_or(0);
        if self.next_lot_seq <= max_id {
            self.next_lot_seq = max_id + 1;
        }
    }

    /// 재시작 직후 보정.
    ///
    /// 로트가 있는데 마지막 추가 시각이 없는 방향은 지금으로 설정하고,
    /// 고점이 비어 있는 러너는 진입가로 시드합니다.
    pub fn warm_up(&mut self, now: DateTime<Utc>) {
        for side in trader_core::Side::ALL {
            let book = &mut self.books[side];
            if !book.is_empty() && self.timers[side].last_add.is_none() {
                self.timers[side].reanchor(now);
                debug!(side = %side, "마지막 추가 시각 초기화");
            }
            if let Some(r) = book.runner {
                if let Some(lot) = book.lots.get_mut(r) {
                    if lot.trail_peak <= Decimal::ZERO {
                        lot.trail_peak = lot.open_price;
                    }
                }
            }
        }
    }

    /// 총 로트 수.
    pub fn lot_count(&self) -> usize {
        self.books.buy.len() + self.books.sell.len()
    }
}

/// 트레일링 파라미터가 비어 있는 로트를 순위별 기본값으로 보충.
///
/// 보충한 로트 수를 반환합니다.
pub fn backfill_trailing_params(books: &mut SidePair<SideBook>, params: &ExitParams) -> usize {
    let mut filled = 0;
    for book in [&mut books.buy, &mut books.sell] {
        for idx in 0..book.len() {
            let mode = classify(book, idx, params.scalp_trailing_slots);
            let lot = &mut book.lots[idx];
            let Some((activate, distance)) = params.trail_params(mode) else {
                continue;
            };
            let mut touched = false;
            if lot.trail_activate_gate_usd <= Decimal::ZERO {
                lot.trail_activate_gate_usd = activate;
                touched = true;
            }
            if lot.trail_distance_pct <= Decimal::ZERO {
                lot.trail_distance_pct = distance;
                touched = true;
            }
            if touched {
                lot.exit_mode = mode;
                filled += 1;
            }
        }
    }
    filled
}

// =============================================================================
// StateStore
// =============================================================================

/// JSON 파일 기반 상태 저장소.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// 임시 파일에 쓴 뒤 원자적으로 교체.
    pub fn save(&self, state: &BotState) -> Result<(), PersistenceError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "상태 저장");
        Ok(())
    }

    /// 저장된 상태 로드. 파일이 없으면 None.
    pub fn load(&self) -> Result<Option<BotState>, PersistenceError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut state: BotState = serde_json::from_slice(&bytes)?;
        state.normalize();
        info!(
            path = %self.path.display(),
            buy_lots = state.books.buy.len(),
            sell_lots = state.books.sell.len(),
            next_lot_seq = state.next_lot_seq,
            "상태 로드"
        );
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use trader_core::{ExitMode, Lot, PendingOpen, Side};

    use super::*;
    use crate::config::TraderConfig;

    fn lot(id: u64, side: Side) -> Lot {
        Lot {
            lot_id: id,
            side,
            open_price: dec!(100),
            size_base: dec!(0.1),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/bot_state.json"));

        let mut state = BotState {
            equity_usd: dec!(1234.5),
            next_lot_seq: 3,
            ..Default::default()
        };
        state.books.buy.push(lot(1, Side::Buy));
        state.books.buy.push(lot(2, Side::Buy));
        state.books.buy.set_runner(1);
        state.books.sell.push(lot(3, Side::Sell));
        state.recheck.sell = true;
        state.equity_stage.buy = 2;
        state.equity_baseline.buy = dec!(1100);
        state.timers.buy = PyramidTimers {
            last_add: Some(Utc::now()),
            watermark: dec!(98.5),
            latched_gate: dec!(99.2),
        };
        for side in Side::ALL {
            let now = Utc::now();
            state.pending[side] = Some(PendingOpen {
                side,
                product_id: "BTC-USD".into(),
                order_id: format!("{side}-2"),
                history: vec![format!("{side}-1")],
                limit_price: dec!(99.5),
                initial_limit_price: dec!(99.9),
                base_at_limit: dec!(1),
                quote: dec!(100),
                take: dec!(101),
                reason: "restored".into(),
                created_at: now,
                deadline: now + Duration::seconds(30),
                equity_trigger: side == Side::Sell,
                reprice_count: 1,
                accum_base: dec!(0.2),
                accum_quote: dec!(19.9),
                accum_fee: dec!(0.06),
            });
        }
        store.save(&state).unwrap();

        assert!(!store.tmp_path().exists());
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_load_old_schema_recomputes_lot_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        std::fs::write(
            &path,
            r#"{"equity_usd":"900","books":{"buy":{"lots":[{"lot_id":7,"open_price":"100","side":"BUY","size_base":"0.1"}],"runner":4}}}"#,
        )
        .unwrap();

        let state = StateStore::new(&path).load().unwrap().unwrap();
        assert_eq!(state.equity_usd, dec!(900));
        assert_eq!(state.next_lot_seq, 8);
        assert_eq!(state.books.buy.runner, None);
        assert!(state.pending.buy.is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(StateStore::new(&path).load(), Err(PersistenceError::Serde(_))));
    }

    #[test]
    fn test_backfill_by_rank() {
        let params = ExitParams::from_config(&TraderConfig::default());
        let mut books: SidePair<SideBook> = SidePair::default();
        for id in 1..=6 {
            books.buy.push(lot(id, Side::Buy));
        }
        books.buy.set_runner(0);
        books.buy.lots[1].trail_distance_pct = dec!(9);
        books.buy.lots[1].trail_activate_gate_usd = dec!(9);

        let filled = backfill_trailing_params(&mut books, &params);
        assert_eq!(filled, 4);

        let lots = &books.buy.lots;
        assert_eq!(lots[0].exit_mode, ExitMode::RunnerTrailing);
        assert_eq!(lots[0].trail_distance_pct, params.runner_distance_pct);
        assert_eq!(lots[1].trail_distance_pct, dec!(9));
        assert_eq!(lots[2].exit_mode, ExitMode::ScalpTrailing);
        assert_eq!(lots[2].trail_activate_gate_usd, params.scalp_activate_usd);
        // 비러너 5번째는 고정 익절이라 보충 대상 아님
        assert_eq!(lots[5].trail_distance_pct, Decimal::ZERO);
    }

    #[test]
    fn test_warm_up_seeds_timers_and_runner_peak() {
        let now = Utc::now();
        let mut state = BotState::default();
        state.books.sell.push(lot(1, Side::Sell));
        state.books.sell.set_runner(0);
        state.timers.buy.last_add = Some(now - Duration::hours(1));

        state.warm_up(now);
        assert_eq!(state.timers.sell.last_add, Some(now));
        assert_eq!(state.books.sell.lots[0].trail_peak, dec!(100));
        // 로트가 없는 방향은 그대로
        assert_eq!(state.timers.buy.last_add, Some(now - Duration::hours(1)));
    }
}
