//! 트레이더 설정.
//!
//! 기본값 → 선택적 설정 파일 → `TRADER__` 접두사 환경 변수 순서로 덮어씁니다.
//!
//! ```text
//! TRADER__DRY_RUN=false
//! TRADER__EXIT__PROFIT_GATE_USD=0.5
//! TRADER__MAKER__ORDER_TYPE=limit
//! ```

use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExecutionError;

/// 환경 변수 접두사.
pub const ENV_PREFIX: &str = "TRADER";

// =============================================================================
// 섹션별 설정
// =============================================================================

/// 청산 정책 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// 어떤 청산 방식이든 활성화되기 위한 최소 순손익 (USD)
    pub profit_gate_usd: Decimal,
    /// 트레일링으로 관리되는 비러너 로트 수. 그 이후 순위는 고정 익절.
    pub scalp_trailing_slots: usize,
    /// 러너 트레일링 활성화 USD (0 이하면 profit_gate_usd 사용)
    pub trail_activate_usd_runner: Decimal,
    /// 러너 트레일링 거리 (%)
    pub trail_distance_pct_runner: Decimal,
    /// 스캘프 트레일링 활성화 USD (0 이하면 profit_gate_usd 사용)
    pub trail_activate_usd_scalp: Decimal,
    /// 스캘프 트레일링 거리 (%)
    pub trail_distance_pct_scalp: Decimal,
    /// 고정 익절 목표가의 메이커 오프셋 (bps)
    pub tp_maker_offset_bps: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            profit_gate_usd: dec!(0.50),
            scalp_trailing_slots: 4,
            trail_activate_usd_runner: dec!(1.00),
            trail_distance_pct_runner: dec!(0.40),
            trail_activate_usd_scalp: dec!(0.50),
            trail_distance_pct_scalp: dec!(0.20),
            tp_maker_offset_bps: dec!(5),
        }
    }
}

/// 역행 피라미딩 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    /// 같은 방향 추가 진입 허용 여부
    pub allow_pyramiding: bool,
    /// 마지막 추가 이후 최소 대기 시간 (초)
    pub min_seconds_between: i64,
    /// 최소 역행 폭 (%)
    pub min_adverse_pct: f64,
    /// 역행 폭 지수 감쇠 계수 (분당)
    pub decay_lambda: f64,
    /// 감쇠 하한 (%)
    pub decay_min_pct: f64,
    /// 양방향 합산 최대 로트 수
    pub max_concurrent_lots: usize,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            allow_pyramiding: true,
            min_seconds_between: 60,
            min_adverse_pct: 0.5,
            decay_lambda: 0.02,
            decay_min_pct: 0.2,
            max_concurrent_lots: 1_000_000,
        }
    }
}

/// 리스크 램프 방식.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampMode {
    #[default]
    Linear,
    Exp,
}

/// 로트 수에 따른 리스크 비율 램프.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    pub enable: bool,
    pub mode: RampMode,
    /// 첫 로트 리스크 (%)
    pub start_pct: f64,
    /// 선형 모드 증분 (%)
    pub step_pct: f64,
    /// 지수 모드 배수
    pub growth: f64,
    /// 상한 (%). 0이면 제한 없음.
    pub max_pct: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            enable: false,
            mode: RampMode::Linear,
            start_pct: 0.25,
            step_pct: 0.05,
            growth: 1.25,
            max_pct: 1.0,
        }
    }
}

/// 자산 변동 트리거 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquityTriggerConfig {
    pub enable: bool,
    /// 매도 트리거: 기준 대비 자산 증가율 (%)
    pub up_pct: Decimal,
    /// 매수 트리거: 기준 대비 자산 감소율 (%)
    pub down_pct: Decimal,
    /// 여유 재고 대비 단계별 사용 비율
    pub stages: Vec<Decimal>,
}

impl Default for EquityTriggerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            up_pct: dec!(1),
            down_pct: dec!(1),
            stages: vec![dec!(0.25), dec!(0.50), dec!(0.75), dec!(1.00)],
        }
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

/// 재호가 가드레일.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepriceConfig {
    pub enable: bool,
    /// 재호가 시도 간격 (ms)
    pub interval_ms: u64,
    /// 최대 재호가 횟수 (0이면 무제한)
    pub max_count: u32,
    /// 최초 지정가 대비 최대 드리프트 (bps, 0이면 비활성)
    pub max_drift_bps: Decimal,
    /// 최소 개선 틱 수 (1 이하이면 방향 무관)
    pub min_improv_ticks: u32,
    /// 최소 개선 금액 (USD)
    pub min_edge_usd: Decimal,
    /// 최우선 호가 기준 재호가
    pub use_bbo: bool,
}

impl Default for RepriceConfig {
    fn default() -> Self {
        Self {
            enable: false,
            interval_ms: 1_000,
            max_count: 10,
            max_drift_bps: dec!(20),
            min_improv_ticks: 1,
            min_edge_usd: Decimal::ZERO,
            use_bbo: false,
        }
    }
}

/// 메이커 우선 주문 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MakerConfig {
    pub order_type: OrderType,
    /// 현재가 대비 지정가 오프셋 (bps)
    pub limit_price_offset_bps: Decimal,
    /// 지정가 대기 시간 (초)
    pub limit_timeout_sec: i64,
    /// 주문 상태 조회 간격 (ms)
    pub poll_interval_ms: u64,
    pub reprice: RepriceConfig,
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            order_type: OrderType::Market,
            limit_price_offset_bps: dec!(5),
            limit_timeout_sec: 0,
            poll_interval_ms: 200,
            reprice: RepriceConfig::default(),
        }
    }
}

impl MakerConfig {
    /// 메이커 우선 진입을 시도할지 여부.
    pub fn wants_limit(&self) -> bool {
        self.order_type == OrderType::Limit
            && self.limit_price_offset_bps > Decimal::ZERO
            && self.limit_timeout_sec > 0
    }
}

/// 스캘프 익절 미리보기 감쇠 방식.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayMode {
    #[default]
    Linear,
    Exp,
}

/// 스캘프 익절 미리보기 감쇠.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalpTpConfig {
    pub enable: bool,
    pub mode: DecayMode,
    /// 첫 스캘프의 익절 폭 (%)
    pub take_profit_pct: f64,
    /// 선형 모드 로트당 감소 (%)
    pub dec_pct: f64,
    /// 지수 모드 배수
    pub factor: f64,
    /// 하한 (%)
    pub min_pct: f64,
}

impl Default for ScalpTpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            mode: DecayMode::Linear,
            take_profit_pct: 0.8,
            dec_pct: 0.1,
            factor: 0.8,
            min_pct: 0.2,
        }
    }
}

// =============================================================================
// TraderConfig
// =============================================================================

/// 트레이더 전체 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderConfig {
    /// 거래 상품 (예: BTC-USD)
    pub product_id: String,
    /// 캔들 주기
    pub granularity: String,
    /// 시그널에 넘길 캔들 수
    pub candle_limit: usize,
    /// 브로커 주문 없이 로컬 시뮬레이션
    pub dry_run: bool,
    /// 매도 진입 금지
    pub long_only: bool,
    /// 숏 진입 시 보유 기준 자산 필요
    pub require_base_for_short: bool,
    /// 수수료율 (%)
    pub fee_rate_pct: Decimal,
    /// 최소 주문 금액 (USD)
    pub order_min_usd: Decimal,
    /// 거래당 리스크 (% of equity)
    pub risk_per_trade_pct: Decimal,
    /// 시작 자산 (USD)
    pub usd_equity: Decimal,
    /// 잔고 기반 자산 재평가 사용
    pub use_live_equity: bool,
    /// 일일 손실 한도 (%). 0이면 비활성.
    pub max_daily_loss_pct: Decimal,
    /// 호가 단위 (0이면 스냅 안 함)
    pub price_tick: Decimal,
    /// 상태 저장 여부
    pub persist_state: bool,
    /// 상태 파일 경로
    pub state_file: PathBuf,
    /// 보관할 최근 청산 기록 수
    pub exit_history_size: usize,
    pub exit: ExitConfig,
    pub pyramid: PyramidConfig,
    pub ramp: RampConfig,
    pub equity_trigger: EquityTriggerConfig,
    pub maker: MakerConfig,
    pub scalp_tp: ScalpTpConfig,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            product_id: "BTC-USD".to_string(),
            granularity: "ONE_MINUTE".to_string(),
            candle_limit: 300,
            dry_run: true,
            long_only: true,
            require_base_for_short: true,
            fee_rate_pct: dec!(0.3),
            order_min_usd: dec!(5),
            risk_per_trade_pct: dec!(0.25),
            usd_equity: dec!(1000),
            use_live_equity: false,
            max_daily_loss_pct: Decimal::ZERO,
            price_tick: dec!(0.01),
            persist_state: true,
            state_file: PathBuf::from("state/bot_state.json"),
            exit_history_size: 8,
            exit: ExitConfig::default(),
            pyramid: PyramidConfig::default(),
            ramp: RampConfig::default(),
            equity_trigger: EquityTriggerConfig::default(),
            maker: MakerConfig::default(),
            scalp_tp: ScalpTpConfig::default(),
        }
    }
}

impl TraderConfig {
    /// `.env` → 설정 파일(선택) → 환경 변수 순서로 로드 후 검증.
    pub fn load(path: Option<&Path>) -> Result<Self, ExecutionError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "설정 파일 로드");
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let loaded: TraderConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ExecutionError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// 수수료율 (비율).
    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate_pct / dec!(100)
    }

    /// 보관할 청산 기록 수 (0이면 8).
    pub fn exit_history_cap(&self) -> usize {
        if self.exit_history_size > 0 {
            self.exit_history_size
        } else {
            8
        }
    }

    /// 설정 값 검증.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        let fail = |msg: String| Err(ExecutionError::Config(msg));

        if self.product_id.trim().is_empty() {
            return fail("product_id가 비어 있습니다".into());
        }
        for (name, value) in [
            ("fee_rate_pct", self.fee_rate_pct),
            ("order_min_usd", self.order_min_usd),
            ("risk_per_trade_pct", self.risk_per_trade_pct),
            ("max_daily_loss_pct", self.max_daily_loss_pct),
            ("price_tick", self.price_tick),
            ("exit.profit_gate_usd", self.exit.profit_gate_usd),
            ("exit.trail_distance_pct_runner", self.exit.trail_distance_pct_runner),
            ("exit.trail_distance_pct_scalp", self.exit.trail_distance_pct_scalp),
            ("exit.tp_maker_offset_bps", self.exit.tp_maker_offset_bps),
            ("maker.limit_price_offset_bps", self.maker.limit_price_offset_bps),
        ] {
            if value < Decimal::ZERO {
                return fail(format!("{name}은(는) 음수일 수 없습니다: {value}"));
            }
        }
        if self.fee_rate_pct >= dec!(100) {
            return fail(format!("fee_rate_pct가 너무 큽니다: {}", self.fee_rate_pct));
        }

        let p = &self.pyramid;
        if p.decay_lambda < 0.0 || p.min_adverse_pct < 0.0 || p.decay_min_pct < 0.0 {
            return fail("pyramid 감쇠 파라미터는 음수일 수 없습니다".into());
        }
        if p.decay_lambda > 0.0 && p.decay_min_pct > p.min_adverse_pct {
            return fail(format!(
                "pyramid.decay_min_pct({})가 min_adverse_pct({})보다 큽니다",
                p.decay_min_pct, p.min_adverse_pct
            ));
        }

        if self.ramp.enable && (self.ramp.start_pct < 0.0 || self.ramp.max_pct < 0.0) {
            return fail("ramp 비율은 음수일 수 없습니다".into());
        }

        let eq = &self.equity_trigger;
        if eq.enable {
            if eq.stages.is_empty() {
                return fail("equity_trigger.stages가 비어 있습니다".into());
            }
            if eq.stages.iter().any(|s| *s <= Decimal::ZERO || *s > Decimal::ONE) {
                return fail("equity_trigger.stages는 (0, 1] 범위여야 합니다".into());
            }
        }

        if self.maker.poll_interval_ms == 0 {
            return fail("maker.poll_interval_ms는 0보다 커야 합니다".into());
        }
        if self.scalp_tp.enable && self.scalp_tp.min_pct > self.scalp_tp.take_profit_pct {
            return fail("scalp_tp.min_pct가 take_profit_pct보다 큽니다".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TraderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fee_rate(), dec!(0.003));
        assert_eq!(config.exit.scalp_trailing_slots, 4);
        assert!(!config.maker.wants_limit());
    }

    #[test]
    fn test_wants_limit_requires_offset_and_timeout() {
        let mut maker = MakerConfig {
            order_type: OrderType::Limit,
            limit_timeout_sec: 30,
            ..Default::default()
        };
        assert!(maker.wants_limit());
        maker.limit_price_offset_bps = Decimal::ZERO;
        assert!(!maker.wants_limit());
    }

    #[test]
    fn test_validate_rejects_inconsistent_decay() {
        let mut config = TraderConfig::default();
        config.pyramid.decay_min_pct = 1.0;
        config.pyramid.min_adverse_pct = 0.5;
        assert!(matches!(config.validate(), Err(ExecutionError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_negative_fee() {
        let config = TraderConfig {
            fee_rate_pct: dec!(-0.1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trader.toml");
        std::fs::write(
            &path,
            r#"
product_id = "ETH-USD"
dry_run = false

[exit]
profit_gate_usd = "0.75"

[maker]
order_type = "limit"
limit_timeout_sec = 20
"#,
        )
        .unwrap();

        let config = TraderConfig::load(Some(&path)).unwrap();
        assert_eq!(config.product_id, "ETH-USD");
        assert!(!config.dry_run);
        assert_eq!(config.exit.profit_gate_usd, dec!(0.75));
        assert_eq!(config.exit.scalp_trailing_slots, 4);
        assert!(config.maker.wants_limit());
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let config: TraderConfig =
            serde_json::from_str(r#"{"exit":{"scalp_trailing_slots":2}}"#).unwrap();
        assert_eq!(config.exit.scalp_trailing_slots, 2);
        assert_eq!(config.exit.profit_gate_usd, dec!(0.50));
        assert_eq!(config.order_min_usd, dec!(5));
    }
}
