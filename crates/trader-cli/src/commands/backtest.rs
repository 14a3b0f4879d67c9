//! CSV 캔들 백테스트.
//!
//! 캔들의 앞 70%로 마이크로 모델을 학습한 뒤, 나머지 30%를 한 봉씩 페이퍼 브로커에
//! 재생하면서 드라이런 트레이더의 `tick`을 실행합니다.
//!
//! # CSV 형식
//!
//! 헤더는 대소문자를 구분하지 않으며 알 수 없는 열은 무시합니다.
//!
//! ```text
//! time,open,high,low,close,volume
//! 2024-01-02T00:00:00Z,42000.5,42100,41950,42080.2,12.5
//! 1704153660,42080.2,42120,42010,42050,8.1
//! ```
//!
//! 시각 열(`time` 또는 `timestamp`)은 RFC3339 또는 유닉스 초를 받습니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use trader_core::{Broker, Candle};
use trader_exchange::{PaperBroker, PaperConfig};
use trader_execution::{TickOutcome, Trader, TraderConfig};
use trader_strategy::indicators::closes;
use trader_strategy::{MicroModel, ThresholdConfig, ThresholdSignal};

/// 백테스트에 필요한 최소 캔들 수.
pub const MIN_ROWS: usize = 1_000;

/// 학습 구간 비율.
const TRAIN_RATIO: f64 = 0.7;

const FIT_LR: f64 = 0.05;
const FIT_EPOCHS: usize = 4;

/// `backtest` 서브커맨드 옵션.
#[derive(Debug, Clone)]
pub struct BacktestOptions {
    pub config: Option<PathBuf>,
    pub csv: PathBuf,
    /// 평가 전에 재생만 하는 테스트 구간 캔들 수
    pub warmup: usize,
}

/// 백테스트 결과 요약.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestReport {
    pub rows: usize,
    pub train: usize,
    pub test: usize,
    pub evaluated: usize,
    pub opens: usize,
    pub wins: usize,
    pub losses: usize,
    pub start_equity: Decimal,
    pub equity: Decimal,
}

impl BacktestReport {
    pub fn print(&self) {
        println!("=== Backtest ===");
        println!("rows      : {}", self.rows);
        println!("train     : {}", self.train);
        println!("test      : {}", self.test);
        println!("evaluated : {}", self.evaluated);
        println!("opens     : {}", self.opens);
        println!("wins      : {}", self.wins);
        println!("losses    : {}", self.losses);
        println!("equity    : {} -> {}", self.start_equity, self.equity.round_dp(2));
    }
}

// =============================================================================
// CSV 로드
// =============================================================================

/// 헤더 이름 후보 중 처음 존재하는 열의 위치.
fn column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name)))
}

/// RFC3339 또는 유닉스 초.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    raw.parse::<i64>().ok().and_then(|sec| DateTime::from_timestamp(sec, 0))
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    raw.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// 캔들 CSV 로드 (오래된 순 정렬).
///
/// 시각, 시가, 종가 중 하나라도 없거나 읽을 수 없는 행은 건너뜁니다.
/// 고가/저가가 비어 있으면 시가와 종가로, 거래량이 비어 있으면 0으로 채웁니다.
pub fn load_csv(path: &Path) -> anyhow::Result<Vec<Candle>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("CSV 열기 실패: {}", path.display()))?;
    let headers = reader.headers()?.clone();

    let Some(time_col) = column(&headers, &["time", "timestamp"]) else {
        bail!("시각 열(time/timestamp)이 없습니다: {}", path.display());
    };
    let open_col = column(&headers, &["open"]);
    let high_col = column(&headers, &["high"]);
    let low_col = column(&headers, &["low"]);
    let close_col = column(&headers, &["close"]);
    let volume_col = column(&headers, &["volume", "vol"]);

    let mut candles = Vec::new();
    let mut skipped = 0usize;
    for record in reader.records() {
        let record = record?;
        let field = |col: Option<usize>| col.and_then(|i| record.get(i)).filter(|v| !v.is_empty());

        let parsed = (|| {
            let time = parse_time(field(Some(time_col))?)?;
            let open = parse_decimal(field(open_col)?)?;
            let close = parse_decimal(field(close_col)?)?;
            let high = field(high_col).and_then(parse_decimal).unwrap_or(open.max(close));
            let low = field(low_col).and_then(parse_decimal).unwrap_or(open.min(close));
            let volume = field(volume_col).and_then(parse_decimal).unwrap_or(Decimal::ZERO);
            Some(Candle {
                time,
                open,
                high,
                low,
                close,
                volume,
            })
        })();

        match parsed {
            Some(candle) => candles.push(candle),
            None => skipped += 1,
        }
    }

    candles.sort_by_key(|c| c.time);
    debug!(path = %path.display(), rows = candles.len(), skipped, "CSV 로드");
    Ok(candles)
}

// =============================================================================
// 백테스트 실행
// =============================================================================

/// 학습/테스트 분할 위치.
fn split_index(len: usize) -> usize {
    let split = (TRAIN_RATIO * len as f64) as usize;
    if split < 100 {
        len / 2
    } else {
        split
    }
}

/// CSV 백테스트 실행.
///
/// 항상 드라이런으로 돌고 상태 파일을 쓰지 않습니다.
pub async fn run_backtest(opts: BacktestOptions) -> anyhow::Result<BacktestReport> {
    let mut config = TraderConfig::load(opts.config.as_deref()).context("설정 로드 실패")?;
    config.dry_run = true;
    config.persist_state = false;

    let candles = load_csv(&opts.csv)?;
    if candles.len() < MIN_ROWS {
        bail!("캔들이 최소 {MIN_ROWS}개 필요합니다 (현재 {}개)", candles.len());
    }

    let split = split_index(candles.len());
    let (train, test) = candles.split_at(split);

    let mut model = MicroModel::random();
    model.fit(&closes(train), FIT_LR, FIT_EPOCHS);
    let signal = ThresholdSignal::new(ThresholdConfig::default(), model);

    let warmup = opts.warmup.min(test.len());
    let paper = Arc::new(PaperBroker::new(PaperConfig {
        initial_price: test[0].close,
        fee_rate: config.fee_rate(),
        quote_balance: config.usd_equity,
        ..Default::default()
    }));
    for candle in &test[..warmup] {
        paper.push_candle(candle.clone()).await;
    }

    let start_equity = config.usd_equity;
    let broker: Arc<dyn Broker> = paper.clone();
    let trader = Trader::new(config, broker, Box::new(signal)).context("트레이더 초기화 실패")?;

    info!(
        csv = %opts.csv.display(),
        rows = candles.len(),
        train = train.len(),
        test = test.len(),
        warmup,
        "백테스트 시작"
    );

    let mut report = BacktestReport {
        rows: candles.len(),
        train: train.len(),
        test: test.len(),
        evaluated: 0,
        opens: 0,
        wins: 0,
        losses: 0,
        start_equity,
        equity: start_equity,
    };

    for (i, candle) in test.iter().enumerate().skip(warmup) {
        paper.push_candle(candle.clone()).await;
        report.evaluated += 1;
        let outcome = match trader.tick().await {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => {
                error!(error = %e, index = i, "치명적 에러로 백테스트 중단");
                return Err(e.into());
            }
            Err(e) => {
                warn!(error = %e, index = i, "틱 실패");
                continue;
            }
        };

        match &outcome {
            TickOutcome::Opened { .. } => report.opens += 1,
            TickOutcome::Closed(record) if record.pnl_usd > Decimal::ZERO => report.wins += 1,
            TickOutcome::Closed(record) if record.pnl_usd < Decimal::ZERO => report.losses += 1,
            _ => {}
        }
        if i % 100 == 0 {
            info!(index = i, time = %candle.time, "[BT] {}", outcome);
        }
    }

    trader.shutdown().await;
    report.equity = trader.equity().await;
    info!(
        evaluated = report.evaluated,
        wins = report.wins,
        losses = report.losses,
        equity = %report.equity,
        "백테스트 완료"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rust_decimal_macros::dec;

    use super::*;

    fn write_csv(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_csv_flexible_headers_and_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            &dir,
            "candles.csv",
            "Timestamp, OPEN ,High,Low,Close,Vol,extra\n\
             1704153660,101,102,100,101.5,3,x\n\
             2024-01-02T00:00:00Z,100,101,99,100.5,2,y\n\
             not-a-time,1,1,1,1,1,z\n\
             1704153720,101.5,,,102,,\n",
        );

        let candles = load_csv(&path).unwrap();
        assert_eq!(candles.len(), 3);
        // 시각순 정렬
        assert_eq!(candles[0].time.to_rfc3339(), "2024-01-02T00:00:00+00:00");
        assert_eq!(candles[0].close, dec!(100.5));
        assert_eq!(candles[1].time.timestamp(), 1704153660);
        assert_eq!(candles[1].volume, dec!(3));
        // 빈 고가/저가/거래량 보정
        assert_eq!(candles[2].high, dec!(102));
        assert_eq!(candles[2].low, dec!(101.5));
        assert_eq!(candles[2].volume, Decimal::ZERO);
    }

    #[test]
    fn test_load_csv_requires_time_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "bad.csv", "open,close\n1,2\n");
        assert!(load_csv(&path).is_err());
    }

    #[test]
    fn test_split_index() {
        assert_eq!(split_index(1000), 700);
        assert_eq!(split_index(100), 50);
    }

    #[tokio::test]
    async fn test_backtest_rejects_short_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "short.csv", "time,open,close\n1704153660,1,1\n");
        let err = run_backtest(BacktestOptions {
            config: None,
            csv: path,
            warmup: 100,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("1000"));
    }

    #[tokio::test]
    async fn test_backtest_walks_forward_over_test_split() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("time,open,high,low,close,volume\n");
        let start = 1_704_067_200i64;
        for i in 0..1200 {
            let close = 100.0 + (i as f64 / 15.0).sin() * 3.0 + (i as f64 / 97.0).cos();
            body.push_str(&format!(
                "{},{:.2},{:.2},{:.2},{:.2},1\n",
                start + i * 60,
                close,
                close + 0.2,
                close - 0.2,
                close
            ));
        }
        let path = write_csv(&dir, "walk.csv", &body);

        let report = run_backtest(BacktestOptions {
            config: None,
            csv: path,
            warmup: 100,
        })
        .await
        .unwrap();

        assert_eq!(report.rows, 1200);
        assert_eq!(report.train, 840);
        assert_eq!(report.test, 360);
        assert_eq!(report.evaluated, 260);
        assert!(report.wins + report.losses <= report.opens);
        assert!(report.equity > Decimal::ZERO);
    }
}
