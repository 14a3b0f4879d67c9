//! 페이퍼 브로커 트레이더 루프.
//!
//! 매 틱마다 페이퍼 가격을 랜덤워크로 움직인 뒤 `Trader::tick`을 실행합니다.
//! Ctrl+C를 받거나 지정한 틱 수를 채우면 대기 주문 감시를 멈추고 상태를 저장합니다.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use trader_core::Broker;
use trader_exchange::{PaperBroker, PaperConfig, RetryConfig, RetryingBroker};
use trader_execution::{TickOutcome, Trader, TraderConfig};
use trader_strategy::{MicroModel, ThresholdConfig, ThresholdSignal};

/// `run` 서브커맨드 옵션.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    /// 0이면 무제한
    pub ticks: u64,
    pub interval_ms: u64,
    pub volatility_bps: f64,
    pub start_price: f64,
}

/// 트레이더 루프 실행.
pub async fn run_trader(opts: RunOptions) -> anyhow::Result<()> {
    let config = TraderConfig::load(opts.config.as_deref()).context("설정 로드 실패")?;
    let start_price = Decimal::from_f64(opts.start_price)
        .filter(|p| *p > Decimal::ZERO)
        .context("시작 가격이 유효하지 않습니다")?;

    let paper = Arc::new(PaperBroker::new(PaperConfig {
        initial_price: start_price,
        fee_rate: config.fee_rate(),
        quote_balance: config.usd_equity,
        spread_bps: dec!(2),
        ..Default::default()
    }));
    let broker: Arc<dyn Broker> = Arc::new(RetryingBroker::new(paper.clone(), RetryConfig::default()));
    let signal = ThresholdSignal::new(ThresholdConfig::default(), MicroModel::random());

    let product_id = config.product_id.clone();
    let use_live_equity = config.use_live_equity;
    let trader = Trader::new(config, broker.clone(), Box::new(signal)).context("트레이더 초기화 실패")?;

    for (side, outcome) in trader.rehydrate_pending().await {
        info!(side = %side, outcome = ?outcome, "대기 주문 복구");
    }

    info!(
        ticks = opts.ticks,
        interval_ms = opts.interval_ms,
        volatility_bps = opts.volatility_bps,
        "트레이더 루프 시작"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(opts.interval_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut count: u64 = 0;
    let mut fatal = None;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                walk_price(&paper, opts.volatility_bps).await;

                if use_live_equity {
                    rebase_equity(&trader, broker.as_ref(), &product_id).await;
                }

                match trader.tick().await {
                    Ok(outcome) => log_outcome(count, &outcome),
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "치명적 에러로 루프 중단");
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => warn!(error = %e, "틱 실패"),
                }

                count += 1;
                if opts.ticks > 0 && count >= opts.ticks {
                    info!(ticks = count, "지정한 틱 수 완료");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("종료 신호 수신");
                break;
            }
        }
    }

    trader.shutdown().await;
    let equity = trader.equity().await;
    info!(ticks = count, equity = %equity, "트레이더 종료");

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// 페이퍼 가격을 ±volatility_bps 범위에서 무작위로 이동.
async fn walk_price(paper: &PaperBroker, volatility_bps: f64) {
    let current = match paper.now_price("").await {
        Ok(price) => price,
        Err(e) => {
            warn!(error = %e, "페이퍼 가격 조회 실패");
            return;
        }
    };
    let step = rand::thread_rng().gen_range(-1.0..=1.0) * volatility_bps / 10_000.0;
    let next = current
        .to_f64()
        .map(|p| p * (1.0 + step))
        .and_then(Decimal::from_f64)
        .map(|p| p.round_dp(2))
        .filter(|p| *p > Decimal::ZERO);
    if let Some(price) = next {
        paper.set_price(price).await;
    }
}

/// 실시간 잔고로 자산 재설정 (호가 잔고 + 기준 잔고 × 현재가).
async fn rebase_equity(trader: &Trader, broker: &dyn Broker, product_id: &str) {
    let (mark, base, quote) = tokio::join!(
        broker.now_price(product_id),
        broker.available_base(product_id),
        broker.available_quote(product_id),
    );
    match (mark, base, quote) {
        (Ok(mark), Ok(base), Ok(quote)) => {
            trader.set_equity(quote.available + base.available * mark).await;
        }
        (mark, base, quote) => {
            let err = [mark.err(), base.err(), quote.err()]
                .into_iter()
                .flatten()
                .next();
            if let Some(e) = err {
                warn!(error = %e, "실시간 자산 조회 실패, 기존 자산 유지");
            }
        }
    }
}

fn log_outcome(tick: u64, outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Opened { .. } | TickOutcome::Closed(_) | TickOutcome::MakerPosted { .. } => {
            info!(tick, "{}", outcome)
        }
        _ => debug!(tick, "{}", outcome),
    }
}
