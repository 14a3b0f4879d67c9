//! 로트 트레이더 CLI.
//!
//! # 사용 예시
//!
//! ```bash
//! # 페이퍼 브로커로 트레이더 실행 (Ctrl+C로 종료)
//! trader run --config trader.toml --interval-ms 1000
//!
//! # 200틱만 실행하고 JSON 로그 출력
//! trader --log-format json run --ticks 200
//!
//! # CSV 캔들로 백테스트 (항상 드라이런)
//! trader backtest --csv data/btc_1m.csv
//!
//! # 저장된 상태 확인
//! trader state --path state/bot_state.json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::{
    backtest::{run_backtest, BacktestOptions},
    run::{run_trader, RunOptions},
    state::print_state,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "trader")]
#[command(about = "Lot trader - 수수료 반영 로트 단위 자동 매매", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// 로그 출력 형식
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// 페이퍼 브로커를 상대로 트레이더 루프 실행
    Run {
        /// 설정 파일 경로 (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// 실행할 틱 수 (0 = 무제한)
        #[arg(long, default_value = "0")]
        ticks: u64,

        /// 틱 간격 (ms)
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// 페이퍼 가격 랜덤워크 변동폭 (bps)
        #[arg(long, default_value = "15")]
        volatility_bps: f64,

        /// 페이퍼 시작 가격
        #[arg(long, default_value = "108000")]
        start_price: f64,
    },

    /// CSV 캔들로 학습 후 나머지 구간 워크포워드 백테스트
    Backtest {
        /// 캔들 CSV 경로
        #[arg(long)]
        csv: PathBuf,

        /// 설정 파일 경로 (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// 테스트 구간에서 평가 전에 재생할 캔들 수
        #[arg(long, default_value = "100")]
        warmup: usize,
    },

    /// 저장된 상태 파일 요약 출력
    State {
        /// 상태 파일 경로
        #[arg(short, long, default_value = "state/bot_state.json")]
        path: PathBuf,

        /// 출력할 최근 청산 기록 수
        #[arg(long, default_value = "8")]
        exits: usize,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "trader={level},trader_execution={level},trader_exchange={level},trader_strategy={level}"
        )
        .into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 파일 로드 (없어도 에러 안남)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Run {
            config,
            ticks,
            interval_ms,
            volatility_bps,
            start_price,
        } => {
            run_trader(RunOptions {
                config,
                ticks,
                interval_ms,
                volatility_bps,
                start_price,
            })
            .await?;
        }
        Commands::Backtest { csv, config, warmup } => {
            let report = run_backtest(BacktestOptions { config, csv, warmup }).await?;
            report.print();
        }
        Commands::State { path, exits } => {
            print_state(&path, exits)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::try_parse_from(["trader", "run", "--ticks", "5"]).unwrap();
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Commands::Run {
                config,
                ticks,
                interval_ms,
                ..
            } => {
                assert!(config.is_none());
                assert_eq!(ticks, 5);
                assert_eq!(interval_ms, 1000);
            }
            _ => panic!("run 커맨드가 아님"),
        }
    }

    #[test]
    fn test_parse_backtest() {
        let cli = Cli::try_parse_from(["trader", "backtest", "--csv", "data/c.csv"]).unwrap();
        match cli.command {
            Commands::Backtest { csv, config, warmup } => {
                assert_eq!(csv, PathBuf::from("data/c.csv"));
                assert!(config.is_none());
                assert_eq!(warmup, 100);
            }
            _ => panic!("backtest 커맨드가 아님"),
        }
        assert!(Cli::try_parse_from(["trader", "backtest"]).is_err());
    }

    #[test]
    fn test_parse_state_with_json_logs() {
        let cli = Cli::try_parse_from(["trader", "--log-format", "json", "state", "--path", "/tmp/s.json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::State { path, exits } => {
                assert_eq!(path, PathBuf::from("/tmp/s.json"));
                assert_eq!(exits, 8);
            }
            _ => panic!("state 커맨드가 아님"),
        }
    }
}
