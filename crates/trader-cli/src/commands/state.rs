//! 저장된 상태 파일 요약 출력.

use std::path::Path;

use anyhow::Context;
use trader_core::Side;
use trader_execution::StateStore;

/// 상태 파일을 읽어 자산, 로트, 대기 주문, 최근 청산을 출력.
pub fn print_state(path: &Path, exits: usize) -> anyhow::Result<()> {
    let store = StateStore::new(path);
    let Some(state) = store
        .load()
        .with_context(|| format!("상태 파일 로드 실패: {}", path.display()))?
    else {
        println!("상태 파일 없음: {}", path.display());
        return Ok(());
    };

    println!("=== Bot State ({}) ===", path.display());
    println!("equity        : {}", state.equity_usd);
    println!(
        "daily pnl     : {} (since {})",
        state.daily_pnl,
        state
            .daily_start
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("wins / losses : {} / {}", state.wins, state.losses);
    println!("next lot id   : {}", state.next_lot_seq);
    if let Some(saved_at) = state.saved_at {
        println!("saved at      : {}", saved_at.to_rfc3339());
    }

    for side in [Side::Buy, Side::Sell] {
        let book = &state.books[side];
        println!();
        println!(
            "--- {} lots: {} (stage {}, baseline {}) ---",
            side,
            book.len(),
            state.equity_stage[side],
            state.equity_baseline[side]
        );
        for (idx, lot) in book.lots.iter().enumerate() {
            let marker = if book.is_runner(idx) { "*" } else { " " };
            println!(
                "{marker} #{:<4} open={} size={} fee={} mode={} take={} trail={}",
                lot.lot_id,
                lot.open_price,
                lot.size_base,
                lot.entry_fee.round_dp(4),
                lot.exit_mode,
                lot.take,
                if lot.trail_active {
                    lot.trail_stop.to_string()
                } else {
                    "-".to_string()
                }
            );
        }

        if let Some(pending) = &state.pending[side] {
            println!(
                "  pending order={} limit={} base={} reprices={} deadline={}",
                pending.order_id,
                pending.limit_price,
                pending.base_at_limit,
                pending.reprice_count,
                pending.deadline.to_rfc3339()
            );
        }
        if state.recheck[side] {
            println!("  market recheck armed");
        }
    }

    let recent: Vec<_> = state.exit_history.iter().rev().take(exits).collect();
    if !recent.is_empty() {
        println!();
        println!("--- recent exits ---");
        for record in recent {
            println!(
                "{} {} lot={} {} -> {} size={} pnl={} reason={}{}",
                record.time.format("%Y-%m-%d %H:%M:%S"),
                record.side,
                record.lot_id,
                record.open_price,
                record.close_price,
                record.size_base,
                record.pnl_usd.round_dp(4),
                record.reason,
                if record.was_runner { " (runner)" } else { "" }
            );
        }
    }

    Ok(())
}
