//! 청산 수식 속성 테스트.

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use trader_core::{Candle, Decision, FilledOrder, Lot, OrderStatus, Side, SignalDirection};
use trader_execution::exit_policy::{activation_price, net_at};
use trader_execution::{BotState, TraderConfig, TraderState};
use trader_strategy::SignalSource;

struct Idle;

impl SignalSource for Idle {
    fn name(&self) -> &str {
        "idle"
    }

    fn decide(&mut self, _candles: &[Candle]) -> Decision {
        Decision {
            signal: SignalDirection::Flat,
            p_up: 0.5,
        }
    }
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

fn lot(side: Side, open_cents: u64, size_milli: u64, fee_bps: u64) -> (Lot, Decimal) {
    let open_price = Decimal::new(open_cents as i64, 2);
    let size_base = Decimal::new(size_milli as i64, 3);
    let fee_rate = Decimal::new(fee_bps as i64, 4);
    let lot = Lot {
        lot_id: 1,
        side,
        open_price,
        size_base,
        entry_fee: open_price * size_base * fee_rate,
        ..Default::default()
    };
    (lot, fee_rate)
}

proptest! {
    /// 활성화 가격에서의 순손익은 게이트와 같다.
    #[test]
    fn prop_activation_price_round_trip(
        side in side_strategy(),
        open_cents in 1_000u64..10_000_000,
        size_milli in 1u64..10_000,
        fee_bps in 0u64..100,
        gate_cents in 0u64..500,
    ) {
        let (lot, fee_rate) = lot(side, open_cents, size_milli, fee_bps);
        let gate = Decimal::new(gate_cents as i64, 2);
        if let Some(price) = activation_price(&lot, gate, fee_rate) {
            let (net, _) = net_at(&lot, price, fee_rate);
            prop_assert!((net - gate).abs() < dec!(0.000001), "net={} gate={}", net, gate);
        }
    }

    /// 여러 번의 부분 청산에서 비례 차감된 진입 수수료 합은 원래 진입 수수료와 같다.
    #[test]
    fn prop_partial_exits_conserve_entry_fee(
        side in side_strategy(),
        weights in prop::collection::vec(1u32..100, 1..6),
    ) {
        let config = TraderConfig { persist_state: false, ..Default::default() };
        let snapshot = BotState { equity_usd: dec!(1000), next_lot_seq: 2, ..Default::default() };
        let mut state = TraderState::from_snapshot(snapshot, Box::new(Idle), &config);

        let (lot, _) = lot(side, 10_000, 2_000, 30);
        let original_fee = lot.entry_fee;
        let size = lot.size_base;
        state.books[side].push(lot);

        let total: u32 = weights.iter().sum();
        let mut remaining = size;
        let mut charged = Decimal::ZERO;
        for (i, w) in weights.iter().enumerate() {
            let part = if i + 1 == weights.len() {
                remaining
            } else {
                (size * Decimal::from(*w) / Decimal::from(total)).round_dp(8)
            };
            if part <= Decimal::ZERO {
                continue;
            }
            remaining -= part;
            let fill = FilledOrder {
                order_id: format!("x-{i}"),
                price: dec!(101),
                base_size: part,
                quote_spent: part * dec!(101),
                commission: part * dec!(101) * dec!(0.003),
                status: Some(OrderStatus::Filled),
            };
            let record = state
                .apply_exit(side, 0, Some(&fill), dec!(101), "take_profit", Utc::now())
                .unwrap();
            charged += record.entry_fee_usd;
        }

        prop_assert!(state.books[side].is_empty());
        prop_assert!((charged - original_fee).abs() < dec!(0.0000000001), "charged={} original={}", charged, original_fee);
    }
}
