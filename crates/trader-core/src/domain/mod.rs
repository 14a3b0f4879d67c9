//! 도메인 모델.
//!
//! - [`Side`], [`SidePair`] - 매매 방향과 방향별 쌍 컨테이너
//! - [`Lot`], [`SideBook`], [`ExitRecord`] - 로트 원장
//! - [`PendingOpen`], [`OpenResult`] - 메이커 진입 주문
//! - [`Broker`] - 거래소 기능 trait

mod exchange_provider;
mod exchange_types;
mod lot;
mod pending;
mod side;
mod signal;

pub use exchange_provider::{Broker, BrokerError};
pub use exchange_types::{split_product_id, AssetBalance, BestBidAsk, Candle, FilledOrder, OrderStatus};
pub use lot::{ExitMode, ExitRecord, Lot, RemovedLot, SideBook};
pub use pending::{OpenResult, PendingOpen, PENDING_HISTORY_CAP};
pub use side::{Side, SidePair};
pub use signal::{Decision, SignalDirection};
