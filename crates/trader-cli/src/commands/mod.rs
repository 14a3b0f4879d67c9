//! CLI 서브커맨드.

pub mod backtest;
pub mod run;
pub mod state;
