//! 시그널 피처용 경량 기술 지표.
//!
//! 모든 함수는 종가 배열(f64)을 받아 입력과 같은 길이로 정렬된 결과를 반환합니다.

use rust_decimal::prelude::ToPrimitive;
use trader_core::Candle;

/// 캔들 종가를 f64 배열로 변환.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .map(|c| c.close.to_f64().unwrap_or(0.0))
        .collect()
}

/// n기간 RSI (Wilder 평활). 첫 구간 이전 값은 0입니다.
pub fn rsi(close: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![0.0; close.len()];
    if n == 0 || close.is_empty() {
        return out;
    }
    let nf = n as f64;
    let (mut gain, mut loss) = (0.0, 0.0);
    for i in 1..close.len() {
        let d = close[i] - close[i - 1];
        if i <= n {
            if d > 0.0 {
                gain += d;
            } else {
                loss -= d;
            }
            if i == n {
                gain /= nf;
                loss /= nf;
                out[i] = rsi_value(gain, loss);
            }
        } else {
            gain = (gain * (nf - 1.0) + d.max(0.0)) / nf;
            loss = (loss * (nf - 1.0) + (-d).max(0.0)) / nf;
            out[i] = rsi_value(gain, loss);
        }
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    let rs = if avg_loss != 0.0 { avg_gain / avg_loss } else { 0.0 };
    100.0 - 100.0 / (1.0 + rs)
}

/// n기간 롤링 z-score. 첫 구간 이전 값은 0입니다.
pub fn zscore(close: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![0.0; close.len()];
    if n <= 1 {
        return out;
    }
    let nf = n as f64;
    let (mut sum, mut sum_sq) = (0.0, 0.0);
    for (i, &x) in close.iter().enumerate() {
        sum += x;
        sum_sq += x * x;
        if i >= n {
            let y = close[i - n];
            sum -= y;
            sum_sq -= y * y;
        }
        if i + 1 >= n {
            let mean = sum / nf;
            let variance = sum_sq / nf - mean * mean;
            out[i] = (x - mean) / variance.max(1e-12).sqrt();
        }
    }
    out
}

/// 지수 이동 평균. 첫 값으로 시드합니다.
pub fn ema(close: &[f64], n: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(close.len());
    if n == 0 {
        return vec![f64::NAN; close.len()];
    }
    let k = 2.0 / (n as f64 + 1.0);
    let mut prev = None;
    for &x in close {
        let next = match prev {
            Some(p) => x * k + p * (1.0 - k),
            None => x,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// 인덱스 i의 피처 벡터 `[ret1, ret5, rsi14/100, zscore20]`.
///
/// 5기간 수익률을 계산할 수 없으면 None.
pub fn features_at(close: &[f64], rsi14: &[f64], z20: &[f64], i: usize) -> Option<[f64; 4]> {
    if i < 5 || i >= close.len() || close[i - 1] == 0.0 || close[i - 5] == 0.0 {
        return None;
    }
    let ret1 = (close[i] - close[i - 1]) / close[i - 1];
    let ret5 = (close[i] - close[i - 5]) / close[i - 5];
    Some([ret1, ret5, rsi14[i] / 100.0, z20[i]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_all_gains_is_100() {
        let close: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&close, 14);
        assert_eq!(out[13], 0.0);
        assert!((out[14] - 100.0).abs() < 1e-9);
        assert!((out[29] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_zscore_flat_series_is_zero() {
        let close = vec![50.0; 25];
        let out = zscore(&close, 20);
        assert!(out.iter().all(|z| z.abs() < 1e-6));
    }

    #[test]
    fn test_ema_seeds_with_first_value() {
        let out = ema(&[10.0, 10.0, 10.0], 4);
        assert_eq!(out, vec![10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_features_require_lookback() {
        let close: Vec<f64> = (1..=10).map(f64::from).collect();
        let r = rsi(&close, 14);
        let z = zscore(&close, 20);
        assert!(features_at(&close, &r, &z, 4).is_none());
        let f = features_at(&close, &r, &z, 9).unwrap();
        assert!((f[0] - 1.0 / 9.0).abs() < 1e-12);
        assert!((f[1] - 5.0 / 5.0).abs() < 1e-12);
    }
}
