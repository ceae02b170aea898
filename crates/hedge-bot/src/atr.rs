//! ATR channel computation.
//!
//! ATR uses Wilder's RMA smoothing: the first `length` true ranges are
//! averaged as the seed, then `ATR_i = ((length-1)·ATR_{i-1} + TR_i) / length`.
//! The channel is the lookback high/low pushed out by `multiplier` ATRs.
//! Computed once per epoch; the result is treated as constant until reset.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use hedge_common::Candle;

/// ATR computation failures.
#[derive(Debug, Error)]
pub enum AtrError {
    #[error("insufficient history: need at least {needed} candles, got {got}")]
    InsufficientHistory { needed: usize, got: usize },

    /// All bars identical — no volatility to build a channel from.
    #[error("degenerate channel: lookback range and ATR are both zero")]
    DegenerateChannel,
}

/// Result of one ATR channel computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtrResult {
    pub atr: Decimal,
    pub upper_bound: Decimal,
    pub lower_bound: Decimal,
    pub computed_at: DateTime<Utc>,
}

impl AtrResult {
    /// Channel width in price units.
    pub fn channel_width(&self) -> Decimal {
        self.upper_bound - self.lower_bound
    }

    /// Channel midpoint.
    pub fn mid(&self) -> Decimal {
        (self.upper_bound + self.lower_bound) / Decimal::TWO
    }
}

/// Compute the ATR channel over `candles` (oldest first).
///
/// Requires `length + 1` candles for the TR series (each TR references the
/// previous close) and `lookback` candles for the channel extremes.
pub fn compute_atr_channel(
    candles: &[Candle],
    length: usize,
    multiplier: Decimal,
    lookback: usize,
) -> Result<AtrResult, AtrError> {
    let needed = (length + 1).max(lookback);
    if candles.len() < needed {
        return Err(AtrError::InsufficientHistory {
            needed,
            got: candles.len(),
        });
    }

    let atr = rma_atr(candles, length);

    let window = &candles[candles.len() - lookback..];
    let max_high = window
        .iter()
        .map(|c| c.high)
        .max()
        .expect("lookback window is non-empty");
    let min_low = window
        .iter()
        .map(|c| c.low)
        .min()
        .expect("lookback window is non-empty");

    let upper_bound = max_high + multiplier * atr;
    let lower_bound = min_low - multiplier * atr;
    if lower_bound >= upper_bound {
        return Err(AtrError::DegenerateChannel);
    }

    Ok(AtrResult {
        atr,
        upper_bound,
        lower_bound,
        computed_at: Utc::now(),
    })
}

/// Wilder-RMA ATR over the candle series.
fn rma_atr(candles: &[Candle], length: usize) -> Decimal {
    let true_ranges: Vec<Decimal> = candles
        .windows(2)
        .map(|pair| pair[1].true_range(pair[0].close))
        .collect();

    let length_dec = Decimal::from(length as u64);
    let seed: Decimal =
        true_ranges[..length].iter().copied().sum::<Decimal>() / length_dec;

    true_ranges[length..].iter().fold(seed, |atr, tr| {
        ((length_dec - Decimal::ONE) * atr + tr) / length_dec
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(i: i64, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(1_700_000_000 + i * 3600, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: dec!(100),
        }
    }

    #[test]
    fn test_atr_seed_is_mean_of_first_true_ranges() {
        let candles = vec![
            candle(0, dec!(10), dec!(9), dec!(9.5)),
            candle(1, dec!(10.5), dec!(9.5), dec!(10)),  // TR = 1
            candle(2, dec!(11), dec!(10), dec!(10.5)),   // TR = 1
            candle(3, dec!(10.8), dec!(10.2), dec!(10.4)), // TR = 0.6
        ];
        let result = compute_atr_channel(&candles, 3, dec!(2), 3).unwrap();

        let expected_atr = dec!(2.6) / dec!(3);
        assert_eq!(result.atr, expected_atr);

        // Lookback window is the last 3 candles: high 11, low 9.5.
        assert_eq!(result.upper_bound, dec!(11) + dec!(2) * expected_atr);
        assert_eq!(result.lower_bound, dec!(9.5) - dec!(2) * expected_atr);
    }

    #[test]
    fn test_rma_recursion_after_seed() {
        // length=2: seed = (TR1+TR2)/2, then one recursive step with TR3.
        let candles = vec![
            candle(0, dec!(100), dec!(98), dec!(99)),
            candle(1, dec!(101), dec!(99), dec!(100)),  // TR = 2
            candle(2, dec!(102), dec!(100), dec!(101)), // TR = 2
            candle(3, dec!(105), dec!(101), dec!(104)), // TR = 4
        ];
        let result = compute_atr_channel(&candles, 2, dec!(1), 4).unwrap();

        let seed = dec!(2);
        let expected = (seed + dec!(4)) / dec!(2); // ((2-1)*2 + 4) / 2 = 3
        assert_eq!(result.atr, expected);
    }

    #[test]
    fn test_channel_invariants() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = dec!(1) + Decimal::from(i % 5) * dec!(0.001);
                candle(i as i64, base + dec!(0.002), base - dec!(0.002), base)
            })
            .collect();
        let k = dec!(2);
        let result = compute_atr_channel(&candles, 14, k, 20).unwrap();

        assert!(result.atr > Decimal::ZERO);
        assert!(result.lower_bound < result.upper_bound);
        // Channel must be at least 2·k·ATR wide.
        assert!(result.channel_width() >= dec!(2) * k * result.atr);
    }

    #[test]
    fn test_insufficient_history() {
        let candles = vec![
            candle(0, dec!(10), dec!(9), dec!(9.5)),
            candle(1, dec!(10), dec!(9), dec!(9.5)),
        ];
        let err = compute_atr_channel(&candles, 14, dec!(2), 20).unwrap_err();
        match err {
            AtrError::InsufficientHistory { needed, got } => {
                assert_eq!(needed, 20);
                assert_eq!(got, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_flat_market_is_degenerate() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| candle(i as i64, dec!(1), dec!(1), dec!(1)))
            .collect();
        assert!(matches!(
            compute_atr_channel(&candles, 14, dec!(2), 20),
            Err(AtrError::DegenerateChannel)
        ));
    }
}
