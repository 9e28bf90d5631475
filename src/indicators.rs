use crate::models::DailyBar;

const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;

/// Simple moving average; `None` until the window fills or when the window
/// contains a missing close.
pub fn sma(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }
    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        if window.iter().all(|v| v.is_some()) {
            let sum: f64 = window.iter().map(|v| v.unwrap_or(0.0)).sum();
            out[i] = Some(sum / period as f64);
        }
    }
    out
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values, the talib convention. Leading gaps are skipped; a gap after the
/// seed poisons the remainder of the series, matching NaN propagation in the
/// reference implementation.
fn ema(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut current: Option<f64> = None;
    let mut seed_sum = 0.0;
    let mut seed_count = 0usize;
    let mut started = false;

    for (i, value) in values.iter().enumerate() {
        let x = match value {
            Some(x) => *x,
            None if !started => continue,
            None => break,
        };
        started = true;
        match current {
            None => {
                seed_sum += x;
                seed_count += 1;
                if seed_count == period {
                    current = Some(seed_sum / period as f64);
                    out[i] = current;
                }
            }
            Some(prev) => {
                let next = x * k + prev * (1.0 - k);
                current = Some(next);
                out[i] = Some(next);
            }
        }
    }
    out
}

/// MACD 12/26/9: difference line (fast EMA − slow EMA), signal line (EMA of
/// the difference), and their gap.
pub fn macd(
    values: &[Option<f64>],
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let fast = ema(values, MACD_FAST);
    let slow = ema(values, MACD_SLOW);
    let dif: Vec<Option<f64>> = fast
        .iter()
        .zip(&slow)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();
    let signal = ema(&dif, MACD_SIGNAL);
    let gap: Vec<Option<f64>> = dif
        .iter()
        .zip(&signal)
        .map(|(d, s)| match (d, s) {
            (Some(d), Some(s)) => Some(d - s),
            _ => None,
        })
        .collect();
    (dif, signal, gap)
}

/// Compute the indicator columns over a daily series: MA5/MA20, the MACD
/// columns (dif / signal / macd) and the derived oscillator
/// (osc = dif − macd). `macd` and `osc` stay separate columns; the bullish
/// test reads both.
///
/// The series is sorted ascending for computation and returned descending;
/// row 0 is the latest trading day, and downstream callers rely on that.
pub fn enrich(mut bars: Vec<DailyBar>) -> Vec<DailyBar> {
    bars.sort_by_key(|b| b.date);

    let closes: Vec<Option<f64>> = bars.iter().map(|b| b.close).collect();
    let ma5 = sma(&closes, 5);
    let ma20 = sma(&closes, 20);
    let (dif, signal, gap) = macd(&closes);

    for (i, bar) in bars.iter_mut().enumerate() {
        bar.ma5 = ma5[i];
        bar.ma20 = ma20[i];
        bar.dif = dif[i];
        bar.signal = signal[i];
        bar.macd = gap[i];
        bar.osc = match (dif[i], gap[i]) {
            (Some(d), Some(m)) => Some(d - m),
            _ => None,
        };
    }

    bars.sort_by(|a, b| b.date.cmp(&a.date));
    bars
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn series(closes: &[f64]) -> Vec<DailyBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let mut bar = DailyBar::new(
                    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
                        + chrono::Duration::days(i as i64),
                );
                bar.close = Some(*c);
                bar
            })
            .collect()
    }

    #[test]
    fn test_sma_window() {
        let values: Vec<Option<f64>> = [1.0, 2.0, 3.0, 4.0, 5.0].iter().map(|v| Some(*v)).collect();
        let out = sma(&values, 5);
        assert_eq!(out[..4], [None, None, None, None]);
        assert_eq!(out[4], Some(3.0));
    }

    #[test]
    fn test_ema_seeds_with_sma() {
        let values: Vec<Option<f64>> = (1..=4).map(|v| Some(v as f64)).collect();
        let out = ema(&values, 3);
        assert_eq!(out[..2], [None, None]);
        assert_eq!(out[2], Some(2.0));
        // 4 * 0.5 + 2 * 0.5
        assert_eq!(out[3], Some(3.0));
    }

    #[test]
    fn test_macd_validity_window() {
        let values: Vec<Option<f64>> = (0..40).map(|v| Some(v as f64)).collect();
        let (dif, signal, gap) = macd(&values);
        assert!(dif[24].is_none());
        assert!(dif[25].is_some());
        assert!(signal[32].is_none());
        assert!(signal[33].is_some());
        assert!(gap[33].is_some());
    }

    #[test]
    fn test_enrich_orders_latest_first_and_derives_osc() {
        let bars = enrich(series(&(1..=60).map(|v| v as f64).collect::<Vec<_>>()));
        assert!(bars[0].date > bars[1].date);
        let latest = &bars[0];
        assert!(latest.ma5.is_some() && latest.ma20.is_some());
        let (dif, macd_col, osc) = (
            latest.dif.unwrap(),
            latest.macd.unwrap(),
            latest.osc.unwrap(),
        );
        assert!((osc - (dif - macd_col)).abs() < 1e-9);
        // strictly rising closes keep the short averages above the long ones
        assert!(latest.ma5.unwrap() > latest.ma20.unwrap());
    }

    #[test]
    fn test_short_series_leaves_nulls() {
        let bars = enrich(series(&[10.0, 11.0, 12.0]));
        assert!(bars.iter().all(|b| b.ma5.is_none()));
        assert!(bars.iter().all(|b| b.dif.is_none()));
    }
}
