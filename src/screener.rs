use crate::models::{DailyBar, MergedStock, ScreeningConditions};

/// Market-wide screen over the merged dataset. A row qualifies only when
/// every predicate holds; a `None` in any referenced field fails that
/// predicate, it never errors. The returned code list keeps only well-formed
/// 4-digit codes: ETFs and warrants pass the row filter but are not
/// analyzable as ordinary stocks.
pub fn screen(
    merged: &[MergedStock],
    conditions: &ScreeningConditions,
) -> (Vec<MergedStock>, Vec<String>) {
    let selected: Vec<MergedStock> = merged
        .iter()
        .filter(|stock| row_qualifies(stock, conditions))
        .cloned()
        .collect();
    let codes = selected
        .iter()
        .filter(|stock| is_four_digit_code(&stock.code))
        .map(|stock| stock.code.clone())
        .collect();
    (selected, codes)
}

fn row_qualifies(stock: &MergedStock, c: &ScreeningConditions) -> bool {
    let above = |value: Option<f64>, threshold: f64| value.map_or(false, |v| v > threshold);
    let at_least = |value: Option<f64>, threshold: f64| value.map_or(false, |v| v >= threshold);
    let ordered = |short: Option<f64>, long: Option<f64>| match (short, long) {
        (Some(s), Some(l)) => s > l,
        _ => false,
    };

    above(stock.total_net_buy, c.min_net_buy_lots)
        && (at_least(stock.foreign_streak_days, c.min_foreign_streak_days)
            || at_least(stock.dealer_streak_days, c.min_dealer_streak_days)
            || at_least(stock.trust_streak_days, c.min_trust_streak_days))
        && above(stock.change_pct, c.min_change_pct)
        && (!c.require_ma5_above_ma20 || ordered(stock.ma5, stock.ma20))
        && at_least(stock.volume_lots, c.min_volume_lots)
        && (!c.require_ma20_above_ma60 || ordered(stock.ma20, stock.ma60))
}

pub fn is_four_digit_code(code: &str) -> bool {
    code.len() == 4 && code.chars().all(|ch| ch.is_ascii_digit())
}

/// Per-stock bullish test against the latest indicator row. All seven fields
/// must be present; an incomplete row is "not bullish", never an error. The
/// macd and osc checks are deliberately separate: the series carries both a
/// macd column and a derived oscillator column.
pub fn is_bullish(latest: &DailyBar) -> bool {
    let (ma5, ma20, dif, signal, macd, osc, close) = match (
        latest.ma5,
        latest.ma20,
        latest.dif,
        latest.signal,
        latest.macd,
        latest.osc,
        latest.close,
    ) {
        (Some(a), Some(b), Some(c), Some(d), Some(e), Some(f), Some(g)) => {
            (a, b, c, d, e, f, g)
        }
        _ => {
            log::warn!("bullish test on {}: indicator columns missing", latest.date);
            return false;
        }
    };

    ma5 > ma20 && dif > signal && macd > 0.0 && osc > 0.0 && close > ma20
}
