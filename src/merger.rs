use std::collections::HashMap;

use crate::models::{Cell, MacdTriple, MacdTriples, MergedStock, NormalizedTable, PipelineError};
use crate::table;

/// Business key shared by the revenue and MACD joins; the moving-average and
/// buy-streak joins extend it. Key fields compare as scraped text; coercion
/// runs after the joins, as the sheets disagree on numeric formatting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QuoteKey {
    code: String,
    name: String,
    close: String,
    change: String,
    change_pct: String,
}

/// flow ⋈ moving-average key: quote plus 成交張數.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MaJoinKey {
    quote: QuoteKey,
    volume: String,
}

/// flow ⋈ buy-streak key: 法人買賣日期 plus the quote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreakJoinKey {
    flow_date: String,
    quote: QuoteKey,
}

struct Columns<'a> {
    table: &'a NormalizedTable,
}

impl<'a> Columns<'a> {
    fn new(table: &'a NormalizedTable) -> Self {
        Columns { table }
    }

    fn required(&self, name: &str, sheet: &str) -> Result<usize, PipelineError> {
        self.table
            .column(name)
            .ok_or_else(|| PipelineError::Merge(format!("{} sheet lacks column {}", sheet, name)))
    }

    fn text(&self, row: &[Cell], idx: usize) -> String {
        row.get(idx).map(|c| c.render()).unwrap_or_default()
    }

    /// Optional data column, glyph-stripped and coerced after the join.
    fn coerced(&self, row: &[Cell], name: &str) -> Option<f64> {
        self.table
            .column(name)
            .and_then(|idx| row.get(idx))
            .and_then(|c| table::coerce_numeric(&c.render()).as_num())
    }
}

fn quote_key(cols: &Columns, row: &[Cell], idx: &[usize; 5]) -> QuoteKey {
    QuoteKey {
        code: cols.text(row, idx[0]),
        name: cols.text(row, idx[1]),
        close: cols.text(row, idx[2]),
        change: cols.text(row, idx[3]),
        change_pct: cols.text(row, idx[4]),
    }
}

fn quote_indices(cols: &Columns, sheet: &str) -> Result<[usize; 5], PipelineError> {
    Ok([
        cols.required("代號", sheet)?,
        cols.required("名稱", sheet)?,
        cols.required("成交", sheet)?,
        cols.required("漲跌價", sheet)?,
        cols.required("漲跌幅", sheet)?,
    ])
}

#[derive(Default)]
struct MaValues {
    ma5: Option<f64>,
    ma10: Option<f64>,
    ma20: Option<f64>,
    ma60: Option<f64>,
    ma120: Option<f64>,
    ma240: Option<f64>,
}

#[derive(Default)]
struct StreakValues {
    total: Option<f64>,
    foreign: Option<f64>,
    dealer: Option<f64>,
    trust: Option<f64>,
}

/// Sequential left-joins anchored on the corporate-flow sheet:
/// flow ⋈ moving-average ⋈ buy-streak ⋈ revenue ⋈ MACD. Flow rows are always
/// preserved; unmatched right sides leave `None`. The superseded
/// 15/50/100/200-day averages and the 法人買賣超註記 flag are intentionally
/// not carried over.
///
/// Returns the merged records plus the revenue labels actually applied (the
/// externally supplied, calendar-dependent set).
pub fn merge(
    flow: &NormalizedTable,
    ma: &NormalizedTable,
    streak: &NormalizedTable,
    revenue: &NormalizedTable,
    macd: &NormalizedTable,
    revenue_labels: &[String],
) -> Result<(Vec<MergedStock>, Vec<String>), PipelineError> {
    let flow_cols = Columns::new(flow);
    let flow_quote = quote_indices(&flow_cols, "corporate-flow")?;
    let flow_volume = flow_cols.required("成交張數", "corporate-flow")?;
    let flow_date = flow_cols.required("法人買賣日期", "corporate-flow")?;

    // moving-average sheet, keyed by quote + volume
    let ma_cols = Columns::new(ma);
    let ma_quote = quote_indices(&ma_cols, "moving-average")?;
    let ma_volume = ma_cols.required("成交張數", "moving-average")?;
    let mut ma_map: HashMap<MaJoinKey, MaValues> = HashMap::new();
    for row in &ma.rows {
        let key = MaJoinKey {
            quote: quote_key(&ma_cols, row, &ma_quote),
            volume: ma_cols.text(row, ma_volume),
        };
        ma_map.insert(
            key,
            MaValues {
                ma5: ma_cols.coerced(row, "5日均線"),
                ma10: ma_cols.coerced(row, "10日均線"),
                ma20: ma_cols.coerced(row, "20日均線"),
                ma60: ma_cols.coerced(row, "60日均線"),
                ma120: ma_cols.coerced(row, "120日均線"),
                ma240: ma_cols.coerced(row, "240日均線"),
            },
        );
    }

    // buy-streak sheet, keyed by flow date + quote
    let streak_cols = Columns::new(streak);
    let streak_quote = quote_indices(&streak_cols, "buy-streak")?;
    let streak_date = streak_cols.required("法人買賣日期", "buy-streak")?;
    let mut streak_map: HashMap<StreakJoinKey, StreakValues> = HashMap::new();
    for row in &streak.rows {
        let key = StreakJoinKey {
            flow_date: streak_cols.text(row, streak_date),
            quote: quote_key(&streak_cols, row, &streak_quote),
        };
        streak_map.insert(
            key,
            StreakValues {
                total: streak_cols.coerced(row, "三大法人連續買賣日數"),
                foreign: streak_cols.coerced(row, "外資連續買賣日數"),
                dealer: streak_cols.coerced(row, "自營商連續買賣日數"),
                trust: streak_cols.coerced(row, "投信連續買賣日數"),
            },
        );
    }

    // revenue sheet, keyed by quote; month columns matched through relabeling
    let revenue_cols = Columns::new(revenue);
    let revenue_quote = quote_indices(&revenue_cols, "revenue")?;
    let relabeled = table::relabel_revenue_columns(&revenue.headers);
    let label_indices: Vec<Option<usize>> = revenue_labels
        .iter()
        .map(|label| relabeled.iter().position(|h| h == label))
        .collect();
    let mut revenue_map: HashMap<QuoteKey, Vec<Option<f64>>> = HashMap::new();
    for row in &revenue.rows {
        let key = quote_key(&revenue_cols, row, &revenue_quote);
        let values = label_indices
            .iter()
            .map(|idx| {
                idx.and_then(|i| row.get(i))
                    .and_then(|c| table::coerce_numeric(&c.render()).as_num())
            })
            .collect();
        revenue_map.insert(key, values);
    }

    // MACD sheet, keyed by quote
    let macd_cols = Columns::new(macd);
    let macd_quote = quote_indices(&macd_cols, "MACD")?;
    let mut macd_map: HashMap<QuoteKey, MacdTriples> = HashMap::new();
    for row in &macd.rows {
        let key = quote_key(&macd_cols, row, &macd_quote);
        let triple = |suffix: &str| MacdTriple {
            dif: macd_cols.coerced(row, &format!("DIF({})", suffix)),
            macd: macd_cols.coerced(row, &format!("MACD({})", suffix)),
            osc: macd_cols.coerced(row, &format!("OSC({})", suffix)),
        };
        macd_map.insert(
            key,
            MacdTriples {
                daily: triple("日"),
                weekly: triple("週"),
                monthly: triple("月"),
            },
        );
    }

    let ma_default = MaValues::default();
    let streak_default = StreakValues::default();
    let mut merged = Vec::with_capacity(flow.rows.len());
    for row in &flow.rows {
        let quote = quote_key(&flow_cols, row, &flow_quote);
        let volume = flow_cols.text(row, flow_volume);
        let date = flow_cols.text(row, flow_date);

        let ma_values = ma_map
            .get(&MaJoinKey {
                quote: quote.clone(),
                volume: volume.clone(),
            })
            .unwrap_or(&ma_default);
        let streak_values = streak_map
            .get(&StreakJoinKey {
                flow_date: date.clone(),
                quote: quote.clone(),
            })
            .unwrap_or(&streak_default);
        let revenue_values = revenue_map.get(&quote);
        let macd_values = macd_map.get(&quote).copied().unwrap_or_default();

        merged.push(MergedStock {
            code: quote.code.clone(),
            name: quote.name.clone(),
            flow_date: if date.is_empty() { None } else { Some(date) },
            close: quote.close.clone(),
            change: quote.change.clone(),
            change_pct: table::coerce_numeric(&quote.change_pct).as_num(),
            volume_lots: table::coerce_numeric(&volume).as_num(),
            total_net_buy: flow_cols.coerced(row, "合計買賣超張數"),
            total_streak_days: streak_values.total,
            foreign_streak_days: streak_values.foreign,
            dealer_streak_days: streak_values.dealer,
            trust_streak_days: streak_values.trust,
            ma5: ma_values.ma5,
            ma10: ma_values.ma10,
            ma20: ma_values.ma20,
            ma60: ma_values.ma60,
            ma120: ma_values.ma120,
            ma240: ma_values.ma240,
            macd: macd_values,
            revenue: revenue_labels
                .iter()
                .enumerate()
                .map(|(i, label)| {
                    (
                        label.clone(),
                        revenue_values.and_then(|v| v.get(i).copied().flatten()),
                    )
                })
                .collect(),
        });
    }

    log::info!("merged dataset: {} records", merged.len());
    Ok((merged, revenue_labels.to_vec()))
}
