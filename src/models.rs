use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage-boundary failures. Every variant except `Config` is recovered where
/// it surfaces: the orchestrator degrades to an empty table, an empty merged
/// set, a fallback narrative or a skipped notification and the batch goes on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("merge failed: {0}")]
    Merge(String),
    #[error("narrative service failed: {0}")]
    Narrative(String),
    #[error("notification failed: {0}")]
    Notification(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Untyped rectangular extract as scraped, rows in source order.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A single value after normalization. `Null` is the explicit missing
/// representation for cells that failed numeric coercion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Cell {
    Text(String),
    Num(f64),
    Null,
}

impl Cell {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Cell::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical rendering, used for duplicate-row signatures and display.
    pub fn render(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Num(v) => format!("{}", v),
            Cell::Null => String::new(),
        }
    }
}

/// A `RawTable` after header cleanup, declared-column coercion and
/// both-copies deduplication. Declared numeric columns hold only `Num` or
/// `Null`.
#[derive(Debug, Clone, Default)]
pub struct NormalizedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl NormalizedTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn cell<'a>(&self, row: &'a [Cell], name: &str) -> Option<&'a Cell> {
        self.column(name).and_then(|idx| row.get(idx))
    }
}

/// One MACD triple as carried by the market MACD sheet.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MacdTriple {
    pub dif: Option<f64>,
    pub macd: Option<f64>,
    pub osc: Option<f64>,
}

/// Daily / weekly / monthly MACD triples.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MacdTriples {
    pub daily: MacdTriple,
    pub weekly: MacdTriple,
    pub monthly: MacdTriple,
}

/// One wide record per stock after the five-table merge. Join keys stay as
/// scraped text (成交 / 漲跌價 compare raw); everything downstream of the
/// coercion pass is `Option<f64>`. Missing joins leave `None`, never drop the
/// row.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergedStock {
    pub code: String,
    pub name: String,
    pub flow_date: Option<String>,
    /// 成交, raw text
    pub close: String,
    /// 漲跌價, raw text
    pub change: String,
    /// 漲跌幅
    pub change_pct: Option<f64>,
    /// 成交張數
    pub volume_lots: Option<f64>,
    /// 合計買賣超張數
    pub total_net_buy: Option<f64>,
    /// 三大法人連續買賣日數
    pub total_streak_days: Option<f64>,
    /// 外資連續買賣日數
    pub foreign_streak_days: Option<f64>,
    /// 自營商連續買賣日數
    pub dealer_streak_days: Option<f64>,
    /// 投信連續買賣日數
    pub trust_streak_days: Option<f64>,
    pub ma5: Option<f64>,
    pub ma10: Option<f64>,
    pub ma20: Option<f64>,
    pub ma60: Option<f64>,
    pub ma120: Option<f64>,
    pub ma240: Option<f64>,
    pub macd: MacdTriples,
    /// Month-labeled revenue cells, one per expected label
    /// ("<year>年<month>月營收 (億)"), `None` when the sheet lacks the month.
    pub revenue: Vec<(String, Option<f64>)>,
}

/// One trading day of a per-stock series plus derived indicator columns.
/// Ascending by date while indicators are computed, descending (row 0 =
/// latest) once handed to the screening step.
#[derive(Debug, Clone, Serialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
    pub volume_lots: Option<f64>,
    pub foreign_net: Option<f64>,
    pub trust_net: Option<f64>,
    pub dealer_net: Option<f64>,
    pub foreign_holding_pct: Option<f64>,
    pub ma5: Option<f64>,
    pub ma20: Option<f64>,
    pub dif: Option<f64>,
    pub signal: Option<f64>,
    pub macd: Option<f64>,
    pub osc: Option<f64>,
}

impl DailyBar {
    pub fn new(date: NaiveDate) -> Self {
        DailyBar {
            date,
            open: None,
            high: None,
            low: None,
            close: None,
            change: None,
            change_pct: None,
            volume_lots: None,
            foreign_net: None,
            trust_net: None,
            dealer_net: None,
            foreign_holding_pct: None,
            ma5: None,
            ma20: None,
            dif: None,
            signal: None,
            macd: None,
            osc: None,
        }
    }

    /// Build a dated series from a normalized ShowK_Chart table. Rows whose
    /// 交易日期 cell does not parse ('yy/mm/dd, served with a leading
    /// apostrophe) are skipped.
    pub fn series_from(table: &NormalizedTable) -> Vec<DailyBar> {
        let mut bars = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let Some(date) = table
                .cell(row, "交易日期")
                .and_then(|c| c.as_text())
                .and_then(parse_tw_date)
            else {
                continue;
            };
            let num = |name: &str| table.cell(row, name).and_then(|c| c.as_num());
            let mut bar = DailyBar::new(date);
            bar.open = num("開盤");
            bar.high = num("最高");
            bar.low = num("最低");
            bar.close = num("收盤");
            bar.change = num("漲跌");
            bar.change_pct = num("漲跌(%)");
            bar.volume_lots = num("成交張數").or_else(|| num("張數"));
            bar.foreign_net = num("外資買賣超(千張)");
            bar.trust_net = num("投信買賣超(千張)");
            bar.dealer_net = num("自營買賣超(千張)");
            bar.foreign_holding_pct = num("外資持股(%)");
            bars.push(bar);
        }
        bars
    }
}

/// "'23/06/16" or "23/06/16" → 2023-06-16.
fn parse_tw_date(raw: &str) -> Option<NaiveDate> {
    let cleaned = raw.trim().trim_start_matches('\'');
    NaiveDate::parse_from_str(cleaned, "%y/%m/%d").ok()
}

/// One month of the per-stock revenue chart (ShowSaleMonChart). Columns are
/// positional on that sheet; see `series_from`.
#[derive(Debug, Clone, Serialize)]
pub struct MonthlyRow {
    pub month: NaiveDate,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
    /// 單月營收(億)
    pub revenue: Option<f64>,
    /// 單月月增(%)
    pub mom_pct: Option<f64>,
    /// 單月年增(%)
    pub yoy_pct: Option<f64>,
    /// 累計營收(億)
    pub cumulative_revenue: Option<f64>,
    /// 累計年增(%)
    pub cumulative_yoy_pct: Option<f64>,
}

/// Column count of the monthly revenue sheet: 月別, six price columns, five
/// standalone-revenue columns, five consolidated-revenue columns.
const MONTHLY_SHEET_WIDTH: usize = 17;

impl MonthlyRow {
    /// Build a monthly series from a normalized ShowSaleMonChart table. The
    /// sheet is mapped positionally; an unexpected width yields an empty
    /// series rather than misaligned fields.
    pub fn series_from(table: &NormalizedTable) -> Vec<MonthlyRow> {
        if table.headers.is_empty() {
            return Vec::new();
        }
        if table.headers.len() != MONTHLY_SHEET_WIDTH {
            log::warn!(
                "unexpected monthly sheet width {} (want {})",
                table.headers.len(),
                MONTHLY_SHEET_WIDTH
            );
            return Vec::new();
        }
        let mut rows = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let Some(month) = row
                .first()
                .and_then(|c| c.as_text())
                .and_then(|s| {
                    NaiveDate::parse_from_str(&format!("{}/01", s.trim()), "%Y/%m/%d").ok()
                })
            else {
                continue;
            };
            let num = |idx: usize| row.get(idx).and_then(|c| c.as_num());
            rows.push(MonthlyRow {
                month,
                open: num(1),
                close: num(2),
                high: num(3),
                low: num(4),
                change: num(5),
                change_pct: num(6),
                revenue: num(7),
                mom_pct: num(8),
                yoy_pct: num(9),
                cumulative_revenue: num(10),
                cumulative_yoy_pct: num(11),
            });
        }
        rows
    }
}

/// Market-screen thresholds. Defaults follow the daily screening rules; any
/// subset can be overridden from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConditions {
    /// 合計買賣超張數 must exceed this
    pub min_net_buy_lots: f64,
    /// 外資連續買賣日數 threshold (OR-group)
    pub min_foreign_streak_days: f64,
    /// 自營商連續買賣日數 threshold (OR-group)
    pub min_dealer_streak_days: f64,
    /// 投信連續買賣日數 threshold (OR-group)
    pub min_trust_streak_days: f64,
    /// 漲跌幅 must exceed this
    pub min_change_pct: f64,
    /// 成交張數 floor
    pub min_volume_lots: f64,
    pub require_ma5_above_ma20: bool,
    pub require_ma20_above_ma60: bool,
}

impl Default for ScreeningConditions {
    fn default() -> Self {
        ScreeningConditions {
            min_net_buy_lots: 0.0,
            min_foreign_streak_days: 5.0,
            min_dealer_streak_days: 3.0,
            min_trust_streak_days: 3.0,
            min_change_pct: 0.0,
            min_volume_lots: 5000.0,
            require_ma5_above_ma20: true,
            require_ma20_above_ma60: true,
        }
    }
}

/// Result of one daily screen-then-analyze batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DailySummary {
    pub total_screened: usize,
    pub qualified: Vec<String>,
    pub analyses: Vec<(String, String)>,
    pub notification_sent: bool,
}
