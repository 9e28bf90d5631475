use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Local};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};

use crate::config::FetchConfig;
use crate::models::{PipelineError, RawTable};

/// The five market-wide sheets of the smart-pick stock list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketCategory {
    CorporateFlow,
    MovingAverage,
    BuyStreak,
    Revenue,
    Macd,
}

impl MarketCategory {
    pub fn label(&self) -> &'static str {
        match self {
            MarketCategory::CorporateFlow => "法人買賣",
            MarketCategory::MovingAverage => "移動均線",
            MarketCategory::BuyStreak => "法人連續買賣",
            MarketCategory::Revenue => "營收狀況",
            MarketCategory::Macd => "MACD",
        }
    }

    /// SHEET parameter, percent-encoded as the site expects it.
    fn sheet(&self) -> &'static str {
        match self {
            MarketCategory::CorporateFlow | MarketCategory::BuyStreak => {
                "%E6%B3%95%E4%BA%BA%E8%B2%B7%E8%B3%A3_%E4%B8%89%E5%A4%A7"
            }
            MarketCategory::MovingAverage => "%E7%A7%BB%E5%8B%95%E5%9D%87%E7%B7%9A",
            MarketCategory::Revenue => {
                "%E7%87%9F%E6%94%B6%E7%8B%80%E6%B3%81_%E8%BF%91N%E5%80%8B%E6%9C%88%E4%B8%80%E8%A6%BD"
            }
            MarketCategory::Macd => "MACD",
        }
    }
}

const STOCK_LIST_BASE: &str = "https://goodinfo.tw/tw2/StockList.asp?SEARCH_WORD=\
&MARKET_CAT=%E6%99%BA%E6%85%A7%E9%81%B8%E8%82%A1\
&INDUSTRY_CAT=%E4%B8%89%E5%A4%A7%E6%B3%95%E4%BA%BA%E9%80%A3%E8%B2%B7+%E2%80%93+%E6%97%A5\
%40%40%E4%B8%89%E5%A4%A7%E6%B3%95%E4%BA%BA%E9%80%A3%E7%BA%8C%E8%B2%B7%E8%B6%85\
%40%40%E4%B8%89%E5%A4%A7%E6%B3%95%E4%BA%BA%E9%80%A3%E7%BA%8C%E8%B2%B7%E8%B6%85+%E2%80%93+%E6%97%A5\
&STOCK_CODE=&RANK=0&STEP=DATA";

/// SHEET2 selecting the consecutive buy/sell statistics view.
const BUY_STREAK_SHEET2: &str =
    "%E6%B3%95%E4%BA%BA%E9%80%A3%E8%B2%B7%E9%80%A3%E8%B3%A3%E7%B5%B1%E8%A8%88(%E6%97%A5)";

/// Fetch seam. The core consumes raw tables through this trait and assumes
/// every call may block for a while and may fail; there is no retry contract.
#[async_trait]
pub trait TableFetcher: Send + Sync {
    async fn fetch_market_table(&self, category: MarketCategory)
        -> Result<RawTable, PipelineError>;

    /// Daily K-chart table plus the stock name from the page title.
    async fn fetch_daily(
        &self,
        stock_id: &str,
        days: i64,
    ) -> Result<(RawTable, String), PipelineError>;

    /// Monthly revenue chart table.
    async fn fetch_monthly(&self, stock_id: &str) -> Result<RawTable, PipelineError>;
}

pub struct GoodinfoFetcher {
    client: Client,
    config: FetchConfig,
}

impl GoodinfoFetcher {
    pub fn new(config: FetchConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    async fn get_text(&self, url: &str) -> Result<String, PipelineError> {
        let mut request = self
            .client
            .get(url)
            .header("User-Agent", &self.config.user_agent);
        if let Some(cookie) = &self.config.cookie {
            request = request.header("Cookie", cookie);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Fetch(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(PipelineError::Fetch(format!("HTTP {}", response.status())));
        }
        response
            .text()
            .await
            .map_err(|e| PipelineError::Fetch(format!("body read failed: {}", e)))
    }
}

#[async_trait]
impl TableFetcher for GoodinfoFetcher {
    async fn fetch_market_table(
        &self,
        category: MarketCategory,
    ) -> Result<RawTable, PipelineError> {
        let url = match category {
            MarketCategory::BuyStreak => format!(
                "{}&SHEET={}&SHEET2={}",
                STOCK_LIST_BASE,
                category.sheet(),
                BUY_STREAK_SHEET2
            ),
            _ => format!("{}&SHEET={}", STOCK_LIST_BASE, category.sheet()),
        };
        let text = self.get_text(&url).await?;
        let table = parse_stock_list(&text).ok_or_else(|| {
            PipelineError::Fetch(format!("no #tblStockList in {} page", category.label()))
        })?;
        log::info!(
            "fetched {} sheet: {} rows",
            category.label(),
            table.rows.len()
        );
        Ok(table)
    }

    async fn fetch_daily(
        &self,
        stock_id: &str,
        days: i64,
    ) -> Result<(RawTable, String), PipelineError> {
        let today = Local::now().date_naive();
        let start = today - Duration::days(days);
        let url = format!(
            "https://goodinfo.tw/tw/ShowK_Chart.asp?STOCK_ID={}&CHT_CAT=DATE&PRICE_ADJ=F\
             &START_DT={}&END_DT={}",
            stock_id,
            start.format("%Y-%m-%d"),
            today.format("%Y-%m-%d")
        );
        let text = self.get_text(&url).await?;
        let table = parse_detail_table(&text, "#tblDetail").ok_or_else(|| {
            PipelineError::Fetch(format!("no #tblDetail for stock {}", stock_id))
        })?;
        let name = parse_stock_name(&text).unwrap_or_else(|| stock_id.to_string());
        log::info!("fetched daily table for {}: {} rows", stock_id, table.rows.len());
        Ok((table, name))
    }

    async fn fetch_monthly(&self, stock_id: &str) -> Result<RawTable, PipelineError> {
        let url = format!(
            "https://goodinfo.tw/tw/ShowSaleMonChart.asp?STOCK_ID={}",
            stock_id
        );
        let text = self.get_text(&url).await?;
        parse_detail_table(&text, "#tblDetail").ok_or_else(|| {
            PipelineError::Fetch(format!("no monthly #tblDetail for stock {}", stock_id))
        })
    }
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn cell_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("")
}

/// Stock-list sheets have a single header row; the site repeats it inside the
/// body every screenful, and those repeats survive here as ordinary data rows
/// for the normalizer's both-copies dedup to remove.
fn parse_stock_list(html: &str) -> Option<RawTable> {
    let document = Html::parse_document(html);
    let table = document.select(&selector("#tblStockList")).next()?;
    let row_sel = selector("tr");
    let cell_sel = selector("th, td");

    let mut rows_iter = table.select(&row_sel);
    let headers: Vec<String> = rows_iter
        .next()?
        .select(&cell_sel)
        .map(cell_text)
        .collect();
    if headers.is_empty() {
        return None;
    }

    let mut rows = Vec::new();
    for tr in rows_iter {
        let cells: Vec<String> = tr.select(&cell_sel).map(cell_text).collect();
        if cells.len() == headers.len() {
            rows.push(cells);
        }
    }
    Some(RawTable { headers, rows })
}

/// Per-stock detail tables stack their headers over two or more rows with
/// col/row spans. Flatten them into one name per column by joining the
/// unique stacked parts in order ("股價 / 收盤" stacked over a rowspan cell
/// collapses to "收盤").
fn parse_detail_table(html: &str, table_css: &str) -> Option<RawTable> {
    let document = Html::parse_document(html);
    let table = document.select(&selector(table_css)).next()?;
    let row_sel = selector("tr");
    let th_sel = selector("th");
    let td_sel = selector("td");

    let all_rows: Vec<ElementRef> = table.select(&row_sel).collect();
    let header_depth = all_rows
        .iter()
        .take_while(|tr| tr.select(&th_sel).next().is_some())
        .count();
    if header_depth == 0 {
        return None;
    }

    let header_grid: Vec<Vec<(String, usize, usize)>> = all_rows[..header_depth]
        .iter()
        .map(|tr| {
            tr.select(&th_sel)
                .map(|th| {
                    let span = |name: &str| {
                        th.value()
                            .attr(name)
                            .and_then(|v| v.parse::<usize>().ok())
                            .unwrap_or(1)
                            .max(1)
                    };
                    (cell_text(th), span("colspan"), span("rowspan"))
                })
                .collect()
        })
        .collect();
    let headers = flatten_headers(&header_grid);
    if headers.is_empty() {
        return None;
    }

    let mut rows = Vec::new();
    for tr in &all_rows[header_depth..] {
        // repeated in-body header rows carry th cells and collect no tds here
        let cells: Vec<String> = tr.select(&td_sel).map(cell_text).collect();
        if cells.len() == headers.len() {
            rows.push(cells);
        }
    }
    Some(RawTable { headers, rows })
}

/// Expand a stacked header block (text, colspan, rowspan per cell) into one
/// flat name per column: place every cell on a grid honoring its spans, then
/// join each column's distinct parts top-down.
fn flatten_headers(header_rows: &[Vec<(String, usize, usize)>]) -> Vec<String> {
    let depth = header_rows.len();
    let width: usize = match header_rows.first() {
        Some(row) => row.iter().map(|(_, colspan, _)| colspan).sum(),
        None => return Vec::new(),
    };

    let mut grid: Vec<Vec<Option<String>>> = vec![vec![None; width]; depth];
    for (r, row) in header_rows.iter().enumerate() {
        let mut c = 0;
        for (text, colspan, rowspan) in row {
            while c < width && grid[r][c].is_some() {
                c += 1;
            }
            for dr in 0..(*rowspan).min(depth - r) {
                for dc in 0..*colspan {
                    if c + dc < width {
                        grid[r + dr][c + dc] = Some(text.clone());
                    }
                }
            }
            c += colspan;
        }
    }

    (0..width)
        .map(|c| {
            let mut parts: Vec<String> = Vec::new();
            for r in 0..depth {
                if let Some(text) = &grid[r][c] {
                    if !text.is_empty() && !parts.contains(text) {
                        parts.push(text.clone());
                    }
                }
            }
            crate::table::clean_header(&parts.concat())
        })
        .collect()
}

/// "2330 台積電 - Goodinfo!..." → "台積電".
fn parse_stock_name(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let title = document.select(&selector("title")).next()?;
    let text = cell_text(title);
    text.split_whitespace().nth(1).map(|s| s.to_string())
}

/// Deterministic fetcher for tests; tables are injected per category.
#[derive(Default)]
pub struct MockFetcher {
    pub market_tables: HashMap<MarketCategory, RawTable>,
    pub daily: RawTable,
    pub monthly: RawTable,
    pub stock_name: String,
}

#[async_trait]
impl TableFetcher for MockFetcher {
    async fn fetch_market_table(
        &self,
        category: MarketCategory,
    ) -> Result<RawTable, PipelineError> {
        self.market_tables
            .get(&category)
            .cloned()
            .ok_or_else(|| PipelineError::Fetch(format!("no mock {} sheet", category.label())))
    }

    async fn fetch_daily(
        &self,
        _stock_id: &str,
        _days: i64,
    ) -> Result<(RawTable, String), PipelineError> {
        Ok((self.daily.clone(), self.stock_name.clone()))
    }

    async fn fetch_monthly(&self, _stock_id: &str) -> Result<RawTable, PipelineError> {
        Ok(self.monthly.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stock_list_with_repeated_header() {
        let html = r#"<html><body><table id="tblStockList">
            <tr><th>代號</th><th>名稱</th><th>成交</th></tr>
            <tr><td>2330</td><td>台積電</td><td>812</td></tr>
            <tr><th>代號</th><th>名稱</th><th>成交</th></tr>
            <tr><td>2317</td><td>鴻海</td><td>105.5</td></tr>
        </table></body></html>"#;
        let table = parse_stock_list(html).unwrap();
        assert_eq!(table.headers, vec!["代號", "名稱", "成交"]);
        // the repeated header row comes through as data for dedup to handle
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0], vec!["2330", "台積電", "812"]);
    }

    #[test]
    fn test_parse_detail_table_flattens_stacked_headers() {
        let html = r#"<html><head><title>2330 台積電 - Goodinfo</title></head>
        <body><table id="tblDetail">
            <tr><th rowspan="2">交易日期</th><th colspan="4">股價</th></tr>
            <tr><th>開盤</th><th>最高</th><th>最低</th><th>收盤</th></tr>
            <tr><td>'24/06/03</td><td>810</td><td>815</td><td>805</td><td>812</td></tr>
        </table></body></html>"#;
        let table = parse_detail_table(html, "#tblDetail").unwrap();
        assert_eq!(
            table.headers,
            vec!["交易日期", "股價開盤", "股價最高", "股價最低", "股價收盤"]
        );
        assert_eq!(table.rows.len(), 1);
        assert_eq!(parse_stock_name(html).as_deref(), Some("台積電"));
    }

    #[test]
    fn test_flatten_headers_collapses_rowspan_duplicates() {
        let grid = vec![
            vec![("交易日期".to_string(), 1, 2), ("收盤".to_string(), 1, 2)],
            vec![],
        ];
        assert_eq!(flatten_headers(&grid), vec!["交易日期", "收盤"]);
    }
}
