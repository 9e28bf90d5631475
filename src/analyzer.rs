use crate::ai_service::Narrator;
use crate::config::AppConfig;
use crate::fetcher::{MarketCategory, TableFetcher};
use crate::models::{DailyBar, DailySummary, MergedStock, MonthlyRow, NormalizedTable};
use crate::notifier::Notifier;
use crate::{indicators, merger, notifier, screener, table};

/// The reply for a stock that fails the technical entry conditions.
pub const NOT_BULLISH_REPLY: &str = "不符合技術面買入條件";

/// Orchestrates one screening/analysis run over the fetch, narrative and
/// notification seams. Everything runs sequentially; a failing stage degrades
/// (empty table, empty merge, fallback narrative) and the batch continues.
pub struct StockAnalyzer {
    fetcher: Box<dyn TableFetcher>,
    narrator: Box<dyn Narrator>,
    notifier: Box<dyn Notifier>,
    config: AppConfig,
}

impl StockAnalyzer {
    pub fn new(
        fetcher: Box<dyn TableFetcher>,
        narrator: Box<dyn Narrator>,
        notifier: Box<dyn Notifier>,
        config: AppConfig,
    ) -> Self {
        Self {
            fetcher,
            narrator,
            notifier,
            config,
        }
    }

    /// Fetch and normalize one market sheet, degrading to an empty table.
    async fn market_table(&self, category: MarketCategory) -> NormalizedTable {
        let raw = match self.fetcher.fetch_market_table(category).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("{} sheet unavailable: {}", category.label(), e);
                return NormalizedTable::default();
            }
        };
        if raw.is_empty() {
            log::warn!("{} sheet came back empty", category.label());
        }
        match table::normalize(&raw, &[]) {
            Ok(normalized) => normalized,
            Err(e) => {
                log::warn!("{} sheet unusable: {}", category.label(), e);
                NormalizedTable::default()
            }
        }
    }

    /// Market-wide screen: five sheets → merge → predicate set. A merge
    /// failure yields an empty selection, never an error.
    pub async fn screen_market(&self) -> (Vec<MergedStock>, Vec<String>) {
        log::info!("running market screen");
        let flow = self.market_table(MarketCategory::CorporateFlow).await;
        let revenue = self.market_table(MarketCategory::Revenue).await;
        let ma = self.market_table(MarketCategory::MovingAverage).await;
        let macd = self.market_table(MarketCategory::Macd).await;
        let streak = self.market_table(MarketCategory::BuyStreak).await;

        let labels = self
            .config
            .expected_revenue_labels(chrono::Local::now().date_naive());
        if flow.is_empty() {
            log::warn!("corporate-flow sheet is empty; the screen will select nothing");
        }
        let (merged, _) = match merger::merge(&flow, &ma, &streak, &revenue, &macd, &labels) {
            Ok(result) => result,
            Err(e) => {
                log::error!("merge failed: {}", e);
                return (Vec::new(), Vec::new());
            }
        };

        let (selected, codes) = screener::screen(&merged, &self.config.screening);
        log::info!(
            "market screen done: {} of {} records selected, {} analyzable codes",
            selected.len(),
            merged.len(),
            codes.len()
        );
        (selected, codes)
    }

    /// Per-stock flow: daily series → indicators → bullish test; bullish
    /// stocks additionally get the monthly revenue sheet and a narrative.
    pub async fn analyze_stock(&self, stock_id: &str) -> (bool, String) {
        log::info!("analyzing stock {}", stock_id);
        let (bars, stock_name) = self.daily_series(stock_id).await;
        let Some(latest) = bars.first() else {
            log::warn!("no daily data for {}", stock_id);
            return (false, NOT_BULLISH_REPLY.to_string());
        };

        if !screener::is_bullish(latest) {
            log::info!("stock {} does not meet entry conditions", stock_id);
            return (false, NOT_BULLISH_REPLY.to_string());
        }

        let monthly = self.monthly_series(stock_id).await;
        let title = if stock_name.is_empty() {
            stock_id.to_string()
        } else {
            format!("{} {}", stock_id, stock_name)
        };
        let dataset = render_dataset(&title, &bars, &monthly);
        let analysis = self.narrator.generate_analysis(&dataset).await;
        log::info!("stock {} meets entry conditions", stock_id);
        (true, analysis)
    }

    async fn daily_series(&self, stock_id: &str) -> (Vec<DailyBar>, String) {
        let (raw, name) = match self
            .fetcher
            .fetch_daily(stock_id, self.config.fetch.lookback_days)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                log::warn!("daily fetch for {} failed: {}", stock_id, e);
                return (Vec::new(), String::new());
            }
        };
        // every column except the date is numeric on this sheet
        let numeric: Vec<String> = raw
            .headers
            .iter()
            .map(|h| table::clean_header(h))
            .filter(|h| h != "交易日期")
            .collect();
        let numeric_refs: Vec<&str> = numeric.iter().map(String::as_str).collect();
        match table::normalize(&raw, &numeric_refs) {
            Ok(normalized) => (
                indicators::enrich(DailyBar::series_from(&normalized)),
                name,
            ),
            Err(e) => {
                log::warn!("daily table for {} unusable: {}", stock_id, e);
                (Vec::new(), name)
            }
        }
    }

    async fn monthly_series(&self, stock_id: &str) -> Vec<MonthlyRow> {
        let raw = match self.fetcher.fetch_monthly(stock_id).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("monthly fetch for {} failed: {}", stock_id, e);
                return Vec::new();
            }
        };
        let numeric: Vec<String> = raw
            .headers
            .iter()
            .map(|h| table::clean_header(h))
            .filter(|h| h != "月別")
            .collect();
        let numeric_refs: Vec<&str> = numeric.iter().map(String::as_str).collect();
        match table::normalize(&raw, &numeric_refs) {
            Ok(normalized) => MonthlyRow::series_from(&normalized),
            Err(e) => {
                log::warn!("monthly table for {} unusable: {}", stock_id, e);
                Vec::new()
            }
        }
    }

    /// Full daily batch: screen, push the digest, then analyze each candidate
    /// sequentially. One stock failing never aborts the rest.
    pub async fn run_daily(&self, notify: bool) -> DailySummary {
        let (selected, codes) = self.screen_market().await;
        let mut summary = DailySummary {
            total_screened: selected.len(),
            ..DailySummary::default()
        };

        if notify && !selected.is_empty() {
            let date = selected[0]
                .flow_date
                .clone()
                .unwrap_or_else(|| "N/A".to_string());
            match notifier::send_screen_summary(self.notifier.as_ref(), &selected, &date).await {
                Ok(()) => summary.notification_sent = true,
                Err(e) => log::error!("screen summary not delivered: {}", e),
            }
        }

        for code in &codes {
            let (bullish, analysis) = self.analyze_stock(code).await;
            if !bullish {
                continue;
            }
            summary.qualified.push(code.clone());
            if notify {
                if let Err(e) =
                    notifier::send_stock_analysis(self.notifier.as_ref(), code, &analysis).await
                {
                    log::error!("analysis for {} not delivered: {}", code, e);
                }
            }
            summary.analyses.push((code.clone(), analysis));
        }

        log::info!(
            "daily run complete: {} analyzed, {} qualified",
            codes.len(),
            summary.qualified.len()
        );
        summary
    }

    /// Push one stock's analysis through the notification seam (single-stock
    /// CLI path).
    pub async fn notify_stock_analysis(
        &self,
        stock_id: &str,
        analysis: &str,
    ) -> Result<(), crate::models::PipelineError> {
        notifier::send_stock_analysis(self.notifier.as_ref(), stock_id, analysis).await
    }

    pub fn summary_report(&self, summary: &DailySummary) -> String {
        format!(
            "=== 每日股票分析報告 ===\n\n\
             📊 篩選結果:\n\
             • 符合初步條件股票: {} 支\n\
             • 符合買入條件股票: {} 支\n\n\
             🎯 推薦買入股票:\n{}\n\n\
             📱 通知狀態:\n{}\n\n\
             =========================",
            summary.total_screened,
            summary.qualified.len(),
            if summary.qualified.is_empty() {
                "無".to_string()
            } else {
                summary.qualified.join(", ")
            },
            if summary.notification_sent {
                "已發送LINE通知"
            } else {
                "未發送通知"
            }
        )
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

/// Render the enriched daily series (latest first) and the monthly revenue
/// rows as the plain-text dataset the narrative service reads.
pub fn render_dataset(title: &str, bars: &[DailyBar], monthly: &[MonthlyRow]) -> String {
    let mut out = format!("股票 {} 日線技術指標 (最新在前):\n", title);
    out.push_str("交易日期 | 收盤 | 漲跌(%) | 成交張數 | MA5 | MA20 | DIF | SIGNAL | MACD | OSC\n");
    for bar in bars {
        out.push_str(&format!(
            "{} | {} | {} | {} | {} | {} | {} | {} | {} | {}\n",
            bar.date.format("%Y-%m-%d"),
            fmt_opt(bar.close),
            fmt_opt(bar.change_pct),
            fmt_opt(bar.volume_lots),
            fmt_opt(bar.ma5),
            fmt_opt(bar.ma20),
            fmt_opt(bar.dif),
            fmt_opt(bar.signal),
            fmt_opt(bar.macd),
            fmt_opt(bar.osc),
        ));
    }

    if !monthly.is_empty() {
        out.push_str("\n月營收狀況:\n");
        out.push_str("月別 | 收盤 | 單月營收(億) | 月增(%) | 年增(%) | 累計營收(億) | 累計年增(%)\n");
        for row in monthly {
            out.push_str(&format!(
                "{} | {} | {} | {} | {} | {} | {}\n",
                row.month.format("%Y/%m"),
                fmt_opt(row.close),
                fmt_opt(row.revenue),
                fmt_opt(row.mom_pct),
                fmt_opt(row.yoy_pct),
                fmt_opt(row.cumulative_revenue),
                fmt_opt(row.cumulative_yoy_pct),
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_service::Narrator;
    use crate::config::{AppConfig, FetchConfig, LineConfig, OpenAiConfig};
    use crate::fetcher::MockFetcher;
    use crate::models::{PipelineError, RawTable, ScreeningConditions};
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct CannedNarrator;

    #[async_trait]
    impl Narrator for CannedNarrator {
        async fn generate_analysis(&self, _dataset: &str) -> String {
            "建議分批佈局".to_string()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn push_text(&self, text: &str) -> Result<(), PipelineError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn test_config() -> AppConfig {
        AppConfig {
            line: LineConfig {
                user_id: "U0".into(),
                channel_secret: String::new(),
                channel_access_token: "token".into(),
            },
            openai: OpenAiConfig {
                api_key: "sk-test".into(),
                base_url: "http://localhost".into(),
                model: "gpt-4o-mini".into(),
                timeout_seconds: 1,
            },
            fetch: FetchConfig::default(),
            screening: ScreeningConditions::default(),
            revenue_labels: Some(vec!["2024年6月營收 (億)".into()]),
        }
    }

    fn raw(headers: &[&str], rows: Vec<Vec<String>>) -> RawTable {
        RawTable {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }

    fn str_rows(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    /// 60 rising closes → MA5 > MA20, DIF > SIGNAL, MACD and OSC positive.
    fn rising_daily_table() -> RawTable {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows = (0..60)
            .map(|i| {
                vec![
                    (start + Duration::days(i)).format("'%y/%m/%d").to_string(),
                    format!("{}", 100 + i),
                ]
            })
            .collect();
        raw(&["交易日期", "收盤"], rows)
    }

    fn market_tables() -> HashMap<MarketCategory, RawTable> {
        let quote = ["2330", "台積電", "812", "+12", "1.5"];
        let mut tables = HashMap::new();
        tables.insert(
            MarketCategory::CorporateFlow,
            raw(
                &["代號", "名稱", "成交", "漲跌價", "漲跌幅", "成交張數", "法人買賣日期", "合計買賣超張數"],
                str_rows(&[&[quote[0], quote[1], quote[2], quote[3], quote[4], "30,000", "06/03", "5,000"]]),
            ),
        );
        tables.insert(
            MarketCategory::MovingAverage,
            raw(
                &["代號", "名稱", "成交", "漲跌價", "漲跌幅", "成交張數", "5日均線", "20日均線", "60日均線"],
                str_rows(&[&[quote[0], quote[1], quote[2], quote[3], quote[4], "30,000", "810↗", "800↗", "790↗"]]),
            ),
        );
        tables.insert(
            MarketCategory::BuyStreak,
            raw(
                &["法人買賣日期", "代號", "名稱", "成交", "漲跌價", "漲跌幅", "三大法人連續買賣日數", "外資連續買賣日數", "自營商連續買賣日數", "投信連續買賣日數"],
                str_rows(&[&["06/03", quote[0], quote[1], quote[2], quote[3], quote[4], "6", "6", "1", "2"]]),
            ),
        );
        tables.insert(
            MarketCategory::Revenue,
            raw(
                &["代號", "名稱", "成交", "漲跌價", "漲跌幅", "24M06營收(億)"],
                str_rows(&[&[quote[0], quote[1], quote[2], quote[3], quote[4], "250.3"]]),
            ),
        );
        tables.insert(
            MarketCategory::Macd,
            raw(
                &["代號", "名稱", "成交", "漲跌價", "漲跌幅", "DIF(日)", "MACD(日)", "OSC(日)"],
                str_rows(&[&[quote[0], quote[1], quote[2], quote[3], quote[4], "2.0", "1.0", "1.0"]]),
            ),
        );
        tables
    }

    fn analyzer_with(fetcher: MockFetcher) -> (StockAnalyzer, &'static RecordingNotifier) {
        let notifier: &'static RecordingNotifier =
            Box::leak(Box::new(RecordingNotifier::default()));
        let analyzer = StockAnalyzer::new(
            Box::new(fetcher),
            Box::new(CannedNarrator),
            Box::new(RelayNotifier(notifier)),
            test_config(),
        );
        (analyzer, notifier)
    }

    struct RelayNotifier(&'static RecordingNotifier);

    #[async_trait]
    impl Notifier for RelayNotifier {
        async fn push_text(&self, text: &str) -> Result<(), PipelineError> {
            self.0.push_text(text).await
        }
    }

    #[tokio::test]
    async fn test_run_daily_screens_analyzes_and_notifies() {
        let fetcher = MockFetcher {
            market_tables: market_tables(),
            daily: rising_daily_table(),
            monthly: RawTable::default(),
            stock_name: "台積電".into(),
        };
        let (analyzer, notifier) = analyzer_with(fetcher);

        let summary = analyzer.run_daily(true).await;
        assert_eq!(summary.total_screened, 1);
        assert_eq!(summary.qualified, vec!["2330"]);
        assert!(summary.notification_sent);
        assert_eq!(summary.analyses[0].1, "建議分批佈局");

        let sent = notifier.sent.lock().unwrap();
        // screen digest first, then the per-stock analysis
        assert!(sent[0].contains("符合條件的股票"));
        assert!(sent[1].contains("股票 2330 詳細分析"));
    }

    #[tokio::test]
    async fn test_run_daily_without_notifications() {
        let fetcher = MockFetcher {
            market_tables: market_tables(),
            daily: rising_daily_table(),
            monthly: RawTable::default(),
            stock_name: "台積電".into(),
        };
        let (analyzer, notifier) = analyzer_with(fetcher);

        let summary = analyzer.run_daily(false).await;
        assert_eq!(summary.qualified, vec!["2330"]);
        assert!(!summary.notification_sent);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_analyze_stock_with_too_little_data_is_not_bullish() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows = (0..3)
            .map(|i| {
                vec![
                    (start + Duration::days(i)).format("'%y/%m/%d").to_string(),
                    "100".to_string(),
                ]
            })
            .collect();
        let fetcher = MockFetcher {
            market_tables: HashMap::new(),
            daily: raw(&["交易日期", "收盤"], rows),
            monthly: RawTable::default(),
            stock_name: "台積電".into(),
        };
        let (analyzer, _) = analyzer_with(fetcher);

        let (bullish, reply) = analyzer.analyze_stock("2330").await;
        assert!(!bullish);
        assert_eq!(reply, NOT_BULLISH_REPLY);
    }

    #[tokio::test]
    async fn test_failed_market_fetch_degrades_to_empty_screen() {
        let fetcher = MockFetcher::default();
        let (analyzer, _) = analyzer_with(fetcher);
        let (selected, codes) = analyzer.screen_market().await;
        assert!(selected.is_empty());
        assert!(codes.is_empty());
    }

    #[test]
    fn test_render_dataset_includes_monthly_section() {
        let mut bar = DailyBar::new(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        bar.close = Some(812.0);
        let monthly = vec![MonthlyRow {
            month: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            open: None,
            close: Some(800.0),
            high: None,
            low: None,
            change: None,
            change_pct: None,
            revenue: Some(250.3),
            mom_pct: Some(3.1),
            yoy_pct: Some(30.0),
            cumulative_revenue: None,
            cumulative_yoy_pct: None,
        }];
        let text = render_dataset("2330", &[bar], &monthly);
        assert!(text.contains("股票 2330"));
        assert!(text.contains("2024-06-03"));
        assert!(text.contains("月營收狀況"));
        assert!(text.contains("250.30"));
    }
}
