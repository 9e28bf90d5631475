use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

mod ai_service;
mod analyzer;
mod config;
mod fetcher;
mod indicators;
mod merger;
mod models;
mod notifier;
mod screener;
mod table;

use crate::ai_service::AiService;
use crate::analyzer::StockAnalyzer;
use crate::config::AppConfig;
use crate::fetcher::GoodinfoFetcher;
use crate::notifier::LineNotifier;

#[derive(Parser, Debug)]
#[command(name = "twstock-analyzer", version, about = "Taiwan stock screener and analyzer")]
struct Args {
    /// Analyze a single stock code instead of running the daily batch
    #[arg(long = "stock-id")]
    stock_id: Option<String>,
    /// Suppress all LINE notifications
    #[arg(long)]
    no_notification: bool,
    /// Path to a JSON config file (default: environment variables)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log verbosity
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    log_level: String,
}

/// Mirror every log line to stderr and the append-only daily log file.
struct Tee {
    file: std::fs::File,
    stderr: io::Stderr,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stderr.write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stderr.flush()?;
        self.file.flush()
    }
}

fn open_log_file() -> Option<std::fs::File> {
    std::fs::create_dir_all("logs").ok()?;
    let path = format!(
        "logs/twstock_{}.log",
        chrono::Local::now().format("%Y%m%d")
    );
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

fn init_logging(level: &str) {
    let filter = match level {
        "DEBUG" => LevelFilter::Debug,
        "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter);
    if let Some(file) = open_log_file() {
        builder.target(env_logger::Target::Pipe(Box::new(Tee {
            file,
            stderr: io::stderr(),
        })));
    }
    builder.init();
}

async fn run(analyzer: &StockAnalyzer, stock_id: Option<String>, notify: bool) {
    match stock_id {
        Some(stock_id) => {
            log::info!("single-stock analysis for {}", stock_id);
            let (bullish, analysis) = analyzer.analyze_stock(&stock_id).await;

            println!("\n=== 股票 {} 分析結果 ===", stock_id);
            println!("買入建議: {}", if bullish { "推薦買入" } else { "不建議買入" });
            println!("分析結果:\n{}", analysis);

            if bullish && notify {
                if let Err(e) = analyzer.notify_stock_analysis(&stock_id, &analysis).await {
                    log::error!("analysis not delivered: {}", e);
                }
            }
        }
        None => {
            log::info!("running daily batch");
            let summary = analyzer.run_daily(notify).await;
            println!("{}", analyzer.summary_report(&summary));
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        log::error!("{}", e);
        std::process::exit(1);
    }

    let analyzer = StockAnalyzer::new(
        Box::new(GoodinfoFetcher::new(config.fetch.clone())),
        Box::new(AiService::new(config.openai.clone())),
        Box::new(LineNotifier::new(config.line.clone())),
        config,
    );

    let code = tokio::select! {
        _ = run(&analyzer, args.stock_id, !args.no_notification) => 0,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, stopping");
            0
        }
    };
    std::process::exit(code);
}
