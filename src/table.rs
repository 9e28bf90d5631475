use std::collections::{HashMap, HashSet};

use crate::models::{Cell, NormalizedTable, PipelineError, RawTable};

/// Trend glyphs goodinfo appends to numeric cells.
const TREND_GLYPHS: [char; 3] = ['↗', '↘', '→'];

/// Trim and collapse internal double-space runs, as the source headers carry
/// both padding and line-break artifacts.
pub fn clean_header(raw: &str) -> String {
    raw.trim().replace("  ", "")
}

pub fn strip_trend_glyphs(value: &str) -> String {
    let mut out = value.to_string();
    for g in TREND_GLYPHS {
        out = out.replace(g, "");
    }
    out
}

/// Glyph-strip then parse a cell as f64. Thousands separators are dropped
/// (the source renders volumes as "1,234"). Failure is `Null`, never an
/// error.
pub fn coerce_numeric(value: &str) -> Cell {
    let cleaned = strip_trend_glyphs(value);
    let cleaned = cleaned.trim().replace(',', "");
    if cleaned.is_empty() {
        return Cell::Null;
    }
    match cleaned.parse::<f64>() {
        Ok(v) => Cell::Num(v),
        Err(_) => Cell::Null,
    }
}

/// Normalize one raw extract: clean headers, coerce the declared numeric
/// columns (glyph-stripped, failure → `Null`), keep everything else as
/// trimmed text, then drop every row that has an exact duplicate elsewhere
/// (both copies removed; repeated in-body header rows die here).
///
/// Ragged input is a recoverable `Parse` error; callers degrade to an empty
/// table.
pub fn normalize(
    raw: &RawTable,
    numeric_columns: &[&str],
) -> Result<NormalizedTable, PipelineError> {
    let headers: Vec<String> = raw.headers.iter().map(|h| clean_header(h)).collect();

    for (i, row) in raw.rows.iter().enumerate() {
        if row.len() != headers.len() {
            return Err(PipelineError::Parse(format!(
                "row {} has {} cells, header has {}",
                i,
                row.len(),
                headers.len()
            )));
        }
    }

    let numeric: HashSet<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| numeric_columns.contains(&h.as_str()))
        .map(|(i, _)| i)
        .collect();

    let rows: Vec<Vec<Cell>> = raw
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, value)| {
                    if numeric.contains(&i) {
                        coerce_numeric(value)
                    } else {
                        Cell::Text(value.trim().to_string())
                    }
                })
                .collect()
        })
        .collect();

    Ok(NormalizedTable {
        headers,
        rows: drop_duplicate_rows(rows),
    })
}

/// Remove every row whose full cell signature occurs more than once. Unlike
/// keep-first dedup, all copies go.
fn drop_duplicate_rows(rows: Vec<Vec<Cell>>) -> Vec<Vec<Cell>> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let signatures: Vec<String> = rows.iter().map(|r| row_signature(r)).collect();
    for sig in &signatures {
        *counts.entry(sig.clone()).or_insert(0) += 1;
    }
    rows.into_iter()
        .zip(signatures)
        .filter(|(_, sig)| counts[sig] == 1)
        .map(|(row, _)| row)
        .collect()
}

fn row_signature(row: &[Cell]) -> String {
    row.iter()
        .map(|c| c.render())
        .collect::<Vec<_>>()
        .join("\u{1}")
}

/// Rewrite revenue sheet headers of the form "<yy>M<mm>...營收(億)" to
/// "20<yy>年<m>月營收 (億)" (month without a leading zero). Anything else
/// passes through unchanged.
pub fn relabel_revenue_columns(headers: &[String]) -> Vec<String> {
    headers.iter().map(|h| relabel_one(h)).collect()
}

fn relabel_one(header: &str) -> String {
    let b = header.as_bytes();
    if header.ends_with("營收(億)")
        && b.len() >= 5
        && b[0].is_ascii_digit()
        && b[1].is_ascii_digit()
        && b[2] == b'M'
        && b[3].is_ascii_digit()
        && b[4].is_ascii_digit()
    {
        if let Ok(month) = header[3..5].parse::<u32>() {
            return format!("20{}年{}月營收 (億)", &header[0..2], month);
        }
    }
    header.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn test_glyph_stripping_coercion() {
        assert_eq!(coerce_numeric("12.3↗"), Cell::Num(12.3));
        assert_eq!(coerce_numeric("5↘"), Cell::Num(5.0));
        assert_eq!(coerce_numeric("0→"), Cell::Num(0.0));
        assert_eq!(coerce_numeric("1,234"), Cell::Num(1234.0));
        assert_eq!(coerce_numeric("-"), Cell::Null);
        assert_eq!(coerce_numeric(""), Cell::Null);
    }

    #[test]
    fn test_header_cleanup() {
        assert_eq!(clean_header("  漲跌幅  "), "漲跌幅");
        assert_eq!(clean_header("合計  買賣超張數"), "合計買賣超張數");
    }

    #[test]
    fn test_duplicate_rows_both_removed() {
        let t = raw(
            &["代號", "名稱"],
            &[&["2330", "台積電"], &["2317", "鴻海"], &["2330", "台積電"]],
        );
        let n = normalize(&t, &[]).unwrap();
        assert_eq!(n.rows.len(), 1);
        assert_eq!(n.rows[0][0], Cell::Text("2317".into()));
    }

    #[test]
    fn test_normalize_is_idempotent_on_numeric_columns() {
        let t = raw(&["代號", "漲跌幅"], &[&["2330", "1.5↗"], &["2317", "x"]]);
        let once = normalize(&t, &["漲跌幅"]).unwrap();
        let back = RawTable {
            headers: once.headers.clone(),
            rows: once
                .rows
                .iter()
                .map(|r| r.iter().map(|c| c.render()).collect())
                .collect(),
        };
        let twice = normalize(&back, &["漲跌幅"]).unwrap();
        assert_eq!(once.rows, twice.rows);
    }

    #[test]
    fn test_ragged_rows_are_a_parse_error() {
        let t = raw(&["代號", "名稱"], &[&["2330"]]);
        assert!(matches!(
            normalize(&t, &[]),
            Err(PipelineError::Parse(_))
        ));
    }

    #[test]
    fn test_revenue_relabeling() {
        let headers: Vec<String> = vec![
            "24M06營收(億)".into(),
            "25M01營收(億)".into(),
            "名稱".into(),
        ];
        let out = relabel_revenue_columns(&headers);
        assert_eq!(out[0], "2024年6月營收 (億)");
        assert_eq!(out[1], "2025年1月營收 (億)");
        assert_eq!(out[2], "名稱");
    }
}
