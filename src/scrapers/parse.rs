//! Payload parsers injected into the adapters.
//!
//! Adapters only depend on `QuoteParser`; the implementations here cover
//! the JSON API envelope, pipe-delimited rows extracted by a rendered page,
//! and plain `<tr>/<td>` tables. Column positions come from configuration.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ParseFailure;
use crate::models::{IndexSnapshot, MarketOverview, Quote};

pub trait QuoteParser: Send + Sync {
    fn parse_quotes(
        &self,
        raw: &str,
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<Quote>, ParseFailure>;

    fn parse_overview(
        &self,
        raw: &str,
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<MarketOverview, ParseFailure>;
}

fn parse_number(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '%')
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse().ok()
}

// =============================================================================
// ROW LAYOUT
// =============================================================================

/// Zero-based column positions of a quote row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnLayout {
    pub symbol: usize,
    pub last_price: usize,
    pub change: usize,
    pub change_percent: usize,
    pub volume: usize,
    pub high: usize,
    pub low: usize,
    pub open: usize,
    pub previous_close: Option<usize>,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            symbol: 0,
            last_price: 1,
            change: 2,
            change_percent: 3,
            volume: 4,
            high: 5,
            low: 6,
            open: 7,
            previous_close: Some(8),
        }
    }
}

impl ColumnLayout {
    fn min_cells(&self) -> usize {
        [
            self.symbol,
            self.last_price,
            self.change,
            self.change_percent,
            self.volume,
            self.high,
            self.low,
            self.open,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1
    }

    /// `None` for header, blank or short rows
    fn quote_from_cells(
        &self,
        cells: &[&str],
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Option<Quote> {
        if cells.len() < self.min_cells() {
            return None;
        }
        let symbol = cells[self.symbol].trim().to_uppercase();
        if symbol.is_empty() {
            return None;
        }
        let last_price = parse_number(cells[self.last_price])?;
        let change = parse_number(cells[self.change]).unwrap_or(0.0);
        let previous_close = self
            .previous_close
            .and_then(|i| cells.get(i))
            .and_then(|c| parse_number(c))
            .unwrap_or(last_price - change);

        Some(Quote {
            symbol,
            last_price,
            change,
            change_percent: parse_number(cells[self.change_percent]).unwrap_or(0.0),
            open: parse_number(cells[self.open]).unwrap_or(last_price),
            high: parse_number(cells[self.high]).unwrap_or(last_price),
            low: parse_number(cells[self.low]).unwrap_or(last_price),
            previous_close,
            volume: parse_number(cells[self.volume]).map(|v| v.max(0.0) as u64).unwrap_or(0),
            turnover: None,
            timestamp: fetched_at,
            source: source.to_string(),
        })
    }
}

fn index_from_cells(cells: &[&str]) -> Option<IndexSnapshot> {
    if cells.len() < 2 {
        return None;
    }
    let name = cells[0].trim();
    if name.is_empty() {
        return None;
    }
    Some(IndexSnapshot {
        name: name.to_string(),
        value: parse_number(cells[1])?,
        change: cells.get(2).and_then(|c| parse_number(c)).unwrap_or(0.0),
        change_percent: cells.get(3).and_then(|c| parse_number(c)).unwrap_or(0.0),
    })
}

fn overview_from_rows(
    rows: Vec<Vec<String>>,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> Result<MarketOverview, ParseFailure> {
    let indices: Vec<IndexSnapshot> = rows
        .iter()
        .filter_map(|r| index_from_cells(&r.iter().map(String::as_str).collect::<Vec<_>>()))
        .collect();
    if indices.is_empty() {
        return Err(ParseFailure::new("no index rows found"));
    }
    Ok(MarketOverview {
        indices,
        turnover: 0.0,
        volume: 0,
        transactions: 0,
        as_of: fetched_at,
        source: source.to_string(),
    })
}

fn quotes_from_rows(
    layout: &ColumnLayout,
    rows: Vec<Vec<String>>,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<Quote>, ParseFailure> {
    let total = rows.len();
    let quotes: Vec<Quote> = rows
        .iter()
        .filter_map(|r| {
            let cells: Vec<&str> = r.iter().map(String::as_str).collect();
            layout.quote_from_cells(&cells, source, fetched_at)
        })
        .collect();
    if quotes.is_empty() {
        return Err(ParseFailure::new(format!("no quote rows in {total} rows")));
    }
    Ok(quotes)
}

// =============================================================================
// PIPE ROWS
// =============================================================================

/// One row per line, cells joined by `|`
#[derive(Debug, Clone, Default)]
pub struct PipeRowParser {
    layout: ColumnLayout,
}

impl PipeRowParser {
    pub fn new(layout: ColumnLayout) -> Self {
        Self { layout }
    }

    fn rows(raw: &str) -> Vec<Vec<String>> {
        raw.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| l.split('|').map(|c| c.trim().to_string()).collect())
            .collect()
    }
}

impl QuoteParser for PipeRowParser {
    fn parse_quotes(
        &self,
        raw: &str,
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<Quote>, ParseFailure> {
        quotes_from_rows(&self.layout, Self::rows(raw), source, fetched_at)
    }

    fn parse_overview(
        &self,
        raw: &str,
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<MarketOverview, ParseFailure> {
        overview_from_rows(Self::rows(raw), source, fetched_at)
    }
}

// =============================================================================
// HTML TABLE
// =============================================================================

/// Extracts `<td>` text from every `<tr>`; ignores everything else
#[derive(Debug, Clone, Default)]
pub struct HtmlTableParser {
    layout: ColumnLayout,
}

impl HtmlTableParser {
    pub fn new(layout: ColumnLayout) -> Self {
        Self { layout }
    }

    fn strip_tags(fragment: &str) -> String {
        let mut out = String::with_capacity(fragment.len());
        let mut in_tag = false;
        for c in fragment.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                _ if !in_tag => out.push(c),
                _ => {}
            }
        }
        out.replace("&nbsp;", " ")
            .replace("&amp;", "&")
            .trim()
            .to_string()
    }

    fn rows(raw: &str) -> Vec<Vec<String>> {
        let lower = raw.to_ascii_lowercase();
        let mut rows = Vec::new();

        for (row_start, _) in lower.match_indices("<tr") {
            let row_end = lower[row_start..]
                .find("</tr>")
                .map(|i| row_start + i)
                .unwrap_or(lower.len());
            let row_lower = &lower[row_start..row_end];
            let row_raw = &raw[row_start..row_end];

            let mut cells = Vec::new();
            let mut cursor = 0;
            while let Some(open) = row_lower[cursor..].find("<td") {
                let open = cursor + open;
                let Some(gt) = row_lower[open..].find('>') else {
                    break;
                };
                let content_start = open + gt + 1;
                let content_end = row_lower[content_start..]
                    .find("</td>")
                    .map(|i| content_start + i)
                    .unwrap_or(row_lower.len());
                cells.push(Self::strip_tags(&row_raw[content_start..content_end]));
                cursor = content_end;
            }
            if !cells.is_empty() {
                rows.push(cells);
            }
        }
        rows
    }
}

impl QuoteParser for HtmlTableParser {
    fn parse_quotes(
        &self,
        raw: &str,
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<Quote>, ParseFailure> {
        quotes_from_rows(&self.layout, Self::rows(raw), source, fetched_at)
    }

    fn parse_overview(
        &self,
        raw: &str,
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<MarketOverview, ParseFailure> {
        overview_from_rows(Self::rows(raw), source, fetched_at)
    }
}

// =============================================================================
// JSON API
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiQuote {
    symbol: String,
    #[serde(rename = "ltp")]
    last_price: f64,
    #[serde(default)]
    turnover: Option<f64>,
    #[serde(default)]
    change: f64,
    #[serde(default)]
    change_percent: f64,
    #[serde(default)]
    volume: i64,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    prev_close: Option<f64>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiIndex {
    index: String,
    point: f64,
    #[serde(default)]
    difference: f64,
    #[serde(default)]
    percent_change: f64,
}

fn parse_api_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

fn open_envelope<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<Vec<T>, ParseFailure> {
    let envelope: ApiEnvelope<T> = serde_json::from_str(raw)
        .map_err(|e| ParseFailure::new(format!("invalid JSON envelope: {e}")))?;
    if !envelope.success {
        let reason = envelope.error.unwrap_or(envelope.message);
        return Err(ParseFailure::new(format!("API reported failure: {reason}")));
    }
    Ok(envelope.data)
}

/// `{ "success": bool, "data": [...], "message": "..." }`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonApiParser;

impl QuoteParser for JsonApiParser {
    fn parse_quotes(
        &self,
        raw: &str,
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<Quote>, ParseFailure> {
        let data: Vec<ApiQuote> = open_envelope(raw)?;
        if data.is_empty() {
            return Err(ParseFailure::new("API returned no quotes"));
        }

        Ok(data
            .into_iter()
            .map(|q| {
                let previous_close = q.prev_close.unwrap_or(q.last_price - q.change);
                Quote {
                    symbol: q.symbol.trim().to_uppercase(),
                    last_price: q.last_price,
                    change: q.change,
                    change_percent: q.change_percent,
                    open: q.open.unwrap_or(q.last_price),
                    high: q.high.unwrap_or(q.last_price),
                    low: q.low.unwrap_or(q.last_price),
                    previous_close,
                    volume: q.volume.max(0) as u64,
                    turnover: q.turnover,
                    timestamp: q
                        .timestamp
                        .as_deref()
                        .and_then(parse_api_timestamp)
                        .unwrap_or(fetched_at),
                    source: source.to_string(),
                }
            })
            .collect())
    }

    fn parse_overview(
        &self,
        raw: &str,
        source: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<MarketOverview, ParseFailure> {
        let data: Vec<ApiIndex> = open_envelope(raw)?;
        if data.is_empty() {
            return Err(ParseFailure::new("API returned no indices"));
        }
        Ok(MarketOverview {
            indices: data
                .into_iter()
                .map(|i| IndexSnapshot {
                    name: i.index,
                    value: i.point,
                    change: i.difference,
                    change_percent: i.percent_change,
                })
                .collect(),
            turnover: 0.0,
            volume: 0,
            transactions: 0,
            as_of: fetched_at,
            source: source.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_rows() {
        let raw = "Symbol|LTP|Change|%|Vol|High|Low|Open|Prev\n\
                   NABIL|1,250.00|10|0.81|12,345|1260|1235|1240|1240\n\
                   \n\
                   NICA|800|-5|-0.62|500|810|795|805|805\n";
        let quotes = PipeRowParser::default()
            .parse_quotes(raw, "browser", Utc::now())
            .unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].symbol, "NABIL");
        assert_eq!(quotes[0].last_price, 1250.0);
        assert_eq!(quotes[0].volume, 12345);
        assert_eq!(quotes[1].change, -5.0);
        assert_eq!(quotes[1].previous_close, 805.0);
        assert_eq!(quotes[1].source, "browser");
    }

    #[test]
    fn test_pipe_rows_without_data_fail() {
        let err = PipeRowParser::default()
            .parse_quotes("Symbol|LTP\n", "browser", Utc::now())
            .unwrap_err();
        assert!(err.0.contains("no quote rows"));
    }

    #[test]
    fn test_html_table_rows() {
        let raw = r#"
            <table><thead><tr><th>Symbol</th><th>LTP</th></tr></thead>
            <tbody>
              <TR class="row"><td><a href="/c/NABIL">NABIL</a></td><td>1,250.00</td><td>10</td>
                <td>0.81</td><td>12,345</td><td>1260</td><td>1235</td><td>1240</td><td>1240</td></TR>
              <tr><td>HIDCL</td><td>210.5</td><td>-1.5</td><td>-0.71</td><td>900</td>
                <td>213</td><td>209</td><td>212</td><td>212</td></tr>
            </tbody></table>"#;
        let quotes = HtmlTableParser::default()
            .parse_quotes(raw, "html", Utc::now())
            .unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].symbol, "NABIL");
        assert_eq!(quotes[1].last_price, 210.5);
        assert_eq!(quotes[1].high, 213.0);
    }

    #[test]
    fn test_html_overview_rows() {
        let raw = "<table><tr><td>NEPSE</td><td>2,045.12</td><td>-12.3</td><td>-0.6</td></tr></table>";
        let overview = HtmlTableParser::default()
            .parse_overview(raw, "html", Utc::now())
            .unwrap();
        assert_eq!(overview.indices.len(), 1);
        assert_eq!(overview.indices[0].value, 2045.12);
    }

    #[test]
    fn test_json_envelope() {
        let raw = r#"{"success":true,"message":"ok","count":2,"data":[
            {"symbol":"nabil","name":"Nabil Bank","ltp":1250.0,"turnover":1.5e7,"change":10.0,"change_percent":0.81,"volume":12345},
            {"symbol":"NICA","name":"NIC Asia","ltp":800.0,"turnover":4.0e5,"prev_close":805.0,"timestamp":"2024-03-13T06:00:00Z"}
        ]}"#;
        let quotes = JsonApiParser.parse_quotes(raw, "api", Utc::now()).unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].symbol, "NABIL");
        assert_eq!(quotes[0].previous_close, 1240.0);
        assert_eq!(quotes[1].previous_close, 805.0);
        assert_eq!(quotes[1].timestamp.to_rfc3339(), "2024-03-13T06:00:00+00:00");
    }

    #[test]
    fn test_json_envelope_failure() {
        let raw = r#"{"success":false,"data":[],"message":"","error":"quota exceeded"}"#;
        let err = JsonApiParser.parse_quotes(raw, "api", Utc::now()).unwrap_err();
        assert!(err.0.contains("quota exceeded"));

        assert!(JsonApiParser.parse_quotes("<html>", "api", Utc::now()).is_err());
    }

    #[test]
    fn test_json_overview() {
        let raw = r#"{"success":true,"data":[{"id":58,"index":"NEPSE Index","point":2045.1,"difference":-12.3,"percent_change":-0.6}]}"#;
        let overview = JsonApiParser.parse_overview(raw, "api", Utc::now()).unwrap();
        assert_eq!(overview.indices[0].name, "NEPSE Index");
        assert_eq!(overview.source, "api");
    }
}
