//! XML tick and code file loading.
//!
//! Exports look like
//!
//! ```text
//! <DocumentElement>
//!   <ROW_TAG><ymcode>..</ymcode><code>..</code>...</ROW_TAG>
//!   <ROW_TAG>...</ROW_TAG>
//! </DocumentElement>
//! ```
//!
//! The row tag is not fixed across exports, so it is detected from the first
//! child of the root before any row is read.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use std::collections::BTreeMap;
use std::path::Path;
use tickhouse_core::config::IngestConfig;
use tickhouse_core::{CodeRow, Error, InstrumentKey, RawTick, Result, Side, TimestampMs};
use tracing::{debug, info};

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
}

/// One named, typed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered set of fields kept from each row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSchema {
    pub fields: Vec<FieldSpec>,
}

impl RowSchema {
    /// Schema of tick exports.
    pub fn ticks() -> Self {
        use FieldKind::*;
        Self::from_pairs(&[
            ("ymcode", Text),
            ("code", Text),
            ("strike", Float),
            ("idate", Integer),
            ("itime", Integer),
            ("tdate", Text),
            ("tcnt", Integer),
            ("c", Float),
            ("o", Float),
            ("h", Float),
            ("l", Float),
            ("oi", Float),
            ("ccnt", Integer),
        ])
    }

    /// Schema of code (contract reference) exports.
    pub fn codes() -> Self {
        use FieldKind::*;
        Self::from_pairs(&[
            ("ymcode", Text),
            ("code", Text),
            ("lastday", Integer),
            ("strike", Float),
        ])
    }

    fn from_pairs(pairs: &[(&str, FieldKind)]) -> Self {
        Self {
            fields: pairs.iter().map(|(n, k)| FieldSpec::new(*n, *k)).collect(),
        }
    }

    /// Infer a schema from raw rows: every field name seen, in first-seen
    /// order, typed by the narrowest kind all its values parse as.
    pub fn infer(rows: &[RawRecord]) -> Self {
        let mut order: Vec<String> = Vec::new();
        let mut kinds: BTreeMap<String, FieldKind> = BTreeMap::new();
        for row in rows {
            for (name, value) in row {
                // leading zeros mark identifiers ("0125"), keep them verbatim
                let zero_padded = value.len() > 1 && value.starts_with('0') && !value.starts_with("0.");
                let observed = if zero_padded {
                    FieldKind::Text
                } else if value.parse::<i64>().is_ok() {
                    FieldKind::Integer
                } else if value.parse::<f64>().is_ok() {
                    FieldKind::Float
                } else {
                    FieldKind::Text
                };
                match kinds.get(name).copied() {
                    None => {
                        order.push(name.clone());
                        kinds.insert(name.clone(), observed);
                    }
                    Some(current) => {
                        kinds.insert(name.clone(), widen(current, observed));
                    }
                }
            }
        }
        Self {
            fields: order
                .into_iter()
                .map(|name| {
                    let kind = kinds[&name];
                    FieldSpec { name, kind }
                })
                .collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.kind)
    }
}

fn widen(a: FieldKind, b: FieldKind) -> FieldKind {
    use FieldKind::*;
    match (a, b) {
        (Text, _) | (_, Text) => Text,
        (Float, _) | (_, Float) => Float,
        _ => Integer,
    }
}

/// A row as read from XML: field name to trimmed, non-empty text.
pub type RawRecord = BTreeMap<String, String>;

/// A typed value after schema application.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
}

/// A row after schema application. Absent keys are nulls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn text(&self, name: &str) -> Option<String> {
        match self.values.get(name)? {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Integer(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            FieldValue::Float(_) => None,
            FieldValue::Text(s) => s.parse().ok(),
        }
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Text(s) => s.parse().ok(),
        }
    }
}

/// Tag of the repeating row element: the first child element of the root.
pub fn detect_row_tag(doc: &roxmltree::Document<'_>) -> Result<String> {
    doc.root_element()
        .children()
        .find(|n| n.is_element())
        .map(|n| n.tag_name().name().to_string())
        .ok_or_else(|| Error::malformed("no row elements under the XML root"))
}

/// Parse a document and return its row tag with every row element's fields.
///
/// Child elements and attributes of a row both become fields; child elements
/// win on name clashes. Empty values are treated as missing.
pub fn read_rows(text: &str) -> Result<(String, Vec<RawRecord>)> {
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| Error::malformed(format!("invalid XML: {e}")))?;
    let row_tag = detect_row_tag(&doc)?;

    let rows = doc
        .root_element()
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == row_tag)
        .map(|row| {
            let mut record = RawRecord::new();
            for attr in row.attributes() {
                let value = attr.value().trim();
                if !value.is_empty() {
                    record.insert(attr.name().to_string(), value.to_string());
                }
            }
            for field in row.children().filter(|n| n.is_element()) {
                let value = field.text().unwrap_or("").trim();
                if !value.is_empty() {
                    record.insert(field.tag_name().name().to_string(), value.to_string());
                }
            }
            record
        })
        .collect();

    Ok((row_tag, rows))
}

/// Keep schema fields only and cast them. Values that fail to cast are null.
pub fn apply_schema(rows: &[RawRecord], schema: &RowSchema) -> Vec<Record> {
    let mut failed_casts = 0usize;
    let records = rows
        .iter()
        .map(|raw| {
            let mut values = BTreeMap::new();
            for field in &schema.fields {
                let Some(text) = raw.get(&field.name) else {
                    continue;
                };
                let value = match field.kind {
                    FieldKind::Text => Some(FieldValue::Text(text.clone())),
                    FieldKind::Integer => text
                        .parse::<i64>()
                        .ok()
                        .or_else(|| {
                            text.parse::<f64>()
                                .ok()
                                .filter(|f| f.fract() == 0.0)
                                .map(|f| f as i64)
                        })
                        .map(FieldValue::Integer),
                    FieldKind::Float => text.parse::<f64>().ok().map(FieldValue::Float),
                };
                match value {
                    Some(v) => {
                        values.insert(field.name.clone(), v);
                    }
                    None => failed_casts += 1,
                }
            }
            Record { values }
        })
        .collect();
    if failed_casts > 0 {
        debug!(failed_casts, "values nulled by failed casts");
    }
    records
}

/// Parse an exchange timestamp.
///
/// RFC 3339 text carries its own offset; naive text is read in `offset`.
pub fn parse_exchange_ts(text: &str, offset: FixedOffset) -> Result<TimestampMs> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y%m%d%H%M%S"];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return localize(naive, offset, text);
        }
    }
    Err(Error::malformed(format!("unparseable timestamp `{text}`")))
}

/// Combine `idate` (`YYYYMMDD`) and `itime` (`HHMMSS`) in the exchange offset.
pub fn combine_idate_itime(idate: i64, itime: i64, offset: FixedOffset) -> Result<TimestampMs> {
    let bad = || Error::malformed(format!("unparseable idate/itime `{idate}`/`{itime}`"));
    let date = NaiveDate::from_ymd_opt(
        (idate / 10_000) as i32,
        ((idate / 100) % 100) as u32,
        (idate % 100) as u32,
    )
    .ok_or_else(bad)?;
    if !(0..240_000).contains(&itime) {
        return Err(bad());
    }
    let naive = date
        .and_hms_opt(
            (itime / 10_000) as u32,
            ((itime / 100) % 100) as u32,
            (itime % 100) as u32,
        )
        .ok_or_else(bad)?;
    localize(naive, offset, &format!("{idate} {itime:06}"))
}

fn localize(naive: NaiveDateTime, offset: FixedOffset, text: &str) -> Result<TimestampMs> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| Error::malformed(format!("unrepresentable local timestamp `{text}`")))
}

/// Provenance and layout of one loaded file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub source_file: String,
    pub row_tag: String,
    pub side: Side,
    pub schema: RowSchema,
}

/// Rows loaded from one file, with provenance.
#[derive(Debug, Clone)]
pub struct LoadedFile<T> {
    pub meta: FileMeta,
    pub rows: Vec<T>,
}

/// Loads tick and code XML exports into bronze rows.
#[derive(Debug, Clone)]
pub struct XmlLoader {
    offset: FixedOffset,
    schema: Option<RowSchema>,
}

impl XmlLoader {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(config.exchange_utc_offset_hours * 3_600)
            .ok_or_else(|| Error::config("invalid exchange UTC offset"))?;
        Ok(Self {
            offset,
            schema: None,
        })
    }

    /// Use `schema` instead of inferring one from each document.
    pub fn with_schema(mut self, schema: RowSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    fn read(&self, path: &Path, side: Option<Side>) -> Result<(FileMeta, Vec<Record>)> {
        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::config(format!("not a file path: {}", path.display())))?;
        let text = std::fs::read_to_string(path)?;
        let (row_tag, raw_rows) =
            read_rows(&text).map_err(|e| Error::malformed(format!("{source_file}: {e}")))?;
        let schema = self.schema.clone().unwrap_or_else(|| RowSchema::infer(&raw_rows));
        let records = apply_schema(&raw_rows, &schema);
        let side = side.unwrap_or_else(|| Side::infer_from_path(path));

        debug!(file = %source_file, %row_tag, rows = records.len(), %side, "parsed XML");
        Ok((
            FileMeta {
                source_file,
                row_tag,
                side,
                schema,
            },
            records,
        ))
    }

    /// Load a tick export. Fails before returning any row if a row is unusable.
    pub fn load_ticks(
        &self,
        path: &Path,
        side: Option<Side>,
        ingest_ts: TimestampMs,
    ) -> Result<LoadedFile<RawTick>> {
        let (meta, records) = self.read(path, side)?;
        let context = format!("{} <{}>", meta.source_file, meta.row_tag);

        for column in ["ymcode", "code"] {
            if !meta.schema.contains(column) {
                return Err(Error::schema_mismatch(&context, column));
            }
        }
        if !meta.schema.contains("tdate") {
            for column in ["idate", "itime"] {
                if !meta.schema.contains(column) {
                    return Err(Error::schema_mismatch(&context, "tdate"));
                }
            }
        }

        let rows = records
            .iter()
            .enumerate()
            .map(|(i, rec)| self.to_tick(rec, &meta, ingest_ts).map_err(|e| row_error(&context, i, e)))
            .collect::<Result<Vec<_>>>()?;

        info!(file = %meta.source_file, row_tag = %meta.row_tag, side = %meta.side, rows = rows.len(), "loaded ticks");
        Ok(LoadedFile { meta, rows })
    }

    /// Load a code export.
    pub fn load_codes(
        &self,
        path: &Path,
        side: Option<Side>,
        ingest_ts: TimestampMs,
    ) -> Result<LoadedFile<CodeRow>> {
        let (meta, records) = self.read(path, side)?;
        let context = format!("{} <{}>", meta.source_file, meta.row_tag);

        for column in ["ymcode", "code"] {
            if !meta.schema.contains(column) {
                return Err(Error::schema_mismatch(&context, column));
            }
        }

        let rows = records
            .iter()
            .enumerate()
            .map(|(i, rec)| {
                let key = instrument_key(rec, meta.side).map_err(|e| row_error(&context, i, e))?;
                Ok(CodeRow {
                    key,
                    lastday: rec.int("lastday"),
                    strike: rec.float("strike"),
                    source_file: meta.source_file.clone(),
                    ingest_ts,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(file = %meta.source_file, row_tag = %meta.row_tag, side = %meta.side, rows = rows.len(), "loaded codes");
        Ok(LoadedFile { meta, rows })
    }

    fn to_tick(&self, rec: &Record, meta: &FileMeta, ingest_ts: TimestampMs) -> Result<RawTick> {
        let key = instrument_key(rec, meta.side)?;
        let tdate = rec.text("tdate");
        let idate = rec.int("idate");
        let itime = rec.int("itime");
        let ts_utc = match (&tdate, idate, itime) {
            (Some(text), _, _) => parse_exchange_ts(text, self.offset)?,
            (None, Some(d), Some(t)) => combine_idate_itime(d, t, self.offset)?,
            _ => return Err(Error::malformed("missing event timestamp")),
        };
        Ok(RawTick {
            key,
            strike: rec.float("strike"),
            idate,
            itime,
            tdate,
            ts_utc,
            tcnt: rec.int("tcnt"),
            c: rec.float("c"),
            o: rec.float("o"),
            h: rec.float("h"),
            l: rec.float("l"),
            oi: rec.float("oi"),
            ccnt: rec.int("ccnt"),
            source_file: meta.source_file.clone(),
            ingest_ts,
        })
    }
}

fn instrument_key(rec: &Record, side: Side) -> Result<InstrumentKey> {
    let ymcode = rec.text("ymcode").ok_or_else(|| Error::malformed("missing ymcode"))?;
    let code = rec.text("code").ok_or_else(|| Error::malformed("missing code"))?;
    Ok(InstrumentKey::new(ymcode, side, code))
}

fn row_error(context: &str, index: usize, err: Error) -> Error {
    match err {
        Error::MalformedInput(msg) => Error::malformed(format!("{context} row {}: {msg}", index + 1)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const TICKS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<DocumentElement>
  <OPT_TICK>
    <ymcode>202512</ymcode>
    <code>B0125C</code>
    <strike>350.0</strike>
    <tdate>2025-12-01T10:01:13+09:00</tdate>
    <tcnt>3</tcnt>
    <c>1.25</c>
    <oi>1200</oi>
    <extra>ignored</extra>
  </OPT_TICK>
  <OPT_TICK>
    <ymcode>202512</ymcode>
    <code>B0125C</code>
    <strike>350.0</strike>
    <tdate>2025-12-01T10:01:40+09:00</tdate>
    <c>abc</c>
  </OPT_TICK>
</DocumentElement>"#;

    fn write_file(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn loader() -> XmlLoader {
        XmlLoader::new(&IngestConfig::default()).unwrap()
    }

    #[test]
    fn test_detect_row_tag() {
        let (tag, rows) = read_rows(TICKS).unwrap();
        assert_eq!(tag, "OPT_TICK");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_empty_root_is_malformed() {
        let err = read_rows("<DocumentElement>\n</DocumentElement>").unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[test]
    fn test_load_ticks_with_explicit_schema() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "tick_CALL_202512.xml", TICKS);
        let loaded = loader()
            .with_schema(RowSchema::ticks())
            .load_ticks(&path, None, 42)
            .unwrap();

        assert_eq!(loaded.meta.side, Side::Call);
        assert_eq!(loaded.meta.source_file, "tick_CALL_202512.xml");
        assert_eq!(loaded.rows.len(), 2);

        let first = &loaded.rows[0];
        assert_eq!(first.key.code, "B0125C");
        assert_eq!(first.ingest_ts, 42);
        // 10:01:13 KST = 01:01:13 UTC
        assert_eq!(first.ts_utc, 1_764_550_873_000);
        assert_eq!(first.tcnt, Some(3));
        assert_eq!(first.c, Some(1.25));

        // unparseable price and missing fields become nulls
        let second = &loaded.rows[1];
        assert_eq!(second.c, None);
        assert_eq!(second.tcnt, None);
        assert_eq!(second.oi, None);
    }

    #[test]
    fn test_explicit_side_overrides_file_name() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "tick_CALL.xml", TICKS);
        let loaded = loader().load_ticks(&path, Some(Side::Put), 0).unwrap();
        assert!(loaded.rows.iter().all(|t| t.key.side == Side::Put));
        // inferred schema still yields numeric prices from text columns
        assert_eq!(loaded.rows[0].c, Some(1.25));
        assert_eq!(loaded.rows[1].c, None);
    }

    #[test]
    fn test_inferred_schema_drops_nothing_known() {
        let (_, rows) = read_rows(TICKS).unwrap();
        let schema = RowSchema::infer(&rows);
        assert_eq!(schema.kind_of("tcnt"), Some(FieldKind::Integer));
        assert_eq!(schema.kind_of("strike"), Some(FieldKind::Float));
        // "abc" in the second row widens c to text
        assert_eq!(schema.kind_of("c"), Some(FieldKind::Text));
        assert!(schema.contains("extra"));
    }

    #[test]
    fn test_missing_timestamp_column_is_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let body = "<Root><R><ymcode>1</ymcode><code>A</code><c>1.0</c></R></Root>";
        let path = write_file(&dir, "tick_put.xml", body);
        let err = loader().load_ticks(&path, None, 0).unwrap_err();
        match err {
            Error::SchemaMismatch { column, .. } => assert_eq!(column, "tdate"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_timestamp_fails_whole_file() {
        let dir = TempDir::new().unwrap();
        let body = "<Root>\
            <R><ymcode>1</ymcode><code>A</code><tdate>2025-12-01T10:00:00+09:00</tdate></R>\
            <R><ymcode>1</ymcode><code>A</code><tdate>yesterday</tdate></R>\
            </Root>";
        let path = write_file(&dir, "tick_put.xml", body);
        let err = loader().load_ticks(&path, None, 0).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("row 2"), "{msg}");
        assert!(msg.contains("yesterday"), "{msg}");
    }

    #[test]
    fn test_idate_itime_fallback() {
        let offset = FixedOffset::east_opt(9 * 3_600).unwrap();
        let ts = combine_idate_itime(20251201, 100113, offset).unwrap();
        assert_eq!(ts, parse_exchange_ts("2025-12-01T10:01:13+09:00", offset).unwrap());
        assert!(combine_idate_itime(20251301, 100113, offset).is_err());
        assert!(combine_idate_itime(20251201, 250000, offset).is_err());
    }

    #[test]
    fn test_naive_timestamp_uses_exchange_offset() {
        let offset = FixedOffset::east_opt(9 * 3_600).unwrap();
        let naive = parse_exchange_ts("2025-12-01 10:01:13", offset).unwrap();
        let explicit = parse_exchange_ts("2025-12-01T10:01:13+09:00", offset).unwrap();
        assert_eq!(naive, explicit);
    }

    #[test]
    fn test_load_codes() {
        let dir = TempDir::new().unwrap();
        let body = "<DocumentElement>\
            <CODE><ymcode>202512</ymcode><code>B0125P</code><lastday>20251211</lastday></CODE>\
            </DocumentElement>";
        let path = write_file(&dir, "code_put.xml", body);
        let loaded = loader()
            .with_schema(RowSchema::codes())
            .load_codes(&path, None, 7)
            .unwrap();
        assert_eq!(loaded.meta.row_tag, "CODE");
        assert_eq!(loaded.rows.len(), 1);
        assert_eq!(loaded.rows[0].key.side, Side::Put);
        assert_eq!(loaded.rows[0].lastday, Some(20251211));
        assert_eq!(loaded.rows[0].strike, None);
    }
}
