//! Column layouts of the lakehouse tables and row conversions.

use crate::catalog::ColumnType::{Integer, Real, Text};
use crate::catalog::{ColumnType, TableSchema};
use rusqlite::types::{Type, Value};
use rusqlite::Row;
use tickhouse_core::{
    Bar, CodeRow, ContractDim, Error, FeatureFrame, FeatureRow, InstrumentKey, LabelFrame, LabelRow,
    RawTick, Result, Side, SilverTick,
};

/// Columns every instrument-level table starts with.
pub const KEY_COLUMNS: [&str; 3] = ["ymcode", "side", "code"];

/// A row type with a fixed table layout.
pub trait TableRow: Sized {
    fn schema() -> TableSchema;
    fn to_values(&self) -> Vec<Value>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn opt_int(v: Option<i64>) -> Value {
    v.map_or(Value::Null, Value::Integer)
}

fn opt_real(v: Option<f64>) -> Value {
    v.map_or(Value::Null, Value::Real)
}

fn key_values(key: &InstrumentKey) -> [Value; 3] {
    [text(&key.ymcode), text(key.side.as_str()), text(&key.code)]
}

/// Read `(ymcode, side, code)` from the first three columns.
fn key_at(row: &Row<'_>) -> rusqlite::Result<InstrumentKey> {
    let side: String = row.get(1)?;
    let side = side
        .parse::<Side>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    Ok(InstrumentKey {
        ymcode: row.get(0)?,
        side,
        code: row.get(2)?,
    })
}

fn with_key(time_column: &str, rest: &[(&str, ColumnType)]) -> TableSchema {
    let mut schema = TableSchema::new(time_column, &[("ymcode", Text), ("side", Text), ("code", Text)]);
    for (name, ty) in rest {
        schema.push(*name, *ty);
    }
    schema
}

impl TableRow for RawTick {
    fn schema() -> TableSchema {
        with_key(
            "ts_utc",
            &[
                ("strike", Real),
                ("idate", Integer),
                ("itime", Integer),
                ("tdate", Text),
                ("ts_utc", Integer),
                ("tcnt", Integer),
                ("c", Real),
                ("o", Real),
                ("h", Real),
                ("l", Real),
                ("oi", Real),
                ("ccnt", Integer),
                ("source_file", Text),
                ("ingest_ts", Integer),
            ],
        )
    }

    fn to_values(&self) -> Vec<Value> {
        let mut values = key_values(&self.key).to_vec();
        values.extend([
            opt_real(self.strike),
            opt_int(self.idate),
            opt_int(self.itime),
            self.tdate.clone().map_or(Value::Null, Value::Text),
            Value::Integer(self.ts_utc),
            opt_int(self.tcnt),
            opt_real(self.c),
            opt_real(self.o),
            opt_real(self.h),
            opt_real(self.l),
            opt_real(self.oi),
            opt_int(self.ccnt),
            text(&self.source_file),
            Value::Integer(self.ingest_ts),
        ]);
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawTick {
            key: key_at(row)?,
            strike: row.get(3)?,
            idate: row.get(4)?,
            itime: row.get(5)?,
            tdate: row.get(6)?,
            ts_utc: row.get(7)?,
            tcnt: row.get(8)?,
            c: row.get(9)?,
            o: row.get(10)?,
            h: row.get(11)?,
            l: row.get(12)?,
            oi: row.get(13)?,
            ccnt: row.get(14)?,
            source_file: row.get(15)?,
            ingest_ts: row.get(16)?,
        })
    }
}

impl TableRow for CodeRow {
    fn schema() -> TableSchema {
        with_key(
            "ingest_ts",
            &[
                ("lastday", Integer),
                ("strike", Real),
                ("source_file", Text),
                ("ingest_ts", Integer),
            ],
        )
    }

    fn to_values(&self) -> Vec<Value> {
        let mut values = key_values(&self.key).to_vec();
        values.extend([
            opt_int(self.lastday),
            opt_real(self.strike),
            text(&self.source_file),
            Value::Integer(self.ingest_ts),
        ]);
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CodeRow {
            key: key_at(row)?,
            lastday: row.get(3)?,
            strike: row.get(4)?,
            source_file: row.get(5)?,
            ingest_ts: row.get(6)?,
        })
    }
}

impl TableRow for SilverTick {
    fn schema() -> TableSchema {
        with_key(
            "ts_utc",
            &[
                ("strike", Real),
                ("ts_utc", Integer),
                ("price", Real),
                ("open", Real),
                ("high", Real),
                ("low", Real),
                ("oi", Real),
                ("tcnt", Integer),
                ("ccnt", Integer),
                ("source_file", Text),
                ("ingest_ts", Integer),
            ],
        )
    }

    fn to_values(&self) -> Vec<Value> {
        let mut values = key_values(&self.key).to_vec();
        values.extend([
            opt_real(self.strike),
            Value::Integer(self.ts_utc),
            opt_real(self.price),
            opt_real(self.open),
            opt_real(self.high),
            opt_real(self.low),
            opt_real(self.oi),
            opt_int(self.tcnt),
            opt_int(self.ccnt),
            text(&self.source_file),
            Value::Integer(self.ingest_ts),
        ]);
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(SilverTick {
            key: key_at(row)?,
            strike: row.get(3)?,
            ts_utc: row.get(4)?,
            price: row.get(5)?,
            open: row.get(6)?,
            high: row.get(7)?,
            low: row.get(8)?,
            oi: row.get(9)?,
            tcnt: row.get(10)?,
            ccnt: row.get(11)?,
            source_file: row.get(12)?,
            ingest_ts: row.get(13)?,
        })
    }
}

impl TableRow for ContractDim {
    fn schema() -> TableSchema {
        with_key(
            "first_seen_ts",
            &[
                ("strike", Real),
                ("ref_strike", Real),
                ("lastday", Integer),
                ("first_seen_ts", Integer),
                ("last_seen_ts", Integer),
            ],
        )
    }

    fn to_values(&self) -> Vec<Value> {
        let mut values = key_values(&self.key).to_vec();
        values.extend([
            opt_real(self.strike),
            opt_real(self.ref_strike),
            opt_int(self.lastday),
            Value::Integer(self.first_seen_ts),
            Value::Integer(self.last_seen_ts),
        ]);
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ContractDim {
            key: key_at(row)?,
            strike: row.get(3)?,
            ref_strike: row.get(4)?,
            lastday: row.get(5)?,
            first_seen_ts: row.get(6)?,
            last_seen_ts: row.get(7)?,
        })
    }
}

impl TableRow for Bar {
    fn schema() -> TableSchema {
        with_key(
            "bar_ts",
            &[
                ("strike", Real),
                ("bar_ts", Integer),
                ("open", Real),
                ("high", Real),
                ("low", Real),
                ("close", Real),
                ("tick_count", Integer),
                ("volume", Integer),
                ("oi_last", Real),
            ],
        )
    }

    fn to_values(&self) -> Vec<Value> {
        let mut values = key_values(&self.key).to_vec();
        values.extend([
            opt_real(self.strike),
            Value::Integer(self.bar_ts),
            Value::Real(self.open),
            Value::Real(self.high),
            Value::Real(self.low),
            Value::Real(self.close),
            Value::Integer(i64::from(self.tick_count)),
            Value::Integer(self.volume),
            opt_real(self.oi_last),
        ]);
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Bar {
            key: key_at(row)?,
            strike: row.get(3)?,
            bar_ts: row.get(4)?,
            open: row.get(5)?,
            high: row.get(6)?,
            low: row.get(7)?,
            close: row.get(8)?,
            tick_count: row.get(9)?,
            volume: row.get(10)?,
            oi_last: row.get(11)?,
        })
    }
}

/// Key, strike and bar time, shared by the feature and label tables.
fn bar_keyed(columns: impl IntoIterator<Item = (String, ColumnType)>) -> TableSchema {
    let mut schema = with_key("bar_ts", &[("strike", Real), ("bar_ts", Integer)]);
    for (name, ty) in columns {
        schema.push(name, ty);
    }
    schema
}

/// Number of leading non-value columns in feature and label tables.
pub const BAR_KEY_WIDTH: usize = 5;

pub fn feature_schema(columns: &[String]) -> TableSchema {
    bar_keyed(columns.iter().map(|c| (c.clone(), Real)))
}

pub fn feature_values(frame: &FeatureFrame) -> Vec<Vec<Value>> {
    frame
        .rows
        .iter()
        .map(|row| {
            let mut values = key_values(&row.key).to_vec();
            values.push(opt_real(row.strike));
            values.push(Value::Integer(row.bar_ts));
            values.extend(row.values.iter().map(|v| opt_real(*v)));
            values
        })
        .collect()
}

pub fn feature_row(row: &Row<'_>, width: usize) -> rusqlite::Result<FeatureRow> {
    Ok(FeatureRow {
        key: key_at(row)?,
        strike: row.get(3)?,
        bar_ts: row.get(4)?,
        values: (0..width)
            .map(|i| row.get(BAR_KEY_WIDTH + i))
            .collect::<rusqlite::Result<_>>()?,
    })
}

pub fn label_schema(horizons: &[usize]) -> TableSchema {
    let returns = horizons.iter().map(|h| (format!("y_ret_{h}"), Real));
    let directions = horizons.iter().map(|h| (format!("y_dir_{h}"), Integer));
    bar_keyed(returns.chain(directions))
}

pub fn label_values(frame: &LabelFrame) -> Vec<Vec<Value>> {
    frame
        .rows
        .iter()
        .map(|row| {
            let mut values = key_values(&row.key).to_vec();
            values.push(opt_real(row.strike));
            values.push(Value::Integer(row.bar_ts));
            values.extend(row.returns.iter().map(|v| opt_real(*v)));
            values.extend(row.directions.iter().map(|d| opt_int(d.map(i64::from))));
            values
        })
        .collect()
}

pub fn label_row(row: &Row<'_>, horizons: usize) -> rusqlite::Result<LabelRow> {
    let returns = (0..horizons)
        .map(|i| row.get(BAR_KEY_WIDTH + i))
        .collect::<rusqlite::Result<Vec<Option<f64>>>>()?;
    let directions = (0..horizons)
        .map(|i| row.get(BAR_KEY_WIDTH + horizons + i))
        .collect::<rusqlite::Result<Vec<Option<i8>>>>()?;
    Ok(LabelRow {
        key: key_at(row)?,
        strike: row.get(3)?,
        bar_ts: row.get(4)?,
        returns,
        directions,
    })
}

/// Value columns of a stored feature table.
pub fn stored_feature_columns(table: &str, columns: &[String]) -> Result<Vec<String>> {
    check_bar_key(table, columns)?;
    Ok(columns[BAR_KEY_WIDTH..].to_vec())
}

/// Horizons of a stored label table, from its `y_ret_<h>` columns.
pub fn stored_label_horizons(table: &str, columns: &[String]) -> Result<Vec<usize>> {
    check_bar_key(table, columns)?;
    let horizons = columns[BAR_KEY_WIDTH..]
        .iter()
        .filter_map(|c| c.strip_prefix("y_ret_"))
        .map(|h| {
            h.parse::<usize>()
                .map_err(|_| Error::malformed(format!("{table}: bad label column y_ret_{h}")))
        })
        .collect::<Result<Vec<_>>>()?;
    for h in &horizons {
        let dir = format!("y_dir_{h}");
        if !columns.contains(&dir) {
            return Err(Error::schema_mismatch(table, dir));
        }
    }
    Ok(horizons)
}

fn check_bar_key(table: &str, columns: &[String]) -> Result<()> {
    let expected = ["ymcode", "side", "code", "strike", "bar_ts"];
    for (i, name) in expected.iter().enumerate() {
        if columns.get(i).map(String::as_str) != Some(*name) {
            return Err(Error::schema_mismatch(table, *name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schemas_match_value_width() {
        let key = InstrumentKey::new("202512", Side::Call, "A");
        let bar = Bar {
            key: key.clone(),
            strike: Some(350.0),
            bar_ts: 60_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            tick_count: 3,
            volume: 7,
            oi_last: None,
        };
        assert_eq!(Bar::schema().columns.len(), bar.to_values().len());

        let code = CodeRow {
            key,
            lastday: Some(20251211),
            strike: None,
            source_file: "codes.xml".to_string(),
            ingest_ts: 0,
        };
        assert_eq!(CodeRow::schema().columns.len(), code.to_values().len());
    }

    #[test]
    fn test_label_schema_layout() {
        let schema = label_schema(&[5, 30]);
        let names: Vec<&str> = schema.column_names().collect();
        assert_eq!(
            names,
            vec!["ymcode", "side", "code", "strike", "bar_ts", "y_ret_5", "y_ret_30", "y_dir_5", "y_dir_30"]
        );
        let stored: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        assert_eq!(stored_label_horizons("labels", &stored).unwrap(), vec![5, 30]);
    }

    #[test]
    fn test_stored_label_horizons_needs_direction() {
        let stored: Vec<String> = ["ymcode", "side", "code", "strike", "bar_ts", "y_ret_5"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = stored_label_horizons("labels", &stored).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { ref column, .. } if column == "y_dir_5"));
    }
}
