//! Local table model: column types, relations, the used-column bitmap, and
//! row assembly.
//!
//! Local values are DataFusion [`ScalarValue`]s so finished rows can be
//! turned into Arrow arrays without another conversion layer.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use datafusion::arrow::datatypes::{DataType, Field, IntervalUnit, Schema, SchemaRef, TimeUnit};
use datafusion::common::ScalarValue;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FdwError, FdwResult};
use crate::options::ColumnOptions;

/// 1-based column ordinal. Values below 1 denote system columns.
pub type AttrNumber = i16;

/// Ordinal of the row-locator system column (`ctid`).
pub const SELF_ITEM_POINTER_ATTNO: AttrNumber = -1;

/// Days between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Width assumed for variable-length values.
const VARLENA_WIDTH: i32 = 32;

/// Types a foreign-table column can be declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalType {
    #[serde(alias = "int2")]
    SmallInt,
    #[serde(alias = "int", alias = "int4")]
    Integer,
    #[serde(alias = "int8")]
    BigInt,
    #[serde(alias = "float4")]
    Real,
    #[serde(alias = "float8")]
    Double,
    #[serde(alias = "bool")]
    Boolean,
    Text,
    Varchar,
    #[serde(alias = "bpchar")]
    Char,
    Name,
    Uuid,
    Date,
    Timestamp,
    Interval,
}

impl LocalType {
    /// SQL name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::SmallInt => "smallint",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Real => "real",
            Self::Double => "double precision",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Varchar => "character varying",
            Self::Char => "character",
            Self::Name => "name",
            Self::Uuid => "uuid",
            Self::Date => "date",
            Self::Timestamp => "timestamp without time zone",
            Self::Interval => "interval",
        }
    }

    pub fn data_type(self) -> DataType {
        match self {
            Self::SmallInt => DataType::Int16,
            Self::Integer => DataType::Int32,
            Self::BigInt => DataType::Int64,
            Self::Real => DataType::Float32,
            Self::Double => DataType::Float64,
            Self::Boolean => DataType::Boolean,
            Self::Text | Self::Varchar | Self::Char | Self::Name | Self::Uuid => DataType::Utf8,
            Self::Date => DataType::Date32,
            Self::Timestamp => DataType::Timestamp(TimeUnit::Nanosecond, None),
            Self::Interval => DataType::Interval(IntervalUnit::MonthDayNano),
        }
    }

    /// Best local type for an Arrow type, used for literals coming from the
    /// engine.
    pub fn from_data_type(data_type: &DataType) -> Option<Self> {
        Some(match data_type {
            DataType::Int8 | DataType::Int16 => Self::SmallInt,
            DataType::Int32 => Self::Integer,
            DataType::Int64 => Self::BigInt,
            DataType::Float32 => Self::Real,
            DataType::Float64 => Self::Double,
            DataType::Boolean => Self::Boolean,
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => Self::Text,
            DataType::Date32 => Self::Date,
            DataType::Timestamp(_, None) => Self::Timestamp,
            DataType::Interval(_) => Self::Interval,
            _ => return None,
        })
    }

    /// String-like and temporal types render as single-quoted literals.
    pub fn is_quoted_literal(self) -> bool {
        matches!(
            self,
            Self::Text | Self::Varchar | Self::Char | Self::Name | Self::Date | Self::Timestamp
        )
    }

    pub fn is_interval(self) -> bool {
        matches!(self, Self::Interval)
    }

    /// Average stored width in bytes.
    pub fn width(self) -> i32 {
        match self {
            Self::Boolean => 1,
            Self::SmallInt => 2,
            Self::Integer | Self::Real | Self::Date => 4,
            Self::BigInt | Self::Double | Self::Timestamp => 8,
            Self::Uuid | Self::Interval => 16,
            Self::Text | Self::Varchar | Self::Char | Self::Name => VARLENA_WIDTH,
        }
    }

    /// Typed null of this column's Arrow type.
    pub fn null_value(self) -> ScalarValue {
        match self {
            Self::SmallInt => ScalarValue::Int16(None),
            Self::Integer => ScalarValue::Int32(None),
            Self::BigInt => ScalarValue::Int64(None),
            Self::Real => ScalarValue::Float32(None),
            Self::Double => ScalarValue::Float64(None),
            Self::Boolean => ScalarValue::Boolean(None),
            Self::Text | Self::Varchar | Self::Char | Self::Name | Self::Uuid => {
                ScalarValue::Utf8(None)
            }
            Self::Date => ScalarValue::Date32(None),
            Self::Timestamp => ScalarValue::TimestampNanosecond(None, None),
            Self::Interval => ScalarValue::IntervalMonthDayNano(None),
        }
    }

    /// Type input conversion: parses the text form of a value.
    pub fn input(self, text: &str) -> FdwResult<ScalarValue> {
        let reject = |reason: &str| FdwError::TypeInput {
            type_name: self.name(),
            value: text.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = text.trim();
        match self {
            Self::SmallInt => trimmed
                .parse::<i16>()
                .map(|value| ScalarValue::Int16(Some(value)))
                .map_err(|err| reject(&err.to_string())),
            Self::Integer => trimmed
                .parse::<i32>()
                .map(|value| ScalarValue::Int32(Some(value)))
                .map_err(|err| reject(&err.to_string())),
            Self::BigInt => trimmed
                .parse::<i64>()
                .map(|value| ScalarValue::Int64(Some(value)))
                .map_err(|err| reject(&err.to_string())),
            Self::Real => trimmed
                .parse::<f32>()
                .map(|value| ScalarValue::Float32(Some(value)))
                .map_err(|err| reject(&err.to_string())),
            Self::Double => trimmed
                .parse::<f64>()
                .map(|value| ScalarValue::Float64(Some(value)))
                .map_err(|err| reject(&err.to_string())),
            Self::Boolean => parse_bool(trimmed)
                .map(|value| ScalarValue::Boolean(Some(value)))
                .ok_or_else(|| reject("expected a boolean")),
            Self::Text | Self::Varchar | Self::Char | Self::Name => {
                Ok(ScalarValue::Utf8(Some(text.to_string())))
            }
            Self::Uuid => Uuid::parse_str(trimmed)
                .map(|value| ScalarValue::Utf8(Some(value.hyphenated().to_string())))
                .map_err(|err| reject(&err.to_string())),
            Self::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(|date| ScalarValue::Date32(Some(days_since_epoch(date))))
                .map_err(|err| reject(&err.to_string())),
            Self::Timestamp => {
                let parsed = parse_timestamp(trimmed).ok_or_else(|| reject("unrecognized format"))?;
                parsed
                    .and_utc()
                    .timestamp_nanos_opt()
                    .map(|nanos| ScalarValue::TimestampNanosecond(Some(nanos), None))
                    .ok_or_else(|| reject("timestamp out of range"))
            }
            Self::Interval => Err(reject("interval values are not supported")),
        }
    }
}

impl fmt::Display for LocalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|value| value.naive_utc())
        })
}

pub(crate) fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

/// One column of a foreign table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalColumn {
    pub name: String,
    pub ty: LocalType,
    pub dropped: bool,
    pub options: ColumnOptions,
}

impl LocalColumn {
    pub fn new(name: impl Into<String>, ty: LocalType) -> Self {
        Self {
            name: name.into(),
            ty,
            dropped: false,
            options: ColumnOptions::default(),
        }
    }

    /// Maps the column onto a differently named remote column.
    pub fn with_column_name(mut self, remote: impl Into<String>) -> Self {
        self.options.column_name = Some(remote.into());
        self
    }

    pub fn into_dropped(mut self) -> Self {
        self.dropped = true;
        self
    }

    /// Remote column name: the `column_name` option, else the local name.
    pub fn remote_name(&self) -> &str {
        self.options.column_name.as_deref().unwrap_or(&self.name)
    }
}

/// Column layout of a foreign table. Ordinals are 1-based and stay stable
/// when columns are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRelation {
    name: String,
    columns: Vec<LocalColumn>,
}

impl LocalRelation {
    pub fn new(name: impl Into<String>, columns: Vec<LocalColumn>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[LocalColumn] {
        &self.columns
    }

    /// Number of attributes, dropped ones included.
    pub fn natts(&self) -> usize {
        self.columns.len()
    }

    /// Fails if some column has no representable ordinal.
    pub fn check_attnos(&self) -> FdwResult<()> {
        AttrNumber::try_from(self.columns.len()).map(|_| ()).map_err(|_| {
            FdwError::Configuration(format!(
                "table \"{}\" has {} columns, more than the {} allowed",
                self.name,
                self.columns.len(),
                AttrNumber::MAX
            ))
        })
    }

    /// Columns with their ordinals, dropped ones included. Stops at the
    /// first column whose ordinal does not fit an [`AttrNumber`].
    pub fn numbered_columns(&self) -> impl Iterator<Item = (AttrNumber, &LocalColumn)> {
        self.columns.iter().enumerate().map_while(|(index, column)| {
            AttrNumber::try_from(index + 1).ok().map(|attno| (attno, column))
        })
    }

    pub fn column(&self, attno: AttrNumber) -> Option<&LocalColumn> {
        if attno < 1 {
            return None;
        }
        self.columns.get(usize::try_from(attno - 1).ok()?)
    }

    pub fn remote_column_name(&self, attno: AttrNumber) -> Option<&str> {
        self.column(attno).map(LocalColumn::remote_name)
    }

    /// Ordinals of the non-dropped columns, ascending.
    pub fn visible_ordinals(&self) -> Vec<AttrNumber> {
        self.numbered_columns()
            .filter(|(_, column)| !column.dropped)
            .map(|(attno, _)| attno)
            .collect()
    }

    /// Ordinal of the visible column called `name`.
    pub fn attno_of(&self, name: &str) -> Option<AttrNumber> {
        self.numbered_columns()
            .find(|(_, column)| !column.dropped && column.name == name)
            .map(|(attno, _)| attno)
    }

    /// Arrow schema over the visible columns.
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields = self
            .columns
            .iter()
            .filter(|column| !column.dropped)
            .map(|column| Field::new(&column.name, column.ty.data_type(), true))
            .collect::<Vec<_>>();
        Arc::new(Schema::new(fields))
    }
}

/// Set of columns a scan needs, plus the whole-row and row-locator flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrsUsed {
    columns: BTreeSet<AttrNumber>,
    whole_row: bool,
    self_item_pointer: bool,
}

impl AttrsUsed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every column is needed.
    pub fn whole_row() -> Self {
        Self {
            whole_row: true,
            ..Self::default()
        }
    }

    pub fn with_columns(columns: impl IntoIterator<Item = AttrNumber>) -> Self {
        let mut used = Self::new();
        for attno in columns {
            used.insert(attno);
        }
        used
    }

    /// Maps a projection over the relation's visible columns (the Arrow
    /// schema order) to ordinals. No projection means every column.
    pub fn from_projection(relation: &LocalRelation, projection: Option<&Vec<usize>>) -> Self {
        let Some(projection) = projection else {
            return Self::whole_row();
        };
        let visible = relation.visible_ordinals();
        Self::with_columns(
            projection
                .iter()
                .filter_map(|index| visible.get(*index).copied()),
        )
    }

    /// Adds an ordinal; the row-locator ordinal sets its flag instead.
    pub fn insert(&mut self, attno: AttrNumber) {
        if attno == SELF_ITEM_POINTER_ATTNO {
            self.self_item_pointer = true;
        } else if attno > 0 {
            self.columns.insert(attno);
        }
    }

    pub fn contains(&self, attno: AttrNumber) -> bool {
        self.whole_row || self.columns.contains(&attno)
    }

    pub fn is_whole_row(&self) -> bool {
        self.whole_row
    }

    pub fn has_self_item_pointer(&self) -> bool {
        self.self_item_pointer
    }

    /// Sum of the widths of the used, non-dropped columns.
    pub fn width(&self, relation: &LocalRelation) -> i32 {
        relation
            .numbered_columns()
            .filter(|(attno, column)| !column.dropped && self.contains(*attno))
            .map(|(_, column)| column.ty.width())
            .sum()
    }
}

/// A finished local row: one value per attribute, typed nulls for columns
/// that were not retrieved.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRow {
    values: Vec<ScalarValue>,
}

impl LocalRow {
    pub fn get(&self, attno: AttrNumber) -> Option<&ScalarValue> {
        if attno < 1 {
            return None;
        }
        self.values.get(usize::try_from(attno - 1).ok()?)
    }

    pub fn values(&self) -> &[ScalarValue] {
        &self.values
    }
}

/// Collects `(ordinal, value)` pairs for one row.
#[derive(Debug, Clone, Default)]
pub struct RowBuilder {
    entries: Vec<(AttrNumber, Option<ScalarValue>)>,
}

impl RowBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, attno: AttrNumber, value: Option<ScalarValue>) {
        self.entries.push((attno, value));
    }

    /// Lays the collected values out over the relation's attributes.
    pub fn finish(self, relation: &LocalRelation) -> FdwResult<LocalRow> {
        let mut values = relation
            .columns()
            .iter()
            .map(|column| column.ty.null_value())
            .collect::<Vec<_>>();
        for (attno, value) in self.entries {
            let index = usize::try_from(attno - 1)
                .ok()
                .filter(|index| *index < values.len())
                .ok_or_else(|| {
                    FdwError::Consistency(format!(
                        "column ordinal {attno} is outside relation \"{}\"",
                        relation.name()
                    ))
                })?;
            if let Some(value) = value {
                values[index] = value;
            }
        }
        Ok(LocalRow { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> LocalRelation {
        LocalRelation::new(
            "users",
            vec![
                LocalColumn::new("id", LocalType::Integer),
                LocalColumn::new("legacy", LocalType::Text).into_dropped(),
                LocalColumn::new("name", LocalType::Text).with_column_name("user_name"),
            ],
        )
    }

    #[test]
    fn remote_names_honor_column_override() {
        let relation = users();
        assert_eq!(relation.remote_column_name(1), Some("id"));
        assert_eq!(relation.remote_column_name(3), Some("user_name"));
        assert_eq!(relation.remote_column_name(0), None);
        assert_eq!(relation.remote_column_name(4), None);
    }

    #[test]
    fn schema_skips_dropped_columns() {
        let relation = users();
        let schema = relation.arrow_schema();
        assert_eq!(schema.fields().len(), 2);
        assert_eq!(schema.field(1).name(), "name");
        assert_eq!(relation.visible_ordinals(), vec![1, 3]);
        assert_eq!(relation.natts(), 3);
        assert_eq!(relation.attno_of("name"), Some(3));
        assert_eq!(relation.attno_of("legacy"), None);
    }

    #[test]
    fn projection_maps_through_visible_columns() {
        let relation = users();
        let used = AttrsUsed::from_projection(&relation, Some(&vec![1]));
        assert!(used.contains(3));
        assert!(!used.contains(1));
        assert!(AttrsUsed::from_projection(&relation, None).is_whole_row());
    }

    #[test]
    fn ctid_ordinal_sets_flag() {
        let mut used = AttrsUsed::new();
        used.insert(SELF_ITEM_POINTER_ATTNO);
        used.insert(0);
        assert!(used.has_self_item_pointer());
        assert!(!used.contains(0));
    }

    #[test]
    fn input_parses_scalar_types() {
        assert_eq!(
            LocalType::Integer.input(" 42 ").expect("int"),
            ScalarValue::Int32(Some(42))
        );
        assert_eq!(
            LocalType::BigInt.input("9000000000").expect("bigint"),
            ScalarValue::Int64(Some(9_000_000_000))
        );
        assert_eq!(
            LocalType::Boolean.input("true").expect("bool"),
            ScalarValue::Boolean(Some(true))
        );
        assert_eq!(
            LocalType::Boolean.input("off").expect("bool"),
            ScalarValue::Boolean(Some(false))
        );
        assert_eq!(
            LocalType::Double.input("2.5").expect("double"),
            ScalarValue::Float64(Some(2.5))
        );
        assert_eq!(
            LocalType::Text.input(" padded ").expect("text"),
            ScalarValue::Utf8(Some(" padded ".to_string()))
        );
    }

    #[test]
    fn input_parses_temporal_types() {
        assert_eq!(
            LocalType::Date.input("1970-01-02").expect("date"),
            ScalarValue::Date32(Some(1))
        );
        assert_eq!(
            LocalType::Timestamp
                .input("1970-01-01 00:00:01")
                .expect("timestamp"),
            ScalarValue::TimestampNanosecond(Some(1_000_000_000), None)
        );
        assert_eq!(
            LocalType::Timestamp
                .input("1970-01-01T00:00:00.5Z")
                .expect("rfc3339"),
            ScalarValue::TimestampNanosecond(Some(500_000_000), None)
        );
    }

    #[test]
    fn input_rejects_bad_text() {
        let err = LocalType::Integer.input("abc").expect_err("not a number");
        assert!(matches!(
            err,
            FdwError::TypeInput {
                type_name: "integer",
                ..
            }
        ));
        assert!(LocalType::Boolean.input("maybe").is_err());
        assert!(LocalType::Uuid.input("not-a-uuid").is_err());
        assert!(LocalType::Interval.input("1 day").is_err());
    }

    #[test]
    fn row_builder_fills_typed_nulls() {
        let relation = users();
        let mut builder = RowBuilder::with_capacity(1);
        builder.push(3, Some(ScalarValue::Utf8(Some("bob".to_string()))));
        builder.push(1, None);
        let row = builder.finish(&relation).expect("row");
        assert_eq!(row.get(1), Some(&ScalarValue::Int32(None)));
        assert_eq!(row.get(2), Some(&ScalarValue::Utf8(None)));
        assert_eq!(row.get(3), Some(&ScalarValue::Utf8(Some("bob".to_string()))));
    }

    #[test]
    fn row_builder_rejects_out_of_range_ordinal() {
        let mut builder = RowBuilder::default();
        builder.push(9, None);
        assert!(matches!(
            builder.finish(&users()),
            Err(FdwError::Consistency(_))
        ));
    }

    #[test]
    fn ordinals_must_fit_attr_numbers() {
        let columns = (0..=AttrNumber::MAX as usize)
            .map(|index| LocalColumn::new(format!("c{index}"), LocalType::Integer))
            .collect::<Vec<_>>();
        let wide = LocalRelation::new("wide", columns);
        assert!(matches!(wide.check_attnos(), Err(FdwError::Configuration(_))));
        assert_eq!(wide.numbered_columns().count(), AttrNumber::MAX as usize);
        assert_eq!(
            wide.numbered_columns().last().map(|(attno, _)| attno),
            Some(AttrNumber::MAX)
        );

        users().check_attnos().expect("narrow table");
    }

    #[test]
    fn width_sums_used_columns() {
        let relation = users();
        assert_eq!(AttrsUsed::whole_row().width(&relation), 4 + 32);
        assert_eq!(AttrsUsed::with_columns([1]).width(&relation), 4);
    }
}
