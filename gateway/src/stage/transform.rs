//! Declarative column operations over a table field.

use async_trait::async_trait;

use modelgate_common::{Column, ColumnData, FieldSpec, Record, Schema, Table, Value, ValueKind};

use crate::config::{ColumnType, TransformOp, TransformStepConfig};
use crate::error::{GatewayError, Result};
use crate::stage::{RequestContext, Stage};

/// Applies the configured operations, in order, to a copy of the input
/// table. Stateless, so concurrent calls need no locking.
pub struct TransformStage {
    config: TransformStepConfig,
    schema_in: Schema,
    schema_out: Schema,
}

impl TransformStage {
    pub fn new(config: TransformStepConfig) -> Self {
        let output = config.output.clone().unwrap_or_else(|| config.input.clone());
        Self {
            schema_in: Schema::new(vec![FieldSpec::new(config.input.clone(), ValueKind::Table)]),
            schema_out: Schema::new(vec![FieldSpec::new(output, ValueKind::Table)]),
            config,
        }
    }

    fn output_name(&self) -> &str {
        self.config.output.as_deref().unwrap_or(&self.config.input)
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &'static str {
        "transform"
    }

    fn schema_in(&self) -> &Schema {
        &self.schema_in
    }

    fn schema_out(&self) -> &Schema {
        &self.schema_out
    }

    async fn apply(&self, input: &Record, _ctx: &RequestContext) -> Result<Record> {
        let table = input
            .get(&self.config.input)
            .and_then(Value::as_table)
            .ok_or_else(|| GatewayError::BadRequest(format!("missing table field '{}'", self.config.input)))?;

        let mut columns = table.columns().to_vec();
        for op in &self.config.operations {
            columns = apply_op(op, columns).map_err(|e| {
                GatewayError::SchemaMismatch(format!("stage '{}': {}", self.config.name, e))
            })?;
        }
        let table = Table::new(columns)?;
        Ok(Record::new().with(self.output_name(), table)?)
    }
}

type OpResult<T> = std::result::Result<T, String>;

fn position(columns: &[Column], name: &str) -> OpResult<usize> {
    columns
        .iter()
        .position(|c| c.name == name)
        .ok_or_else(|| format!("no column '{}'", name))
}

/// Apply one operation. Renamed and rewritten columns keep their position;
/// derived columns go to the end.
pub fn apply_op(op: &TransformOp, mut columns: Vec<Column>) -> OpResult<Vec<Column>> {
    match op {
        TransformOp::Rename { from, to } => {
            let idx = position(&columns, from)?;
            if from != to && columns.iter().any(|c| &c.name == to) {
                return Err(format!("cannot rename '{}': column '{}' exists", from, to));
            }
            columns[idx].name = to.clone();
        }
        TransformOp::Drop { columns: names } => {
            for name in names {
                position(&columns, name)?;
            }
            columns.retain(|c| !names.contains(&c.name));
        }
        TransformOp::Cast { column, to } => {
            let idx = position(&columns, column)?;
            columns[idx].data = cast(&columns[idx].data, *to).map_err(|e| format!("column '{}': {}", column, e))?;
        }
        TransformOp::Append { column, suffix } => {
            let idx = position(&columns, column)?;
            let values = to_strings(&columns[idx].data);
            columns[idx].data = ColumnData::Utf8(values.into_iter().map(|v| v + suffix.as_str()).collect());
        }
        TransformOp::Prefix { column, prefix } => {
            let idx = position(&columns, column)?;
            let values = to_strings(&columns[idx].data);
            columns[idx].data = ColumnData::Utf8(values.into_iter().map(|v| format!("{}{}", prefix, v)).collect());
        }
        TransformOp::CategoricalToInteger { column, categories } => {
            let idx = position(&columns, column)?;
            let codes = to_strings(&columns[idx].data)
                .iter()
                .map(|v| {
                    categories
                        .iter()
                        .position(|c| c == v)
                        .map(|i| i as i32)
                        .ok_or_else(|| format!("column '{}': unknown category '{}'", column, v))
                })
                .collect::<OpResult<Vec<_>>>()?;
            columns[idx].data = ColumnData::Int32(codes);
        }
        TransformOp::IntegerToCategorical { column, categories } => {
            let idx = position(&columns, column)?;
            let labels = integers(&columns[idx].data)
                .ok_or_else(|| format!("column '{}' is not an integer column", column))?
                .into_iter()
                .map(|code| {
                    usize::try_from(code)
                        .ok()
                        .and_then(|i| categories.get(i))
                        .cloned()
                        .ok_or_else(|| format!("column '{}': no category for code {}", column, code))
                })
                .collect::<OpResult<Vec<_>>>()?;
            columns[idx].data = ColumnData::Utf8(labels);
        }
        TransformOp::MinMaxScale { column, min, max } => {
            let idx = position(&columns, column)?;
            let values = floats(&columns[idx].data)
                .ok_or_else(|| format!("column '{}' is not numeric", column))?;
            let range = max - min;
            let scaled = values
                .into_iter()
                .map(|v| if range == 0.0 { 0.0 } else { (v - min) / range })
                .collect();
            columns[idx].data = ColumnData::Float64(scaled);
        }
        TransformOp::OneHot { column, categories } => {
            let idx = position(&columns, column)?;
            let values = to_strings(&columns[idx].data);
            if let Some(unknown) = values.iter().find(|v| !categories.contains(*v)) {
                return Err(format!("column '{}': unknown category '{}'", column, unknown));
            }
            let source = columns.remove(idx);
            for category in categories {
                let name = format!("{}[{}]", source.name, category);
                if columns.iter().any(|c| c.name == name) {
                    return Err(format!("one-hot column '{}' already exists", name));
                }
                let flags = values.iter().map(|v| i32::from(v == category)).collect();
                columns.push(Column::new(name, ColumnData::Int32(flags)));
            }
        }
    }
    Ok(columns)
}

fn to_strings(data: &ColumnData) -> Vec<String> {
    match data {
        ColumnData::Bool(v) => v.iter().map(|x| x.to_string()).collect(),
        ColumnData::Int32(v) => v.iter().map(|x| x.to_string()).collect(),
        ColumnData::Int64(v) => v.iter().map(|x| x.to_string()).collect(),
        ColumnData::Float32(v) => v.iter().map(|x| x.to_string()).collect(),
        ColumnData::Float64(v) => v.iter().map(|x| x.to_string()).collect(),
        ColumnData::Utf8(v) => v.clone(),
    }
}

fn integers(data: &ColumnData) -> Option<Vec<i64>> {
    match data {
        ColumnData::Int32(v) => Some(v.iter().map(|x| *x as i64).collect()),
        ColumnData::Int64(v) => Some(v.clone()),
        _ => None,
    }
}

fn floats(data: &ColumnData) -> Option<Vec<f64>> {
    match data {
        ColumnData::Int32(v) => Some(v.iter().map(|x| *x as f64).collect()),
        ColumnData::Int64(v) => Some(v.iter().map(|x| *x as f64).collect()),
        ColumnData::Float32(v) => Some(v.iter().map(|x| *x as f64).collect()),
        ColumnData::Float64(v) => Some(v.clone()),
        _ => None,
    }
}

fn parse_all<T: std::str::FromStr>(values: &[String]) -> OpResult<Vec<T>> {
    values
        .iter()
        .map(|v| v.trim().parse::<T>().map_err(|_| format!("cannot parse '{}'", v)))
        .collect()
}

fn cast(data: &ColumnData, to: ColumnType) -> OpResult<ColumnData> {
    if let ColumnData::Utf8(values) = data {
        return Ok(match to {
            ColumnType::Bool => ColumnData::Bool(parse_all(values)?),
            ColumnType::Int32 => ColumnData::Int32(parse_all(values)?),
            ColumnType::Int64 => ColumnData::Int64(parse_all(values)?),
            ColumnType::Float32 => ColumnData::Float32(parse_all(values)?),
            ColumnType::Float64 => ColumnData::Float64(parse_all(values)?),
            ColumnType::String => data.clone(),
        });
    }
    let numbers: Vec<f64> = match data {
        ColumnData::Bool(v) => v.iter().map(|x| f64::from(u8::from(*x))).collect(),
        other => floats(other).unwrap_or_default(),
    };
    Ok(match to {
        ColumnType::Bool => ColumnData::Bool(numbers.iter().map(|v| *v != 0.0).collect()),
        ColumnType::Int32 => ColumnData::Int32(match integers(data) {
            Some(ints) => ints
                .into_iter()
                .map(|v| i32::try_from(v).map_err(|_| format!("{} overflows int32", v)))
                .collect::<OpResult<Vec<_>>>()?,
            None => numbers.iter().map(|v| *v as i32).collect(),
        }),
        ColumnType::Int64 => ColumnData::Int64(match integers(data) {
            Some(ints) => ints,
            None => numbers.iter().map(|v| *v as i64).collect(),
        }),
        ColumnType::Float32 => ColumnData::Float32(numbers.iter().map(|v| *v as f32).collect()),
        ColumnType::Float64 => ColumnData::Float64(numbers),
        ColumnType::String => ColumnData::Utf8(to_strings(data)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table() -> Table {
        Table::new(vec![
            Column::new("id", ColumnData::Int64(vec![1, 2, 3])),
            Column::new("color", ColumnData::Utf8(vec!["red".into(), "green".into(), "red".into()])),
            Column::new("size", ColumnData::Utf8(vec!["10".into(), "20".into(), "30".into()])),
        ])
        .unwrap()
    }

    fn names(columns: &[Column]) -> Vec<&str> {
        columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_rename_keeps_position() {
        let columns = apply_op(
            &TransformOp::Rename { from: "color".into(), to: "colour".into() },
            table().into_columns(),
        )
        .unwrap();
        assert_eq!(names(&columns), vec!["id", "colour", "size"]);
    }

    #[test]
    fn test_rename_onto_existing_column() {
        let err = apply_op(
            &TransformOp::Rename { from: "color".into(), to: "id".into() },
            table().into_columns(),
        )
        .unwrap_err();
        assert!(err.contains("exists"));
    }

    #[test]
    fn test_drop_preserves_order() {
        let columns = apply_op(
            &TransformOp::Drop { columns: vec!["color".into()] },
            table().into_columns(),
        )
        .unwrap();
        assert_eq!(names(&columns), vec!["id", "size"]);
    }

    #[test]
    fn test_cast_string_to_float() {
        let columns = apply_op(
            &TransformOp::Cast { column: "size".into(), to: ColumnType::Float32 },
            table().into_columns(),
        )
        .unwrap();
        assert_eq!(columns[2].data, ColumnData::Float32(vec![10.0, 20.0, 30.0]));
    }

    #[test]
    fn test_cast_unparsable() {
        let err = apply_op(
            &TransformOp::Cast { column: "color".into(), to: ColumnType::Int32 },
            table().into_columns(),
        )
        .unwrap_err();
        assert!(err.contains("cannot parse 'red'"));
    }

    #[test]
    fn test_append_and_prefix() {
        let columns = apply_op(
            &TransformOp::Append { column: "id".into(), suffix: "x".into() },
            table().into_columns(),
        )
        .unwrap();
        let columns = apply_op(&TransformOp::Prefix { column: "id".into(), prefix: "#".into() }, columns).unwrap();
        assert_eq!(columns[0].data, ColumnData::Utf8(vec!["#1x".into(), "#2x".into(), "#3x".into()]));
    }

    #[test]
    fn test_categorical_round_trip() {
        let categories = vec!["green".to_string(), "red".to_string()];
        let columns = apply_op(
            &TransformOp::CategoricalToInteger { column: "color".into(), categories: categories.clone() },
            table().into_columns(),
        )
        .unwrap();
        assert_eq!(columns[1].data, ColumnData::Int32(vec![1, 0, 1]));

        let columns = apply_op(
            &TransformOp::IntegerToCategorical { column: "color".into(), categories },
            columns,
        )
        .unwrap();
        assert_eq!(columns[1].data, table().columns()[1].data);
    }

    #[test]
    fn test_unknown_category() {
        let err = apply_op(
            &TransformOp::CategoricalToInteger { column: "color".into(), categories: vec!["red".into()] },
            table().into_columns(),
        )
        .unwrap_err();
        assert!(err.contains("unknown category 'green'"));
    }

    #[test]
    fn test_min_max_scale() {
        let columns = apply_op(
            &TransformOp::MinMaxScale { column: "id".into(), min: 1.0, max: 3.0 },
            table().into_columns(),
        )
        .unwrap();
        assert_eq!(columns[0].data, ColumnData::Float64(vec![0.0, 0.5, 1.0]));
    }

    #[test]
    fn test_one_hot_appends_derived_columns() {
        let columns = apply_op(
            &TransformOp::OneHot { column: "color".into(), categories: vec!["red".into(), "green".into()] },
            table().into_columns(),
        )
        .unwrap();
        assert_eq!(names(&columns), vec!["id", "size", "color[red]", "color[green]"]);
        assert_eq!(columns[2].data, ColumnData::Int32(vec![1, 0, 1]));
        assert_eq!(columns[3].data, ColumnData::Int32(vec![0, 1, 0]));
    }

    #[tokio::test]
    async fn test_stage_writes_output_field() {
        let stage = TransformStage::new(TransformStepConfig {
            name: "prep".into(),
            input: "table".into(),
            output: Some("features".into()),
            operations: vec![
                TransformOp::Drop { columns: vec!["id".into()] },
                TransformOp::Cast { column: "size".into(), to: ColumnType::Int64 },
            ],
        });
        let input = Record::new().with("table", table()).unwrap();
        let output = stage
            .apply(&input, &RequestContext::new(Duration::from_secs(1)))
            .await
            .unwrap();

        stage.schema_out().validate(&output).unwrap();
        let features = output.get("features").and_then(Value::as_table).unwrap();
        assert_eq!(features.column("size").unwrap().data, ColumnData::Int64(vec![10, 20, 30]));
        assert!(features.column("id").is_none());
    }

    #[tokio::test]
    async fn test_stage_error_names_stage() {
        let stage = TransformStage::new(TransformStepConfig {
            name: "prep".into(),
            input: "table".into(),
            output: None,
            operations: vec![TransformOp::Drop { columns: vec!["missing".into()] }],
        });
        let input = Record::new().with("table", table()).unwrap();
        let err = stage
            .apply(&input, &RequestContext::new(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SchemaMismatch");
        assert!(err.to_string().contains("stage 'prep': no column 'missing'"));
    }
}
