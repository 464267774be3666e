//! Script stage backed by an embedded Rhai interpreter.
//!
//! Declared inputs are bound into the script scope by name and declared
//! outputs are read back after evaluation, so a script can be as short as:
//!
//! ```rhai
//! second = first + 2
//! ```
//!
//! Arithmetic between arrays and numbers is element-wise.

use async_trait::async_trait;
use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, Map, Position, Scope, AST, FLOAT, INT};
use tokio::sync::{Mutex, OnceCell};

use modelgate_common::{
    BoundingBox, Column, ColumnData, DType, FieldSpec, Record, Schema, Table, Tensor, Value,
    ValueKind,
};

use crate::config::ScriptStepConfig;
use crate::error::{GatewayError, Result};
use crate::stage::{RequestContext, Stage};

pub struct ScriptStage {
    config: ScriptStepConfig,
    schema_in: Schema,
    schema_out: Schema,
    engine: Engine,
    compiled: OnceCell<AST>,
    /// Held for the whole evaluation unless the script is reentrant.
    exclusive: Mutex<()>,
}

impl ScriptStage {
    pub fn new(config: ScriptStepConfig) -> Self {
        Self {
            schema_in: Schema::new(config.inputs.clone()),
            schema_out: Schema::new(config.outputs.clone()),
            engine: build_engine(config.max_operations),
            compiled: OnceCell::new(),
            exclusive: Mutex::new(()),
            config,
        }
    }

    fn script_error(&self, message: impl Into<String>) -> GatewayError {
        GatewayError::UserScript {
            stage: self.config.name.clone(),
            message: message.into(),
        }
    }

    fn run(&self, ast: &AST, input: &Record) -> Result<Record> {
        let mut scope = Scope::new();
        for spec in self.schema_in.fields() {
            if let Some(value) = input.get(&spec.name) {
                scope.push_dynamic(spec.name.clone(), to_dynamic(value));
            }
        }
        for spec in self.schema_out.fields() {
            if !scope.contains(&spec.name) {
                scope.push_dynamic(spec.name.clone(), Dynamic::UNIT);
            }
        }

        self.engine
            .run_ast_with_scope(&mut scope, ast)
            .map_err(|e| self.script_error(e.to_string()))?;

        let mut output = Record::new();
        for spec in self.schema_out.fields() {
            let result = scope
                .get_value::<Dynamic>(&spec.name)
                .filter(|d| !d.is_unit())
                .ok_or_else(|| self.script_error(format!("output '{}' was not assigned", spec.name)))?;
            let value = from_dynamic(result, spec).map_err(|e| self.script_error(e))?;
            output.insert(spec.name.clone(), value)?;
        }
        Ok(output)
    }
}

#[async_trait]
impl Stage for ScriptStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &'static str {
        "script"
    }

    fn schema_in(&self) -> &Schema {
        &self.schema_in
    }

    fn schema_out(&self) -> &Schema {
        &self.schema_out
    }

    fn is_thread_safe(&self) -> bool {
        self.config.reentrant
    }

    async fn init(&self) -> Result<()> {
        let source = match (&self.config.code, &self.config.code_path) {
            (Some(code), _) => code.clone(),
            (None, Some(path)) => tokio::fs::read_to_string(path).await.map_err(|e| {
                GatewayError::Config(format!(
                    "step '{}': cannot read {}: {}",
                    self.config.name,
                    path.display(),
                    e
                ))
            })?,
            (None, None) => {
                return Err(GatewayError::Config(format!(
                    "step '{}': no script source",
                    self.config.name
                )))
            }
        };
        let ast = self.engine.compile(&source).map_err(|e| {
            GatewayError::Config(format!("step '{}': compile error: {}", self.config.name, e))
        })?;
        tracing::debug!(stage = %self.config.name, "Script compiled");
        // a second init keeps the first compilation
        let _ = self.compiled.set(ast);
        Ok(())
    }

    async fn apply(&self, input: &Record, _ctx: &RequestContext) -> Result<Record> {
        let ast = self
            .compiled
            .get()
            .ok_or_else(|| GatewayError::NotReady(format!("stage '{}' is not initialized", self.config.name)))?;

        if self.config.reentrant {
            return self.run(ast, input);
        }
        let _guard = self.exclusive.lock().await;
        self.run(ast, input)
    }
}

// ============================================================================
// Engine
// ============================================================================

fn build_engine(max_operations: Option<u64>) -> Engine {
    let mut engine = Engine::new();
    // route arithmetic through registered overloads
    engine.set_fast_operators(false);
    if let Some(max) = max_operations {
        engine.set_max_operations(max);
    }

    for op in [Op::Add, Op::Sub, Op::Mul, Op::Div] {
        let symbol = op.symbol();
        engine.register_fn(symbol, move |a: Array, b: INT| elementwise(a, Dynamic::from(b), op, false));
        engine.register_fn(symbol, move |a: Array, b: FLOAT| elementwise(a, Dynamic::from(b), op, false));
        engine.register_fn(symbol, move |a: INT, b: Array| elementwise(b, Dynamic::from(a), op, true));
        engine.register_fn(symbol, move |a: FLOAT, b: Array| elementwise(b, Dynamic::from(a), op, true));
        if op != Op::Add {
            engine.register_fn(symbol, move |a: Array, b: Array| zip_arrays(a, b, op));
        }
    }
    engine
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
        }
    }

    fn ints(self, a: INT, b: INT) -> std::result::Result<INT, Box<EvalAltResult>> {
        match self {
            Op::Add => Ok(a.wrapping_add(b)),
            Op::Sub => Ok(a.wrapping_sub(b)),
            Op::Mul => Ok(a.wrapping_mul(b)),
            Op::Div if b == 0 => Err(runtime_error("division by zero")),
            Op::Div => Ok(a / b),
        }
    }

    fn floats(self, a: FLOAT, b: FLOAT) -> FLOAT {
        match self {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
        }
    }
}

fn runtime_error(msg: &str) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(msg.into(), Position::NONE))
}

fn combine(a: &Dynamic, b: &Dynamic, op: Op) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
    if a.is_array() && b.is_array() {
        let left = a.clone().into_array().map_err(|t| runtime_error(t))?;
        let right = b.clone().into_array().map_err(|t| runtime_error(t))?;
        return zip_arrays(left, right, op).map(Dynamic::from_array);
    }
    if b.is_array() {
        let inner = b.clone().into_array().map_err(|t| runtime_error(t))?;
        return elementwise(inner, a.clone(), op, true).map(Dynamic::from_array);
    }
    if a.is_array() {
        let inner = a.clone().into_array().map_err(|t| runtime_error(t))?;
        return elementwise(inner, b.clone(), op, false).map(Dynamic::from_array);
    }
    match (a.as_int(), b.as_int(), a.as_float(), b.as_float()) {
        (Ok(x), Ok(y), _, _) => op.ints(x, y).map(Dynamic::from),
        (Ok(x), _, _, Ok(y)) => Ok(Dynamic::from(op.floats(x as FLOAT, y))),
        (_, Ok(y), Ok(x), _) => Ok(Dynamic::from(op.floats(x, y as FLOAT))),
        (_, _, Ok(x), Ok(y)) => Ok(Dynamic::from(op.floats(x, y))),
        _ => Err(runtime_error(&format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Apply `op` between every element of `array` and `scalar`. `flipped`
/// puts the scalar on the left.
fn elementwise(
    array: Array,
    scalar: Dynamic,
    op: Op,
    flipped: bool,
) -> std::result::Result<Array, Box<EvalAltResult>> {
    array
        .iter()
        .map(|item| {
            if flipped {
                combine(&scalar, item, op)
            } else {
                combine(item, &scalar, op)
            }
        })
        .collect()
}

fn zip_arrays(a: Array, b: Array, op: Op) -> std::result::Result<Array, Box<EvalAltResult>> {
    if a.len() != b.len() {
        return Err(runtime_error(&format!(
            "array lengths differ: {} and {}",
            a.len(),
            b.len()
        )));
    }
    a.iter().zip(&b).map(|(x, y)| combine(x, y, op)).collect()
}

// ============================================================================
// Value <-> Dynamic
// ============================================================================

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Bool(v) => Dynamic::from_bool(*v),
        Value::Int32(v) => Dynamic::from_int(*v as INT),
        Value::Int64(v) => Dynamic::from_int(*v),
        Value::Float32(v) => Dynamic::from_float(*v as FLOAT),
        Value::Float64(v) => Dynamic::from_float(*v),
        Value::String(v) => Dynamic::from(v.clone()),
        Value::Bytes(v) => Dynamic::from_blob(v.to_vec()),
        Value::Tensor(t) => tensor_to_dynamic(t),
        Value::Image(i) => {
            let mut map = Map::new();
            map.insert("format".into(), Dynamic::from(i.format().as_str().to_string()));
            map.insert("width".into(), Dynamic::from_int(i.width() as INT));
            map.insert("height".into(), Dynamic::from_int(i.height() as INT));
            map.insert("pixels".into(), Dynamic::from_blob(i.pixels().to_vec()));
            Dynamic::from_map(map)
        }
        Value::Table(t) => {
            let mut map = Map::new();
            for column in t.columns() {
                let values = column_to_array(&column.data);
                map.insert(column.name.as_str().into(), Dynamic::from_array(values));
            }
            Dynamic::from_map(map)
        }
        Value::List(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Record(r) => {
            let mut map = Map::new();
            for (name, value) in r.iter() {
                map.insert(name.into(), to_dynamic(value));
            }
            Dynamic::from_map(map)
        }
        Value::BoundingBoxes(boxes) => Dynamic::from_array(
            boxes
                .iter()
                .map(|b| {
                    let mut map = Map::new();
                    map.insert("cx".into(), Dynamic::from_float(b.cx as FLOAT));
                    map.insert("cy".into(), Dynamic::from_float(b.cy as FLOAT));
                    map.insert("w".into(), Dynamic::from_float(b.w as FLOAT));
                    map.insert("h".into(), Dynamic::from_float(b.h as FLOAT));
                    if let Some(label) = &b.label {
                        map.insert("label".into(), Dynamic::from(label.clone()));
                    }
                    if let Some(p) = b.probability {
                        map.insert("probability".into(), Dynamic::from_float(p as FLOAT));
                    }
                    Dynamic::from_map(map)
                })
                .collect(),
        ),
    }
}

fn column_to_array(data: &ColumnData) -> Array {
    match data {
        ColumnData::Bool(v) => v.iter().map(|x| Dynamic::from_bool(*x)).collect(),
        ColumnData::Int32(v) => v.iter().map(|x| Dynamic::from_int(*x as INT)).collect(),
        ColumnData::Int64(v) => v.iter().map(|x| Dynamic::from_int(*x)).collect(),
        ColumnData::Float32(v) => v.iter().map(|x| Dynamic::from_float(*x as FLOAT)).collect(),
        ColumnData::Float64(v) => v.iter().map(|x| Dynamic::from_float(*x)).collect(),
        ColumnData::Utf8(v) => v.iter().map(|x| Dynamic::from(x.clone())).collect(),
    }
}

/// A tensor as nested arrays following its shape.
fn tensor_to_dynamic(tensor: &Tensor) -> Dynamic {
    let flat: Vec<Dynamic> = if let Some(strings) = tensor.strings() {
        strings.iter().map(|s| Dynamic::from(s.clone())).collect()
    } else if tensor.dtype().is_float() {
        tensor.to_f64_vec().unwrap_or_default().into_iter().map(Dynamic::from_float).collect()
    } else if tensor.dtype() == DType::Bool {
        tensor.to_i64_vec().unwrap_or_default().into_iter().map(|v| Dynamic::from_bool(v != 0)).collect()
    } else {
        tensor.to_i64_vec().unwrap_or_default().into_iter().map(Dynamic::from_int).collect()
    };
    nest(flat, tensor.shape())
}

fn nest(flat: Vec<Dynamic>, shape: &[usize]) -> Dynamic {
    match shape {
        [] => flat.into_iter().next().unwrap_or(Dynamic::UNIT),
        [_] => Dynamic::from_array(flat),
        [_, rest @ ..] => {
            let chunk = rest.iter().product::<usize>().max(1);
            let mut rows = Array::new();
            let mut iter = flat.into_iter();
            loop {
                let row: Vec<Dynamic> = iter.by_ref().take(chunk).collect();
                if row.is_empty() {
                    break;
                }
                rows.push(nest(row, rest));
            }
            Dynamic::from_array(rows)
        }
    }
}

type ConvResult<T> = std::result::Result<T, String>;

/// Read a script result back as the declared kind.
fn from_dynamic(d: Dynamic, spec: &FieldSpec) -> ConvResult<Value> {
    let name = &spec.name;
    let mismatch = |d: &Dynamic| format!("output '{}' must be {}, got {}", name, spec.kind, d.type_name());
    match spec.kind {
        ValueKind::Bool => d.as_bool().map(Value::Bool).map_err(|_| mismatch(&d)),
        ValueKind::Int32 => d
            .as_int()
            .map_err(|_| mismatch(&d))
            .and_then(|v| i32::try_from(v).map_err(|_| format!("output '{}' overflows int32", name)))
            .map(Value::Int32),
        ValueKind::Int64 => d.as_int().map(Value::Int64).map_err(|_| mismatch(&d)),
        ValueKind::Float32 => number(&d).map(|v| Value::Float32(v as f32)).ok_or_else(|| mismatch(&d)),
        ValueKind::Float64 => number(&d).map(Value::Float64).ok_or_else(|| mismatch(&d)),
        ValueKind::String => match d.clone().into_string() {
            Ok(s) => Ok(Value::String(s)),
            Err(_) => Err(mismatch(&d)),
        },
        ValueKind::Bytes => match d.clone().try_cast::<Blob>() {
            Some(blob) => Ok(Value::Bytes(blob.into())),
            None => Err(mismatch(&d)),
        },
        ValueKind::Tensor => dynamic_to_tensor(&d, spec.dtype).map(Value::Tensor),
        ValueKind::List => {
            let array = d.clone().into_array().map_err(|_| mismatch(&d))?;
            let items = array.into_iter().map(infer_value).collect::<ConvResult<Vec<_>>>()?;
            Value::list(items).map_err(|e| format!("output '{}': {}", name, e))
        }
        ValueKind::Record => infer_value(d).and_then(|v| match v {
            Value::Record(r) => Ok(Value::Record(r)),
            other => Err(format!("output '{}' must be record, got {}", name, other.kind())),
        }),
        ValueKind::BoundingBoxes => {
            let array = d.clone().into_array().map_err(|_| mismatch(&d))?;
            array.into_iter().map(dynamic_to_box).collect::<ConvResult<Vec<_>>>().map(Value::BoundingBoxes)
        }
        ValueKind::Table => {
            let map = d.clone().try_cast::<Map>().ok_or_else(|| mismatch(&d))?;
            let mut columns = Vec::with_capacity(map.len());
            for (column, values) in map {
                let values = values.into_array().map_err(|t| format!("column '{}' is {}", column, t))?;
                let tensor = dynamic_to_tensor(&Dynamic::from_array(values), None)?;
                let data = ColumnData::from_tensor(&tensor).map_err(|e| e.to_string())?;
                columns.push(Column::new(column.as_str(), data));
            }
            Table::new(columns).map(Value::Table).map_err(|e| e.to_string())
        }
        ValueKind::Image => Err(format!("output '{}': scripts cannot produce images", name)),
    }
}

fn number(d: &Dynamic) -> Option<f64> {
    d.as_float().ok().or_else(|| d.as_int().ok().map(|v| v as f64))
}

/// Convert without a declaration: ints become int64, floats float64,
/// arrays lists and maps records.
fn infer_value(d: Dynamic) -> ConvResult<Value> {
    if let Ok(v) = d.as_bool() {
        return Ok(Value::Bool(v));
    }
    if let Ok(v) = d.as_int() {
        return Ok(Value::Int64(v));
    }
    if let Ok(v) = d.as_float() {
        return Ok(Value::Float64(v));
    }
    if d.is_string() {
        return d.into_string().map(Value::String).map_err(|t| t.to_string());
    }
    if d.is_array() {
        let array = d.into_array().map_err(|t| t.to_string())?;
        let items = array.into_iter().map(infer_value).collect::<ConvResult<Vec<_>>>()?;
        return Value::list(items).map_err(|e| e.to_string());
    }
    if d.is_blob() {
        return d.try_cast::<Blob>().map(|b| Value::Bytes(b.into())).ok_or_else(|| "bad blob".to_string());
    }
    if d.is_map() {
        let map = d.try_cast::<Map>().ok_or_else(|| "bad map".to_string())?;
        let mut record = Record::new();
        for (key, value) in map {
            record.insert(key.as_str(), infer_value(value)?).map_err(|e| e.to_string())?;
        }
        return Ok(Value::Record(record));
    }
    Err(format!("cannot convert {} to a value", d.type_name()))
}

fn dynamic_to_tensor(d: &Dynamic, dtype: Option<DType>) -> ConvResult<Tensor> {
    fn shape_of(d: &Dynamic) -> ConvResult<Vec<usize>> {
        if !d.is_array() {
            return Ok(Vec::new());
        }
        let array = d.clone().into_array().map_err(|t| t.to_string())?;
        let mut shape = vec![array.len()];
        if let Some(first) = array.first() {
            let inner = shape_of(first)?;
            for item in &array[1..] {
                if shape_of(item)? != inner {
                    return Err("ragged nested array".to_string());
                }
            }
            shape.extend(inner);
        }
        Ok(shape)
    }
    fn leaves(d: &Dynamic, out: &mut Vec<Dynamic>) {
        match d.clone().into_array() {
            Ok(array) => array.iter().for_each(|item| leaves(item, out)),
            Err(_) => out.push(d.clone()),
        }
    }

    let shape = shape_of(d)?;
    let mut flat = Vec::new();
    leaves(d, &mut flat);

    if flat.iter().all(|v| v.is_string()) && !flat.is_empty() {
        let strings = flat.into_iter().map(|v| v.to_string()).collect();
        return Tensor::from_strings(shape, strings).map_err(|e| e.to_string());
    }
    let all_ints = flat.iter().all(|v| v.is_int() || v.is_bool());
    let dtype = dtype.unwrap_or(if all_ints { DType::I64 } else { DType::F64 });
    if dtype.is_float() || !all_ints {
        let values = flat
            .iter()
            .map(|v| number(v).or_else(|| v.as_bool().ok().map(f64::from)).ok_or_else(|| format!("non-numeric element {}", v.type_name())))
            .collect::<ConvResult<Vec<_>>>()?;
        Tensor::from_f64_values(dtype, shape, &values).map_err(|e| e.to_string())
    } else {
        let values = flat
            .iter()
            .map(|v| v.as_int().or_else(|_| v.as_bool().map(INT::from)).map_err(|t| t.to_string()))
            .collect::<ConvResult<Vec<_>>>()?;
        Tensor::from_i64_values(dtype, shape, &values).map_err(|e| e.to_string())
    }
}

fn dynamic_to_box(d: Dynamic) -> ConvResult<BoundingBox> {
    let map = d.try_cast::<Map>().ok_or_else(|| "bounding boxes must be maps".to_string())?;
    let coord = |key: &str| {
        map.get(key)
            .and_then(number)
            .map(|v| v as f32)
            .ok_or_else(|| format!("bounding box needs a numeric '{}'", key))
    };
    let mut b = BoundingBox::new(coord("cx")?, coord("cy")?, coord("w")?, coord("h")?);
    if let Some(label) = map.get("label") {
        b = b.with_label(label.to_string());
    }
    if let Some(p) = map.get("probability").and_then(number) {
        b = b.with_probability(p as f32);
    }
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn stage(code: &str, inputs: Vec<FieldSpec>, outputs: Vec<FieldSpec>) -> ScriptStage {
        ScriptStage::new(ScriptStepConfig {
            name: "script".into(),
            language: Default::default(),
            code: Some(code.into()),
            code_path: None,
            inputs,
            outputs,
            reentrant: false,
            max_operations: None,
        })
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_add_scalar_to_list() {
        let stage = stage(
            "second = first + 2",
            vec![FieldSpec::new("first", ValueKind::List)],
            vec![FieldSpec::new("second", ValueKind::List)],
        );
        stage.init().await.unwrap();

        let input = Record::new()
            .with("first", Value::List(vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]))
            .unwrap();
        let output = stage.apply(&input, &ctx()).await.unwrap();
        assert_eq!(
            output.get("second"),
            Some(&Value::List(vec![Value::Int64(3), Value::Int64(4), Value::Int64(5)]))
        );
        assert_eq!(output.len(), 1);
    }

    #[tokio::test]
    async fn test_tensor_round_trip_with_declared_dtype() {
        let stage = stage(
            "y = x * 0.5",
            vec![FieldSpec::tensor("x")],
            vec![FieldSpec::tensor("y").with_dtype(DType::F32)],
        );
        stage.init().await.unwrap();

        let x = Tensor::from_f32(vec![2, 2], &[2.0, 4.0, 6.0, 8.0]).unwrap();
        let output = stage.apply(&Record::new().with("x", x).unwrap(), &ctx()).await.unwrap();
        let y = output.get("y").and_then(Value::as_tensor).unwrap();
        assert_eq!(y.dtype(), DType::F32);
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(y.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_thrown_error_keeps_message() {
        let stage = stage(
            r#"throw "bad input""#,
            vec![],
            vec![FieldSpec::new("out", ValueKind::Int64)],
        );
        stage.init().await.unwrap();
        let err = stage.apply(&Record::new(), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "UserScriptError");
        assert_eq!(err.status().as_u16(), 422);
        assert!(err.to_string().contains("bad input"));
    }

    #[tokio::test]
    async fn test_trailing_expression_is_ignored() {
        let stage = stage("out = 7; out * 2", vec![], vec![FieldSpec::new("out", ValueKind::Int64)]);
        stage.init().await.unwrap();
        let output = stage.apply(&Record::new(), &ctx()).await.unwrap();
        assert_eq!(output.get("out"), Some(&Value::Int64(7)));
    }

    #[tokio::test]
    async fn test_unassigned_output() {
        let stage = stage("let z = 1;", vec![], vec![FieldSpec::new("out", ValueKind::Int64)]);
        stage.init().await.unwrap();
        let err = stage.apply(&Record::new(), &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("'out' was not assigned"));
    }

    #[tokio::test]
    async fn test_compile_error_is_config_error() {
        let stage = stage("let = ;", vec![], vec![FieldSpec::new("out", ValueKind::Int64)]);
        assert_eq!(stage.init().await.unwrap_err().kind(), "ConfigError");
    }

    #[tokio::test]
    async fn test_apply_before_init() {
        let stage = stage("out = 1", vec![], vec![FieldSpec::new("out", ValueKind::Int64)]);
        assert_eq!(stage.apply(&Record::new(), &ctx()).await.unwrap_err().kind(), "NotReady");
    }

    #[tokio::test]
    async fn test_record_output() {
        let stage = stage(
            r#"meta = #{ name: name, size: 3 }"#,
            vec![FieldSpec::new("name", ValueKind::String)],
            vec![FieldSpec::new("meta", ValueKind::Record)],
        );
        stage.init().await.unwrap();
        let output = stage
            .apply(&Record::new().with("name", "cat").unwrap(), &ctx())
            .await
            .unwrap();
        match output.get("meta") {
            Some(Value::Record(r)) => {
                assert_eq!(r.get("name"), Some(&Value::String("cat".into())));
                assert_eq!(r.get("size"), Some(&Value::Int64(3)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let stage = Arc::new(stage(
            "let n = 0; for i in 0..2000 { n += i; } out = n",
            vec![],
            vec![FieldSpec::new("out", ValueKind::Int64)],
        ));
        assert!(!stage.is_thread_safe());
        stage.init().await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stage = stage.clone();
                tokio::spawn(async move { stage.apply(&Record::new(), &ctx()).await })
            })
            .collect();
        for handle in handles {
            let output = handle.await.unwrap().unwrap();
            assert_eq!(output.get("out"), Some(&Value::Int64(1999 * 2000 / 2)));
        }
    }
}
