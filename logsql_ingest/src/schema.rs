//! Inferring a column schema from the first JSON record of a request.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Fields, Schema};
use serde_json::{Map, Number, Value};

/// Schema of `record`, one nullable column per field whose value maps to a
/// storage type. Fields that don't map (nulls, empty objects, empty arrays)
/// are left out.
pub fn infer_schema(record: &Map<String, Value>) -> Schema {
    Schema::new(infer_fields(record))
}

fn infer_fields(record: &Map<String, Value>) -> Fields {
    record
        .iter()
        .filter_map(|(name, value)| Some(Field::new(name, data_type(value)?, true)))
        .collect()
}

/// Storage type of one JSON value.
pub fn data_type(value: &Value) -> Option<DataType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(DataType::Boolean),
        Value::Number(n) => Some(number_type(n)),
        Value::String(_) => Some(DataType::Utf8),
        Value::Array(items) => {
            let item = items.iter().find_map(data_type)?;
            Some(DataType::List(Arc::new(Field::new("item", item, true))))
        }
        Value::Object(fields) => {
            let fields = infer_fields(fields);
            (!fields.is_empty()).then_some(DataType::Struct(fields))
        }
    }
}

fn number_type(n: &Number) -> DataType {
    if n.is_i64() {
        DataType::Int64
    } else {
        // u64 beyond i64::MAX included
        DataType::Float64
    }
}
