use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, NullArray, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use crate::errors::ConversionError;
use crate::record::{check_uniform, Record, Value};

/// Converts a uniform batch of records into one arrow batch, column by column.
///
/// Column types come from the first non-null value of each field. Mixing
/// value kinds in one column or holding list values is rejected, which sends
/// the write strategy down its row fallback.
pub fn to_record_batch(batch: &[Record]) -> Result<RecordBatch, ConversionError> {
    check_uniform(batch)?;
    let first = &batch[0];

    let mut fields = Vec::with_capacity(first.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(first.len());

    for (position, name) in first.field_names().enumerate() {
        let column: Vec<&Value> = batch.iter().map(|r| &r.fields()[position].1).collect();
        let data_type = infer_column_type(name, &column)?;
        arrays.push(create_array_from_values(&data_type, &column));
        fields.push(Field::new(name, data_type, true));
    }

    let record_batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
    Ok(record_batch)
}

fn infer_column_type(column: &str, values: &[&Value]) -> Result<ArrowDataType, ConversionError> {
    let mut first: Option<&Value> = None;

    for value in values {
        if value.is_null() {
            continue;
        }
        if let Value::List(_) = value {
            return Err(ConversionError::UnsupportedType {
                column: column.to_string(),
                type_name: value.type_name(),
            });
        }
        match first {
            None => first = Some(*value),
            Some(seen) if std::mem::discriminant(seen) != std::mem::discriminant(*value) => {
                return Err(ConversionError::MixedTypes {
                    column: column.to_string(),
                    first: seen.type_name(),
                    other: value.type_name(),
                });
            }
            Some(_) => {}
        }
    }

    let data_type = match first {
        None => ArrowDataType::Null,
        Some(Value::Bool(_)) => ArrowDataType::Boolean,
        Some(Value::Int(_)) => ArrowDataType::Int64,
        Some(Value::Float(_)) => ArrowDataType::Float64,
        Some(Value::Text(_)) => ArrowDataType::Utf8,
        Some(Value::Timestamp(_)) => {
            ArrowDataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        }
        Some(Value::Blob(_)) => ArrowDataType::Binary,
        Some(other) => {
            return Err(ConversionError::UnsupportedType {
                column: column.to_string(),
                type_name: other.type_name(),
            });
        }
    };
    Ok(data_type)
}

// Values were type-checked by `infer_column_type`, so anything not matching
// the column type is a null.
fn create_array_from_values(data_type: &ArrowDataType, values: &[&Value]) -> ArrayRef {
    match data_type {
        ArrowDataType::Boolean => {
            let array: BooleanArray = values
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect();
            Arc::new(array)
        }
        ArrowDataType::Int64 => {
            let array: Int64Array = values
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            Arc::new(array)
        }
        ArrowDataType::Float64 => {
            let array: Float64Array = values
                .iter()
                .map(|v| match v {
                    Value::Float(f) => Some(*f),
                    _ => None,
                })
                .collect();
            Arc::new(array)
        }
        ArrowDataType::Utf8 => {
            let array: StringArray = values
                .iter()
                .map(|v| match v {
                    Value::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            Arc::new(array)
        }
        ArrowDataType::Timestamp(TimeUnit::Microsecond, _) => {
            let array: TimestampMicrosecondArray = values
                .iter()
                .map(|v| match v {
                    Value::Timestamp(ts) => Some(ts.timestamp_micros()),
                    _ => None,
                })
                .collect();
            Arc::new(array.with_timezone("UTC"))
        }
        ArrowDataType::Binary => {
            let array: BinaryArray = values
                .iter()
                .map(|v| match v {
                    Value::Blob(bytes) => Some(bytes.as_slice()),
                    _ => None,
                })
                .collect();
            Arc::new(array)
        }
        _ => Arc::new(NullArray::new(values.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use chrono::{TimeZone, Utc};

    fn person(id: i64, name: &str, score: f64) -> Record {
        Record::new()
            .with("id", id)
            .with("name", name)
            .with("score", score)
    }

    #[test]
    fn test_uniform_batch_converts() {
        let batch = vec![person(1, "Alice", 1.5), person(2, "Bob", 2.5)];
        let rb = to_record_batch(&batch).unwrap();

        assert_eq!(rb.num_rows(), 2);
        assert_eq!(rb.num_columns(), 3);
        let schema = rb.schema();
        assert_eq!(schema.field(0).name(), "id");
        assert_eq!(schema.field(0).data_type(), &ArrowDataType::Int64);
        assert_eq!(schema.field(1).data_type(), &ArrowDataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &ArrowDataType::Float64);

        let names = rb
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(1), "Bob");
    }

    #[test]
    fn test_nulls_take_column_type_from_other_rows() {
        let batch = vec![
            Record::new().with("id", 1).with("name", Value::Null),
            Record::new().with("id", 2).with("name", "Bob"),
        ];
        let rb = to_record_batch(&batch).unwrap();

        assert_eq!(rb.schema().field(1).data_type(), &ArrowDataType::Utf8);
        assert!(rb.column(1).is_null(0));
        assert!(!rb.column(1).is_null(1));
    }

    #[test]
    fn test_all_null_column() {
        let batch = vec![Record::new().with("id", 1).with("note", Value::Null)];
        let rb = to_record_batch(&batch).unwrap();

        assert_eq!(rb.schema().field(1).data_type(), &ArrowDataType::Null);
    }

    #[test]
    fn test_timestamp_column() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let batch = vec![Record::new().with("at", ts)];
        let rb = to_record_batch(&batch).unwrap();

        let column = rb
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(column.value(0), ts.timestamp_micros());
    }

    #[test]
    fn test_mixed_types_rejected() {
        let batch = vec![
            Record::new().with("score", 1),
            Record::new().with("score", 2.5),
        ];
        let err = to_record_batch(&batch).unwrap_err();

        assert!(matches!(
            err,
            ConversionError::MixedTypes {
                first: "int",
                other: "float",
                ..
            }
        ));
    }

    #[test]
    fn test_list_values_rejected() {
        let batch = vec![Record::new().with("tags", Value::List(vec![Value::Int(1)]))];

        assert!(matches!(
            to_record_batch(&batch),
            Err(ConversionError::UnsupportedType { type_name: "list", .. })
        ));
    }

    #[test]
    fn test_heterogeneous_shapes_rejected() {
        let batch = vec![
            Record::new().with("id", 1),
            Record::new().with("id", 2).with("extra", true),
        ];

        assert!(matches!(
            to_record_batch(&batch),
            Err(ConversionError::SchemaMismatch { .. })
        ));
    }
}
