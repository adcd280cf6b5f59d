//! Time-series bucket unpacking. A bucket stores its measurements as
//! columns under `data`, each column keyed by row index; unpacking emits one
//! document per row.

use std::collections::VecDeque;

use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::value::Value;

/// Span used by `$_unpackBucket`, which does not take one.
const DEFAULT_BUCKET_MAX_SPAN_SECONDS: i32 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketFields {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl BucketFields {
    fn wants(&self, field: &str) -> bool {
        match self {
            BucketFields::Include(fields) => fields.iter().any(|f| f == field),
            BucketFields::Exclude(fields) => !fields.iter().any(|f| f == field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackBucketSpec {
    pub time_field: String,
    /// Name the bucket's `meta` value takes in each measurement.
    pub meta_field: Option<String>,
    pub fields: BucketFields,
    /// Top-level bucket fields copied onto every measurement.
    pub computed_meta_fields: Vec<String>,
    pub bucket_max_span_seconds: i32,
    pub assume_no_mixed_schema_data: bool,
    pub fixed_buckets: bool,
}

fn string_list(value: &Value, what: &str, error_codes: [i32; 3]) -> Result<Vec<String>> {
    let [not_array, not_string, dotted] = error_codes;
    let items = value.as_array().ok_or_else(|| {
        Error::location(not_array, format!("{what} must be an array, got: {}", value.type_name()))
    })?;
    items
        .iter()
        .map(|item| {
            let field = item.as_str().ok_or_else(|| {
                Error::location(
                    not_string,
                    format!("{what} element must be a string, got: {}", item.type_name()),
                )
            })?;
            if field.contains('.') {
                return Err(Error::location(
                    dotted,
                    format!("{what} element must be a single-element field path"),
                ));
            }
            Ok(field.to_string())
        })
        .collect()
}

fn time_field_name(value: &Value, code: i32) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::location(code, format!("timeField field must be a string, got: {}", value.type_name())))
}

fn meta_field_name(value: &Value, not_string: i32, dotted: i32) -> Result<String> {
    let name = value.as_str().ok_or_else(|| {
        Error::location(not_string, format!("metaField field must be a string, got: {}", value.type_name()))
    })?;
    if name.contains('.') {
        return Err(Error::location(dotted, "metaField field must be a single-element field path"));
    }
    Ok(name.to_string())
}

fn bool_option(name: &str, value: &Value, code: i32) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(Error::location(
            code,
            format!("{name} field must be a bool, got: {}", other.type_name()),
        )),
    }
}

impl UnpackBucketSpec {
    /// `$_internalUnpackBucket`. `timeField` and `bucketMaxSpanSeconds` are
    /// required; without include/exclude every field is kept.
    pub fn parse_internal(body: &Value) -> Result<Self> {
        let obj = body.as_document().ok_or_else(|| {
            Error::location(
                codes::UNPACK_SPEC_NOT_OBJECT,
                format!("$_internalUnpackBucket specification must be an object, got: {}", body.type_name()),
            )
        })?;
        let mut fields = None;
        let mut time_field = None;
        let mut meta_field = None;
        let mut span = None;
        let mut computed_meta_fields = Vec::new();
        let mut assume_no_mixed_schema_data = false;
        let mut fixed_buckets = false;
        for (name, v) in obj {
            match name.as_str() {
                "include" | "exclude" => {
                    if fields.is_some() {
                        return Err(Error::location(
                            codes::UNPACK_INCLUDE_AND_EXCLUDE,
                            "the $_internalUnpackBucket stage expects at most one of include/exclude parameters to be specified",
                        ));
                    }
                    let list = string_list(
                        v,
                        "include or exclude field",
                        [codes::UNPACK_FIELDS_NOT_ARRAY, codes::UNPACK_FIELD_NOT_STRING, codes::UNPACK_FIELD_DOTTED],
                    )?;
                    fields = Some(if name == "include" {
                        BucketFields::Include(list)
                    } else {
                        BucketFields::Exclude(list)
                    });
                }
                "assumeNoMixedSchemaData" => {
                    assume_no_mixed_schema_data = bool_option(name, v, codes::UNPACK_BOOL_OPTION)?;
                }
                "fixedBuckets" => fixed_buckets = bool_option(name, v, codes::UNPACK_FIXED_BUCKETS_NOT_BOOL)?,
                "timeField" => time_field = Some(time_field_name(v, codes::UNPACK_TIME_FIELD_NOT_STRING)?),
                "metaField" => {
                    meta_field = Some(meta_field_name(
                        v,
                        codes::UNPACK_META_FIELD_NOT_STRING,
                        codes::UNPACK_META_FIELD_DOTTED,
                    )?);
                }
                "bucketMaxSpanSeconds" => {
                    let Value::Int32(n) = v else {
                        return Err(Error::location(
                            codes::UNPACK_SPAN_NOT_INT,
                            format!("bucketMaxSpanSeconds field must be an integer, got: {}", v.type_name()),
                        ));
                    };
                    if *n <= 0 {
                        return Err(Error::location(
                            codes::UNPACK_SPAN_NOT_POSITIVE,
                            "bucketMaxSpanSeconds field must be greater than zero",
                        ));
                    }
                    span = Some(*n);
                }
                "computedMetaProjFields" => {
                    computed_meta_fields = string_list(
                        v,
                        "computedMetaProjFields field",
                        [
                            codes::UNPACK_COMPUTED_NOT_ARRAY,
                            codes::UNPACK_COMPUTED_NOT_STRING,
                            codes::UNPACK_COMPUTED_DOTTED,
                        ],
                    )?;
                }
                other => {
                    return Err(Error::location(
                        codes::UNPACK_UNKNOWN_OPTION,
                        format!("unrecognized parameter to $_internalUnpackBucket: {other}"),
                    ));
                }
            }
        }
        let time_field = time_field.ok_or_else(|| {
            Error::location(
                codes::UNPACK_NO_TIME_FIELD,
                "the $_internalUnpackBucket stage requires a timeField parameter",
            )
        })?;
        let bucket_max_span_seconds = span.ok_or_else(|| {
            Error::location(
                codes::UNPACK_NO_SPAN,
                "the $_internalUnpackBucket stage requires a bucketMaxSpanSeconds parameter",
            )
        })?;
        Ok(Self {
            time_field,
            meta_field,
            fields: fields.unwrap_or(BucketFields::Exclude(Vec::new())),
            computed_meta_fields,
            bucket_max_span_seconds,
            assume_no_mixed_schema_data,
            fixed_buckets,
        })
    }

    /// `$_unpackBucket`: time and meta fields only, every field kept.
    pub fn parse_external(body: &Value) -> Result<Self> {
        let obj = body.as_document().ok_or_else(|| {
            Error::location(
                codes::UNPACK_EXTERNAL_NOT_OBJECT,
                format!("$_unpackBucket specification must be an object, got: {}", body.type_name()),
            )
        })?;
        let mut time_field = None;
        let mut meta_field = None;
        let mut assume_no_mixed_schema_data = false;
        for (name, v) in obj {
            match name.as_str() {
                "timeField" => time_field = Some(time_field_name(v, codes::UNPACK_EXTERNAL_TIME_NOT_STRING)?),
                "metaField" => {
                    meta_field = Some(meta_field_name(
                        v,
                        codes::UNPACK_EXTERNAL_META_NOT_STRING,
                        codes::UNPACK_EXTERNAL_META_DOTTED,
                    )?);
                }
                "assumeNoMixedSchemaData" => {
                    assume_no_mixed_schema_data = bool_option(name, v, codes::UNPACK_EXTERNAL_BOOL_OPTION)?;
                }
                other => {
                    return Err(Error::location(
                        codes::UNPACK_EXTERNAL_UNKNOWN_OPTION,
                        format!("unrecognized parameter to $_unpackBucket: {other}"),
                    ));
                }
            }
        }
        let time_field = time_field.ok_or_else(|| {
            Error::location(
                codes::UNPACK_EXTERNAL_NO_TIME_FIELD,
                "the $_unpackBucket stage requires a timeField parameter",
            )
        })?;
        Ok(Self {
            time_field,
            meta_field,
            fields: BucketFields::Exclude(Vec::new()),
            computed_meta_fields: Vec::new(),
            bucket_max_span_seconds: DEFAULT_BUCKET_MAX_SPAN_SECONDS,
            assume_no_mixed_schema_data,
            fixed_buckets: false,
        })
    }

    pub fn to_value(&self) -> Value {
        let strings = |fields: &[String]| Value::Array(fields.iter().cloned().map(Value::String).collect());
        let mut d = Document::new();
        match &self.fields {
            BucketFields::Include(fields) => d.insert("include", strings(fields)),
            BucketFields::Exclude(fields) => d.insert("exclude", strings(fields)),
        }
        d.insert("timeField", Value::String(self.time_field.clone()));
        if let Some(meta) = &self.meta_field {
            d.insert("metaField", Value::String(meta.clone()));
        }
        d.insert("bucketMaxSpanSeconds", Value::Int32(self.bucket_max_span_seconds));
        if !self.computed_meta_fields.is_empty() {
            d.insert("computedMetaProjFields", strings(&self.computed_meta_fields));
        }
        if self.assume_no_mixed_schema_data {
            d.insert("assumeNoMixedSchemaData", Value::Bool(true));
        }
        if self.fixed_buckets {
            d.insert("fixedBuckets", Value::Bool(true));
        }
        Value::Document(d)
    }
}

/// Push one measurement per row of `bucket` onto `out`. Rows are the keys
/// of the time column; a row missing from another column omits that field.
/// Field order is time, meta, the remaining columns, then computed fields.
pub(crate) fn unpack(spec: &UnpackBucketSpec, bucket: &Document, out: &mut VecDeque<Document>) -> Result<()> {
    let data = match bucket.get("data") {
        Some(Value::Document(data)) => data,
        Some(other) => {
            return Err(Error::TypeMismatch(format!(
                "bucket 'data' must be an object, found {}",
                other.type_name()
            )));
        }
        None => return Err(Error::TypeMismatch("bucket has no 'data' field".into())),
    };
    let mut columns: Vec<(&String, &Document)> = Vec::with_capacity(data.len());
    for (name, column) in data {
        let Value::Document(column) = column else {
            return Err(Error::TypeMismatch(format!(
                "bucket column '{name}' must be an object, found {}",
                column.type_name()
            )));
        };
        columns.push((name, column));
    }
    let Some(times) = columns
        .iter()
        .find(|(name, _)| name.as_str() == spec.time_field)
        .map(|(_, column)| *column)
    else {
        return Ok(());
    };

    let include_time = spec.fields.wants(&spec.time_field);
    let meta = spec
        .meta_field
        .as_ref()
        .filter(|name| spec.fields.wants(name))
        .and_then(|name| bucket.get("meta").map(|value| (name, value)));
    let width = columns.len() + 1 + spec.computed_meta_fields.len();

    for (row, time) in times.iter() {
        let mut measurement = Document::with_capacity(width);
        if include_time {
            measurement.insert(spec.time_field.clone(), time.clone());
        }
        if let Some((name, value)) = meta {
            measurement.insert(name.clone(), value.clone());
        }
        for (name, column) in &columns {
            if name.as_str() == spec.time_field || !spec.fields.wants(name) {
                continue;
            }
            if let Some(value) = column.get(row) {
                measurement.insert((*name).clone(), value.clone());
            }
        }
        for name in &spec.computed_meta_fields {
            if let Some(value) = bucket.get(name) {
                measurement.insert(name.clone(), value.clone());
            }
        }
        out.push_back(measurement);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> Result<UnpackBucketSpec> {
        UnpackBucketSpec::parse_internal(&Value::from_json(&v))
    }

    #[test]
    fn defaults_to_excluding_nothing() {
        let spec = parse(json!({"timeField": "t", "bucketMaxSpanSeconds": 60})).unwrap();
        assert_eq!(spec.fields, BucketFields::Exclude(Vec::new()));
        assert_eq!(spec.meta_field, None);
    }

    #[test]
    fn option_errors() {
        let cases = [
            (json!(5), codes::UNPACK_SPEC_NOT_OBJECT),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1, "include": [], "exclude": []}), codes::UNPACK_INCLUDE_AND_EXCLUDE),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1, "include": "a"}), codes::UNPACK_FIELDS_NOT_ARRAY),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1, "exclude": [1]}), codes::UNPACK_FIELD_NOT_STRING),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1, "exclude": ["a.b"]}), codes::UNPACK_FIELD_DOTTED),
            (json!({"timeField": 1, "bucketMaxSpanSeconds": 1}), codes::UNPACK_TIME_FIELD_NOT_STRING),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1, "metaField": "m.x"}), codes::UNPACK_META_FIELD_DOTTED),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1.5}), codes::UNPACK_SPAN_NOT_INT),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 0}), codes::UNPACK_SPAN_NOT_POSITIVE),
            (json!({"timeField": "t"}), codes::UNPACK_NO_SPAN),
            (json!({"bucketMaxSpanSeconds": 1}), codes::UNPACK_NO_TIME_FIELD),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1, "computedMetaProjFields": ["a.b"]}), codes::UNPACK_COMPUTED_DOTTED),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1, "assumeNoMixedSchemaData": 1}), codes::UNPACK_BOOL_OPTION),
            (json!({"timeField": "t", "bucketMaxSpanSeconds": 1, "bogus": 1}), codes::UNPACK_UNKNOWN_OPTION),
        ];
        for (spec, code) in cases {
            assert_eq!(parse(spec.clone()).unwrap_err().code(), code, "{spec}");
        }
    }

    #[test]
    fn external_form_takes_only_time_and_meta() {
        let spec = UnpackBucketSpec::parse_external(&Value::from_json(&json!({"timeField": "t", "metaField": "m"}))).unwrap();
        assert_eq!(spec.bucket_max_span_seconds, DEFAULT_BUCKET_MAX_SPAN_SECONDS);
        assert_eq!(spec.meta_field.as_deref(), Some("m"));
        let err = UnpackBucketSpec::parse_external(&Value::from_json(&json!({"timeField": "t", "include": []}))).unwrap_err();
        assert_eq!(err.code(), codes::UNPACK_EXTERNAL_UNKNOWN_OPTION);
        let err = UnpackBucketSpec::parse_external(&Value::from_json(&json!({}))).unwrap_err();
        assert_eq!(err.code(), codes::UNPACK_EXTERNAL_NO_TIME_FIELD);
    }

    #[test]
    fn malformed_buckets_are_rejected() {
        let spec = parse(json!({"timeField": "t", "bucketMaxSpanSeconds": 60})).unwrap();
        let mut out = VecDeque::new();
        let bucket = Document::from_json(&json!({"_id": 1, "data": 3})).unwrap();
        assert!(unpack(&spec, &bucket, &mut out).is_err());
        let bucket = Document::from_json(&json!({"_id": 1, "data": {"t": [1, 2]}})).unwrap();
        assert!(unpack(&spec, &bucket, &mut out).is_err());
        let bucket = Document::from_json(&json!({"_id": 1, "data": {"x": {"0": 1}}})).unwrap();
        unpack(&spec, &bucket, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
