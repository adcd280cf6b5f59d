use serde_json::{Value as JsonValue, json};
use thiserror::Error;

/// Per-operator precondition codes. Stable across releases.
pub mod codes {
    pub const SUBSTR_START_NOT_NUMERIC: i32 = 34450;
    pub const SUBSTR_START_NOT_INT32: i32 = 34451;
    pub const SUBSTR_LENGTH_NOT_NUMERIC: i32 = 34452;
    pub const SUBSTR_LENGTH_NOT_INT32: i32 = 34453;
    pub const SUBSTR_LENGTH_NEGATIVE: i32 = 34454;
    pub const SUBSTR_START_NEGATIVE: i32 = 34455;
    pub const SUBSTR_BYTES_NOT_UTF8: i32 = 28656;
    pub const ADD_NOT_NUMERIC: i32 = 16554;
    pub const ADD_MULTIPLE_DATES: i32 = 16612;
    pub const SUBTRACT_NOT_NUMERIC: i32 = 16556;
    pub const MULTIPLY_NOT_NUMERIC: i32 = 16555;
    pub const DIVIDE_NOT_NUMERIC: i32 = 16609;
    pub const DIVIDE_BY_ZERO: i32 = 16608;
    pub const MOD_NOT_NUMERIC: i32 = 16611;
    pub const MOD_BY_ZERO: i32 = 16610;
    pub const MATH_NOT_NUMERIC: i32 = 28765;
    pub const CONCAT_NOT_STRING: i32 = 16702;
    pub const STRING_ARG_NOT_STRING: i32 = 16007;
    pub const SPLIT_NOT_STRING: i32 = 40085;
    pub const SPLIT_EMPTY_SEPARATOR: i32 = 40087;
    pub const INDEX_OF_NOT_STRING: i32 = 40091;
    pub const INDEX_OF_BAD_INDEX: i32 = 40096;
    pub const SIZE_NOT_ARRAY: i32 = 17124;
    pub const ARRAY_ELEM_AT_NOT_ARRAY: i32 = 28689;
    pub const ARRAY_ELEM_AT_NOT_NUMERIC: i32 = 28690;
    pub const ARRAY_ELEM_AT_NOT_INT32: i32 = 28691;
    pub const CONCAT_ARRAYS_NOT_ARRAY: i32 = 28664;
    pub const IN_NOT_ARRAY: i32 = 40081;
    pub const SLICE_NOT_ARRAY: i32 = 28724;
    pub const SLICE_BAD_ARG: i32 = 28725;
    pub const SLICE_NON_POSITIVE_COUNT: i32 = 28729;
    pub const REVERSE_NOT_ARRAY: i32 = 34435;
    pub const RANGE_BAD_ARG: i32 = 34443;
    pub const RANGE_ZERO_STEP: i32 = 34449;
    pub const FIRST_LAST_NOT_ARRAY: i32 = 28689;
    pub const MAP_INPUT_NOT_ARRAY: i32 = 16883;
    pub const FILTER_INPUT_NOT_ARRAY: i32 = 28651;
    pub const REDUCE_INPUT_NOT_ARRAY: i32 = 40080;
    pub const MERGE_OBJECTS_NOT_OBJECT: i32 = 40400;
    pub const OBJECT_TO_ARRAY_NOT_OBJECT: i32 = 40390;
    pub const DATE_NOT_DATE: i32 = 16006;
    pub const CONVERSION_FAILURE: i32 = 241;
    pub const REGEX_INPUT_NOT_STRING: i32 = 51104;
    pub const REGEX_BAD_PATTERN: i32 = 51111;
    pub const INVALID_USER_VARIABLE: i32 = 16867;
    pub const UNDEFINED_VARIABLE: i32 = 17276;
    pub const GROUP_ID_REQUIRED: i32 = 15955;
    pub const UNKNOWN_ACCUMULATOR: i32 = 15952;
    pub const ACCUMULATOR_N_INVALID: i32 = 5787908;
    pub const CONCAT_ARRAYS_ACC_NOT_ARRAY: i32 = 8464800;
    pub const MERGE_OBJECTS_ACC_NOT_OBJECT: i32 = 40400;
    pub const REPLACE_ROOT_NOT_OBJECT: i32 = 40228;
    pub const REDACT_BAD_RESULT: i32 = 17053;
    pub const UNWIND_BAD_PATH: i32 = 28818;
    pub const GRAPH_LOOKUP_MEMORY: i32 = 40099;
    pub const BUCKET_BAD_BOUNDARIES: i32 = 40193;
    pub const BUCKET_NO_DEFAULT: i32 = 40066;
    pub const BUCKET_GROUP_BY_BAD: i32 = 40202;
    pub const BUCKET_DEFAULT_IN_RANGE: i32 = 40199;
    pub const FACET_FORBIDDEN_STAGE: i32 = 40600;
    pub const SAMPLE_BAD_SIZE: i32 = 28747;
    pub const WRONG_ARITY: i32 = 16020;
    pub const SWITCH_NO_MATCH: i32 = 40066;
    pub const SUBSTR_BYTES_START_NEGATIVE: i32 = 50752;
    pub const SUBSTR_BYTES_START_NOT_NUMERIC: i32 = 16034;
    pub const SUBSTR_BYTES_LENGTH_NOT_NUMERIC: i32 = 16035;
    pub const SUBSTR_BYTES_END_NOT_UTF8: i32 = 28657;
    pub const STRLEN_CP_NOT_STRING: i32 = 34471;
    pub const STRLEN_BYTES_NOT_STRING: i32 = 34473;
    pub const SPLIT_SEPARATOR_NOT_STRING: i32 = 40086;
    pub const INDEX_OF_SUBSTRING_NOT_STRING: i32 = 40092;
    pub const INDEX_OF_NEGATIVE_INDEX: i32 = 40097;
    pub const RANGE_END_BAD: i32 = 34444;
    pub const RANGE_STEP_BAD: i32 = 34447;
    pub const ROUND_BAD_PLACE: i32 = 51083;
    pub const FILTER_LIMIT_BAD: i32 = 327391;
    pub const DATE_BAD_TIMEZONE: i32 = 40485;
    pub const REGEX_BAD_OPTIONS: i32 = 51108;
    pub const FIELD_PATH_DOTTED: i32 = 16412;
    pub const FIELD_NAME_DOLLAR: i32 = 16410;
    pub const GROUP_FIELD_DOTTED: i32 = 40235;
    pub const STAGE_ONE_FIELD: i32 = 40323;
    pub const STAGE_UNKNOWN: i32 = 40324;
    pub const STAGE_MUST_BE_LAST: i32 = 40601;
    pub const PROJECT_EMPTY: i32 = 51272;
    pub const PROJECT_MIXED: i32 = 31254;
    pub const SORT_EMPTY: i32 = 15976;
    pub const SORT_BAD_ORDER: i32 = 15975;
    pub const SKIP_BAD: i32 = 15956;
    pub const LIMIT_BAD: i32 = 15958;
    pub const COUNT_BAD_FIELD: i32 = 40156;
    pub const UNWIND_BAD_OPTION: i32 = 28811;
    pub const GRAPH_LOOKUP_BAD_DEPTH: i32 = 40101;
    pub const GRAPH_LOOKUP_MISSING_FIELD: i32 = 40105;
    pub const LOOKUP_MISSING_FIELD: i32 = 4572;
    pub const MERGE_BAD_MODE: i32 = 51191;
    pub const MERGE_ON_FIELD_MISSING: i32 = 51132;
    pub const IMMUTABLE_ID: i32 = 66;
    pub const LOOKUP_PIPELINE_FORBIDDEN: i32 = 51047;
    pub const UNPACK_SPEC_NOT_OBJECT: i32 = 5346500;
    pub const UNPACK_FIELDS_NOT_ARRAY: i32 = 5346501;
    pub const UNPACK_FIELD_NOT_STRING: i32 = 5346502;
    pub const UNPACK_FIELD_DOTTED: i32 = 5346503;
    pub const UNPACK_TIME_FIELD_NOT_STRING: i32 = 5346504;
    pub const UNPACK_META_FIELD_NOT_STRING: i32 = 5346505;
    pub const UNPACK_UNKNOWN_OPTION: i32 = 5346506;
    pub const UNPACK_NO_TIME_FIELD: i32 = 5346508;
    pub const UNPACK_INCLUDE_AND_EXCLUDE: i32 = 5408000;
    pub const UNPACK_COMPUTED_NOT_ARRAY: i32 = 5509900;
    pub const UNPACK_COMPUTED_NOT_STRING: i32 = 5509901;
    pub const UNPACK_COMPUTED_DOTTED: i32 = 5509902;
    pub const UNPACK_SPAN_NOT_INT: i32 = 5510600;
    pub const UNPACK_SPAN_NOT_POSITIVE: i32 = 5510601;
    pub const UNPACK_NO_SPAN: i32 = 5510602;
    pub const UNPACK_META_FIELD_DOTTED: i32 = 5545700;
    pub const UNPACK_BOOL_OPTION: i32 = 6067202;
    pub const UNPACK_EXTERNAL_BOOL_OPTION: i32 = 6067203;
    pub const UNPACK_FIXED_BUCKETS_NOT_BOOL: i32 = 7823300;
    pub const UNPACK_EXTERNAL_NOT_OBJECT: i32 = 5612400;
    pub const UNPACK_EXTERNAL_TIME_NOT_STRING: i32 = 5612401;
    pub const UNPACK_EXTERNAL_META_NOT_STRING: i32 = 5612402;
    pub const UNPACK_EXTERNAL_META_DOTTED: i32 = 5612403;
    pub const UNPACK_EXTERNAL_UNKNOWN_OPTION: i32 = 5612404;
    pub const UNPACK_EXTERNAL_NO_TIME_FIELD: i32 = 5612405;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("unrecognized expression '{0}'")]
    UnknownExpression(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// An operator precondition failed. The code identifies which one.
    #[error("{message}")]
    Location { code: i32, message: String },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("integer overflow: {0}")]
    Overflow(String),

    #[error("exceeded memory limit: {0}")]
    ExceededMemoryLimit(String),

    #[error(
        "exceeded memory limit for {stage} ({used} > {limit} bytes), but did not allow external \
         spilling; pass allowDiskUse:true to opt in"
    )]
    MemoryLimitNoDiskUse {
        stage: &'static str,
        used: usize,
        limit: usize,
    },

    #[error("operation was interrupted")]
    Interrupted,

    #[error("operation exceeded time limit")]
    MaxTimeExpired,

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("$merge could not find a matching document in the target collection: {0}")]
    MergeNoMatchingDocument(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("spill run corrupted: {0}")]
    SpillCorrupted(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("document must be an object")]
    NotAnObject,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn location(code: i32, message: impl Into<String>) -> Self {
        Error::Location {
            code,
            message: message.into(),
        }
    }

    /// Wrap an error with context, keeping its code.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidPipeline(_) => 9,
            Error::UnknownExpression(_) => 168,
            Error::InvalidQuery(_) => 2,
            Error::InvalidOptions(_) => 2,
            Error::Location { code, .. } => *code,
            Error::TypeMismatch(_) => 14,
            Error::Overflow(_) => 15,
            Error::ExceededMemoryLimit(_) => 146,
            Error::MemoryLimitNoDiskUse { .. } => 292,
            Error::Interrupted => 11601,
            Error::MaxTimeExpired => 50,
            Error::NamespaceNotFound(_) => 26,
            Error::DuplicateKey(_) => 11000,
            Error::MergeNoMatchingDocument(_) => 13113,
            Error::Script(_) => 139,
            Error::SpillCorrupted(_) => 1,
            Error::LockPoisoned(_) => 1,
            Error::NotAnObject => 2,
            Error::Context { source, .. } => source.code(),
            Error::Io(_) => 1,
            Error::Json(_) => 9,
        }
    }

    pub fn code_name(&self) -> &'static str {
        match self {
            Error::InvalidPipeline(_) | Error::Json(_) => "FailedToParse",
            Error::UnknownExpression(_) => "InvalidPipelineOperator",
            Error::InvalidQuery(_) | Error::InvalidOptions(_) | Error::NotAnObject => "BadValue",
            Error::Location { .. } => "Location",
            Error::TypeMismatch(_) => "TypeMismatch",
            Error::Overflow(_) => "Overflow",
            Error::ExceededMemoryLimit(_) => "ExceededMemoryLimit",
            Error::MemoryLimitNoDiskUse { .. } => "QueryExceededMemoryLimitNoDiskUseAllowed",
            Error::Interrupted => "Interrupted",
            Error::MaxTimeExpired => "MaxTimeMSExpired",
            Error::NamespaceNotFound(_) => "NamespaceNotFound",
            Error::DuplicateKey(_) => "DuplicateKey",
            Error::MergeNoMatchingDocument(_) => "MergeStageNoMatchingDocument",
            Error::Script(_) => "JSInterpreterFailure",
            Error::SpillCorrupted(_) | Error::LockPoisoned(_) | Error::Io(_) => "InternalError",
            Error::Context { source, .. } => source.code_name(),
        }
    }

    /// Whether this error is a resource-exhaustion failure of any flavour.
    pub fn is_memory_limit(&self) -> bool {
        match self {
            Error::ExceededMemoryLimit(_) | Error::MemoryLimitNoDiskUse { .. } => true,
            Error::Location { code, .. } => *code == codes::GRAPH_LOOKUP_MEMORY,
            Error::Context { source, .. } => source.is_memory_limit(),
            _ => false,
        }
    }

    /// The structured failure reported to callers.
    pub fn to_json(&self) -> JsonValue {
        let code_name = match self {
            Error::Location { code, .. } => format!("Location{code}"),
            other => other.code_name().to_string(),
        };
        json!({
            "ok": 0,
            "code": self.code(),
            "codeName": code_name,
            "errmsg": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_inner_code() {
        let err = Error::NamespaceNotFound("db.out".into()).context("$out to db.out");
        assert_eq!(err.code(), 26);
        assert_eq!(err.code_name(), "NamespaceNotFound");
        assert!(err.to_string().starts_with("$out to db.out: "));
    }

    #[test]
    fn memory_errors_have_distinct_codes() {
        let disk = Error::MemoryLimitNoDiskUse {
            stage: "$group",
            used: 10,
            limit: 5,
        };
        let generic = Error::ExceededMemoryLimit("$push".into());
        assert_eq!(disk.code(), 292);
        assert_eq!(generic.code(), 146);
        assert!(disk.is_memory_limit());
        assert!(generic.is_memory_limit());
    }

    #[test]
    fn structured_failure_shape() {
        let err = Error::location(codes::DIVIDE_BY_ZERO, "can't $divide by zero");
        let doc = err.to_json();
        assert_eq!(doc["ok"], 0);
        assert_eq!(doc["code"], 16608);
        assert_eq!(doc["codeName"], "Location16608");
        assert_eq!(doc["errmsg"], "can't $divide by zero");
    }
}
