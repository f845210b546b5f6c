//! Upstream column type -> downstream storage type and client type mapping.

use pg_query::NodeEnum;
use thiserror::Error;

use super::PgTypeClass;

/// The simplified value type exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Number,
    String,
    Boolean,
    Json,
}

const NUMBER_TYPES: &[&str] = &[
    "int2", "int4", "int8", "smallint", "integer", "bigint", "serial", "serial2", "serial4",
    "serial8", "bigserial", "smallserial", "numeric", "decimal", "float4", "float8", "real",
    "double precision", "date", "timestamp", "timestamptz", "time", "timetz",
];

const STRING_TYPES: &[&str] = &["char", "varchar", "bpchar", "text", "uuid"];

const BOOLEAN_TYPES: &[&str] = &["bool", "boolean"];

const JSON_TYPES: &[&str] = &["json", "jsonb"];

/// Whether a base (non-array) Postgres type is boolean. The initial-sync
/// copy path special-cases these to preserve the replica's `0`/`1` integer
/// convention instead of its generic `::text` cast.
pub fn is_boolean_type(base_pg_type: &str) -> bool {
    BOOLEAN_TYPES.contains(&base_pg_type.trim().to_ascii_lowercase().as_str())
}

/// Map a base (non-array, non-enum) Postgres type name to its client type.
/// Returns `None` for types the client projection cannot represent (e.g.
/// `bytea`); the column is still replicated physically, just excluded from
/// the client-visible schema.
pub fn client_type(base_pg_type: &str) -> Option<ClientType> {
    let name = base_pg_type.trim().to_ascii_lowercase();
    if NUMBER_TYPES.contains(&name.as_str()) {
        Some(ClientType::Number)
    } else if STRING_TYPES.contains(&name.as_str()) {
        Some(ClientType::String)
    } else if BOOLEAN_TYPES.contains(&name.as_str()) {
        Some(ClientType::Boolean)
    } else if JSON_TYPES.contains(&name.as_str()) {
        Some(ClientType::Json)
    } else {
        None
    }
}

/// Build the replica storage type string `base|SUFFIX[|SUFFIX...]` for a
/// column. `base_pg_type` should already be the element type for arrays.
pub fn storage_type_string(
    base_pg_type: &str,
    pg_type_class: Option<PgTypeClass>,
    elem_pg_type_class: Option<PgTypeClass>,
    is_array: bool,
    not_null: bool,
) -> String {
    let is_enum = match (is_array, pg_type_class, elem_pg_type_class) {
        (true, _, Some(PgTypeClass::Enum)) => true,
        (false, Some(PgTypeClass::Enum), _) => true,
        _ => false,
    };

    let mut suffixes = Vec::new();
    if is_enum {
        suffixes.push("TEXT_ENUM");
    }
    if is_array {
        suffixes.push("TEXT_ARRAY");
    }
    if not_null {
        suffixes.push("NOT_NULL");
    }

    if suffixes.is_empty() {
        base_pg_type.to_string()
    } else {
        format!("{base_pg_type}|{}", suffixes.join("|"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefaultError {
    #[error("unsupported column default: {0}")]
    Unsupported(String),

    #[error("failed to parse default expression \"{0}\"")]
    Parse(String),
}

/// Validate and normalize a column default expression.
///
/// Accepts literal constants and cast-wrapped literals (`'x'::bigint`).
/// Booleans fold to the replica's `0`/`1` integer convention. Rejects
/// function calls, column references, and `CURRENT_*` expressions.
pub fn map_default_expr(expr: &str) -> Result<String, DefaultError> {
    let query = format!("SELECT {expr}");
    let parsed = pg_query::parse(&query).map_err(|_| DefaultError::Parse(expr.to_string()))?;

    let stmt = parsed
        .protobuf
        .stmts
        .first()
        .and_then(|s| s.stmt.as_ref())
        .and_then(|n| n.node.as_ref())
        .ok_or_else(|| DefaultError::Parse(expr.to_string()))?;

    let NodeEnum::SelectStmt(select) = stmt else {
        return Err(DefaultError::Parse(expr.to_string()));
    };

    let target = select
        .target_list
        .first()
        .and_then(|n| n.node.as_ref())
        .ok_or_else(|| DefaultError::Parse(expr.to_string()))?;

    let NodeEnum::ResTarget(res_target) = target else {
        return Err(DefaultError::Parse(expr.to_string()));
    };

    let value = res_target
        .val
        .as_ref()
        .and_then(|n| n.node.as_ref())
        .ok_or_else(|| DefaultError::Parse(expr.to_string()))?;

    literal_from_node(value, expr)
}

fn literal_from_node(node: &NodeEnum, original: &str) -> Result<String, DefaultError> {
    match node {
        NodeEnum::AConst(_) => Ok(original.trim().to_string()),
        NodeEnum::TypeCast(cast) => {
            let inner = cast
                .arg
                .as_ref()
                .and_then(|n| n.node.as_ref())
                .ok_or_else(|| DefaultError::Unsupported(original.to_string()))?;

            match inner {
                NodeEnum::AConst(c) => {
                    // `'true'::bool` -> `1`, `'false'::bool` -> `0`.
                    if let Some(pg_query::protobuf::a_const::Val::Sval(s)) =
                        c.val.as_ref().map(|v| v.clone())
                    {
                        match s.sval.to_ascii_lowercase().as_str() {
                            "true" => return Ok("1".to_string()),
                            "false" => return Ok("0".to_string()),
                            _ => {}
                        }
                    }
                    Ok(original.trim().to_string())
                }
                _ => Err(DefaultError::Unsupported(original.to_string())),
            }
        }
        NodeEnum::FuncCall(_) | NodeEnum::ColumnRef(_) | NodeEnum::SqlvalueFunction(_) => {
            Err(DefaultError::Unsupported(original.to_string()))
        }
        _ => Err(DefaultError::Unsupported(original.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_client_type_mapping() {
        assert_eq!(client_type("int4"), Some(ClientType::Number));
        assert_eq!(client_type("timestamptz"), Some(ClientType::Number));
        assert_eq!(client_type("text"), Some(ClientType::String));
        assert_eq!(client_type("uuid"), Some(ClientType::String));
        assert_eq!(client_type("boolean"), Some(ClientType::Boolean));
        assert_eq!(client_type("jsonb"), Some(ClientType::Json));
        assert_eq!(client_type("bytea"), None);
    }

    #[test]
    fn test_storage_type_string_suffixes() {
        assert_eq!(storage_type_string("int4", None, None, false, false), "int4");
        assert_eq!(
            storage_type_string("int4", None, None, false, true),
            "int4|NOT_NULL"
        );
        assert_eq!(
            storage_type_string("int4", None, None, true, false),
            "int4|TEXT_ARRAY"
        );
        assert_eq!(
            storage_type_string("mood", Some(PgTypeClass::Enum), None, false, true),
            "mood|TEXT_ENUM|NOT_NULL"
        );
        assert_eq!(
            storage_type_string("mood", None, Some(PgTypeClass::Enum), true, false),
            "mood|TEXT_ENUM|TEXT_ARRAY"
        );
    }

    #[test]
    fn test_default_expr_literal_accepted() {
        assert!(map_default_expr("'hello'").is_ok());
        assert!(map_default_expr("42").is_ok());
    }

    #[test]
    fn test_default_expr_cast_literal_accepted() {
        assert!(map_default_expr("'123'::bigint").is_ok());
    }

    #[test]
    fn test_default_expr_bool_cast_folds_to_integer() {
        assert_eq!(map_default_expr("'true'::bool").unwrap(), "1");
        assert_eq!(map_default_expr("'false'::bool").unwrap(), "0");
    }

    #[test]
    fn test_default_expr_rejects_function_call() {
        assert!(map_default_expr("now()").is_err());
        assert!(map_default_expr("CURRENT_TIMESTAMP").is_err());
        assert!(map_default_expr("other_column").is_err());
    }
}
