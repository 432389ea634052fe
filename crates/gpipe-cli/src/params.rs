//! `--param` override parsing

use gpipe_engine::ParamMap;
use serde_json::Value;

use crate::error::{CliError, Result};

/// Parse `--param` occurrences into an override map.
///
/// A single argument that parses as a JSON object is taken wholesale; worker
/// processes receive their parent's overrides this way. Everything else must
/// be KEY=VALUE, where the value is parsed as JSON when possible and kept as
/// a plain string otherwise, so `--param threshold=500` arrives as a number
/// and `--param genome=GRCh38` as a string.
pub fn parse_params(args: &[String]) -> Result<ParamMap> {
    if let [single] = args {
        if let Ok(Value::Object(map)) = serde_json::from_str(single) {
            return Ok(map);
        }
    }

    let mut params = ParamMap::new();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(CliError::invalid_param(format!("'{arg}' is not KEY=VALUE")));
        };
        if key.is_empty() {
            return Err(CliError::invalid_param(format!("'{arg}' has an empty key")));
        }
        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_key_value_pairs_typed_by_json() {
        let params = parse_params(&args(&["genome=GRCh38", "threshold=500", "force=true"]))
            .unwrap();
        assert_eq!(params["genome"], json!("GRCh38"));
        assert_eq!(params["threshold"], json!(500));
        assert_eq!(params["force"], json!(true));
    }

    #[test]
    fn test_single_json_object_taken_wholesale() {
        let params = parse_params(&args(&[r#"{"genome": "GRCh38", "threshold": 500}"#])).unwrap();
        assert_eq!(params["genome"], json!("GRCh38"));
        assert_eq!(params["threshold"], json!(500));
    }

    #[test]
    fn test_value_keeps_embedded_equals() {
        let params = parse_params(&args(&["where=chrom=1"])).unwrap();
        assert_eq!(params["where"], json!("chrom=1"));
    }

    #[test]
    fn test_rejects_bare_words_and_empty_keys() {
        assert!(parse_params(&args(&["not-a-pair"])).is_err());
        assert!(parse_params(&args(&["=value"])).is_err());
    }

    #[test]
    fn test_empty_args_make_empty_map() {
        assert!(parse_params(&[]).unwrap().is_empty());
    }
}
