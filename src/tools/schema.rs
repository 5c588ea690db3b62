//! 工具参数 / 结构化输出的 JSON Schema
//!
//! schemars 从参数结构体自动生成 schema（暴露给推理服务），jsonschema 在执行前校验参数。

use jsonschema::Validator;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::ToolError;

/// 由类型生成 schema，去掉 `$schema` / `title` 等推理服务不需要的元字段
pub fn schema_value<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| empty_object_schema());
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
    }
    value
}

pub fn empty_object_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// 编译参数 schema；失败说明工具声明本身有误（启动期错误）
pub fn compile(schema: &Value) -> Result<Validator, String> {
    jsonschema::validator_for(schema).map_err(|e| e.to_string())
}

/// 校验参数；所有违规合并为一条 invalid_arguments 错误
pub fn validate_arguments(validator: &Validator, args: &Value) -> Result<(), ToolError> {
    let problems: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ToolError::invalid_arguments(problems.join("; ")))
    }
}

/// 将已校验的参数反序列化为工具自己的参数结构体
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { Value::Object(Map::new()) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::invalid_arguments(e.to_string()))
}

/// 用 schema 中声明的 default 补齐缺失的顶层参数
pub fn fill_defaults(schema: &Value, args: &mut Value) {
    if args.is_null() {
        *args = Value::Object(Map::new());
    }
    let (Some(props), Some(obj)) = (
        schema.get("properties").and_then(|p| p.as_object()),
        args.as_object_mut(),
    ) else {
        return;
    };
    for (name, prop) in props {
        if let Some(default) = prop.get("default") {
            let missing = obj.get(name).map(|v| v.is_null()).unwrap_or(true);
            if missing && !default.is_null() {
                obj.insert(name.clone(), default.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct LookupArgs {
        /// 患者 ID
        patient_id: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_derived_schema_rejects_missing_required() {
        let schema = schema_value::<LookupArgs>();
        assert!(schema.get("$schema").is_none());
        let v = compile(&schema).unwrap();
        assert!(validate_arguments(&v, &json!({"patient_id": "p1"})).is_ok());
        let err = validate_arguments(&v, &json!({"limit": 3})).unwrap_err();
        assert_eq!(err.kind, crate::core::ToolErrorKind::InvalidArguments);
        assert!(err.message.contains("patient_id"));
    }

    #[test]
    fn test_fill_defaults_only_fills_missing() {
        let schema = json!({"type": "object", "properties": {
            "limit": {"type": "integer", "default": 5},
            "resource_type": {"type": "string", "default": "Observation"}
        }});
        let mut args = json!({"limit": 2});
        fill_defaults(&schema, &mut args);
        assert_eq!(args, json!({"limit": 2, "resource_type": "Observation"}));

        let mut empty = Value::Null;
        fill_defaults(&schema, &mut empty);
        assert_eq!(empty["limit"], 5);
    }
}
