/// Node body execution
///
/// The engine never knows what a node does; it hands the node type string and a
/// `NodeContext` to a `NodeRegistry` and gets a `NodeResult` back. This module
/// defines that capability and ships `BuiltinNodeRegistry`, the default set of
/// node bodies:
/// - trigger.*: pass the trigger payload through
/// - logic.if / logic.switch: evaluate a condition / case selector
/// - logic.merge, logic.loop.*, human.input: pass-through bodies
/// - code.lua: sandboxed Lua script
/// - http.request: outbound HTTP call
/// - util.set: merge static values into the payload
///
/// Lua evaluation is sandboxed: dangerous globals are removed before any user
/// expression runs and expressions mentioning them are rejected up front.

use crate::workflow::types::NodeContext;
use anyhow::Result;
use async_trait::async_trait;
use mlua::LuaSerdeExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Outcome of one node body attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
}

impl NodeResult {
    pub fn success(output: Value) -> Self {
        Self { success: true, output, error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Capability the engine calls for every node body
///
/// Expected domain failures come back as `NodeResult::failure`; an `Err` is
/// treated as an unexpected fault and converted into a failed result by the
/// engine.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn execute(&self, node_type: &str, context: &NodeContext) -> Result<NodeResult>;
}

/// Default node bodies shipped with the engine
#[derive(Debug, Clone)]
pub struct BuiltinNodeRegistry {
    http: reqwest::Client,
}

impl Default for BuiltinNodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinNodeRegistry {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    fn execute_if(&self, context: &NodeContext) -> Result<NodeResult> {
        let condition = match context.config.get("condition") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(expr)) => eval_condition(expr, &[("input", &context.input)])?,
            Some(other) => truthy(other),
            None => context.input.get("condition").map(truthy).unwrap_or(false),
        };

        tracing::debug!("🔀 If node '{}' evaluated to {}", context.node_id, condition);
        Ok(NodeResult::success(with_field(&context.input, "condition", Value::Bool(condition))))
    }

    fn execute_switch(&self, context: &NodeContext) -> Result<NodeResult> {
        let case = match context.config.get("value") {
            Some(Value::String(selector)) if selector.starts_with('$') => {
                resolve_path(&context.input, selector).unwrap_or(Value::Null)
            }
            Some(Value::String(expr)) => eval_lua_expression(expr, &[("input", &context.input)])?,
            Some(literal) => literal.clone(),
            None => context.input.get("case").cloned().unwrap_or(Value::Null),
        };

        tracing::debug!("🔀 Switch node '{}' selected case {}", context.node_id, case);
        Ok(NodeResult::success(with_field(&context.input, "case", case)))
    }

    /// Run `config.script` with `input` bound as a global
    ///
    /// Expected config: { "script": "return { total = input.price * input.qty }" }
    fn execute_lua_script(&self, context: &NodeContext) -> Result<NodeResult> {
        let Some(script) = context.config.get("script").and_then(Value::as_str) else {
            return Ok(NodeResult::failure("code.lua node missing 'script' parameter"));
        };

        match eval_lua_expression(script, &[("input", &context.input)]) {
            Ok(Value::Object(output)) => Ok(NodeResult::success(Value::Object(output))),
            Ok(other) => Ok(NodeResult::success(json!({ "result": other }))),
            Err(e) => Ok(NodeResult::failure(e.to_string())),
        }
    }

    /// Expected config: { "url": "...", "method": "POST", "headers": {...}, "body": {...} }
    ///
    /// Without an explicit body, POST/PUT/PATCH send the node input as JSON.
    async fn execute_http_request(&self, context: &NodeContext) -> Result<NodeResult> {
        let Some(url) = context.config.get("url").and_then(Value::as_str) else {
            return Ok(NodeResult::failure("http.request node missing 'url' parameter"));
        };
        let method = context
            .config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);

        let mut request_builder = match method.as_str() {
            "GET" => self.http.get(url),
            "POST" => self.http.post(url),
            "PUT" => self.http.put(url),
            "DELETE" => self.http.delete(url),
            "PATCH" => self.http.patch(url),
            _ => return Ok(NodeResult::failure(format!("Unsupported HTTP method: {}", method))),
        };

        if let Some(headers) = context.config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(header_value) = value.as_str() {
                    request_builder = request_builder.header(key.as_str(), header_value);
                }
            }
        }

        if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            let body = context.config.get("body").unwrap_or(&context.input);
            request_builder = request_builder.json(body);
        }

        let response = match request_builder.send().await {
            Ok(response) => response,
            Err(e) => return Ok(NodeResult::failure(format!("HTTP request failed: {}", e))),
        };

        let status = response.status();
        let headers_map: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let response_text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        let data = serde_json::from_str::<Value>(&response_text).unwrap_or(Value::String(response_text));

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);

        let output = json!({
            "status": status.as_u16(),
            "headers": headers_map,
            "data": data,
        });

        if status.is_success() {
            Ok(NodeResult::success(output))
        } else {
            Ok(NodeResult {
                success: false,
                output,
                error: Some(format!("HTTP {} returned status {}", method, status)),
            })
        }
    }

    fn execute_set(&self, context: &NodeContext) -> Result<NodeResult> {
        let mut output = match &context.input {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if let Some(values) = context.config.get("values").and_then(Value::as_object) {
            for (key, value) in values {
                output.insert(key.clone(), value.clone());
            }
        }
        Ok(NodeResult::success(Value::Object(output)))
    }
}

#[async_trait]
impl NodeRegistry for BuiltinNodeRegistry {
    async fn execute(&self, node_type: &str, context: &NodeContext) -> Result<NodeResult> {
        match node_type {
            t if t.starts_with(crate::workflow::types::TRIGGER_PREFIX) => {
                Ok(NodeResult::success(context.input.clone()))
            }
            "logic.if" => self.execute_if(context),
            "logic.switch" => self.execute_switch(context),
            "logic.merge" | "logic.loop.for" | "logic.loop.foreach" | "logic.loop.while" | "human.input" => {
                Ok(NodeResult::success(context.input.clone()))
            }
            "code.lua" => self.execute_lua_script(context),
            "http.request" => self.execute_http_request(context).await,
            "util.set" => self.execute_set(context),
            other => Ok(NodeResult::failure(format!("Unknown node type: {}", other))),
        }
    }
}

/// Copy of `base` (or an empty object) with `key` set
fn with_field(base: &Value, key: &str, value: Value) -> Value {
    let mut map = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// JavaScript-like truthiness for non-boolean condition values
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Resolve a JSONPath selector (`$.items`, `$.order.lines[*]`) against `input`
///
/// A single match is returned as-is; several matches are collected into an array.
pub(crate) fn resolve_path(input: &Value, selector: &str) -> Option<Value> {
    let matches = jsonpath_lib::select(input, selector)
        .map_err(|e| tracing::warn!("⚠️ Invalid JSONPath '{}': {:?}", selector, e))
        .ok()?;

    match matches.len() {
        0 => None,
        1 => Some(matches[0].clone()),
        _ => Some(Value::Array(matches.into_iter().cloned().collect())),
    }
}

const BLOCKED_LUA_GLOBALS: &[&str] = &[
    "os", "io", "debug", "package", "require", "load", "dofile", "loadfile", "loadstring",
    "rawget", "rawset", "getmetatable", "setmetatable", "_G", "_ENV", "coroutine", "collectgarbage",
];

/// Reject expressions that reach for globals the sandbox removes
///
/// Only the root of each dotted path is checked, so `input.payload` or
/// `input.os` stay legal.
fn is_safe_lua_expression(expr: &str) -> bool {
    let mut previous = None;
    for token in expr.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.' || c == ':')) {
        if token.is_empty() {
            continue;
        }
        let root = token.split(['.', ':']).next().unwrap_or("");
        // `x . os` style member access is not a root
        let is_member = token.starts_with('.') || token.starts_with(':') || previous == Some('.');
        if !is_member && BLOCKED_LUA_GLOBALS.contains(&root) {
            tracing::warn!("🚨 Blocked dangerous Lua expression: {}", expr);
            return false;
        }
        previous = token.chars().last();
    }
    true
}

/// Evaluate a Lua expression or script in a fresh sandboxed state
///
/// `bindings` become globals; JSON in, JSON out.
pub(crate) fn eval_lua_expression(expr: &str, bindings: &[(&str, &Value)]) -> Result<Value> {
    if !is_safe_lua_expression(expr) {
        return Err(anyhow::anyhow!("Lua expression rejected by sandbox: {}", expr));
    }

    let lua = mlua::Lua::new();
    let _ = lua.set_memory_limit(16 * 1024 * 1024);

    let globals = lua.globals();
    for name in ["os", "io", "debug", "package", "require", "load", "loadfile", "dofile", "collectgarbage"] {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| anyhow::anyhow!("Failed to sandbox Lua global '{}': {}", name, e))?;
    }

    globals
        .set(
            "now",
            lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))
                .map_err(|e| anyhow::anyhow!("Failed to create now function: {}", e))?,
        )
        .map_err(|e| anyhow::anyhow!("Failed to set now function: {}", e))?;

    for (name, value) in bindings {
        // Top-level null binds as nil so `x == nil` works in expressions
        let lua_value = if value.is_null() {
            mlua::Value::Nil
        } else {
            lua.to_value(*value)
                .map_err(|e| anyhow::anyhow!("Failed to bind '{}' into Lua: {}", name, e))?
        };
        globals
            .set(*name, lua_value)
            .map_err(|e| anyhow::anyhow!("Failed to set Lua global '{}': {}", name, e))?;
    }

    let result = lua
        .load(expr)
        .eval::<mlua::Value>()
        .map_err(|e| anyhow::anyhow!("Lua evaluation failed: {}", e))?;

    lua_to_json(result)
}

/// Evaluate a Lua expression and coerce the result to a boolean
pub(crate) fn eval_condition(expr: &str, bindings: &[(&str, &Value)]) -> Result<bool> {
    Ok(truthy(&eval_lua_expression(expr, bindings)?))
}

/// Convert Lua value to JSON Value
fn lua_to_json(lua_value: mlua::Value) -> Result<Value> {
    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)),
        mlua::Value::String(s) => {
            let s_str = s.to_str().map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua string: {}", e))?;
            Ok(Value::String(s_str.to_string()))
        }
        mlua::Value::Table(table) => {
            // Sequence tables become arrays, everything else an object
            let mut is_array = true;
            let mut max_index = 0;
            let mut count = 0;

            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut arr = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    let val: mlua::Value = table
                        .get(i)
                        .map_err(|e| anyhow::anyhow!("Failed to get Lua table value: {}", e))?;
                    arr.push(lua_to_json(val)?);
                }
                Ok(Value::Array(arr))
            } else {
                let mut obj = Map::new();
                for pair in table.pairs::<mlua::Value, mlua::Value>() {
                    let (key, value) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                    let key_str = match key {
                        mlua::Value::String(s) => s
                            .to_str()
                            .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua key: {}", e))?
                            .to_string(),
                        mlua::Value::Integer(i) => i.to_string(),
                        mlua::Value::Number(f) => f.to_string(),
                        _ => continue,
                    };
                    obj.insert(key_str, lua_to_json(value)?);
                }
                Ok(Value::Object(obj))
            }
        }
        // Functions, userdata (including the serde null sentinel) and threads
        _ => Ok(Value::Null),
    }
}
