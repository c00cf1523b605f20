use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::debug;

use crate::llm::{ToolDef, ToolFunctionDef};

/// A tool the model may call. Arguments are decoded into `Args`, whose JSON
/// schema is what the model sees.
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send;

    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn call(&self, args: Self::Args) -> Result<Value>;
}

#[async_trait]
trait DynTool: Send + Sync {
    fn def(&self) -> ToolDef;
    async fn call_json(&self, args: Value) -> Result<Value>;
}

#[async_trait]
impl<T: Tool> DynTool for T {
    fn def(&self) -> ToolDef {
        ToolDef {
            kind: "function".into(),
            function: ToolFunctionDef {
                name: self.name().to_string(),
                description: self.description().to_string(),
                parameters: args_schema::<T::Args>(),
            },
        }
    }

    async fn call_json(&self, args: Value) -> Result<Value> {
        let args: T::Args = serde_json::from_value(args)
            .with_context(|| format!("invalid request: bad arguments for {}", self.name()))?;
        self.call(args).await
    }
}

fn args_schema<A: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(A);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// Name-indexed set of tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn DynTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn defs(&self) -> Vec<ToolDef> {
        self.tools.values().map(|t| t.def()).collect()
    }

    /// Runs a tool and returns its result as a JSON string.
    pub async fn execute(&self, name: &str, args: Value) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow!("invalid request: unknown tool '{name}'"))?;
        debug!(tool = name, "executing tool");
        let value = tool.call_json(args).await?;
        Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}
