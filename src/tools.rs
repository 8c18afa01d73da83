//! Tool Registry & Executor
//!
//! A fixed name → handler mapping advertised to the model as function tools.
//! Handlers emit their own progress/result frames through the turn's
//! [`EventSink`]; lifecycle frames (`tool_start`/`tool_complete`/`tool_error`)
//! belong to the relay.

use crate::constants::{CHART_PROGRESS_DELAY, CHART_TOOL_NAME};
use crate::events::{StreamEvent, ToolProgress};
use crate::relay::EventSink;
use crate::types::{ChartKind, ChartPayload, RelayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Model-callable tool.
#[async_trait]
pub trait ChatTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, args: Value, out: &EventSink) -> Result<()>;
}

/// Function tool descriptor in the chat-completions wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ChatTool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry holding every built-in tool.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ChartTool::default()));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn ChatTool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::from(tool));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ChatTool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool descriptors sorted by name so the upstream payload is stable.
    pub fn manifest(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                kind: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Parses raw argument JSON and runs the named tool.
    ///
    /// Returns the parsed arguments on success. Every failure (bad JSON,
    /// unknown tool, handler error) comes back as an `Err` for the caller to
    /// report; nothing panics past this point.
    pub async fn dispatch(&self, name: &str, raw_arguments: &str, out: &EventSink) -> Result<Value> {
        let args = parse_arguments(name, raw_arguments)?;
        let tool = self.get(name).ok_or_else(|| RelayError::Tool {
            name: name.to_string(),
            message: "Unknown tool".to_string(),
        })?;
        tool.execute(args.clone(), out).await?;
        Ok(args)
    }
}

fn parse_arguments(name: &str, raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| {
        RelayError::Tool {
            name: name.to_string(),
            message: format!("Invalid tool arguments: {}", e),
        }
        .into()
    })
}

/// --- CHART TOOL ---

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChartArgs {
    #[serde(rename = "type")]
    pub kind: ChartKind,
    pub title: String,
    pub data: Vec<Value>,
    #[serde(default)]
    pub labels: Option<Vec<Value>>,
    #[serde(default)]
    pub series: Option<Vec<String>>,
}

impl ChartArgs {
    pub fn from_value(args: Value) -> Result<Self> {
        serde_json::from_value(args).map_err(|e| {
            RelayError::Tool {
                name: CHART_TOOL_NAME.to_string(),
                message: format!("Invalid chart arguments: {}", e),
            }
            .into()
        })
    }

    /// Number of series when this is a multi-line chart.
    pub fn multi_line_series(&self) -> Option<usize> {
        match (&self.kind, &self.series) {
            (ChartKind::Line, Some(series)) if !series.is_empty() => Some(series.len()),
            _ => None,
        }
    }

    pub fn progress_message(&self) -> String {
        match self.multi_line_series() {
            Some(n) => format!(
                "Creating multi-line {} chart with {} series...",
                self.kind, n
            ),
            None => format!("Creating {} chart...", self.kind),
        }
    }

    pub fn into_payload(self) -> ChartPayload {
        ChartPayload {
            id: format!("chart_{}", uuid::Uuid::new_v4().simple()),
            kind: self.kind,
            title: self.title,
            data: self.data,
            labels: self.labels,
            series: self.series,
        }
    }
}

pub struct ChartTool {
    delay: Duration,
}

impl Default for ChartTool {
    fn default() -> Self {
        Self::new(CHART_PROGRESS_DELAY)
    }
}

impl ChartTool {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ChatTool for ChartTool {
    fn name(&self) -> &str {
        CHART_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Create a chart ONLY when explicitly asked for charts/graphs OR when presenting numeric data that needs visualization (GDP, statistics, financial data, etc.). Do NOT use for general questions about countries, politics, or non-numeric topics."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": { "type": "string", "enum": ["line", "bar", "pie", "area"] },
                "title": { "type": "string" },
                "data": { "type": "array", "description": "Array of {label, value}" },
                "labels": { "type": "array", "description": "Optional axis/category labels" },
                "series": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Optional data keys to plot as separate lines (multi-line charts)"
                }
            },
            "required": ["type", "title", "data"]
        })
    }

    async fn execute(&self, args: Value, out: &EventSink) -> Result<()> {
        let args = ChartArgs::from_value(args)?;
        tracing::debug!(
            "[⚙️ ] Building {} chart '{}' with {} records",
            args.kind,
            args.title,
            args.data.len()
        );

        out.emit(StreamEvent::ToolProgress(ToolProgress {
            name: CHART_TOOL_NAME.to_string(),
            message: Some(args.progress_message()),
            progress: Some(50u8.into()),
        }))
        .await;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        out.emit(StreamEvent::Chart(args.into_payload())).await;
        Ok(())
    }
}
