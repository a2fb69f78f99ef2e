//! Collaborators injected per run
//!
//! The engine calls tools, AI providers and the observability sink through
//! these traits and owns none of their protocols.

use super::trace::MetricSample;
use super::types::{AiProfile, LogLevel, Val};
use std::collections::BTreeMap;

pub trait ToolRunner {
    /// Invoke a tool with its named arguments. Errors are plain messages.
    fn call(&mut self, tool: &str, args: &Val) -> Result<Val, String>;
}

pub trait AiProvider {
    fn complete(&mut self, profile: &AiProfile, input: &Val) -> Result<Val, String>;
}

pub trait Observer {
    fn metric(&mut self, sample: &MetricSample);
    fn log(&mut self, level: LogLevel, flow_name: &str, message: &str);
}

/* ===================== Tools ===================== */

/// Canned responses by tool name; tools without one echo their `input`
/// argument (or all arguments), which makes pipelines easy to test.
#[derive(Debug, Default)]
pub struct StaticToolRunner {
    responses: BTreeMap<String, Val>,
    failures: BTreeMap<String, String>,
    pub calls: Vec<(String, Val)>,
}

impl StaticToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, tool: &str, value: impl Into<Val>) -> Self {
        self.responses.insert(tool.to_string(), value.into());
        self
    }

    pub fn fail(mut self, tool: &str, message: &str) -> Self {
        self.failures.insert(tool.to_string(), message.to_string());
        self
    }
}

impl ToolRunner for StaticToolRunner {
    fn call(&mut self, tool: &str, args: &Val) -> Result<Val, String> {
        self.calls.push((tool.to_string(), args.clone()));
        if let Some(message) = self.failures.get(tool) {
            return Err(message.clone());
        }
        if let Some(value) = self.responses.get(tool) {
            return Ok(value.clone());
        }
        Ok(args
            .as_obj()
            .and_then(|obj| obj.get("input"))
            .cloned()
            .unwrap_or_else(|| args.clone()))
    }
}

/* ===================== AI ===================== */

/// Deterministic provider: answers with the profile model and the input text
#[derive(Debug, Default)]
pub struct MockAiProvider {
    pub prompts: Vec<(String, Val)>,
}

impl MockAiProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AiProvider for MockAiProvider {
    fn complete(&mut self, profile: &AiProfile, input: &Val) -> Result<Val, String> {
        self.prompts.push((profile.name.clone(), input.clone()));
        let model = if profile.model.is_empty() { "mock" } else { profile.model.as_str() };
        Ok(Val::Str(format!("[{}] {}", model, input)))
    }
}

/* ===================== Observability ===================== */

/// Forwards metrics and log statements to `tracing`
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn metric(&mut self, sample: &MetricSample) {
        tracing::info!(
            target: "flowgate::metrics",
            flow = %sample.flow_name,
            metric = %sample.name,
            value = %sample.value,
            labels = ?sample.labels,
            "metric"
        );
    }

    fn log(&mut self, level: LogLevel, flow_name: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "flowgate::flow", flow = %flow_name, "{}", message),
            LogLevel::Info => tracing::info!(target: "flowgate::flow", flow = %flow_name, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "flowgate::flow", flow = %flow_name, "{}", message),
            LogLevel::Error => tracing::error!(target: "flowgate::flow", flow = %flow_name, "{}", message),
        }
    }
}

/// Keeps everything it observes; used by tests
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub metrics: Vec<MetricSample>,
    pub logs: Vec<(LogLevel, String)>,
}

impl Observer for RecordingObserver {
    fn metric(&mut self, sample: &MetricSample) {
        self.metrics.push(sample.clone());
    }

    fn log(&mut self, level: LogLevel, _flow_name: &str, message: &str) {
        self.logs.push((level, message.to_string()));
    }
}
