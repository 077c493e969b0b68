//! Handlebars rendering for configured response bodies.
//!
//! Templates see the request (`method`, `request_path`, `path`, `query`,
//! `headers`, `body`, `json`) and, on schema-backed custom routes, a
//! generated `record`.

use crate::config::ResponseBody;
use crate::exchange::MockRequest;
use crate::generator;
use bytes::Bytes;
use chrono::Utc;
use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Write;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

/// Context for template rendering.
#[derive(Debug, Default, Serialize)]
pub struct TemplateContext {
    /// Path parameters from the matched route
    pub path: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Request path
    pub request_path: String,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Generated record for the route's resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

impl TemplateContext {
    /// Build the context for a request and its path parameters.
    pub fn from_request(request: &MockRequest, params: &HashMap<String, String>) -> Self {
        let body = request
            .body_text()
            .filter(|s| !s.is_empty())
            .map(String::from);
        let json = body.as_ref().and_then(|s| serde_json::from_str(s).ok());

        Self {
            path: params.clone(),
            query: request.query_pairs().into_iter().collect(),
            headers: request.headers.clone(),
            method: request.method.to_string(),
            request_path: request.path.clone(),
            body,
            json,
            record: None,
        }
    }

    pub fn with_record(mut self, record: Value) -> Self {
        self.record = Some(record);
        self
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        // Register custom helpers
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Don't escape HTML by default (we're not rendering HTML)
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string with the given context.
    pub fn render(
        &self,
        template: &str,
        ctx: &TemplateContext,
    ) -> Result<String, handlebars::RenderError> {
        self.handlebars.render_template(template, ctx)
    }

    /// Render a JSON value with templates in string fields.
    pub fn render_json(
        &self,
        json: &Value,
        ctx: &TemplateContext,
    ) -> Result<Value, handlebars::RenderError> {
        match json {
            Value::String(s) if s.contains("{{") => {
                Ok(Value::String(self.handlebars.render_template(s, ctx)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_json(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut rendered = Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json(v, ctx)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(json.clone()),
        }
    }

    /// Render a configured body. Only text and JSON bodies are templated.
    pub fn render_body(
        &self,
        body: &ResponseBody,
        ctx: &TemplateContext,
    ) -> anyhow::Result<Bytes> {
        match body {
            ResponseBody::Text { content } => Ok(Bytes::from(self.render(content, ctx)?)),
            ResponseBody::Json { content } => {
                let rendered = self.render_json(content, ctx)?;
                Ok(Bytes::from(serde_json::to_vec(&rendered)?))
            }
            other => Ok(Bytes::from(other.to_bytes()?)),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

// Helpers. Missing parameters read as null.

fn param<'a>(h: &'a Helper<'_>, index: usize) -> Option<&'a Value> {
    h.param(index).map(|p| p.value())
}

fn str_param<'a>(h: &'a Helper<'_>, index: usize) -> &'a str {
    param(h, index).and_then(Value::as_str).unwrap_or("")
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// `{{json record}}` pretty-prints a value; a string holding JSON is reformatted.
fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let rendered = match param(h, 0) {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .map_or_else(|_| s.clone(), |parsed| pretty(&parsed)),
        Some(value) => pretty(value),
        None => String::new(),
    };
    out.write(&rendered)?;
    Ok(())
}

fn uuid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&generator::uuid(&mut rand::thread_rng()))?;
    Ok(())
}

/// `{{now}}` or `{{now "%Y-%m-%d"}}`, in UTC.
fn now_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = param(h, 0)
        .and_then(Value::as_str)
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
    let mut rendered = String::new();
    write!(rendered, "{}", Utc::now().format(format)).map_err(|_| {
        RenderErrorReason::Other(format!("invalid time format '{}'", format))
    })?;
    out.write(&rendered)?;
    Ok(())
}

/// `{{random lo hi}}`, inclusive; reversed bounds are swapped.
fn random_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let a = param(h, 0).and_then(Value::as_i64).unwrap_or(0);
    let b = param(h, 1).and_then(Value::as_i64).unwrap_or(100);
    let value = rand::thread_rng().gen_range(a.min(b)..=a.max(b));
    out.write(&value.to_string())?;
    Ok(())
}

/// `{{default value "fallback"}}`: the fallback replaces null and empty strings.
fn default_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let rendered = match param(h, 0) {
        None | Some(Value::Null) => str_param(h, 1).to_string(),
        Some(Value::String(s)) if s.is_empty() => str_param(h, 1).to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    out.write(&rendered)?;
    Ok(())
}

fn upper_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&str_param(h, 0).to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&str_param(h, 0).to_lowercase())?;
    Ok(())
}
