//! SOAP 1.1 envelopes for the Grid Server protocol
//!
//! Requests are written by hand; responses are read with `roxmltree`,
//! matching on local element names so any namespace prefix is accepted.

use grid_core::domain::lua::{GridServerStatus, JobRecord, LuaType, LuaValue, ScriptExecution};
use roxmltree::{Document, Node};

use crate::error::{ClientError, Result};

/// Target namespace of every operation
pub const NAMESPACE: &str = "http://roblox.com/";

const ENVELOPE_NAMESPACE: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Value of the `SOAPAction` header for an operation
pub fn soap_action(operation: &str) -> String {
    format!("{}{}", NAMESPACE, operation)
}

/// Wraps operation parameters into a full envelope
pub fn envelope(operation: &str, parameters: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><SOAP-ENV:Envelope xmlns:SOAP-ENV="{}" xmlns:ns1="{}"><SOAP-ENV:Body><ns1:{op}>{}</ns1:{op}></SOAP-ENV:Body></SOAP-ENV:Envelope>"#,
        ENVELOPE_NAMESPACE,
        NAMESPACE,
        parameters,
        op = operation
    )
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn text_element(name: &str, value: &str) -> String {
    format!("<ns1:{name}>{}</ns1:{name}>", escape(value))
}

pub fn job_element(job: &JobRecord) -> String {
    format!(
        "<ns1:job>{}{}{}{}</ns1:job>",
        text_element("id", &job.id),
        text_element("expirationInSeconds", &job.expiration_in_seconds.to_string()),
        text_element("category", &job.category.to_string()),
        text_element("cores", &job.cores.to_string()),
    )
}

fn lua_value_element(value: &LuaValue) -> String {
    let mut out = String::from("<ns1:LuaValue>");
    out.push_str(&text_element("type", value.lua_type().as_wire()));

    match value {
        LuaValue::Table(items) => {
            out.push_str("<ns1:table>");
            for item in items {
                out.push_str(&lua_value_element(item));
            }
            out.push_str("</ns1:table>");
        }
        other => {
            if let Some(v) = other.wire_value() {
                out.push_str(&text_element("value", &v));
            }
        }
    }

    out.push_str("</ns1:LuaValue>");
    out
}

pub fn script_element(script: &ScriptExecution) -> String {
    let mut arguments = String::new();
    for argument in &script.arguments {
        arguments.push_str(&lua_value_element(argument));
    }

    format!(
        "<ns1:script>{}{}<ns1:arguments>{}</ns1:arguments></ns1:script>",
        text_element("name", &script.name),
        text_element("script", &script.script),
        arguments
    )
}

// =============================================================================
// Response parsing
// =============================================================================

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name).map(|n| n.text().unwrap_or_default().to_string())
}

fn fault_of(doc: &Document<'_>) -> Option<ClientError> {
    let fault = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Fault")?;

    Some(ClientError::soap_fault(
        child_text(fault, "faultcode").unwrap_or_default(),
        child_text(fault, "faultstring").unwrap_or_default(),
    ))
}

/// Extracts a SOAP fault from a response body, if there is one
pub fn read_fault(body: &str) -> Option<ClientError> {
    let doc = Document::parse(body).ok()?;
    fault_of(&doc)
}

/// Parses the body and hands the `{operation}Result` element to `f`
///
/// The result element is `None` for void operations and empty results.
fn with_result<T>(
    body: &str,
    operation: &str,
    f: impl FnOnce(Option<Node<'_, '_>>) -> Result<T>,
) -> Result<T> {
    let doc = Document::parse(body)
        .map_err(|e| ClientError::ParseError(format!("Invalid SOAP response: {}", e)))?;

    if let Some(fault) = fault_of(&doc) {
        return Err(fault);
    }

    let response_name = format!("{}Response", operation);
    let response = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == response_name)
        .ok_or_else(|| ClientError::ParseError(format!("Missing {} element", response_name)))?;

    let result = child(response, &format!("{}Result", operation));
    f(result)
}

/// Checks a void response for faults
pub fn read_empty(body: &str, operation: &str) -> Result<()> {
    with_result(body, operation, |_| Ok(()))
}

pub fn read_text(body: &str, operation: &str) -> Result<Option<String>> {
    with_result(body, operation, |result| {
        Ok(result.map(|n| n.text().unwrap_or_default().to_string()))
    })
}

fn parse_scalar<T: std::str::FromStr>(text: Option<String>, operation: &str) -> Result<T> {
    let text = text.ok_or_else(|| ClientError::ParseError(format!("{} returned no value", operation)))?;
    text.trim()
        .parse::<T>()
        .map_err(|_| ClientError::ParseError(format!("{} returned '{}'", operation, text)))
}

pub fn read_f64(body: &str, operation: &str) -> Result<f64> {
    parse_scalar(read_text(body, operation)?, operation)
}

pub fn read_i32(body: &str, operation: &str) -> Result<i32> {
    parse_scalar(read_text(body, operation)?, operation)
}

fn parse_lua_value(node: Node<'_, '_>) -> Result<LuaValue> {
    let type_name = child_text(node, "type").unwrap_or_default();
    let lua_type = LuaType::from_wire(type_name.trim())
        .ok_or_else(|| ClientError::ParseError(format!("Unknown Lua type '{}'", type_name)))?;

    let value = child_text(node, "value").unwrap_or_default();

    Ok(match lua_type {
        LuaType::Nil => LuaValue::Nil,
        LuaType::Boolean => LuaValue::Boolean(value.trim() == "true"),
        LuaType::Number => LuaValue::Number(
            value
                .trim()
                .parse()
                .map_err(|_| ClientError::ParseError(format!("Invalid Lua number '{}'", value)))?,
        ),
        LuaType::String => LuaValue::String(value),
        LuaType::Table => {
            let items = match child(node, "table") {
                Some(table) => table
                    .children()
                    .filter(|n| n.is_element() && n.tag_name().name() == "LuaValue")
                    .map(parse_lua_value)
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            LuaValue::Table(items)
        }
    })
}

pub fn read_lua_values(body: &str, operation: &str) -> Result<Vec<LuaValue>> {
    with_result(body, operation, |result| {
        let Some(result) = result else {
            return Ok(Vec::new());
        };
        result
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "LuaValue")
            .map(parse_lua_value)
            .collect()
    })
}

pub fn read_jobs(body: &str, operation: &str) -> Result<Vec<JobRecord>> {
    with_result(body, operation, |result| {
        let Some(result) = result else {
            return Ok(Vec::new());
        };
        result
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "Job")
            .map(|job| {
                Ok(JobRecord {
                    id: child_text(job, "id").unwrap_or_default(),
                    expiration_in_seconds: parse_scalar(
                        child_text(job, "expirationInSeconds"),
                        operation,
                    )?,
                    category: parse_scalar(child_text(job, "category"), operation)?,
                    cores: parse_scalar(child_text(job, "cores"), operation)?,
                })
            })
            .collect()
    })
}

pub fn read_status(body: &str, operation: &str) -> Result<GridServerStatus> {
    with_result(body, operation, |result| {
        let result =
            result.ok_or_else(|| ClientError::ParseError(format!("{} returned no status", operation)))?;
        Ok(GridServerStatus {
            version: child_text(result, "version").unwrap_or_default(),
            environment_count: parse_scalar(child_text(result, "environmentCount"), operation)?,
        })
    })
}
