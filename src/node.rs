//! Node bindings. Options arrive as a JSON string and results leave as plain
//! JS objects; failures surface as thrown errors carrying the diagnostic text.

use napi_derive::napi;

use crate::config::CompileOptions;
use crate::error::CompileFailure;

fn options_from(
    options_json: Option<String>,
    fallback: fn() -> CompileOptions,
) -> napi::Result<CompileOptions> {
    match options_json {
        Some(json) => CompileOptions::from_json(&json)
            .map_err(|e| napi::Error::from_reason(format!("Invalid compile options: {}", e))),
        None => Ok(fallback()),
    }
}

fn failure_reason(failure: CompileFailure) -> napi::Error {
    let mut reason = failure.error.to_string();
    for warning in &failure.warnings {
        reason.push('\n');
        reason.push_str(&warning.to_string());
    }
    napi::Error::from_reason(reason)
}

#[napi]
pub fn compile_template_native(
    source: String,
    file_path: String,
    options_json: Option<String>,
) -> napi::Result<serde_json::Value> {
    let options = options_from(options_json, CompileOptions::in_memory)?;
    let unit = crate::compile(&source, &file_path, &options).map_err(failure_reason)?;
    serde_json::to_value(&unit).map_err(|e| napi::Error::from_reason(e.to_string()))
}

#[napi]
pub fn compile_file_native(
    path: String,
    options_json: Option<String>,
) -> napi::Result<serde_json::Value> {
    let options = options_from(options_json, CompileOptions::default)?;
    let unit = crate::compile_file(&path, &options).map_err(failure_reason)?;
    serde_json::to_value(&unit).map_err(|e| napi::Error::from_reason(e.to_string()))
}

#[napi]
pub fn is_up_to_date_native(template_path: String, options_json: Option<String>) -> bool {
    let options = options_json
        .and_then(|json| CompileOptions::from_json(&json).ok())
        .unwrap_or_default();
    crate::check_up_to_date(&template_path, &options)
}
