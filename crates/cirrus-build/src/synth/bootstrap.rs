//! Bootstrap binary rendering.
//!
//! The bootstrap is the process entrypoint inside the function image. It
//! reads one JSON document from stdin, runs the handler once and writes a
//! single envelope line to stdout:
//!
//! ```text
//! {"result":<handler output>}     exit 0
//! {"error":"<message>"}           exit 1
//! ```
//!
//! The rendered text depends only on its inputs, so re-running synthesis on
//! an unchanged tree produces byte-identical output.

/// First line of every generated bootstrap.
pub const GENERATED_HEADER: &str = "// @generated by cirrus-build. Do not edit.";

/// Render the bootstrap source for a handler.
///
/// `marker` is the capability trait path, brought into scope so the
/// handler's `handle` method resolves. `handler_path` is the absolute path
/// of the handler type as seen from the bootstrap binary.
#[must_use]
pub fn render(marker: &str, handler_path: &str) -> String {
    format!(
        r#"{GENERATED_HEADER}

use std::io::{{Read as _, Write as _}};

#[allow(unused_imports)]
use {marker} as _;

fn main() {{
    let outcome = run();
    let envelope = match &outcome {{
        Ok(value) => serde_json::json!({{ "result": value }}),
        Err(message) => serde_json::json!({{ "error": message }}),
    }};

    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{{envelope}}");
    let _ = stdout.flush();

    if outcome.is_err() {{
        std::process::exit(1);
    }}
}}

fn run() -> Result<serde_json::Value, String> {{
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .map_err(|e| format!("failed to read input: {{e}}"))?;

    let input: serde_json::Value = if raw.trim().is_empty() {{
        serde_json::Value::Null
    }} else {{
        serde_json::from_str(&raw).map_err(|e| format!("invalid input: {{e}}"))?
    }};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start runtime: {{e}}"))?;

    let handler = <{handler_path} as ::core::default::Default>::default();
    let output = runtime
        .block_on(async {{ handler.handle(input).await }})
        .map_err(|e| e.to_string())?;

    serde_json::to_value(output).map_err(|e| format!("failed to encode output: {{e}}"))
}}
"#
    )
}
