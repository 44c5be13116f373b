use serde_json::Value;
use serde_json_path::JsonPath;

use crate::LogError;

/// How each backend line becomes client output.
#[derive(Debug)]
pub enum Projection {
    /// Lines are forwarded as-is, no JSON parsing.
    Passthrough,
    /// Lines are parsed as JSON and every string match is emitted.
    JsonPath(JsonPath),
}

impl Projection {
    /// Compile once per request; `None` or an empty expression is passthrough.
    pub fn compile(expr: Option<&str>) -> Result<Self, LogError> {
        match expr.map(str::trim) {
            None | Some("") => Ok(Projection::Passthrough),
            Some(path) => JsonPath::parse(path)
                .map(Projection::JsonPath)
                .map_err(|e| LogError::InvalidProjection { path: path.to_string(), message: e.to_string() }),
        }
    }

    /// Project one raw line (without its trailing newline). `Ok(None)` means
    /// the line contributes nothing.
    pub fn project(&self, raw: &[u8]) -> Result<Option<String>, LogError> {
        let text = String::from_utf8_lossy(raw);
        let line = text.strip_suffix('\r').unwrap_or(&text);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let out = match self {
            Projection::Passthrough => line.to_string(),
            Projection::JsonPath(path) => {
                let doc: Value = serde_json::from_str(line)?;
                let mut parts = Vec::new();
                for m in path.query(&doc).all() {
                    match m.as_str() {
                        Some(s) => parts.push(s),
                        None => return Err(LogError::NonStringMatch(m.to_string())),
                    }
                }
                parts.join("\n")
            }
        };
        Ok(if out.is_empty() { None } else { Some(out) })
    }
}
