use std::fmt::Write as _;
use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde_json::{json, Value};
use xpckit_peer::XpcObject;

/// Bytes of a surface shown in previews.
const SURFACE_PREVIEW: usize = 16;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Print a reply object in `format`.
pub fn print_reply(message: &str, reply: &XpcObject, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&to_json(reply)).unwrap_or_else(|_| "null".to_string())
            );
        }
        OutputFormat::Pretty => {
            println!(
                "{}",
                serde_json::to_string_pretty(&to_json(reply))
                    .unwrap_or_else(|_| "null".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KEY", "TYPE", "VALUE"]);
            match reply {
                XpcObject::Dictionary(dict) => {
                    for (key, value) in dict.iter() {
                        table.add_row(vec![
                            key.clone(),
                            value.type_name().to_string(),
                            to_json(value).to_string(),
                        ]);
                    }
                }
                other => {
                    table.add_row(vec![
                        message.to_string(),
                        other.type_name().to_string(),
                        to_json(other).to_string(),
                    ]);
                }
            }
            println!("{table}");
        }
    }
}

/// JSON view of an object tree. Values JSON has no form for are tagged.
pub fn to_json(object: &XpcObject) -> Value {
    match object {
        XpcObject::Null => Value::Null,
        XpcObject::Bool(b) => json!(b),
        XpcObject::Int64(n) => json!(n),
        XpcObject::UInt64(n) => json!(n),
        XpcObject::Double(n) => json!(n),
        XpcObject::String(s) => json!(s),
        XpcObject::Data(bytes) => json!({ "data": hex(bytes) }),
        XpcObject::Date(date) => json!({ "date": date.unix_nanos() }),
        XpcObject::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        XpcObject::Dictionary(dict) => Value::Object(
            dict.iter()
                .map(|(key, value)| (key.clone(), to_json(value)))
                .collect(),
        ),
        XpcObject::Endpoint(endpoint) => {
            json!({ "endpoint": endpoint.socket_path().display().to_string() })
        }
        XpcObject::SharedMemory(surface) => {
            let mut preview = vec![0u8; surface.len().min(SURFACE_PREVIEW)];
            let preview = match surface.read_at(0, &mut preview) {
                Ok(()) => hex(&preview),
                Err(_) => String::new(),
            };
            json!({ "shared_memory": { "len": surface.len(), "preview": preview } })
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}
