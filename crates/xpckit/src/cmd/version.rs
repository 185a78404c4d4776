use serde_json::json;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("xpckit {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let info = json!({
        "name": "xpckit",
        "version": env!("CARGO_PKG_VERSION"),
        "target": option_env!("XPCKIT_BUILD_TARGET").unwrap_or("unknown"),
        "profile": option_env!("XPCKIT_BUILD_PROFILE").unwrap_or("unknown"),
        "target_os": std::env::consts::OS,
        "target_arch": std::env::consts::ARCH,
        "protocol": xpckit_peer::HandshakeConfig::default().protocol_version,
        "error_domains": xpckit_peer::registered_domains(),
    });

    match format {
        OutputFormat::Json => println!("{info}"),
        OutputFormat::Pretty | OutputFormat::Table => {
            if let Some(fields) = info.as_object() {
                for (key, value) in fields {
                    match value.as_str() {
                        Some(text) => println!("{key}: {text}"),
                        None => println!("{key}: {value}"),
                    }
                }
            }
        }
    }
    Ok(SUCCESS)
}
