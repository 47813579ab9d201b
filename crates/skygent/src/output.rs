//! Terminal output helpers.
//!
//! The engine never produces user-facing strings beyond error messages;
//! everything here is a thin JSON/line emitter.

use serde::Serialize;

/// Print a value as JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a plain line on stdout.
pub fn print_line(line: &str) {
    println!("{line}");
}

/// Print an error envelope on stderr.
///
/// JSON mode emits `{error: {code, message, exitCode}}`; text mode emits a
/// single human line.
pub fn print_error(error: &anyhow::Error, exit_code: i32) {
    let text_mode = std::env::var("SKYGENT_OUTPUT_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("text"))
        .unwrap_or(false);
    if text_mode {
        eprintln!("error: {error}");
        return;
    }
    let envelope = serde_json::json!({
        "error": {
            "code": error_code_name(exit_code),
            "message": error.to_string(),
            "exitCode": exit_code,
        }
    });
    eprintln!("{envelope}");
}

fn error_code_name(exit_code: i32) -> &'static str {
    match exit_code {
        2 => "input",
        3 => "store-not-found",
        5 => "source",
        7 => "store-io",
        8 => "filter",
        _ => "error",
    }
}
