//! Execution harnesses for interpreted languages.
//!
//! A harness loads the submitted source and replaces the language's input
//! routine. Each call writes one prompt frame to stdout,
//! `{"action":"output","data":<prompt>,"prompt":true}` followed by a newline,
//! flushes, then reads one line from stdin. Uncaught errors are reported as a
//! single `Error: <Kind>: <message>` line on stderr with a non-zero exit.
//!
//! Compiled languages get no harness. Instead a small translation unit is
//! linked into every binary that turns off stdout buffering before `main`, so
//! output reaches the client while the program waits for input.

use crate::config::Language;

const PYTHON_HARNESS: &str = include_str!("scripts/python_harness.py");
const JAVASCRIPT_HARNESS: &str = include_str!("scripts/javascript_harness.js");

const UNBUFFERED_STDOUT: &str = include_str!("scripts/unbuffered_stdout.c");

const SOURCE_PLACEHOLDER: &str = "__SOURCE_PATH__";

/// Harness template for a language, `None` for compiled languages
pub fn template(language: Language) -> Option<&'static str> {
    match language {
        Language::Python => Some(PYTHON_HARNESS),
        Language::JavaScript => Some(JAVASCRIPT_HARNESS),
        Language::C | Language::Cpp => None,
    }
}

/// File name of the harness written next to the source
pub fn file_name(language: Language, token: &str) -> String {
    format!("harness_{token}.{}", language.extension())
}

/// Extra translation unit compiled into C and C++ programs
pub fn stdio_unit(language: Language) -> Option<&'static str> {
    language.is_compiled().then_some(UNBUFFERED_STDOUT)
}

/// File name of the stdio unit; `.c` is compiled as C++ by `g++`
pub fn stdio_file_name(token: &str) -> String {
    format!("stdio_{token}.c")
}

/// Render the harness for `language` pointing at `source_path`.
///
/// The path is embedded as a JSON string literal, which both Python and
/// JavaScript parse as a plain string.
pub fn render(language: Language, source_path: &str) -> Option<String> {
    let template = template(language)?;
    let literal = serde_json::Value::String(source_path.to_owned()).to_string();
    Some(template.replace(SOURCE_PLACEHOLDER, &literal))
}
