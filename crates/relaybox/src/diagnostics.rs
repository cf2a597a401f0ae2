//! Beginner-friendly explanations of compiler and runtime errors
//!
//! Explanations supplement the raw diagnostic; they never replace it.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::Language;

struct ErrorPattern {
    regex: Regex,
    explanation: &'static str,
}

fn compile_patterns(table: &[(&str, &'static str)]) -> Vec<ErrorPattern> {
    table
        .iter()
        .filter_map(|&(pattern, explanation)| {
            Regex::new(pattern).ok().map(|regex| ErrorPattern {
                regex,
                explanation,
            })
        })
        .collect()
}

const PYTHON_TABLE: &[(&str, &str)] = &[
    (
        r"ImportError: No module named '(.*)'",
        "The module '{0}' is not installed or not available.",
    ),
    (
        r"NameError: name '(.*)' is not defined",
        "The variable or function '{0}' is used but hasn't been defined yet.",
    ),
    (
        r"TypeError: (.*) takes (.*) positional arguments? but (.*) (?:were|was) given",
        "Function call has the wrong number of arguments: {0}",
    ),
    (
        r"SyntaxError: invalid syntax",
        "There's a syntax error in your code. Check for missing parentheses, quotes, or colons.",
    ),
    (
        r"ZeroDivisionError: (?:integer )?division (?:or modulo )?by zero",
        "You're trying to divide by zero, which is not allowed in mathematics.",
    ),
    (
        r"IndexError: list index out of range",
        "You're trying to access an element at an index that doesn't exist in your list.",
    ),
    (
        r"KeyError: (.*)",
        "The key '{0}' doesn't exist in the dictionary you're trying to access.",
    ),
    (
        r"(?m)FileNotFoundError: (.*?)$",
        "The file '{0}' could not be found. Check the path and filename.",
    ),
    (
        r"IndentationError: (.*)",
        "There's an issue with the indentation in your code: {0}",
    ),
    (
        r"ModuleNotFoundError: No module named '(.*)'",
        "The Python module '{0}' is not installed.",
    ),
    (
        r"AttributeError: '(.*)' object has no attribute '(.*)'",
        "The object of type '{0}' doesn't have the attribute or method '{1}'.",
    ),
];

// gcc quotes with ASCII or typographic quotes depending on locale, and ld
// opens with a backtick
const C_TABLE: &[(&str, &str)] = &[
    (
        r"undefined reference to [`'‘](.*?)['’]",
        "The function '{0}' is being called but hasn't been defined or linked properly.",
    ),
    (
        r"['‘](.*?)['’] undeclared",
        "The variable or function '{0}' is used but hasn't been declared.",
    ),
    (
        r"expected ['‘](.*?)['’] before ['‘](.*?)['’]",
        "Syntax error: expected '{0}' before '{1}'.",
    ),
    (
        r"invalid operands to binary (\S+)",
        "The operation '{0}' cannot be performed on these types.",
    ),
    (
        r"incompatible implicit declaration of built-in function ['‘](.*?)['’]",
        "You need to include the proper header file for the function '{0}'.",
    ),
];

const CPP_TABLE: &[(&str, &str)] = &[
    (
        r"undefined reference to [`'‘](.*?)['’]",
        "The function or symbol '{0}' is being called but hasn't been defined or linked properly.",
    ),
    (
        r"['‘](.*?)['’] was not declared in this scope",
        "The variable, function, or class '{0}' is used but hasn't been declared in this scope.",
    ),
    (
        r"expected ['‘](.*?)['’] before ['‘](.*?)['’]",
        "Syntax error: expected '{0}' before '{1}'.",
    ),
    (
        r"no matching function for call to ['‘](.*?)['’]",
        "There's no version of the function '{0}' that matches the arguments you provided.",
    ),
    (
        r"invalid operands to binary (\S+)",
        "The operation '{0}' cannot be performed on these types.",
    ),
];

static PYTHON_PATTERNS: LazyLock<Vec<ErrorPattern>> =
    LazyLock::new(|| compile_patterns(PYTHON_TABLE));
static C_PATTERNS: LazyLock<Vec<ErrorPattern>> = LazyLock::new(|| compile_patterns(C_TABLE));
static CPP_PATTERNS: LazyLock<Vec<ErrorPattern>> = LazyLock::new(|| compile_patterns(CPP_TABLE));

/// Tips for identifiers that usually mean a missing header or import
const TIPS: &[(&str, &str)] = &[
    ("sqrt", "For using sqrt(), you need to include <math.h> for C or <cmath> for C++"),
    ("printf", "For using printf(), you need to include <stdio.h> for C or <cstdio> for C++"),
    ("cout", "For using cout, you need to include <iostream> in C++"),
    ("cin", "For using cin, you need to include <iostream> in C++"),
    ("malloc", "For using malloc(), you need to include <stdlib.h> for C or <cstdlib> for C++"),
    ("strlen", "For using strlen(), you need to include <string.h> for C or <cstring> for C++"),
    (
        "fopen",
        "For using file operations like fopen(), you need to include <stdio.h> for C or <cstdio> for C++",
    ),
    ("std::vector", "For using std::vector, you need to include <vector> in C++"),
    ("std::string", "For using std::string, you need to include <string> in C++"),
    ("std::map", "For using std::map, you need to include <map> in C++"),
    ("rand", "For using rand(), you need to include <stdlib.h> for C or <cstdlib> for C++"),
    ("time", "For using time(), you need to include <time.h> for C or <ctime> for C++"),
    ("isalpha", "For using isalpha(), you need to include <ctype.h> for C or <cctype> for C++"),
    ("numpy", "To use numpy, make sure it's properly imported with 'import numpy as np'"),
    ("pandas", "To use pandas, make sure it's properly imported with 'import pandas as pd'"),
    (
        "matplotlib",
        "To use matplotlib, make sure it's properly imported with 'import matplotlib.pyplot as plt'",
    ),
];

struct Tip {
    term: &'static str,
    regex: Regex,
    suggestion: &'static str,
}

// Whole identifiers only, so "runtime" does not trigger the time() tip
static TIP_PATTERNS: LazyLock<Vec<Tip>> = LazyLock::new(|| {
    TIPS.iter()
        .filter_map(|&(term, suggestion)| {
            Regex::new(&format!(r"\b{}\b", regex::escape(term)))
                .ok()
                .map(|regex| Tip {
                    term,
                    regex,
                    suggestion,
                })
        })
        .collect()
});

const PYTHON_PACKAGES: &[(&str, &[&str])] = &[
    ("numpy", &["np", "numpy"]),
    ("pandas", &["pd", "pandas"]),
    ("matplotlib", &["plt", "matplotlib"]),
    ("scipy", &["scipy"]),
    ("tensorflow", &["tf", "tensorflow"]),
    ("torch", &["torch"]),
    ("sklearn", &["sklearn"]),
];

const C_HEADERS: &[(&str, &[&str])] = &[
    ("math.h", &["sqrt", "pow", "sin", "cos", "log"]),
    ("stdio.h", &["printf", "scanf", "fopen"]),
    ("stdlib.h", &["malloc", "free", "rand", "exit"]),
    ("string.h", &["strlen", "strcpy", "strcmp"]),
    ("iostream", &["cout", "cin", "endl"]),
    ("vector", &["vector"]),
    ("algorithm", &["sort", "find", "max", "min"]),
    ("fstream", &["ifstream", "ofstream"]),
];

fn patterns(language: Language) -> Option<&'static [ErrorPattern]> {
    match language {
        Language::Python => Some(PYTHON_PATTERNS.as_slice()),
        Language::C => Some(C_PATTERNS.as_slice()),
        Language::Cpp => Some(CPP_PATTERNS.as_slice()),
        Language::JavaScript => None,
    }
}

fn fill(template: &str, captures: &regex::Captures<'_>) -> String {
    let mut filled = template.to_string();
    for i in 1..captures.len() {
        let value = captures.get(i).map_or("", |m| m.as_str());
        filled = filled.replace(&format!("{{{}}}", i - 1), value);
    }
    filled
}

/// Explain an error message in plain words
pub fn friendly_message(language: Language, error: &str) -> String {
    if error.trim().is_empty() {
        return "An unknown error occurred.".to_string();
    }
    let Some(patterns) = patterns(language) else {
        return format!("Error details: {error}");
    };

    if let Some((pattern, captures)) = patterns
        .iter()
        .find_map(|p| p.regex.captures(error).map(|c| (p, c)))
    {
        let mut message = fill(pattern.explanation, &captures);
        for tip in TIP_PATTERNS.iter().filter(|tip| tip.regex.is_match(error)) {
            message.push_str("\n\nTIP: ");
            message.push_str(tip.suggestion);
        }
        return message;
    }

    if let Some(tip) = TIP_PATTERNS.iter().find(|tip| tip.regex.is_match(error)) {
        return format!(
            "Error involving '{}'. {}\n\nOriginal error: {error}",
            tip.term, tip.suggestion
        );
    }

    let lines: Vec<&str> = error.trim().lines().collect();
    if lines.len() > 5 {
        format!(
            "Error summary: {}\n\nPlease check your code for syntax errors or missing libraries.",
            lines[0]
        )
    } else {
        format!("Error details: {error}")
    }
}

/// Libraries or headers the program seems to be missing
pub fn missing_libraries(language: Language, code: &str, error: &str) -> Vec<&'static str> {
    match language {
        Language::Python => PYTHON_PACKAGES
            .iter()
            .filter(|(name, aliases)| {
                error.contains(&format!("No module named '{name}'"))
                    && aliases.iter().any(|alias| code.contains(alias))
            })
            .map(|(name, _)| *name)
            .collect(),
        Language::C | Language::Cpp => C_HEADERS
            .iter()
            .filter(|(header, functions)| {
                !code.contains(header)
                    && functions
                        .iter()
                        .any(|f| code.contains(f) && error.contains(f))
            })
            .map(|(header, _)| *header)
            .collect(),
        Language::JavaScript => Vec::new(),
    }
}

/// Friendly message plus any missing libraries
pub fn explain(language: Language, code: &str, error: &str) -> String {
    let mut message = friendly_message(language, error);
    let missing = missing_libraries(language, code, error);
    if !missing.is_empty() {
        let label = match language {
            Language::Python => "Missing Python packages",
            Language::C => "Missing C headers",
            Language::Cpp => "Missing C++ headers",
            Language::JavaScript => "Missing packages",
        };
        message.push_str(&format!("\n\n{label}: {}", missing.join(", ")));
    }
    message
}

pub fn timeout_message(limit: Duration) -> String {
    format!(
        "Your code took too long to run! It exceeded the {} second limit.",
        limit.as_secs_f64()
    )
}
