//! Configuration file loading for Relaybox
//!
//! Handles loading and parsing configuration files using the config crate.
//! The `CODE_EXEC_DIR` environment variable takes precedence over `exec_dir`.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat, Source};

use crate::config::{Config, ConfigError, EXEC_DIR_ENV, Language, SandboxKind};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load(File::from(path.as_ref()), exec_dir_override())
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        Self::load(File::from_str(content, FileFormat::Toml), exec_dir_override())
    }

    fn load<S>(source: S, exec_dir: Option<String>) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        let config = ConfigBuilder::builder()
            .add_source(source)
            .set_override_option("exec_dir", exec_dir)?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.exec_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("exec_dir is empty".to_string()));
        }
        if self.backend == SandboxKind::Process && !self.allow_unisolated {
            return Err(ConfigError::Invalid(
                "the process backend has no filesystem isolation; \
                 set allow_unisolated = true to use it"
                    .to_string(),
            ));
        }
        if self.box_pool.count == 0 {
            return Err(ConfigError::Invalid(
                "box_pool.count must be at least 1".to_string(),
            ));
        }
        if self.session.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "session.outbound_buffer must be at least 1".to_string(),
            ));
        }

        for (id, toolchain) in &self.languages {
            let language: Language = id
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("unknown language '{id}'")))?;

            if toolchain.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if toolchain.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            match (&toolchain.compile, language.is_compiled()) {
                (Some(compile), true) if compile.command.is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' has empty compile command"
                    )));
                }
                (Some(compile), true) if compile.output_name.contains('/') => {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' output name must be a plain file name"
                    )));
                }
                (None, true) => {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' is compiled but has no compile section"
                    )));
                }
                (Some(_), false) => {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' is interpreted and cannot have a compile section"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn exec_dir_override() -> Option<String> {
    std::env::var(EXEC_DIR_ENV).ok().filter(|dir| !dir.is_empty())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn parse(toml: &str, exec_dir: Option<&str>) -> Result<Config, ConfigError> {
        Config::load(
            File::from_str(toml, FileFormat::Toml),
            exec_dir.map(String::from),
        )
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
[languages.python]
name = "Python 3"

[languages.python.run]
command = ["python3", "{source}"]
"#;

        let config = parse(toml, None).unwrap();
        assert!(config.languages.contains_key("python"));
        assert_eq!(config.backend, SandboxKind::Isolate);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
exec_dir = "/srv/relaybox"
backend = "process"
allow_unisolated = true
isolate_path = "/usr/local/bin/isolate"

[box_pool]
first_id = 100
count = 8

[session]
kill_grace_ms = 250

[default_limits]
wall_time_limit = 5.0
memory_limit = 131072

[languages.c]
name = "C"

[languages.c.compile]
command = ["gcc", "{source}", "-o", "{output}"]

[languages.c.run]
command = ["{binary}"]
"#;

        let config = parse(toml, None).unwrap();
        assert_eq!(config.exec_dir, PathBuf::from("/srv/relaybox"));
        assert_eq!(config.backend, SandboxKind::Process);
        assert_eq!(config.box_pool.first_id, 100);
        assert_eq!(config.box_pool.count, 8);
        assert_eq!(config.session.kill_grace_ms, 250);
        assert_eq!(config.session.drain_timeout_ms, 2000);
        assert_eq!(config.default_limits.wall_time_limit, Some(5.0));
        assert_eq!(config.default_limits.memory_limit, Some(131072));
        assert_eq!(config.default_limits.time_limit, Some(10.0));
        assert_eq!(
            config.languages["c"].compile.as_ref().unwrap().output_name,
            "program"
        );
    }

    #[test]
    fn exec_dir_override_wins() {
        let toml = r#"exec_dir = "/from/file""#;
        let config = parse(toml, Some("/from/env")).unwrap();
        assert_eq!(config.exec_dir, PathBuf::from("/from/env"));
    }

    #[test]
    fn exec_dir_defaults_under_working_directory() {
        let config = parse("", None).unwrap();
        assert!(config.exec_dir.ends_with("code_exec_files"));
    }

    #[test]
    fn partial_limits_dont_override_unspecified_fields() {
        let toml = r#"
[languages.javascript]
name = "Node"

[languages.javascript.run]
command = ["node", "{source}"]

[languages.javascript.run.limits]
max_processes = 16
"#;

        let config = parse(toml, None).unwrap();
        let limits = config.languages["javascript"].run.limits.as_ref().unwrap();
        assert_eq!(limits.max_processes, Some(16));
        assert_eq!(limits.time_limit, None);
        assert_eq!(limits.memory_limit, None);
    }

    #[test]
    fn process_backend_requires_opt_in() {
        let err = parse(r#"backend = "process""#, None).unwrap_err();
        assert!(matches!(&err, ConfigError::Invalid(msg) if msg.contains("allow_unisolated")));

        let config = parse("backend = \"process\"\nallow_unisolated = true", None).unwrap();
        assert_eq!(config.backend, SandboxKind::Process);
        assert!(config.allow_unisolated);
    }

    #[test]
    fn embedded_cpp_allows_threads() {
        let config = parse(crate::config::EXAMPLE_CONFIG, None).unwrap();
        let limits = config.effective_limits(config.languages["cpp"].run.limits.as_ref());
        assert!(limits.max_processes.unwrap() > 1);
        assert_eq!(limits.memory_limit, config.default_limits.memory_limit);
    }

    #[test]
    fn rejects_unknown_language() {
        let toml = r#"
[languages.ruby]
name = "Ruby"

[languages.ruby.run]
command = ["ruby", "{source}"]
"#;
        assert!(matches!(parse(toml, None), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_compiled_language_without_compile_section() {
        let toml = r#"
[languages.cpp]
name = "C++"

[languages.cpp.run]
command = ["{binary}"]
"#;
        assert!(matches!(parse(toml, None), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_empty_run_command() {
        let toml = r#"
[languages.python]
name = "Python"

[languages.python.run]
command = []
"#;
        assert!(matches!(parse(toml, None), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_outbound_buffer() {
        let toml = r#"
[session]
outbound_buffer = 0
"#;
        assert!(matches!(parse(toml, None), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            parse("backend = [", None),
            Err(ConfigError::Parse(_))
        ));
    }
}
