//! Engine flavours: how to launch an engine and how it marks the end of a reply.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Token the engines echo after each request.
pub const DEFAULT_END_TOKEN: &str = "END";

/// Token used by engine servers reached in client mode.
pub const CLIENT_END_TOKEN: &str = "#! END";

// =============================================================================
// Command builders
// =============================================================================

/// Produces the argv of an engine process.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, config: &EngineConfig) -> Vec<String>;
}

impl<F> CommandBuilder for F
where
    F: Fn(&EngineConfig) -> Vec<String> + Send + Sync,
{
    fn build(&self, config: &EngineConfig) -> Vec<String> {
        self(config)
    }
}

/// Assembles `<binary> <config extra args> <args> <files> [-- -]`.
///
/// The binary is resolved against the configured installation root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgvBuilder {
    program: String,
    args: Vec<String>,
    files: Vec<String>,
    read_stdin: bool,
}

impl ArgvBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an input file, passed after all flags.
    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.files.push(file.into());
        self
    }

    /// Also read program text from stdin (`-- -`).
    pub fn read_stdin(mut self, read_stdin: bool) -> Self {
        self.read_stdin = read_stdin;
        self
    }
}

impl CommandBuilder for ArgvBuilder {
    fn build(&self, config: &EngineConfig) -> Vec<String> {
        let mut argv = vec![config
            .binary_path(&self.program)
            .to_string_lossy()
            .into_owned()];
        argv.extend(config.extra_args());
        argv.extend(self.args.iter().cloned());
        argv.extend(self.files.iter().cloned());
        if self.read_stdin || config.read_stdin {
            argv.push("--".to_string());
            argv.push("-".to_string());
        }
        argv
    }
}

// =============================================================================
// Delimiters
// =============================================================================

/// Syntax of the directive that makes an engine print a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoStyle {
    /// `_echo("TOKEN").` for probabilistic Datalog engines.
    Datalog,
    /// `INSERT INTO _echo VALUES ('TOKEN');` for PSQL engines.
    Psql,
    /// Any directive; every `{token}` is replaced by the token.
    Template(String),
}

impl EchoStyle {
    fn directive(&self, token: &str) -> String {
        match self {
            EchoStyle::Datalog => format!("_echo(\"{}\").", token),
            EchoStyle::Psql => format!("INSERT INTO _echo VALUES ('{}');", token),
            EchoStyle::Template(template) => template.replace("{token}", token),
        }
    }
}

/// End-of-reply marker: the token, the directive that echoes it and the
/// pattern that recognises the echoed line.
#[derive(Debug, Clone)]
pub struct Delimiter {
    token: String,
    style: EchoStyle,
    directive: String,
    pattern: Regex,
}

impl Delimiter {
    /// A delimiter with the default recognition pattern.
    ///
    /// The pattern accepts the token bare, parenthesised, quoted and with a
    /// leading probability, so `END`, `(END)`, `("END")` and `1 (END)` all
    /// match while `(WEEKEND)` does not.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the pattern cannot be compiled.
    pub fn new(token: &str, style: EchoStyle) -> EngineResult<Self> {
        Ok(Self {
            token: token.to_string(),
            directive: style.directive(token),
            pattern: token_pattern(token)?,
            style,
        })
    }

    pub fn datalog() -> EngineResult<Self> {
        Self::new(DEFAULT_END_TOKEN, EchoStyle::Datalog)
    }

    pub fn psql() -> EngineResult<Self> {
        Self::new(DEFAULT_END_TOKEN, EchoStyle::Psql)
    }

    /// A delimiter with a caller-supplied directive and pattern.
    pub fn custom(token: impl Into<String>, directive: impl Into<String>, pattern: Regex) -> Self {
        let directive = directive.into();
        Self {
            token: token.into(),
            style: EchoStyle::Template(directive.clone()),
            directive,
            pattern,
        }
    }

    /// Same echo syntax with a different token.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the pattern cannot be compiled.
    pub fn with_token(&self, token: &str) -> EngineResult<Self> {
        Self::new(token, self.style.clone())
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn directive(&self) -> &str {
        &self.directive
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

fn token_pattern(token: &str) -> EngineResult<Regex> {
    let pattern = format!(
        r#"^\s*(?:[01](?:\.\d*)?\s*)?\(?\s*"?{}"?\s*\)?\s*$"#,
        regex::escape(token)
    );
    Regex::new(&pattern)
        .map_err(|e| EngineError::Config(format!("bad delimiter `{}`: {}", token, e)))
}

// =============================================================================
// Flavours
// =============================================================================

/// A named engine variant: its command builder and its delimiter.
///
/// Engines without a delimiter (analysis tools) produce one reply that ends
/// at end of stream.
#[derive(Clone)]
pub struct Flavor {
    name: String,
    command: Arc<dyn CommandBuilder>,
    delimiter: Option<Delimiter>,
}

impl Flavor {
    pub fn new(name: impl Into<String>, command: impl CommandBuilder + 'static) -> Self {
        Self {
            name: name.into(),
            command: Arc::new(command),
            delimiter: None,
        }
    }

    /// Flavour whose command is the binary `name` with no extra arguments.
    pub fn binary(name: &str) -> Self {
        Self::new(name, ArgvBuilder::new(name))
    }

    /// Probabilistic Datalog engine (`hy_pd`), reading program text from stdin.
    ///
    /// # Errors
    ///
    /// Fails only if the delimiter pattern cannot be compiled.
    pub fn pdatalog() -> EngineResult<Self> {
        Ok(Self::new("hy_pd", ArgvBuilder::new("hy_pd").read_stdin(true))
            .with_delimiter(Delimiter::datalog()?))
    }

    /// Probabilistic SQL engine (`hy_psql`).
    ///
    /// # Errors
    ///
    /// Fails only if the delimiter pattern cannot be compiled.
    pub fn psql() -> EngineResult<Self> {
        Ok(Self::new("hy_psql", ArgvBuilder::new("hy_psql")).with_delimiter(Delimiter::psql()?))
    }

    /// Analysis tool that processes `files` and exits.
    pub fn analysis<I, S>(name: &str, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let builder = files
            .into_iter()
            .fold(ArgvBuilder::new(name), |builder, file| builder.file(file));
        Self::new(name, builder)
    }

    pub fn with_delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delimiter(&self) -> Option<&Delimiter> {
        self.delimiter.as_ref()
    }

    pub fn build_command(&self, config: &EngineConfig) -> Vec<String> {
        self.command.build(config)
    }
}

impl fmt::Debug for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flavor")
            .field("name", &self.name)
            .field("delimiter", &self.delimiter.as_ref().map(Delimiter::token))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn test_delimiter_pattern_variants() {
        let delimiter = Delimiter::datalog().unwrap();
        for line in ["END", "(END)", "(\"END\")", "1 (END)", "  0.5 ( \"END\" )  "] {
            assert!(delimiter.is_match(line), "should match {:?}", line);
        }
        for line in ["(WEEKEND)", "END OF TEXT", "(END, x)", "0.5 (d1)"] {
            assert!(!delimiter.is_match(line), "should not match {:?}", line);
        }
    }

    #[test]
    fn test_directives() {
        assert_eq!(Delimiter::datalog().unwrap().directive(), "_echo(\"END\").");
        assert_eq!(
            Delimiter::psql().unwrap().directive(),
            "INSERT INTO _echo VALUES ('END');"
        );
        let echo = Delimiter::new("--", EchoStyle::Template("echo {token}".to_string())).unwrap();
        assert_eq!(echo.directive(), "echo --");
        assert!(echo.is_match("--"));
    }

    #[test]
    fn test_with_token_keeps_style() {
        let client = Delimiter::datalog().unwrap().with_token(CLIENT_END_TOKEN).unwrap();
        assert_eq!(client.directive(), "_echo(\"#! END\").");
        assert!(client.is_match("#! END"));
        assert!(!client.is_match("END"));
    }

    #[test]
    fn test_argv_builder() {
        let config = EngineConfig {
            home: Some(PathBuf::from("/opt/hy")),
            extra_args: "-v  -x".to_string(),
            ..EngineConfig::default()
        };
        let builder = ArgvBuilder::new("hy_pd")
            .args(["-eval", "sequential"])
            .file("kb.pd")
            .read_stdin(true);
        assert_eq!(
            builder.build(&config),
            vec![
                "/opt/hy/bin/hy_pd",
                "-v",
                "-x",
                "-eval",
                "sequential",
                "kb.pd",
                "--",
                "-"
            ]
        );
    }

    #[test]
    fn test_config_read_stdin_applies_to_any_builder() {
        let config = EngineConfig {
            read_stdin: true,
            ..EngineConfig::default()
        };
        assert_eq!(ArgvBuilder::new("cat").build(&config), vec!["cat", "--", "-"]);
    }

    #[test]
    fn test_closure_builder() {
        let flavor = Flavor::new("echo", |_: &EngineConfig| {
            vec!["echo".to_string(), "hi".to_string()]
        });
        assert_eq!(
            flavor.build_command(&EngineConfig::default()),
            vec!["echo", "hi"]
        );
        assert!(flavor.delimiter().is_none());
    }

    #[test]
    fn test_presets() {
        let pd = Flavor::pdatalog().unwrap();
        assert_eq!(pd.name(), "hy_pd");
        assert_eq!(
            pd.build_command(&EngineConfig::default()),
            vec!["hy_pd", "--", "-"]
        );
        assert_eq!(pd.delimiter().unwrap().token(), "END");

        let analysis = Flavor::analysis("hy_text2mds", ["a.txt", "b.txt"]);
        assert_eq!(
            analysis.build_command(&EngineConfig::default()),
            vec!["hy_text2mds", "a.txt", "b.txt"]
        );
        assert!(format!("{:?}", analysis).contains("hy_text2mds"));
    }
}
