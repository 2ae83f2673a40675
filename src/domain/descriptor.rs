//! Build descriptor (Dockerfile) model
//!
//! Parses the subset of Dockerfile syntax the image builder understands and
//! checks that build steps are ordered from least to most frequently changing
//! input, so a source edit never invalidates the dependency-install layer.

use globset::Glob;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use super::binding::Protocol;
use super::finding::Finding;

#[derive(Debug, Error, PartialEq)]
pub enum DescriptorError {
    #[error("build descriptor is empty")]
    Empty,
    #[error("line {line}: the first instruction must be FROM")]
    MissingFrom { line: usize },
    #[error("line {line}: unknown instruction '{keyword}'")]
    UnknownInstruction { line: usize, keyword: String },
    #[error("line {line}: {keyword} is missing arguments")]
    MissingArgument { line: usize, keyword: String },
    #[error("line {line}: invalid JSON array form")]
    InvalidExecForm { line: usize },
    #[error("line {line}: invalid port '{value}'")]
    InvalidPort { line: usize, value: String },
}

/// Exec form (`["python", "app.py"]`) or shell form (`python app.py`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandForm {
    Exec(Vec<String>),
    Shell(String),
}

impl fmt::Display for CommandForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandForm::Exec(args) => {
                let json = serde_json::to_string(args).map_err(|_| fmt::Error)?;
                write!(f, "{}", json)
            }
            CommandForm::Shell(cmd) => write!(f, "{}", cmd),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    From {
        image: String,
        alias: Option<String>,
    },
    Arg {
        name: String,
        default: Option<String>,
    },
    Workdir {
        path: String,
    },
    Env {
        vars: Vec<(String, String)>,
    },
    Copy {
        sources: Vec<String>,
        dest: String,
        from: Option<String>,
        chown: Option<String>,
    },
    Run {
        command: String,
    },
    Expose {
        ports: Vec<ExposedPort>,
    },
    User {
        user: String,
    },
    Cmd {
        command: CommandForm,
    },
    Entrypoint {
        command: CommandForm,
    },
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Arg { .. } => "ARG",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Env { .. } => "ENV",
            Instruction::Copy { .. } => "COPY",
            Instruction::Run { .. } => "RUN",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::User { .. } => "USER",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())?;
        match self {
            Instruction::From { image, alias } => {
                write!(f, " {}", image)?;
                if let Some(alias) = alias {
                    write!(f, " AS {}", alias)?;
                }
                Ok(())
            }
            Instruction::Arg { name, default } => match default {
                Some(default) => write!(f, " {}={}", name, default),
                None => write!(f, " {}", name),
            },
            Instruction::Workdir { path } => write!(f, " {}", path),
            Instruction::Env { vars } => {
                for (key, value) in vars {
                    write!(f, " {}={}", key, value)?;
                }
                Ok(())
            }
            Instruction::Copy {
                sources,
                dest,
                from,
                chown,
            } => {
                if let Some(from) = from {
                    write!(f, " --from={}", from)?;
                }
                if let Some(chown) = chown {
                    write!(f, " --chown={}", chown)?;
                }
                write!(f, " {} {}", sources.join(" "), dest)
            }
            Instruction::Run { command } => write!(f, " {}", command),
            Instruction::Expose { ports } => {
                for p in ports {
                    write!(f, " {}/{}", p.port, p.protocol.as_str())?;
                }
                Ok(())
            }
            Instruction::User { user } => write!(f, " {}", user),
            Instruction::Cmd { command } | Instruction::Entrypoint { command } => {
                write!(f, " {}", command)
            }
        }
    }
}

/// One instruction with the line it starts on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Step {
    pub line: usize,
    pub instruction: Instruction,
}

/// Steps between one FROM and the next.
#[derive(Debug)]
pub struct StageView<'a> {
    pub alias: Option<&'a str>,
    pub steps: &'a [Step],
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BuildDescriptor {
    pub steps: Vec<Step>,
}

impl BuildDescriptor {
    pub fn parse(text: &str) -> Result<Self, DescriptorError> {
        let mut steps = Vec::new();
        for (line, logical) in logical_lines(text) {
            steps.push(Step {
                line,
                instruction: parse_instruction(&logical, line)?,
            });
        }

        let first = steps
            .iter()
            .find(|s| !matches!(s.instruction, Instruction::Arg { .. }))
            .ok_or(DescriptorError::Empty)?;
        if !matches!(first.instruction, Instruction::From { .. }) {
            return Err(DescriptorError::MissingFrom { line: first.line });
        }

        Ok(Self { steps })
    }

    /// Split into build stages; leading ARGs belong to no stage.
    pub fn stages(&self) -> Vec<StageView<'_>> {
        let starts: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.instruction, Instruction::From { .. }))
            .map(|(i, _)| i)
            .collect();

        starts
            .iter()
            .enumerate()
            .map(|(n, &start)| {
                let end = starts.get(n + 1).copied().unwrap_or(self.steps.len());
                let alias = match &self.steps[start].instruction {
                    Instruction::From { alias, .. } => alias.as_deref(),
                    _ => None,
                };
                StageView {
                    alias,
                    steps: &self.steps[start..end],
                }
            })
            .collect()
    }

    /// Ports declared with EXPOSE in the final stage.
    pub fn exposed_ports(&self) -> Vec<ExposedPort> {
        self.stages()
            .last()
            .map(|stage| {
                stage
                    .steps
                    .iter()
                    .filter_map(|s| match &s.instruction {
                        Instruction::Expose { ports } => Some(ports.clone()),
                        _ => None,
                    })
                    .flatten()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check step ordering against the dependency manifest and the port the
    /// application binds.
    pub fn check(&self, subject: &str, manifest_name: &str, app_port: u16) -> Vec<Finding> {
        let mut findings = Vec::new();
        let stages = self.stages();

        for stage in &stages {
            let Some(install) = stage
                .steps
                .iter()
                .position(|s| is_install_step(&s.instruction, manifest_name))
            else {
                continue;
            };
            let install_line = stage.steps[install].line;

            let manifest_copy = stage.steps[..install]
                .iter()
                .find(|s| is_manifest_copy(&s.instruction, manifest_name));
            let source_copy = stage.steps[..install]
                .iter()
                .find(|s| is_source_copy(&s.instruction, manifest_name));

            if let Some(source) = source_copy {
                findings.push(
                    Finding::error(
                        subject,
                        format!(
                            "application source is copied before the dependency install on line {}; \
                             every source edit will reinstall dependencies. Copy {} on its own first \
                             and the rest of the source after the install",
                            install_line, manifest_name
                        ),
                    )
                    .at_line(source.line),
                );
            } else if manifest_copy.is_none() {
                findings.push(
                    Finding::error(
                        subject,
                        format!(
                            "dependency install reads {} but it is not copied into the image before this step",
                            manifest_name
                        ),
                    )
                    .at_line(install_line),
                );
            }
        }

        if let Some(last) = stages.last() {
            let has_command = last.steps.iter().any(|s| {
                matches!(
                    s.instruction,
                    Instruction::Cmd { .. } | Instruction::Entrypoint { .. }
                )
            });
            if !has_command {
                findings.push(Finding::warning(
                    subject,
                    "final stage declares no CMD or ENTRYPOINT",
                ));
            }
        }

        let exposed = self.exposed_ports();
        if !exposed.is_empty() && !exposed.iter().any(|p| p.port == app_port) {
            let declared: Vec<String> = exposed.iter().map(|p| p.port.to_string()).collect();
            findings.push(Finding::warning(
                subject,
                format!(
                    "EXPOSE declares {} but the application binds port {}",
                    declared.join(", "),
                    app_port
                ),
            ));
        }

        findings
    }
}

/// A RUN step that consumes the manifest (e.g. `pip install -r requirements.txt`).
pub fn is_install_step(instruction: &Instruction, manifest_name: &str) -> bool {
    matches!(instruction, Instruction::Run { command } if command.contains(manifest_name))
}

/// A local COPY whose only source is the manifest.
pub fn is_manifest_copy(instruction: &Instruction, manifest_name: &str) -> bool {
    match instruction {
        Instruction::Copy {
            sources,
            from: None,
            ..
        } => sources.iter().all(|s| is_manifest_path(s, manifest_name)),
        _ => false,
    }
}

/// A local COPY that brings in anything besides the manifest.
pub fn is_source_copy(instruction: &Instruction, manifest_name: &str) -> bool {
    match instruction {
        Instruction::Copy {
            sources,
            from: None,
            ..
        } => sources.iter().any(|s| !is_manifest_path(s, manifest_name)),
        _ => false,
    }
}

fn is_manifest_path(source: &str, manifest_name: &str) -> bool {
    let source = source.trim_start_matches("./");
    if source == manifest_name {
        return true;
    }
    let Some(file_name) = Path::new(source).file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    // `requirements*.txt` brings the manifest in too
    if file_name.contains(|c: char| matches!(c, '*' | '?' | '[')) {
        return Glob::new(file_name)
            .map(|glob| glob.compile_matcher().is_match(manifest_name))
            .unwrap_or(false);
    }
    file_name == manifest_name
}

/// Join continuation lines and drop comments. Yields (first line number, text).
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.starts_with('#') || (trimmed.is_empty() && current.is_none()) {
            continue;
        }

        let (body, continues) = match trimmed.strip_suffix('\\') {
            Some(body) => (body.trim_end(), true),
            None => (trimmed, false),
        };

        let entry = current.get_or_insert_with(|| (idx + 1, String::new()));
        if !body.is_empty() {
            if !entry.1.is_empty() {
                entry.1.push(' ');
            }
            entry.1.push_str(body);
        }

        if !continues {
            if let Some(done) = current.take() {
                out.push(done);
            }
        }
    }

    if let Some(done) = current.take() {
        out.push(done);
    }
    out
}

fn parse_instruction(text: &str, line: usize) -> Result<Instruction, DescriptorError> {
    let (keyword, rest) = match text.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim()),
        None => (text, ""),
    };
    let keyword = keyword.to_ascii_uppercase();

    let missing = || DescriptorError::MissingArgument {
        line,
        keyword: keyword.clone(),
    };
    if rest.is_empty() {
        return Err(missing());
    }

    let instruction = match keyword.as_str() {
        "FROM" => {
            let words: Vec<&str> = rest
                .split_whitespace()
                .filter(|w| !w.starts_with("--"))
                .collect();
            match words.as_slice() {
                [image] => Instruction::From {
                    image: image.to_string(),
                    alias: None,
                },
                [image, as_kw, alias] if as_kw.eq_ignore_ascii_case("as") => Instruction::From {
                    image: image.to_string(),
                    alias: Some(alias.to_string()),
                },
                _ => return Err(missing()),
            }
        }
        "ARG" => match rest.split_once('=') {
            Some((name, default)) => Instruction::Arg {
                name: name.trim().to_string(),
                default: Some(unquote(default.trim()).to_string()),
            },
            None => Instruction::Arg {
                name: rest.to_string(),
                default: None,
            },
        },
        "WORKDIR" => Instruction::Workdir {
            path: rest.to_string(),
        },
        "ENV" => Instruction::Env {
            vars: parse_env(rest),
        },
        "COPY" | "ADD" => parse_copy(rest, line, &keyword)?,
        "RUN" => Instruction::Run {
            command: rest.to_string(),
        },
        "EXPOSE" => {
            let mut ports = Vec::new();
            for word in rest.split_whitespace() {
                let (port, protocol) = match word.split_once('/') {
                    Some((p, proto)) if proto.eq_ignore_ascii_case("udp") => (p, Protocol::Udp),
                    Some((p, _)) => (p, Protocol::Tcp),
                    None => (word, Protocol::Tcp),
                };
                let port = port.parse().map_err(|_| DescriptorError::InvalidPort {
                    line,
                    value: word.to_string(),
                })?;
                ports.push(ExposedPort { port, protocol });
            }
            Instruction::Expose { ports }
        }
        "USER" => Instruction::User {
            user: rest.to_string(),
        },
        "CMD" => Instruction::Cmd {
            command: parse_command(rest, line)?,
        },
        "ENTRYPOINT" => Instruction::Entrypoint {
            command: parse_command(rest, line)?,
        },
        _ => {
            return Err(DescriptorError::UnknownInstruction {
                line,
                keyword: keyword.clone(),
            });
        }
    };

    Ok(instruction)
}

fn parse_copy(rest: &str, line: usize, keyword: &str) -> Result<Instruction, DescriptorError> {
    let mut from = None;
    let mut chown = None;
    let mut words = Vec::new();

    let mut remaining = rest;
    while let Some(flag) = remaining.strip_prefix("--") {
        let (flag, tail) = flag
            .split_once(char::is_whitespace)
            .unwrap_or((flag, ""));
        if let Some(v) = flag.strip_prefix("from=") {
            from = Some(v.to_string());
        } else if let Some(v) = flag.strip_prefix("chown=") {
            chown = Some(v.to_string());
        }
        remaining = tail.trim_start();
    }

    if remaining.starts_with('[') {
        words = serde_json::from_str::<Vec<String>>(remaining)
            .map_err(|_| DescriptorError::InvalidExecForm { line })?;
    } else {
        words.extend(remaining.split_whitespace().map(str::to_string));
    }

    if words.len() < 2 {
        return Err(DescriptorError::MissingArgument {
            line,
            keyword: keyword.to_string(),
        });
    }
    let dest = words.pop().unwrap_or_default();

    Ok(Instruction::Copy {
        sources: words,
        dest,
        from,
        chown,
    })
}

fn parse_command(rest: &str, line: usize) -> Result<CommandForm, DescriptorError> {
    if rest.starts_with('[') {
        serde_json::from_str::<Vec<String>>(rest)
            .map(CommandForm::Exec)
            .map_err(|_| DescriptorError::InvalidExecForm { line })
    } else {
        Ok(CommandForm::Shell(rest.to_string()))
    }
}

fn parse_env(rest: &str) -> Vec<(String, String)> {
    let first = rest.split_whitespace().next().unwrap_or_default();
    if first.contains('=') {
        rest.split_whitespace()
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), unquote(v).to_string()))
            .collect()
    } else {
        // Legacy form: ENV KEY value with spaces
        let (key, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        vec![(key.to_string(), unquote(value.trim()).to_string())]
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
# syntax=docker/dockerfile:1
FROM python:3.12-slim

WORKDIR /app

COPY requirements.txt .
RUN pip install --no-cache-dir \
    -r requirements.txt

COPY . .

ENV FLASK_APP=app.py PORT=5000
EXPOSE 5000
CMD ["python", "app.py"]
"#;

    #[test]
    fn test_parse_standard_descriptor() {
        let d = BuildDescriptor::parse(GOOD).unwrap();
        assert_eq!(d.steps.len(), 8);
        assert_eq!(
            d.steps[0].instruction,
            Instruction::From {
                image: "python:3.12-slim".to_string(),
                alias: None
            }
        );
        assert_eq!(d.steps[3].line, 8);
        assert_eq!(
            d.steps[3].instruction,
            Instruction::Run {
                command: "pip install --no-cache-dir -r requirements.txt".to_string()
            }
        );
        assert_eq!(
            d.steps[7].instruction,
            Instruction::Cmd {
                command: CommandForm::Exec(vec!["python".to_string(), "app.py".to_string()])
            }
        );
        assert_eq!(d.exposed_ports()[0].port, 5000);
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        let d = BuildDescriptor::parse(GOOD).unwrap();
        let rendered: Vec<String> = d.steps.iter().map(|s| s.instruction.to_string()).collect();
        assert_eq!(rendered[2], "COPY requirements.txt .");
        assert_eq!(rendered[5], "ENV FLASK_APP=app.py PORT=5000");
        assert_eq!(rendered[7], r#"CMD ["python","app.py"]"#);
    }

    #[test]
    fn test_good_order_has_no_findings() {
        let d = BuildDescriptor::parse(GOOD).unwrap();
        assert!(d.check("Dockerfile", "requirements.txt", 5000).is_empty());
    }

    #[test]
    fn test_source_copy_before_install_is_an_error() {
        let d = BuildDescriptor::parse(
            "FROM python:3.12-slim\nWORKDIR /app\nCOPY . .\nRUN pip install -r requirements.txt\nCMD python app.py\n",
        )
        .unwrap();
        let findings = d.check("Dockerfile", "requirements.txt", 5000);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_error());
        assert_eq!(findings[0].line, Some(3));
    }

    #[test]
    fn test_wildcard_manifest_copy_counts_as_manifest() {
        let text = "FROM python:3.12-slim\nCOPY requirements*.txt ./\nRUN pip install -r requirements.txt\nCOPY *.py ./\nCMD [\"python\", \"app.py\"]\n";
        let descriptor = BuildDescriptor::parse(text).unwrap();
        assert!(descriptor.check("Dockerfile", "requirements.txt", 5000).is_empty());

        let text = "FROM python:3.12-slim\nCOPY *.py ./\nRUN pip install -r requirements.txt\nCMD [\"python\", \"app.py\"]\n";
        let findings = BuildDescriptor::parse(text)
            .unwrap()
            .check("Dockerfile", "requirements.txt", 5000);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_error());
    }

    #[test]
    fn test_install_without_manifest_copy_is_an_error() {
        let d = BuildDescriptor::parse(
            "FROM python:3.12-slim\nRUN pip install -r requirements.txt\nCOPY requirements.txt .\nCMD [\"python\"]\n",
        )
        .unwrap();
        let findings = d.check("Dockerfile", "requirements.txt", 5000);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, Some(2));
    }

    #[test]
    fn test_expose_mismatch_and_missing_cmd_are_warnings() {
        let d = BuildDescriptor::parse("FROM alpine\nEXPOSE 8000/tcp\n").unwrap();
        let findings = d.check("Dockerfile", "requirements.txt", 5000);
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| !f.is_error()));
        assert!(findings[1].message.contains("8000"));
    }

    #[test]
    fn test_multi_stage() {
        let d = BuildDescriptor::parse(
            "ARG BASE=rust:1.82\nFROM --platform=linux/amd64 $BASE AS builder\nRUN cargo build\nFROM debian:bookworm-slim\nCOPY --from=builder /app/bin /usr/local/bin/app\nCMD [\"app\"]\n",
        )
        .unwrap();
        let stages = d.stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].alias, Some("builder"));
        assert_eq!(stages[1].steps.len(), 3);
        assert!(matches!(
            &stages[1].steps[1].instruction,
            Instruction::Copy { from: Some(f), .. } if f == "builder"
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(BuildDescriptor::parse("# nothing\n"), Err(DescriptorError::Empty));
        assert_eq!(
            BuildDescriptor::parse("RUN echo hi\n"),
            Err(DescriptorError::MissingFrom { line: 1 })
        );
        assert!(matches!(
            BuildDescriptor::parse("FROM a\nFROBNICATE x\n"),
            Err(DescriptorError::UnknownInstruction { line: 2, .. })
        ));
        assert!(matches!(
            BuildDescriptor::parse("FROM a\nCOPY onlyone\n"),
            Err(DescriptorError::MissingArgument { line: 2, .. })
        ));
        assert!(matches!(
            BuildDescriptor::parse("FROM a\nEXPOSE http\n"),
            Err(DescriptorError::InvalidPort { line: 2, .. })
        ));
        assert!(matches!(
            BuildDescriptor::parse("FROM a\nCMD [\"unterminated\"\n"),
            Err(DescriptorError::InvalidExecForm { line: 2 })
        ));
    }
}
