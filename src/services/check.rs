//! 项目检查
//!
//! Reads the manifest, build descriptor and compose file of a project and
//! collects every finding. Nothing is built or started.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

use crate::config::{EnvConfig, ProjectConfig};
use crate::domain::compose::{ComposeFile, ResolvedService};
use crate::domain::descriptor::BuildDescriptor;
use crate::domain::finding::Finding;
use crate::domain::manifest::DependencyManifest;

/// 检查结果
#[derive(Debug, Default, Serialize)]
pub struct CheckReport {
    pub findings: Vec<Finding>,
    /// Requirements in the manifest, when it parsed
    pub requirements: usize,
    /// Compose services that resolved
    pub services: Vec<ResolvedService>,
}

impl CheckReport {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(Finding::is_error)
    }

    pub fn errors(&self) -> usize {
        self.findings.iter().filter(|f| f.is_error()).count()
    }

    pub fn warnings(&self) -> usize {
        self.findings.len() - self.errors()
    }
}

/// Check the project. `lookup` supplies variables for compose interpolation.
pub fn check_project<F>(project: &ProjectConfig, env: &EnvConfig, lookup: F) -> io::Result<CheckReport>
where
    F: Fn(&str) -> Option<String>,
{
    let mut report = CheckReport::default();
    let port = env.bind.port;

    if !env.bind.is_reachable_from_host() {
        report.findings.push(Finding::warning(
            "HOST",
            format!(
                "the process binds {}; inside a container it cannot receive published traffic",
                env.bind
            ),
        ));
    }

    // Manifest
    let manifest_subject = project.manifest.clone();
    match read_optional(&project.manifest_path())? {
        Some(text) => match DependencyManifest::parse(&text) {
            Ok(manifest) => {
                report.requirements = manifest.len();
                if manifest.is_empty() {
                    report
                        .findings
                        .push(Finding::warning(&manifest_subject, "no requirements listed"));
                }
            }
            Err(e) => report
                .findings
                .push(Finding::error(&manifest_subject, e.to_string())),
        },
        None => report
            .findings
            .push(Finding::error(&manifest_subject, "file not found")),
    }

    // Build descriptor
    let dockerfile_subject = project.dockerfile.clone();
    match read_optional(&project.dockerfile_path())? {
        Some(text) => match BuildDescriptor::parse(&text) {
            Ok(descriptor) => report.findings.extend(descriptor.check(
                &dockerfile_subject,
                project.manifest_name(),
                port,
            )),
            Err(e) => report
                .findings
                .push(Finding::error(&dockerfile_subject, e.to_string())),
        },
        None => report
            .findings
            .push(Finding::error(&dockerfile_subject, "file not found")),
    }

    // Compose file is optional
    let compose_subject = project.compose_file.clone();
    match read_optional(&project.compose_path())? {
        Some(text) => match ComposeFile::parse(&text) {
            Ok(compose) => {
                let (services, findings) = compose.check(&compose_subject, port, &lookup);
                for service in &services {
                    for overlay in &service.overlays {
                        debug!(
                            service = %service.name,
                            host = %overlay.host,
                            container = %overlay.container,
                            "Bind-mount overlay"
                        );
                    }
                }
                report.findings.extend(findings);
                report.services = services;
            }
            Err(e) => report
                .findings
                .push(Finding::error(&compose_subject, e.to_string())),
        },
        None => debug!(file = %compose_subject, "No compose file, skipping"),
    }

    info!(
        errors = report.errors(),
        warnings = report.warnings(),
        "Project check finished"
    );
    Ok(report)
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DOCKERFILE: &str = "FROM python:3.12-slim\nWORKDIR /app\nCOPY requirements.txt .\n\
        RUN pip install -r requirements.txt\nCOPY . .\nEXPOSE 5000\nCMD [\"python\", \"app.py\"]\n";

    const COMPOSE: &str = "services:\n  web:\n    build: .\n    ports:\n      - \"${PORT:-5000}:${PORT:-5000}\"\n    volumes:\n      - ./templates:/app/templates\n    environment:\n      - PORT=${PORT:-5000}\n";

    fn project(files: &[(&str, &str)]) -> (TempDir, ProjectConfig) {
        let dir = TempDir::new().unwrap();
        for (name, body) in files {
            fs::write(dir.path().join(name), body).unwrap();
        }
        let config = ProjectConfig::default().with_root(dir.path());
        (dir, config)
    }

    #[test]
    fn test_clean_project() {
        let (_dir, config) = project(&[
            ("requirements.txt", "Flask==3.0.3\n"),
            ("Dockerfile", DOCKERFILE),
            ("docker-compose.yml", COMPOSE),
        ]);
        let report = check_project(&config, &EnvConfig::default(), |_| None).unwrap();
        assert!(report.findings.is_empty(), "{:?}", report.findings);
        assert_eq!(report.requirements, 1);
        assert_eq!(report.services[0].overlays.len(), 1);
    }

    #[test]
    fn test_missing_files_and_bad_manifest() {
        let (_dir, config) = project(&[("requirements.txt", "flask>=3\n")]);
        let report = check_project(&config, &EnvConfig::default(), |_| None).unwrap();
        assert!(report.has_errors());
        assert_eq!(report.errors(), 2);
        assert!(report.findings.iter().any(|f| f.subject == "Dockerfile"));
    }

    #[test]
    fn test_port_drift_is_reported() {
        let (_dir, config) = project(&[
            ("requirements.txt", "Flask==3.0.3\n"),
            ("Dockerfile", DOCKERFILE),
            (
                "docker-compose.yml",
                "version: \"3.8\"\nservices:\n  web:\n    image: site\n    ports:\n      - \"8000:8000\"\n",
            ),
        ]);
        let report = check_project(&config, &EnvConfig::default(), |_| None).unwrap();
        assert_eq!(report.errors(), 1);
        assert_eq!(report.warnings(), 1);
        assert!(report
            .findings
            .iter()
            .any(|f| f.is_error() && f.message.contains("binds port 5000")));
    }
}
