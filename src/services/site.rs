//! 页面渲染与静态资源
//!
//! Templates and assets are compiled into the binary. When `TEMPLATE_DIR` or
//! `STATIC_DIR` is set, files are read from that directory on every request
//! instead, so edits under a bind mount show up without a rebuild.

use minijinja::value::{Kwargs, Value};
use minijinja::{context, Environment, Error, ErrorKind};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::config::env::constants::{SERVICE_NAME, VERSION};
use crate::config::EnvConfig;
use crate::error::LifecycleError;

/// Page title shown in the navbar and `<title>`.
pub const SITE_TITLE: &str = "Flask + Bootstrap";

const EMBEDDED_TEMPLATES: &[(&str, &str)] = &[
    ("base.html", include_str!("../../templates/base.html")),
    ("index.html", include_str!("../../templates/index.html")),
];

const EMBEDDED_ASSETS: &[(&str, &[u8])] = &[
    ("css/style.css", include_bytes!("../../static/css/style.css")),
    ("js/script.js", include_bytes!("../../static/js/script.js")),
];

/// 页面渲染器
pub struct SiteRenderer {
    embedded: Environment<'static>,
    template_dir: Option<PathBuf>,
    static_dir: Option<PathBuf>,
}

impl SiteRenderer {
    /// Build the renderer. A configured template directory must contain
    /// `index.html`; otherwise the process cannot serve its only page.
    pub fn new(config: &EnvConfig) -> Result<Self, LifecycleError> {
        if let Some(dir) = &config.template_dir {
            if !dir.join("index.html").is_file() {
                return Err(LifecycleError::Runtime(format!(
                    "template directory {} has no index.html",
                    dir.display()
                )));
            }
            info!(dir = %dir.display(), "Serving templates from directory");
        }
        if let Some(dir) = &config.static_dir {
            info!(dir = %dir.display(), "Serving static assets from directory");
        }

        let mut embedded = base_environment();
        for &(name, source) in EMBEDDED_TEMPLATES {
            embedded
                .add_template(name, source)
                .map_err(|e| LifecycleError::Runtime(format!("invalid template {}: {}", name, e)))?;
        }

        Ok(Self {
            embedded,
            template_dir: config.template_dir.clone(),
            static_dir: config.static_dir.clone(),
        })
    }

    /// "embedded" or "directory", for the health endpoint.
    pub fn template_source(&self) -> &'static str {
        if self.template_dir.is_some() {
            "directory"
        } else {
            "embedded"
        }
    }

    pub fn render(&self, name: &str) -> Result<String, Error> {
        let ctx = context! {
            title => SITE_TITLE,
            service => SERVICE_NAME,
            version => VERSION,
        };
        match &self.template_dir {
            None => self.embedded.get_template(name)?.render(ctx),
            Some(dir) => {
                // fresh environment per render: nothing is cached between requests
                let mut env = base_environment();
                let dir = dir.clone();
                env.set_loader(move |name| load_template(&dir, name));
                let rendered = env.get_template(name)?.render(ctx)?;
                Ok(rendered)
            }
        }
    }

    /// Bytes of a static asset. `None` for unknown assets and unsafe paths.
    pub async fn asset(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        let Some(rel) = safe_relative(path) else {
            debug!(path, "Rejected asset path");
            return Ok(None);
        };
        match &self.static_dir {
            None => Ok(EMBEDDED_ASSETS
                .iter()
                .find(|(name, _)| Path::new(name) == rel.as_path())
                .map(|(_, bytes)| bytes.to_vec())),
            Some(dir) => match tokio::fs::read(dir.join(&rel)).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(None),
                // directories and other non-files
                Err(_) if dir.join(&rel).is_dir() => Ok(None),
                Err(e) => Err(e),
            },
        }
    }
}

fn base_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_function("url_for", url_for);
    env
}

/// `url_for('static', filename='css/style.css')` / `url_for('index')`
///
/// Marked safe so HTML auto-escaping leaves the slashes alone.
fn url_for(endpoint: String, kwargs: Kwargs) -> Result<Value, Error> {
    let url = match endpoint.as_str() {
        "static" => {
            let filename: String = kwargs.get("filename")?;
            format!("/static/{}", filename.trim_start_matches('/'))
        }
        "index" => "/".to_string(),
        other => {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("no endpoint named '{}'", other),
            ))
        }
    };
    kwargs.assert_all_used()?;
    Ok(Value::from_safe_string(url))
}

fn load_template(dir: &Path, name: &str) -> Result<Option<String>, Error> {
    let Some(rel) = safe_relative(name) else {
        return Ok(None);
    };
    match fs::read_to_string(dir.join(rel)) {
        Ok(source) => Ok(Some(source)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot read template {}", name),
        )
        .with_source(e)),
    }
}

/// Relative path made only of normal components. Rejects `..`, absolute
/// paths and empty input.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Content type by file extension.
pub fn content_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "html" => "text/html; charset=utf-8",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "ico" => "image/x-icon",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
