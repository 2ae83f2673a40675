//! Build context: the project files visible to COPY steps

use globset::{GlobBuilder, GlobMatcher};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::config::project::CACHE_DIR_NAME;

/// Never part of the context, whatever .dockerignore says.
const ALWAYS_EXCLUDED: &[&str] = &[".git", "target", CACHE_DIR_NAME];

#[derive(Debug, Clone)]
enum IgnoreRule {
    /// `dir` or `dir/file`: the path and everything under it
    Prefix(String),
    /// Wildcard pattern anchored at the context root; `*` stays within one
    /// path segment, `**` crosses them
    Pattern(GlobMatcher),
}

impl IgnoreRule {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            return None;
        }
        let line = line
            .trim_start_matches("./")
            .trim_start_matches('/')
            .trim_end_matches('/');
        if line.is_empty() {
            return None;
        }
        if is_pattern(line) {
            return compile(line).map(IgnoreRule::Pattern);
        }
        Some(IgnoreRule::Prefix(line.to_string()))
    }

    fn matches(&self, rel: &str) -> bool {
        match self {
            IgnoreRule::Prefix(p) => rel == p.as_str() || rel.starts_with(&format!("{}/", p)),
            // a matched directory excludes everything below it
            IgnoreRule::Pattern(glob) => rel
                .match_indices('/')
                .map(|(i, _)| &rel[..i])
                .chain(std::iter::once(rel))
                .any(|path| glob.is_match(path)),
        }
    }
}

/// Whether a path contains wildcard syntax (`*`, `?`, `[...]`).
fn is_pattern(path: &str) -> bool {
    path.contains(|c: char| matches!(c, '*' | '?' | '['))
}

fn compile(pattern: &str) -> Option<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .ok()
        .map(|glob| glob.compile_matcher())
}

#[derive(Debug)]
pub enum ContextError {
    /// Source does not exist in the context (or is ignored)
    Missing(String),
    Io(io::Error),
}

impl From<io::Error> for ContextError {
    fn from(e: io::Error) -> Self {
        ContextError::Io(e)
    }
}

/// Files under the project root, minus ignored paths.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    rules: Vec<IgnoreRule>,
}

impl BuildContext {
    /// Open a context rooted at `root`, reading `.dockerignore` if present.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("build context {} is not a directory", root.display()),
            ));
        }

        let mut rules: Vec<IgnoreRule> = ALWAYS_EXCLUDED
            .iter()
            .map(|p| IgnoreRule::Prefix(p.to_string()))
            .collect();
        match fs::read_to_string(root.join(".dockerignore")) {
            Ok(text) => rules.extend(text.lines().filter_map(IgnoreRule::parse)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(Self { root, rules })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_ignored(&self, rel: &str) -> bool {
        self.rules.iter().any(|r| r.matches(rel))
    }

    /// Read one file from the context. `None` when absent or ignored.
    pub fn read(&self, rel: &str) -> Result<Option<Vec<u8>>, ContextError> {
        let Some(rel) = normalize(rel) else {
            return Ok(None);
        };
        if rel.is_empty() || self.is_ignored(&rel) {
            return Ok(None);
        }
        let path = self.root.join(&rel);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    /// Context-relative paths the COPY sources name, wildcards expanded
    /// (`""` is the context root). A source that names nothing is `Missing`.
    pub fn expand(&self, sources: &[String]) -> Result<Vec<String>, ContextError> {
        let mut paths = Vec::new();
        for source in sources {
            let rel = normalize(source).ok_or_else(|| ContextError::Missing(source.clone()))?;
            if is_pattern(&rel) {
                let glob = compile(&rel).ok_or_else(|| ContextError::Missing(source.clone()))?;
                let mut entries = Vec::new();
                self.walk(&self.root, "", &mut entries)?;
                let before = paths.len();
                paths.extend(entries.into_iter().filter(|e| glob.is_match(e)));
                if paths.len() == before {
                    return Err(ContextError::Missing(source.clone()));
                }
                continue;
            }
            if !rel.is_empty() && self.is_ignored(&rel) {
                return Err(ContextError::Missing(source.clone()));
            }
            if !self.root.join(&rel).exists() {
                return Err(ContextError::Missing(source.clone()));
            }
            paths.push(rel);
        }
        Ok(paths)
    }

    /// Content digest of everything the given COPY sources match.
    ///
    /// Files are hashed in path order with their relative path and length, so
    /// renames and moves change the digest as well as edits.
    pub fn digest(&self, sources: &[String]) -> Result<String, ContextError> {
        let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
        for rel in self.expand(sources)? {
            let path = if rel.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&rel)
            };
            if path.is_dir() {
                self.collect(&path, &rel, &mut files)?;
            } else if path.is_file() {
                files.insert(rel, path);
            } else {
                return Err(ContextError::Missing(rel));
            }
        }

        let mut hasher = Sha256::new();
        for (rel, path) in &files {
            let contents = fs::read(path)?;
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(&contents);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Every non-ignored file and directory below `dir`, in path order.
    fn walk(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), ContextError> {
        let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            let child_rel = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            if self.is_ignored(&child_rel) {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                out.push(child_rel.clone());
                self.walk(&entry.path(), &child_rel, out)?;
            } else if file_type.is_file() {
                out.push(child_rel);
            }
        }
        Ok(())
    }

    fn collect(
        &self,
        dir: &Path,
        rel: &str,
        out: &mut BTreeMap<String, PathBuf>,
    ) -> Result<(), ContextError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child_rel = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            if self.is_ignored(&child_rel) {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.collect(&entry.path(), &child_rel, out)?;
            } else if file_type.is_file() {
                out.insert(child_rel, entry.path());
            }
        }
        Ok(())
    }
}

/// Normalise a COPY source to a context-relative path. `None` if it escapes the root.
fn normalize(source: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(source).components() {
        match component {
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(p) => parts.push(p.to_string_lossy().to_string()),
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "Flask==3.0.3\n").unwrap();
        fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();
        fs::create_dir_all(dir.path().join("templates")).unwrap();
        fs::write(dir.path().join("templates/index.html"), "<h1>hi</h1>").unwrap();
        dir
    }

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let dir = project();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let all = vec![".".to_string()];
        let first = ctx.digest(&all).unwrap();
        assert_eq!(first, ctx.digest(&all).unwrap());

        let manifest = ctx.digest(&["requirements.txt".to_string()]).unwrap();
        fs::write(dir.path().join("app.py"), "print('changed')\n").unwrap();
        assert_ne!(first, ctx.digest(&all).unwrap());
        assert_eq!(manifest, ctx.digest(&["./requirements.txt".to_string()]).unwrap());
    }

    #[test]
    fn test_missing_source() {
        let dir = project();
        let ctx = BuildContext::open(dir.path()).unwrap();
        assert!(matches!(
            ctx.digest(&["nope.txt".to_string()]),
            Err(ContextError::Missing(p)) if p == "nope.txt"
        ));
        assert!(matches!(
            ctx.digest(&["../outside".to_string()]),
            Err(ContextError::Missing(_))
        ));
    }

    #[test]
    fn test_ignored_paths_do_not_affect_digest() {
        let dir = project();
        fs::write(dir.path().join(".dockerignore"), "# local only\n*.log\nnotes/\n").unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let all = vec![".".to_string()];
        let before = ctx.digest(&all).unwrap();

        fs::write(dir.path().join("debug.log"), "noise").unwrap();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/todo.md"), "x").unwrap();
        fs::create_dir_all(dir.path().join(CACHE_DIR_NAME)).unwrap();
        fs::write(dir.path().join(CACHE_DIR_NAME).join("cache.json"), "{}").unwrap();

        assert_eq!(before, ctx.digest(&all).unwrap());
        assert_eq!(ctx.read("debug.log").unwrap(), None);
    }

    #[test]
    fn test_ignore_patterns_are_anchored_at_root() {
        let dir = project();
        fs::write(dir.path().join(".dockerignore"), "*.log\nbuild-*\n").unwrap();
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("logs/app.log"), "kept").unwrap();
        fs::create_dir_all(dir.path().join("build-tmp")).unwrap();
        fs::write(dir.path().join("build-tmp/out.txt"), "x").unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();

        assert!(ctx.is_ignored("debug.log"));
        assert!(!ctx.is_ignored("logs/app.log"));
        assert!(ctx.is_ignored("build-tmp/out.txt"));
        assert_eq!(ctx.read("logs/app.log").unwrap(), Some(b"kept".to_vec()));

        fs::write(dir.path().join(".dockerignore"), "**/*.log\n").unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();
        assert!(ctx.is_ignored("logs/app.log"));
        assert!(ctx.is_ignored("debug.log"));
    }

    #[test]
    fn test_wildcard_sources() {
        let dir = project();
        fs::write(dir.path().join("requirements-dev.txt"), "pytest==8.2.0\n").unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();

        let sources = |s: &[&str]| s.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(
            ctx.expand(&sources(&["requirements*.txt"])).unwrap(),
            vec!["requirements-dev.txt".to_string(), "requirements.txt".to_string()]
        );
        assert_eq!(
            ctx.expand(&sources(&["./*.py"])).unwrap(),
            vec!["app.py".to_string()]
        );
        // `*` does not descend into directories
        assert!(matches!(
            ctx.expand(&sources(&["*.html"])),
            Err(ContextError::Missing(p)) if p == "*.html"
        ));
        assert_eq!(
            ctx.expand(&sources(&["templates/*.html"])).unwrap(),
            vec!["templates/index.html".to_string()]
        );

        let wildcard = ctx.digest(&sources(&["*.py"])).unwrap();
        assert_eq!(wildcard, ctx.digest(&sources(&["app.py"])).unwrap());
    }

    #[test]
    fn test_read() {
        let dir = project();
        let ctx = BuildContext::open(dir.path()).unwrap();
        assert_eq!(
            ctx.read("requirements.txt").unwrap(),
            Some(b"Flask==3.0.3\n".to_vec())
        );
        assert_eq!(ctx.read("templates").unwrap(), None);
        assert_eq!(ctx.read("missing").unwrap(), None);
    }

    #[test]
    fn test_open_requires_directory() {
        let dir = project();
        assert!(BuildContext::open(dir.path().join("app.py")).is_err());
    }
}
