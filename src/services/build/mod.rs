//! Layered image build simulation
//!
//! Runs the steps of a build descriptor in order against a content-keyed
//! layer cache. Dependency installation resolves the manifest that earlier
//! COPY steps brought into the image against a package index.

pub mod cache;
pub mod context;
pub mod index;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::domain::descriptor::{is_install_step, BuildDescriptor, Instruction, Step};
use crate::domain::manifest::DependencyManifest;
use crate::domain::step::{StepRecord, StepStatus};
use crate::error::BuildError;

pub use cache::{layer_key, ImageRecord, LayerCache};
pub use context::{BuildContext, ContextError};
pub use index::{PackageIndex, PinnedIndex, ResolveError, StaticIndex};

/// 构建选项
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Tag written on success
    pub tag: String,
    /// Manifest file name as referenced by COPY / RUN
    pub manifest_name: String,
    /// Ignore cached layers (they are still recorded)
    pub no_cache: bool,
}

/// 构建结果
#[derive(Clone, Debug, Serialize)]
pub struct BuildReport {
    pub tag: String,
    pub image_id: String,
    pub steps: Vec<StepRecord>,
}

impl BuildReport {
    pub fn cached(&self) -> usize {
        self.count(StepStatus::Cached)
    }

    pub fn built(&self) -> usize {
        self.count(StepStatus::Built)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// State of the stage currently being built.
#[derive(Debug, Default)]
struct Stage {
    number: usize,
    alias: Option<String>,
    parent: Option<String>,
    /// Manifest bytes as copied into this stage
    manifest: Option<Vec<u8>>,
    layers: Vec<String>,
}

/// 镜像构建器
pub struct ImageBuilder<'a, I: PackageIndex + ?Sized> {
    context: &'a BuildContext,
    index: &'a I,
    options: BuildOptions,
    steps: Vec<StepRecord>,
}

impl<'a, I: PackageIndex + ?Sized> ImageBuilder<'a, I> {
    pub fn new(context: &'a BuildContext, index: &'a I, options: BuildOptions) -> Self {
        Self {
            context,
            index,
            options,
            steps: Vec::new(),
        }
    }

    /// Step records of the last build, including the failed step and the
    /// skipped ones after it.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Build the descriptor. Layers are added to `cache` as they are built;
    /// the tag is written only when every step succeeds.
    pub fn build(
        &mut self,
        descriptor: &BuildDescriptor,
        cache: &mut LayerCache,
    ) -> Result<BuildReport, BuildError> {
        self.steps = descriptor
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepRecord::new(i + 1, s.line, s.instruction.to_string()))
            .collect();
        let total = self.steps.len();

        info!(
            tag = %self.options.tag,
            steps = total,
            no_cache = self.options.no_cache,
            context = %self.context.root().display(),
            "Starting image build"
        );

        let mut tips: HashMap<String, String> = HashMap::new();
        let mut global_args: Vec<String> = Vec::new();
        let mut stage: Option<Stage> = None;

        for (i, step) in descriptor.steps.iter().enumerate() {
            let text = self.steps[i].instruction.clone();

            // ARGs before the first FROM only parameterise FROM lines
            if stage.is_none() && matches!(step.instruction, Instruction::Arg { .. }) {
                global_args.push(text);
                self.steps[i].skip(Some("global build argument".to_string()));
                continue;
            }

            self.steps[i].start();
            let result = self.run_step(
                i + 1,
                step,
                &text,
                &mut stage,
                &mut tips,
                &global_args,
                cache,
            );
            match result {
                Ok((key, status)) => {
                    debug!(step = i + 1, key = %key, "Layer key");
                    self.steps[i].cache_key = Some(key);
                    self.steps[i].finish(status, None);
                    info!(
                        step = i + 1,
                        total = total,
                        status = self.steps[i].status.as_str(),
                        instruction = %text,
                        "Build step finished"
                    );
                }
                Err(e) => {
                    warn!(step = i + 1, instruction = %text, error = %e, "Build step failed");
                    self.steps[i].finish(StepStatus::Failed, Some(e.to_string()));
                    for rest in self.steps[i + 1..]
                        .iter_mut()
                        .filter(|s| !s.status.is_terminal())
                    {
                        rest.skip(Some("previous step failed".to_string()));
                    }
                    return Err(e);
                }
            }
        }

        let final_stage = stage.unwrap_or_default();
        let image_id = final_stage.parent.clone().unwrap_or_default();
        cache.tag(
            &self.options.tag,
            ImageRecord {
                id: image_id.clone(),
                layers: final_stage.layers,
                built_at: Utc::now(),
            },
        );

        let report = BuildReport {
            tag: self.options.tag.clone(),
            image_id,
            steps: self.steps.clone(),
        };
        info!(
            tag = %report.tag,
            image = %report.image_id,
            cached = report.cached(),
            built = report.built(),
            "Image build finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_step(
        &self,
        number: usize,
        step: &Step,
        text: &str,
        stage: &mut Option<Stage>,
        tips: &mut HashMap<String, String>,
        global_args: &[String],
        cache: &mut LayerCache,
    ) -> Result<(String, StepStatus), BuildError> {
        if let Instruction::From { image, alias } = &step.instruction {
            let stage_number = match stage.take() {
                Some(done) => {
                    record_tip(tips, &done);
                    done.number + 1
                }
                None => 0,
            };
            // FROM <earlier stage> continues from that stage's last layer
            let base = tips.get(image).cloned();
            let args = global_args.join("\n");
            let key = layer_key(base.as_deref(), text, Some(&args));
            let status = self.commit(&key, text, cache);
            *stage = Some(Stage {
                number: stage_number,
                alias: alias.clone(),
                parent: Some(key.clone()),
                manifest: None,
                layers: vec![key.clone()],
            });
            return Ok((key, status));
        }

        let current = stage.get_or_insert_with(Stage::default);
        let input = match &step.instruction {
            Instruction::Copy {
                from: Some(source_stage),
                ..
            } => Some(
                tips.get(source_stage)
                    .cloned()
                    .ok_or_else(|| BuildError::UnknownStage {
                        step: number,
                        stage: source_stage.clone(),
                    })?,
            ),
            Instruction::Copy {
                sources, from: None, ..
            } => {
                let digest = self
                    .context
                    .digest(sources)
                    .map_err(|e| context_error(number, text, e))?;
                let copied = self
                    .context
                    .expand(sources)
                    .map_err(|e| context_error(number, text, e))?;
                if let Some(path) = manifest_source(&copied, &self.options.manifest_name) {
                    current.manifest = self
                        .context
                        .read(&path)
                        .map_err(|e| context_error(number, text, e))?;
                }
                Some(digest)
            }
            _ => None,
        };

        let key = layer_key(current.parent.as_deref(), text, input.as_deref());
        let cached = !self.options.no_cache && cache.contains(&key);

        if !cached && is_install_step(&step.instruction, &self.options.manifest_name) {
            self.install(number, current.manifest.as_deref())?;
        }

        let status = self.commit(&key, text, cache);
        current.parent = Some(key.clone());
        current.layers.push(key.clone());
        Ok((key, status))
    }

    /// Record the layer unless it can be reused.
    fn commit(&self, key: &str, text: &str, cache: &mut LayerCache) -> StepStatus {
        if !self.options.no_cache && cache.contains(key) {
            return StepStatus::Cached;
        }
        cache.insert_layer(key, text);
        StepStatus::Built
    }

    /// Resolve every requirement of the manifest copied into the stage.
    fn install(&self, number: usize, manifest: Option<&[u8]>) -> Result<(), BuildError> {
        let bytes = manifest.ok_or_else(|| BuildError::ManifestNotCopied {
            step: number,
            manifest: self.options.manifest_name.clone(),
        })?;
        let text = String::from_utf8_lossy(bytes);
        let manifest = DependencyManifest::parse(&text).map_err(|source| {
            BuildError::InvalidManifest {
                step: number,
                source,
            }
        })?;

        for requirement in &manifest.requirements {
            self.index
                .resolve(requirement)
                .map_err(|e| BuildError::Unresolvable {
                    step: number,
                    requirement: requirement.to_string(),
                    reason: e.to_string(),
                })?;
            debug!(step = number, requirement = %requirement, "Resolved");
        }
        info!(step = number, packages = manifest.len(), "Dependencies installed");
        Ok(())
    }
}

fn record_tip(tips: &mut HashMap<String, String>, stage: &Stage) {
    let Some(tip) = &stage.parent else {
        return;
    };
    tips.insert(stage.number.to_string(), tip.clone());
    if let Some(alias) = &stage.alias {
        tips.insert(alias.clone(), tip.clone());
    }
}

/// Context path the manifest is read from, if this COPY brings it in.
/// `sources` are the paths after wildcard expansion.
fn manifest_source(sources: &[String], manifest_name: &str) -> Option<String> {
    sources.iter().find_map(|source| {
        let trimmed = source.trim_start_matches("./").trim_end_matches('/');
        let file_name = Path::new(trimmed).file_name().and_then(|n| n.to_str());
        if file_name == Some(manifest_name) {
            Some(trimmed.to_string())
        } else if trimmed.is_empty() || trimmed == "." {
            Some(manifest_name.to_string())
        } else {
            None
        }
    })
}

fn context_error(step: usize, instruction: &str, e: ContextError) -> BuildError {
    match e {
        ContextError::Missing(path) => BuildError::MissingInput {
            step,
            instruction: instruction.to_string(),
            path,
        },
        ContextError::Io(e) => BuildError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::manifest::Requirement;
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    const DOCKERFILE: &str = "FROM python:3.12-slim\n\
        WORKDIR /app\n\
        COPY requirements.txt .\n\
        RUN pip install --no-cache-dir -r requirements.txt\n\
        COPY . .\n\
        EXPOSE 5000\n\
        CMD [\"python\", \"app.py\"]\n";

    /// Index that counts resolutions so tests can tell whether install ran.
    #[derive(Default)]
    struct CountingIndex {
        calls: Cell<usize>,
    }

    impl PackageIndex for CountingIndex {
        fn resolve(&self, _requirement: &Requirement) -> Result<(), ResolveError> {
            self.calls.set(self.calls.get() + 1);
            Ok(())
        }
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "Flask==3.0.3\nJinja2==3.1.4\n").unwrap();
        fs::write(dir.path().join("app.py"), "app = Flask(__name__)\n").unwrap();
        fs::write(dir.path().join("Dockerfile"), DOCKERFILE).unwrap();
        dir
    }

    fn options() -> BuildOptions {
        BuildOptions {
            tag: "site:latest".to_string(),
            manifest_name: "requirements.txt".to_string(),
            no_cache: false,
        }
    }

    fn statuses(steps: &[StepRecord]) -> Vec<StepStatus> {
        steps.iter().map(|s| s.status.clone()).collect()
    }

    fn build_with<I: PackageIndex>(
        dir: &TempDir,
        index: &I,
        cache: &mut LayerCache,
        options: BuildOptions,
    ) -> Result<BuildReport, BuildError> {
        let descriptor = BuildDescriptor::parse(DOCKERFILE).unwrap();
        let context = BuildContext::open(dir.path()).unwrap();
        ImageBuilder::new(&context, index, options).build(&descriptor, cache)
    }

    #[test]
    fn test_unchanged_rebuild_is_fully_cached() {
        let dir = project();
        let mut cache = LayerCache::in_memory();
        let index = CountingIndex::default();

        let first = build_with(&dir, &index, &mut cache, options()).unwrap();
        assert_eq!(first.built(), 7);
        assert_eq!(index.calls.get(), 2);

        let second = build_with(&dir, &index, &mut cache, options()).unwrap();
        assert_eq!(second.cached(), 7);
        assert_eq!(second.image_id, first.image_id);
        assert_eq!(index.calls.get(), 2);
        assert_eq!(
            cache.image("site:latest").map(|i| i.layers.len()),
            Some(7)
        );
    }

    #[test]
    fn test_source_change_keeps_install_layer() {
        let dir = project();
        let mut cache = LayerCache::in_memory();
        let index = CountingIndex::default();
        let first = build_with(&dir, &index, &mut cache, options()).unwrap();

        fs::write(dir.path().join("app.py"), "app = Flask('changed')\n").unwrap();
        let second = build_with(&dir, &index, &mut cache, options()).unwrap();

        use StepStatus::*;
        assert_eq!(
            statuses(&second.steps),
            vec![Cached, Cached, Cached, Cached, Built, Built, Built]
        );
        assert_eq!(second.steps[3].cache_key, first.steps[3].cache_key);
        assert_ne!(second.image_id, first.image_id);
        assert_eq!(index.calls.get(), 2);
    }

    #[test]
    fn test_manifest_change_reruns_install() {
        let dir = project();
        let mut cache = LayerCache::in_memory();
        let index = CountingIndex::default();
        build_with(&dir, &index, &mut cache, options()).unwrap();

        fs::write(
            dir.path().join("requirements.txt"),
            "Flask==3.0.3\nJinja2==3.1.4\ngunicorn==22.0.0\n",
        )
        .unwrap();
        let report = build_with(&dir, &index, &mut cache, options()).unwrap();

        use StepStatus::*;
        assert_eq!(
            statuses(&report.steps),
            vec![Cached, Cached, Built, Built, Built, Built, Built]
        );
        assert_eq!(index.calls.get(), 5);
    }

    #[test]
    fn test_missing_manifest_fails_before_install() {
        let dir = project();
        fs::remove_file(dir.path().join("requirements.txt")).unwrap();
        let mut cache = LayerCache::in_memory();
        let index = CountingIndex::default();

        let descriptor = BuildDescriptor::parse(DOCKERFILE).unwrap();
        let context = BuildContext::open(dir.path()).unwrap();
        let mut builder = ImageBuilder::new(&context, &index, options());
        let err = builder.build(&descriptor, &mut cache).unwrap_err();

        assert!(matches!(
            err,
            BuildError::MissingInput { step: 3, ref path, .. } if path == "requirements.txt"
        ));
        assert_eq!(builder.steps()[2].status, StepStatus::Failed);
        assert_eq!(builder.steps()[3].status, StepStatus::Skipped);
        assert_eq!(index.calls.get(), 0);
        assert!(cache.image("site:latest").is_none());
    }

    #[test]
    fn test_unresolvable_requirement_writes_no_tag() {
        let dir = project();
        let mut cache = LayerCache::in_memory();
        let index = StaticIndex::parse("flask==3.0.3\n").unwrap();

        let err = build_with(&dir, &index, &mut cache, options()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Unresolvable { step: 4, ref requirement, .. } if requirement == "Jinja2==3.1.4"
        ));
        assert!(cache.image("site:latest").is_none());
        // FROM, WORKDIR and the manifest COPY stay cached
        assert_eq!(cache.layer_count(), 3);
    }

    #[test]
    fn test_no_cache_rebuilds_everything() {
        let dir = project();
        let mut cache = LayerCache::in_memory();
        let index = CountingIndex::default();
        build_with(&dir, &index, &mut cache, options()).unwrap();

        let report = build_with(
            &dir,
            &index,
            &mut cache,
            BuildOptions {
                no_cache: true,
                ..options()
            },
        )
        .unwrap();
        assert_eq!(report.built(), 7);
        assert_eq!(index.calls.get(), 4);
    }

    #[test]
    fn test_install_without_copied_manifest() {
        let dir = project();
        let descriptor =
            BuildDescriptor::parse("FROM python:3.12-slim\nRUN pip install -r requirements.txt\n")
                .unwrap();
        let context = BuildContext::open(dir.path()).unwrap();
        let mut cache = LayerCache::in_memory();
        let err = ImageBuilder::new(&context, &PinnedIndex, options())
            .build(&descriptor, &mut cache)
            .unwrap_err();
        assert!(matches!(err, BuildError::ManifestNotCopied { step: 2, .. }));
    }

    #[test]
    fn test_multi_stage_copy_from() {
        let dir = project();
        let descriptor = BuildDescriptor::parse(
            "ARG PY=3.12\nFROM python:3.12-slim AS deps\nCOPY requirements.txt .\n\
             RUN pip install -r requirements.txt\n\
             FROM python:3.12-slim\nCOPY --from=deps /usr/local /usr/local\nCOPY . .\n",
        )
        .unwrap();
        let context = BuildContext::open(dir.path()).unwrap();
        let mut cache = LayerCache::in_memory();
        let report = ImageBuilder::new(&context, &PinnedIndex, options())
            .build(&descriptor, &mut cache)
            .unwrap();
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
        assert_eq!(report.built(), 6);
        assert_eq!(cache.image("site:latest").map(|i| i.layers.len()), Some(3));

        let bad = BuildDescriptor::parse("FROM alpine\nCOPY --from=nowhere /a /a\n").unwrap();
        let err = ImageBuilder::new(&context, &PinnedIndex, options())
            .build(&bad, &mut cache)
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownStage { step: 2, .. }));
    }

    #[test]
    fn test_manifest_source() {
        let sources = |s: &[&str]| s.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(
            manifest_source(&sources(&["./requirements.txt"]), "requirements.txt"),
            Some("requirements.txt".to_string())
        );
        assert_eq!(
            manifest_source(&sources(&["."]), "requirements.txt"),
            Some("requirements.txt".to_string())
        );
        assert_eq!(manifest_source(&sources(&["app.py"]), "requirements.txt"), None);
    }

    #[test]
    fn test_wildcard_copy_sources() {
        let dir = project();
        let descriptor = BuildDescriptor::parse(
            "FROM python:3.12-slim\n\
             WORKDIR /app\n\
             COPY requirements*.txt ./\n\
             RUN pip install -r requirements.txt\n\
             COPY *.py ./\n\
             CMD [\"python\", \"app.py\"]\n",
        )
        .unwrap();
        let context = BuildContext::open(dir.path()).unwrap();
        let index = CountingIndex::default();
        let mut cache = LayerCache::in_memory();

        let report = ImageBuilder::new(&context, &index, options())
            .build(&descriptor, &mut cache)
            .unwrap();
        assert_eq!(report.built(), 6);
        assert_eq!(index.calls.get(), 2);

        // a pattern that matches nothing is still a missing input
        fs::remove_file(dir.path().join("app.py")).unwrap();
        let context = BuildContext::open(dir.path()).unwrap();
        let mut builder = ImageBuilder::new(&context, &index, options());
        let err = builder.build(&descriptor, &mut cache).unwrap_err();
        assert!(matches!(
            err,
            BuildError::MissingInput { step: 5, ref path, .. } if path == "*.py"
        ));
    }
}
