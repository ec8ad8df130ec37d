//! Concurrent derivative generation.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use reel_core::{DerivativeKind, EntityId, Error, ImageDerivativeSpec, PathResolver, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::render;

/// Where a derivative ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DerivativeOutput {
    File(PathBuf),
    Inline(String),
}

/// A derivative that was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedDerivative {
    pub width: u32,
    pub height: u32,
    pub output: DerivativeOutput,
}

/// Outcome of one spec.
#[derive(Debug)]
pub struct DerivativeOutcome {
    pub spec: ImageDerivativeSpec,
    pub result: Result<GeneratedDerivative>,
}

/// Per-spec outcomes, in spec order. At least one succeeded.
#[derive(Debug)]
pub struct DerivativeReport {
    pub outcomes: Vec<DerivativeOutcome>,
}

impl DerivativeReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &GeneratedDerivative> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&ImageDerivativeSpec, &Error)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.spec, e)))
    }
}

/// Where the FILE derivatives of one asset go:
/// `<root>/<entity>/<category>/<label>-<width>p.webp`.
#[derive(Debug, Clone, Copy)]
pub struct DerivativeTarget<'a> {
    pub paths: &'a PathResolver,
    pub entity: &'a EntityId,
    pub category: &'a str,
    pub label: &'a str,
}

impl DerivativeTarget<'_> {
    fn dir(&self) -> Result<PathBuf> {
        self.paths.resolve_media_path(self.entity, &[self.category])
    }

    fn file_path(&self, spec: &ImageDerivativeSpec) -> Result<PathBuf> {
        self.paths.resolve_derivative_path(
            self.entity,
            self.category,
            &render::file_name(self.label, spec),
        )
    }
}

/// Produces image derivatives.
#[derive(Debug, Clone)]
pub struct DerivativeGenerator {
    webp_quality: f32,
}

impl DerivativeGenerator {
    pub fn new(webp_quality: f32) -> Self {
        Self { webp_quality }
    }

    /// Render every spec from `source` into `target`.
    ///
    /// Fails with [`Error::Derivative`] only when the source cannot be
    /// decoded or every spec fails; otherwise per-spec outcomes are
    /// returned.
    ///
    /// Firing `cancel` stops renders before they write and makes this
    /// return [`Error::Cancelled`]. It only returns after every render task
    /// has finished, and a cancelled run leaves none of its files behind.
    /// Dropping the future does not stop renders already started.
    pub async fn generate(
        &self,
        source: &Path,
        target: DerivativeTarget<'_>,
        specs: &[ImageDerivativeSpec],
        cancel: &CancellationToken,
    ) -> Result<DerivativeReport> {
        if specs.is_empty() {
            return Err(Error::Derivative("no derivative specs configured".into()));
        }
        ensure_live(cancel, source)?;

        let bytes = tokio::fs::read(source).await.map_err(|e| {
            Error::Derivative(format!("cannot read {}: {e}", source.display()))
        })?;
        let img = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| Error::Internal(format!("decode task failed: {e}")))?
            .map_err(|e| Error::Derivative(format!("cannot decode {}: {e}", source.display())))?;
        let img = Arc::new(img);
        ensure_live(cancel, source)?;

        if specs.iter().any(|s| s.kind == DerivativeKind::File) {
            tokio::fs::create_dir_all(target.dir()?).await?;
        }

        let mut seen = Vec::new();
        let tasks = specs.iter().map(|spec| {
            let spec = *spec;
            let destination = match spec.kind {
                DerivativeKind::Inline => Ok(None),
                DerivativeKind::File => target.file_path(&spec).and_then(|path| {
                    if seen.contains(&path) {
                        return Err(Error::Derivative(format!(
                            "{spec}: output name already used by another spec"
                        )));
                    }
                    seen.push(path.clone());
                    Ok(Some(path))
                }),
            };
            let img = Arc::clone(&img);
            let cancel = cancel.clone();
            let quality = self.webp_quality;
            async move {
                let destination = destination?;
                tokio::task::spawn_blocking(move || {
                    render_one(&img, &spec, destination.as_deref(), quality, &cancel)
                })
                .await
                .map_err(|e| Error::Internal(format!("derivative task failed: {e}")))?
            }
        });
        let tasks: Vec<_> = tasks.collect();
        let results = futures::future::join_all(tasks).await;

        let outcomes: Vec<DerivativeOutcome> = specs
            .iter()
            .zip(results)
            .map(|(spec, result)| DerivativeOutcome {
                spec: *spec,
                result,
            })
            .collect();

        if cancel.is_cancelled() {
            discard_files(&outcomes).await;
            return Err(cancelled(source));
        }

        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                tracing::warn!(spec = %outcome.spec, source = %source.display(), "Derivative failed: {e}");
            }
        }

        if outcomes.iter().all(|o| o.result.is_err()) {
            let reasons = outcomes
                .iter()
                .filter_map(|o| o.result.as_ref().err().map(|e| e.to_string()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Derivative(format!("all derivatives failed: {reasons}")));
        }

        Ok(DerivativeReport { outcomes })
    }
}

fn cancelled(source: &Path) -> Error {
    Error::Cancelled(format!("derivatives of {} cancelled", source.display()))
}

fn ensure_live(cancel: &CancellationToken, source: &Path) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(cancelled(source));
    }
    Ok(())
}

/// Remove files a cancelled run managed to write before it noticed.
async fn discard_files(outcomes: &[DerivativeOutcome]) {
    for outcome in outcomes {
        if let Ok(GeneratedDerivative {
            output: DerivativeOutput::File(path),
            ..
        }) = &outcome.result
        {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), "Failed to remove cancelled derivative: {e}");
            }
        }
    }
}

fn render_one(
    img: &DynamicImage,
    spec: &ImageDerivativeSpec,
    destination: Option<&Path>,
    quality: f32,
    cancel: &CancellationToken,
) -> Result<GeneratedDerivative> {
    render::check_spec(spec)?;
    let resized = render::resize(img, spec);
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(format!("{spec} cancelled")));
    }

    let output = match destination {
        None => DerivativeOutput::Inline(render::encode_data_uri(&resized)?),
        Some(path) => {
            let bytes = render::encode_webp(&resized, quality)?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("{spec} cancelled")));
            }
            write_atomic(path, &bytes)?;
            DerivativeOutput::File(path.to_path_buf())
        }
    };

    Ok(GeneratedDerivative {
        width: resized.width(),
        height: resized.height(),
        output,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent", path.display())))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".derivative")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| Error::from(e.error))?;
    Ok(())
}
