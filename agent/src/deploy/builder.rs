//! Image builder

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::deploy::naming::{image_name, image_repository, LABEL_BUILD, LABEL_PROJECT};
use crate::deploy::recipe::{self, DEFAULT_IGNORE, ENTRY_CANDIDATES, IGNORE_FILE, RECIPE_FILE};
use crate::errors::DockyardError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::app_type::AppType;
use crate::models::deployment::{LogSeverity, LogSink};
use crate::runtime::{args, ContainerRuntime, LineCallback};

/// The recipe an image was built from and the resulting image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    /// Image reference, `dockyard/<project8>:<build8>`
    pub image: String,

    /// Recipe content used for the build
    pub recipe: String,

    /// Whether the recipe was synthesized rather than supplied by the user
    pub generated: bool,
}

/// A managed image as listed by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub repository: String,
    pub tag: String,
    pub created_at: DateTime<FixedOffset>,
}

impl ImageRecord {
    /// Reference used to delete the image
    pub fn reference(&self) -> String {
        if self.tag.is_empty() || self.tag == "<none>" {
            self.id.clone()
        } else {
            format!("{}:{}", self.repository, self.tag)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListedImage {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "CreatedAt")]
    created_at: String,
}

/// Parse the runtime's `CreatedAt` column, e.g. `2024-05-01 10:22:03 +0000 UTC`
pub fn parse_created_at(value: &str) -> Option<DateTime<FixedOffset>> {
    let stamp = value.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
    DateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S %z")
        .or_else(|_| DateTime::parse_from_rfc3339(value.trim()))
        .ok()
}

/// Parse `images --format {{json .}}` output, one JSON object per line
pub fn parse_image_list(output: &str) -> Vec<ImageRecord> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<ListedImage>(line) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Skipping unparseable image entry: {}", e);
                None
            }
        })
        .filter_map(|image| match parse_created_at(&image.created_at) {
            Some(created_at) => Some(ImageRecord {
                id: image.id,
                repository: image.repository,
                tag: image.tag,
                created_at,
            }),
            None => {
                warn!(
                    "Skipping image {} with unreadable creation time: {}",
                    image.id, image.created_at
                );
                None
            }
        })
        .collect()
}

/// Images beyond the `keep` most recently created ones
pub fn select_stale(mut images: Vec<ImageRecord>, keep: usize) -> Vec<ImageRecord> {
    images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if images.len() <= keep {
        return Vec::new();
    }
    images.split_off(keep)
}

/// Files the builder wrote into the source tree for one build
#[derive(Debug, Default)]
struct GeneratedFiles {
    files: Vec<File>,
}

impl GeneratedFiles {
    async fn remove(self) {
        for file in self.files {
            if let Err(e) = file.delete().await {
                warn!("Failed to remove generated {}: {}", file.path().display(), e);
            } else {
                debug!("Removed generated {}", file.path().display());
            }
        }
    }
}

/// Builds project images and manages their retention
pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Build the image for one (project, build) pair from `source_dir`.
    ///
    /// Recipe files synthesized here are removed again once the build has
    /// finished, whether it succeeded or not.
    pub async fn build(
        &self,
        project_id: &str,
        build_id: &str,
        source_dir: &Path,
        app_type: AppType,
        internal_port: u16,
        on_log: &LogSink,
    ) -> Result<BuildArtifact, DockyardError> {
        let source = Dir::new(source_dir);
        if !source.exists().await {
            return Err(DockyardError::InvalidInput(format!(
                "Source directory does not exist: {}",
                source_dir.display()
            )));
        }

        let mut generated = GeneratedFiles::default();
        let result = self
            .build_in(&source, project_id, build_id, app_type, internal_port, on_log, &mut generated)
            .await;
        generated.remove().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_in(
        &self,
        source: &Dir,
        project_id: &str,
        build_id: &str,
        app_type: AppType,
        internal_port: u16,
        on_log: &LogSink,
        generated: &mut GeneratedFiles,
    ) -> Result<BuildArtifact, DockyardError> {
        let recipe_file = source.file(RECIPE_FILE);
        let (recipe, is_generated) = if recipe_file.exists().await {
            let recipe = self.sanitize_existing(&recipe_file, internal_port, on_log).await?;
            (recipe, false)
        } else {
            let recipe = self.synthesize(source, app_type, internal_port).await;
            recipe_file.write_string(&recipe).await?;
            generated.files.push(recipe_file.clone());

            let ignore_file = source.file(IGNORE_FILE);
            if !ignore_file.exists().await {
                ignore_file.write_string(DEFAULT_IGNORE).await?;
                generated.files.push(ignore_file);
            }

            on_log(
                &format!("Generated Dockerfile for {} app (port {})", app_type, internal_port),
                LogSeverity::Info,
            );
            (recipe, true)
        };

        let image = image_name(project_id, build_id);
        info!("Building image {} from {}", image, source.path().display());
        on_log(&format!("Building image {}...", image), LogSeverity::Info);

        let build_args = args([
            "build".to_string(),
            "-t".to_string(),
            image.clone(),
            "-f".to_string(),
            recipe_file.path().display().to_string(),
            "--label".to_string(),
            format!("{}={}", LABEL_PROJECT, project_id),
            "--label".to_string(),
            format!("{}={}", LABEL_BUILD, build_id),
            source.path().display().to_string(),
        ]);

        let sink = on_log.clone();
        let on_line: LineCallback = Arc::new(move |line: String| sink(&line, LogSeverity::Info));
        let output = self.runtime.exec_streaming(&build_args, on_line).await;

        if !output.success() {
            return Err(DockyardError::BuildError(output.error_text()));
        }

        on_log(&format!("Image {} built", image), LogSeverity::Success);
        Ok(BuildArtifact {
            image,
            recipe,
            generated: is_generated,
        })
    }

    async fn sanitize_existing(
        &self,
        recipe_file: &File,
        internal_port: u16,
        on_log: &LogSink,
    ) -> Result<String, DockyardError> {
        let original = recipe_file.read_string().await.map_err(|e| {
            DockyardError::InvalidInput(format!("Unable to read Dockerfile: {}", e))
        })?;

        let sanitized = recipe::sanitize(&original, internal_port);
        if sanitized != original {
            recipe_file.write_string(&sanitized).await?;
            on_log(
                &format!("Sanitized Dockerfile for port {}", internal_port),
                LogSeverity::Warn,
            );
        } else {
            on_log("Using existing Dockerfile", LogSeverity::Info);
        }
        Ok(sanitized)
    }

    async fn synthesize(&self, source: &Dir, app_type: AppType, internal_port: u16) -> String {
        if app_type.is_static() {
            return recipe::synthesize(app_type, internal_port, &[]);
        }
        let entry = detect_entry(source).await;
        let has_start = has_start_script(source).await;
        debug!("Detected entry {:?} (start script: {})", entry, has_start);
        let start = recipe::start_command(app_type, entry, has_start);
        recipe::synthesize(app_type, internal_port, &start)
    }

    /// List the images of a project's repository
    pub async fn list_images(&self, project_id: &str) -> Result<Vec<ImageRecord>, DockyardError> {
        let output = self
            .runtime
            .exec(&args([
                "images".to_string(),
                "--filter".to_string(),
                format!("reference={}", image_repository(project_id)),
                "--format".to_string(),
                "{{json .}}".to_string(),
            ]))
            .await;

        if !output.success() {
            return Err(DockyardError::RuntimeError(output.error_text()));
        }
        Ok(parse_image_list(&output.stdout))
    }

    /// Delete every project image beyond the `keep` most recent ones.
    /// Returns the number of images deleted; failures are logged.
    pub async fn prune_images(&self, project_id: &str, keep: usize) -> usize {
        let images = match self.list_images(project_id).await {
            Ok(images) => images,
            Err(e) => {
                warn!("Unable to list images for {}: {}", project_id, e);
                return 0;
            }
        };

        let stale = select_stale(images, keep);
        if stale.is_empty() {
            return 0;
        }

        info!("Pruning {} old image(s) for project {}", stale.len(), project_id);
        let refs: Vec<String> = stale.iter().map(ImageRecord::reference).collect();
        self.remove_images(&refs).await
    }

    /// Delete the images of the given builds, regardless of retention.
    /// Returns the number of images deleted; failures are logged.
    pub async fn remove_build_images(&self, project_id: &str, build_ids: &[String]) -> usize {
        let refs: Vec<String> = build_ids
            .iter()
            .map(|build_id| image_name(project_id, build_id))
            .collect();
        self.remove_images(&refs).await
    }

    async fn remove_images(&self, refs: &[String]) -> usize {
        let results = join_all(refs.iter().map(|reference| self.remove_image(reference))).await;
        results.into_iter().filter(|removed| *removed).count()
    }

    async fn remove_image(&self, reference: &str) -> bool {
        let output = self
            .runtime
            .exec(&args(["rmi", "-f", reference]))
            .await;
        if output.success() {
            debug!("Removed image {}", reference);
            true
        } else {
            warn!("Failed to remove image {}: {}", reference, output.error_text());
            false
        }
    }
}

/// First conventional entry file present in the source tree
async fn detect_entry(source: &Dir) -> Option<&'static str> {
    for candidate in ENTRY_CANDIDATES {
        if source.file(candidate).exists().await {
            return Some(*candidate);
        }
    }
    None
}

/// Whether `package.json` declares a `start` script
async fn has_start_script(source: &Dir) -> bool {
    let package = source.file("package.json");
    if !package.exists().await {
        return false;
    }
    match package.read_json::<serde_json::Value>().await {
        Ok(value) => value
            .get("scripts")
            .and_then(|scripts| scripts.get("start"))
            .and_then(|start| start.as_str())
            .is_some_and(|start| !start.trim().is_empty()),
        Err(e) => {
            warn!("Unable to parse package.json: {}", e);
            false
        }
    }
}
