//! The `build` pipeline: turn a base image into its graphenized counterpart.
//!
//! ```text
//! CHECK_EXISTING ──found──▶ done (no-op)
//!       │
//! CHECK_BASE ──missing──▶ error
//!       │
//! ASSEMBLE ─▶ INVOKE ─▶ VERIFY ──missing──▶ error
//!                          │
//!                        built
//! ```
//!
//! Nothing is retried, and concurrent builds of the same image race on the
//! same context directory.

use crate::config::{Config, load_config};
use crate::constants::{CONFIG_FILE_NAME, FINALIZE_SCRIPT_NAME, TEMPLATES_DIR};
use crate::context::{BuildContext, RenderedContext};
use crate::images::ContainerEngine;
use crate::metadata::ImageMetadata;
use crate::options::BuildArgs;
use crate::render::{ManifestFragment, TemplateRenderer};
use crate::substitutions::build_substitutions;
use crate::utils::forward_chunk;
use anyhow::{Result, bail};
use futures::StreamExt;
use log::{debug, error, info, trace};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where the build finds its inputs and puts its contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    /// Holds `templates/`, the finalize script and, by default, the config file.
    pub gsc_dir: PathBuf,
    pub config_file: PathBuf,
    /// Parent of the per-image build context directories.
    pub context_root: PathBuf,
}

impl BuildSettings {
    pub fn new<P: Into<PathBuf>>(gsc_dir: P) -> Self {
        let gsc_dir = gsc_dir.into();

        Self {
            config_file: gsc_dir.join(CONFIG_FILE_NAME),
            context_root: PathBuf::from("."),
            gsc_dir,
        }
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.gsc_dir.join(TEMPLATES_DIR)
    }

    pub fn finalize_script(&self) -> PathBuf {
        self.gsc_dir.join(FINALIZE_SCRIPT_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The graphenized image already existed; nothing was built.
    AlreadyBuilt { image: String },
    Built { image: String, context_dir: PathBuf },
}

pub struct GscBuilder<'a, E: ContainerEngine> {
    engine: &'a E,
    settings: BuildSettings,
}

impl<'a, E: ContainerEngine> GscBuilder<'a, E> {
    pub fn new(engine: &'a E, settings: BuildSettings) -> Self {
        Self { engine, settings }
    }

    /// Build the graphenized variant of `args.image`, writing build progress
    /// to `progress` as the engine reports it.
    ///
    /// The configuration is loaded before the engine is contacted, so a
    /// malformed configuration never reaches the engine.
    pub async fn build<W: Write>(&self, args: &BuildArgs, progress: &mut W) -> Result<BuildOutcome> {
        let config = load_config(&self.settings.config_file).await?;
        debug!("loaded configuration from {}", self.settings.config_file.display());

        let image = &args.image;
        let output = image.gsc_name();
        info!("graphenizing docker image {image}");

        if self.engine.image_exists(&output).await {
            info!("image {output} already exists, no build required");
            return Ok(BuildOutcome::AlreadyBuilt { image: output });
        }

        let base = match self.engine.inspect_image(image.as_str()).await {
            Ok(base) => base,
            Err(e) => {
                debug!("base image lookup failed: {e:#}");
                bail!("unable to find base image {image}");
            }
        };
        info!("building graphenized image {output} from {base}");

        let metadata = ImageMetadata::extract(image, &base)?;
        let context = self.prepare_context(args, &config, &metadata).await?;

        self.invoke_build(context.dir(), &output, progress).await?;

        if self.engine.image_exists(&output).await {
            info!("successfully graphenized {image} as {output}");
            Ok(BuildOutcome::Built {
                image: output,
                context_dir: context.dir().to_path_buf(),
            })
        } else {
            error!("build of {output} finished but the image does not exist");
            bail!("failed to build graphenized image {output}")
        }
    }

    async fn prepare_context(
        &self,
        args: &BuildArgs,
        config: &Config,
        metadata: &ImageMetadata,
    ) -> Result<BuildContext> {
        let values = build_substitutions(&args.options, config, metadata)?;
        for (key, value) in values.iter() {
            trace!("substitution {key} = {value:?}");
        }

        let mut fragments = Vec::with_capacity(args.manifests.len());
        for path in &args.manifests {
            fragments.push(ManifestFragment::load(path).await?);
        }

        let renderer = TemplateRenderer::new(self.settings.templates_dir());
        let rendered = RenderedContext::render(&renderer, &values, &fragments).await?;

        let context = BuildContext::for_image(&self.settings.context_root, &args.image);
        context
            .assemble(&rendered, &self.settings.finalize_script())
            .await?;

        Ok(context)
    }

    async fn invoke_build<W: Write>(&self, context_dir: &Path, tag: &str, progress: &mut W) -> Result<()> {
        let mut events = self.engine.build_image(context_dir, tag).await?;

        while let Some(event) = events.next().await {
            let event = event?;

            if let Some(text) = &event.stream {
                forward_chunk(progress, text)?;
            }

            if let Some(msg) = event.error {
                bail!("build error for {tag}: {msg}");
            }
        }

        Ok(())
    }
}
