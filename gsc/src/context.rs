use crate::constants::{APPLOADER_NAME, DOCKERFILE_NAME, FINALIZE_SCRIPT_NAME};
use crate::images::ImageReference;
use crate::render::{ManifestFragment, ManifestStub, TemplateRenderer};
use crate::substitutions::SubstitutionSet;
use anyhow::{Context, Result};
use log::{debug, info};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;

const SCRIPT_MODE: u32 = 0o755;

/// The artifacts of one build context, rendered but not yet written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContext {
    pub dockerfile: String,
    pub apploader: String,
    pub manifests: Vec<ManifestStub>,
}

impl RenderedContext {
    /// Run the three render jobs against one substitution set.
    pub async fn render(
        renderer: &TemplateRenderer,
        values: &SubstitutionSet,
        fragments: &[ManifestFragment],
    ) -> Result<Self> {
        Ok(Self {
            dockerfile: renderer.render_dockerfile(values).await?,
            apploader: renderer.render_apploader(values).await?,
            manifests: renderer.render_manifests(values, fragments).await?,
        })
    }
}

/// A per-image directory handed to the engine's build operation.
///
/// The directory is kept after the build for inspection. Writes are not
/// atomic: a failure part way leaves a partially populated directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    dir: PathBuf,
}

impl BuildContext {
    /// The context directory for `image` under `root`.
    pub fn for_image(root: &Path, image: &ImageReference) -> Self {
        Self {
            dir: root.join(image.as_str()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create (or reuse) the directory and write the rendered artifacts plus a
    /// copy of the finalize script into it.
    pub async fn assemble(&self, rendered: &RenderedContext, finalize_script: &Path) -> Result<()> {
        info!("preparing build context in {}", self.dir.display());
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating build context {}", self.dir.display()))?;

        self.write(DOCKERFILE_NAME, &rendered.dockerfile).await?;
        self.write(APPLOADER_NAME, &rendered.apploader).await?;
        self.make_executable(APPLOADER_NAME).await?;

        for stub in &rendered.manifests {
            self.write(&stub.file_name, &stub.contents).await?;
        }

        let script = self.dir.join(FINALIZE_SCRIPT_NAME);
        fs::copy(finalize_script, &script).await.with_context(|| {
            format!(
                "copying {} to {}",
                finalize_script.display(),
                script.display()
            )
        })?;

        Ok(())
    }

    async fn write(&self, name: &str, contents: &str) -> Result<()> {
        let path = self.dir.join(name);
        debug!("writing {}", path.display());
        fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn make_executable(&self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        fs::set_permissions(&path, std::fs::Permissions::from_mode(SCRIPT_MODE))
            .await
            .with_context(|| format!("setting permissions of {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::{BuildContext, RenderedContext};
    use crate::images::ImageReference;
    use crate::render::ManifestStub;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn rendered() -> RenderedContext {
        RenderedContext {
            dockerfile: "FROM ubuntu:18.04\n".to_string(),
            apploader: "#!/bin/sh\n".to_string(),
            manifests: vec![ManifestStub {
                file_name: "myapp.manifest".to_string(),
                contents: "stub\nfragment\n".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_assemble_writes_all_artifacts() {
        let root = TempDir::new().unwrap();
        let script = root.path().join("finalize_manifests.sh");
        tokio::fs::write(&script, "#!/bin/sh\nexit 0\n").await.unwrap();

        let image = ImageReference::parse("ns/myapp:latest").unwrap();
        let context = BuildContext::for_image(root.path(), &image);
        assert_eq!(context.dir(), root.path().join("ns/myapp:latest"));

        context.assemble(&rendered(), &script).await.unwrap();

        let read = |name: &str| std::fs::read_to_string(context.dir().join(name)).unwrap();
        assert_eq!(read("Dockerfile"), "FROM ubuntu:18.04\n");
        assert_eq!(read("apploader.sh"), "#!/bin/sh\n");
        assert_eq!(read("myapp.manifest"), "stub\nfragment\n");
        assert_eq!(read("finalize_manifests.sh"), "#!/bin/sh\nexit 0\n");

        let mode = std::fs::metadata(context.dir().join("apploader.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn test_assemble_reuses_existing_directory() {
        let root = TempDir::new().unwrap();
        let script = root.path().join("finalize_manifests.sh");
        tokio::fs::write(&script, "").await.unwrap();

        let image = ImageReference::parse("python:3.8").unwrap();
        let context = BuildContext::for_image(root.path(), &image);

        context.assemble(&rendered(), &script).await.unwrap();
        context.assemble(&rendered(), &script).await.unwrap();
    }

    #[tokio::test]
    async fn test_assemble_missing_finalize_script() {
        let root = TempDir::new().unwrap();
        let image = ImageReference::parse("python").unwrap();
        let context = BuildContext::for_image(root.path(), &image);

        let err = context
            .assemble(&rendered(), &root.path().join("absent.sh"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("absent.sh"));
        // Artifacts written before the failure remain.
        assert!(context.dir().join("Dockerfile").exists());
    }
}
