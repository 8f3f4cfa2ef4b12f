use crate::constants::{
    APPLOADER_TEMPLATE, MANIFEST_EXTENSION, MANIFEST_TEMPLATE, app_stage_template,
    build_stage_template,
};
use crate::substitutions::SubstitutionSet;
use crate::template::Template;
use crate::utils::StringablePathExt;
use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use std::path::{Path, PathBuf};

/// Caller-supplied manifest text appended to the generated manifest stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFragment {
    /// File name up to the first `.`.
    pub app: String,
    pub text: String,
}

impl ManifestFragment {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("manifest path {} has no file name", path.display()))?;
        let file_name = Path::new(file_name).must_to_str()?;

        let app = file_name.split('.').next().unwrap_or_default();
        if app.is_empty() {
            bail!("cannot derive an application name from manifest {file_name:?}");
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading manifest {}", path.display()))?;

        Ok(Self {
            app: app.to_string(),
            text,
        })
    }

    /// Name of the manifest stub generated for this fragment.
    pub fn stub_name(&self) -> String {
        format!("{}.{MANIFEST_EXTENSION}", self.app)
    }
}

/// A rendered manifest stub, ready to be written into a build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestStub {
    pub file_name: String,
    pub contents: String,
}

/// Renders the templates found in one directory.
pub struct TemplateRenderer {
    dir: PathBuf,
}

impl TemplateRenderer {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    async fn load(&self, name: &str) -> Result<Template> {
        let path = self.dir.join(name);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading template {}", path.display()))?;

        Template::parse(name, &text)
    }

    pub async fn render(&self, name: &str, values: &SubstitutionSet) -> Result<String> {
        debug!("rendering template {name}");
        self.load(name).await?.substitute(values)
    }

    /// Render the shared manifest template once, then build one stub per
    /// fragment: rendered text, newline, fragment text, newline.
    pub async fn render_manifests(
        &self,
        values: &SubstitutionSet,
        fragments: &[ManifestFragment],
    ) -> Result<Vec<ManifestStub>> {
        let rendered = self.render(MANIFEST_TEMPLATE, values).await?;

        Ok(fragments
            .iter()
            .map(|fragment| ManifestStub {
                file_name: fragment.stub_name(),
                contents: format!("{rendered}\n{}\n", fragment.text),
            })
            .collect())
    }

    pub async fn render_apploader(&self, values: &SubstitutionSet) -> Result<String> {
        self.render(APPLOADER_TEMPLATE, values).await
    }

    /// Render the toolchain build stage and the application stage for the
    /// configured distro, concatenated into one multistage Dockerfile.
    pub async fn render_dockerfile(&self, values: &SubstitutionSet) -> Result<String> {
        let distro = values
            .get("distro")
            .ok_or_else(|| anyhow!("no distro configured"))?;

        let build_stage = self.render(&build_stage_template(distro), values).await?;
        let app_stage = self.render(&app_stage_template(distro), values).await?;

        Ok(build_stage + &app_stage)
    }
}

#[cfg(test)]
mod tests {
    use super::{ManifestFragment, TemplateRenderer};
    use crate::config::load_config;
    use crate::images::{ImageRef, ImageReference};
    use crate::metadata::ImageMetadata;
    use crate::options::BuildOption;
    use crate::substitutions::{Layer, SubstitutionSet, build_substitutions};
    use std::path::Path;
    use tempfile::TempDir;

    fn values() -> SubstitutionSet {
        SubstitutionSet::fold([&Layer::new("test")
            .with("distro", "ubuntu18.04")
            .with("app", "myapp")
            .with("binary", "/usr/bin/myapp")
            .with("appImage", "ns/myapp:latest")])
    }

    async fn write(dir: &TempDir, name: &str, text: &str) {
        tokio::fs::write(dir.path().join(name), text).await.unwrap();
    }

    #[tokio::test]
    async fn test_render_dockerfile_concatenates_stages() {
        let dir = TempDir::new().unwrap();
        write(&dir, "Dockerfile.ubuntu18.04.build.template", "FROM ubuntu:18.04 AS graphene\n").await;
        write(&dir, "Dockerfile.ubuntu18.04.app.template", "FROM $appImage\n").await;

        let renderer = TemplateRenderer::new(dir.path());
        let dockerfile = renderer.render_dockerfile(&values()).await.unwrap();

        assert_eq!(dockerfile, "FROM ubuntu:18.04 AS graphene\nFROM ns/myapp:latest\n");
    }

    #[tokio::test]
    async fn test_render_dockerfile_missing_stage() {
        let dir = TempDir::new().unwrap();
        write(&dir, "Dockerfile.ubuntu18.04.build.template", "FROM ubuntu:18.04\n").await;

        let renderer = TemplateRenderer::new(dir.path());
        let err = renderer.render_dockerfile(&values()).await.unwrap_err();

        assert!(format!("{err:#}").contains("Dockerfile.ubuntu18.04.app.template"));
    }

    #[tokio::test]
    async fn test_render_manifests_one_stub_per_fragment() {
        let dir = TempDir::new().unwrap();
        write(&dir, "manifest.template", "libos.entrypoint = $binary").await;
        write(&dir, "myapp.manifest", "sgx.enclave_size = 1G").await;
        write(&dir, "helper.extra.manifest", "sgx.thread_num = 8").await;

        let fragments = vec![
            ManifestFragment::load(dir.path().join("myapp.manifest")).await.unwrap(),
            ManifestFragment::load(dir.path().join("helper.extra.manifest")).await.unwrap(),
        ];
        assert_eq!(fragments[1].app, "helper");

        let renderer = TemplateRenderer::new(dir.path());
        let stubs = renderer.render_manifests(&values(), &fragments).await.unwrap();

        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[0].file_name, "myapp.manifest");
        assert_eq!(
            stubs[0].contents,
            "libos.entrypoint = /usr/bin/myapp\nsgx.enclave_size = 1G\n"
        );
        assert_eq!(stubs[1].file_name, "helper.manifest");
    }

    #[tokio::test]
    async fn test_render_unresolved_placeholder_fails() {
        let dir = TempDir::new().unwrap();
        write(&dir, "apploader.template", "exec $binary $binary_arguments\n").await;

        let renderer = TemplateRenderer::new(dir.path());
        let err = renderer.render_apploader(&values()).await.unwrap_err();

        assert!(err.to_string().contains("$binary_arguments"));
    }

    #[tokio::test]
    async fn test_shipped_templates_render() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("..");
        let config = load_config(root.join("config.yaml")).await.unwrap();
        let reference = ImageReference::parse("ns/myapp:latest").unwrap();
        let image = ImageRef {
            cmd: vec!["/usr/bin/myapp".to_string()],
            ..Default::default()
        };
        let metadata = ImageMetadata::extract(&reference, &image).unwrap();
        let renderer = TemplateRenderer::new(root.join("templates"));

        for options in [vec![], vec![BuildOption::Debug, BuildOption::LinuxPal]] {
            let values = build_substitutions(&options, &config, &metadata).unwrap();

            let dockerfile = renderer.render_dockerfile(&values).await.unwrap();
            assert!(dockerfile.contains("FROM ubuntu:18.04 AS graphene"));
            assert!(dockerfile.contains("FROM ns/myapp:latest"));

            let apploader = renderer.render_apploader(&values).await.unwrap();
            assert!(apploader.contains("/graphene/manifests/myapp  \"$@\""));

            let stubs = renderer.render_manifests(&values, &[]).await.unwrap();
            assert!(stubs.is_empty());
        }
    }

    #[tokio::test]
    async fn test_fragment_without_app_name() {
        let dir = TempDir::new().unwrap();
        write(&dir, ".manifest", "").await;

        assert!(ManifestFragment::load(dir.path().join(".manifest")).await.is_err());
        assert!(ManifestFragment::load(dir.path().join("absent.manifest")).await.is_err());
    }
}
