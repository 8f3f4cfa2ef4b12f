use crate::constants::{DOCKERFILE_NAME, GSC_IMAGE_PREFIX};
use crate::spawn;
use anyhow::{Context, Result, anyhow, bail};
use bollard::Docker;
use bollard::models::BuildInfo;
use bollard::query_parameters::BuildImageOptionsBuilder;
use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{self, LocalBoxStream, Stream, StreamExt};
use log::{debug, trace};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, duplex};
use tokio::task::JoinHandle;
use tokio_util::codec;

const CONTEXT_PIPE_CAPACITY: usize = 64 * 1024;

/// A user-supplied image reference of the form `[registry/]name[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference(String);

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            bail!("image reference must not be empty");
        }
        if reference.chars().any(char::is_whitespace) {
            bail!("image reference {reference:?} contains whitespace");
        }

        Ok(Self(reference.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The unqualified application name: registry and repository path
    /// components, tag and digest are stripped.
    pub fn app_name(&self) -> &str {
        let last = self.0.rsplit('/').next().unwrap_or(&self.0);
        let last = last.split('@').next().unwrap_or(last);
        last.split(':').next().unwrap_or(last)
    }

    /// Name of the hardened image derived from this one.
    pub fn gsc_name(&self) -> String {
        format!("{GSC_IMAGE_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The parts of an engine's image record this tool cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRef {
    pub id: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: String,
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// One record from the engine's build progress stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildProgress {
    /// Free-text progress output, possibly spanning several lines.
    pub stream: Option<String>,
    pub error: Option<String>,
}

impl From<BuildInfo> for BuildProgress {
    fn from(info: BuildInfo) -> Self {
        Self {
            stream: info.stream.or(info.status),
            error: info.error,
        }
    }
}

pub type ProgressStream<'a> = LocalBoxStream<'a, Result<BuildProgress>>;

/// The container engine operations the build pipeline consumes.
#[allow(async_fn_in_trait)]
pub trait ContainerEngine {
    /// Look up an image by name or ID.
    async fn inspect_image(&self, name: &str) -> Result<ImageRef>;

    /// Build the context directory into an image tagged `tag`, yielding
    /// progress records in the order the engine emits them.
    async fn build_image(&self, context_dir: &Path, tag: &str) -> Result<ProgressStream<'_>>;

    /// Whether an image is present. Lookup errors of any kind count as absent.
    async fn image_exists(&self, name: &str) -> bool {
        match self.inspect_image(name).await {
            Ok(img) => {
                debug!("found image {name}: {img}");
                true
            }
            Err(e) => {
                debug!("treating {name} as absent: {e:#}");
                false
            }
        }
    }
}

/// Connect to the local Docker daemon. The client is shared by every
/// component of one invocation.
pub fn connect_docker() -> Result<Arc<Docker>> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| anyhow!("connecting to docker: {}", e))?;

    Ok(Arc::new(docker))
}

/// [`ContainerEngine`] backed by a Docker daemon.
pub struct DockerEngine {
    docker: Arc<Docker>,
}

impl DockerEngine {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }
}

impl ContainerEngine for DockerEngine {
    async fn inspect_image(&self, name: &str) -> Result<ImageRef> {
        debug!("attempting to resolve image: {name}");
        let img = self
            .docker
            .inspect_image(name)
            .await
            .with_context(|| format!("inspecting image {}", name))?;

        let id = img
            .id
            .ok_or_else(|| anyhow!("missing image ID in image_inspect result"))?;
        let config = img.config.unwrap_or_default();

        Ok(ImageRef {
            id,
            cmd: config.cmd.unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            working_dir: config.working_dir.unwrap_or_default(),
        })
    }

    async fn build_image(&self, context_dir: &Path, tag: &str) -> Result<ProgressStream<'_>> {
        let (byte_stream, writer) = context_tarball_stream(context_dir)?;

        let options = BuildImageOptionsBuilder::default()
            .dockerfile(DOCKERFILE_NAME)
            .t(tag)
            .rm(true)
            .build();

        debug!("building {} from {}", tag, context_dir.display());
        let progress = self
            .docker
            .build_image(options, None, Some(bollard::body_stream(byte_stream)))
            .map(|res| res.map(BuildProgress::from).context("building image"));

        // A context that could not be archived completely fails the build even
        // when the daemon accepted the truncated tarball.
        let context_written = stream::once(async move {
            finish_context_tarball(writer).await.err().map(Err)
        })
        .filter_map(future::ready);

        Ok(progress.chain(context_written).boxed_local())
    }
}

/// Stream `context_dir` as a tarball through an in-memory pipe, so the archive
/// is never held in memory whole. The byte stream ends at the first read
/// error; the writer's handle reports whether the archive is complete.
fn context_tarball_stream(
    context_dir: &Path,
) -> Result<(impl Stream<Item = Bytes> + Send + 'static, JoinHandle<Result<()>>)> {
    let (tar_write, tar_read) = duplex(CONTEXT_PIPE_CAPACITY);
    let dir = context_dir.to_path_buf();
    let writer = spawn!("build context tarball", async move {
        write_context_tarball(&dir, tar_write).await
    })?;

    let byte_stream = codec::FramedRead::new(tar_read, codec::BytesCodec::new())
        .take_while(|chunk| future::ready(chunk.is_ok()))
        .filter_map(|chunk| future::ready(chunk.ok().map(|bytes| bytes.freeze())));

    Ok((byte_stream, writer))
}

async fn finish_context_tarball(writer: JoinHandle<Result<()>>) -> Result<()> {
    writer
        .await
        .context("build context writer panicked")?
        .context("streaming build context")
}

async fn write_context_tarball<W>(context_dir: &Path, dst: W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    trace!("archiving build context {}", context_dir.display());
    let mut tb = tokio_tar::Builder::new(dst);
    tb.append_dir_all(".", context_dir)
        .await
        .with_context(|| format!("archiving {}", context_dir.display()))?;

    let mut dst = tb.into_inner().await?;
    dst.shutdown().await?;

    Ok(())
}
