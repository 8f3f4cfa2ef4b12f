use crate::constants::{AESM_SOCKET, GSGX_DEVICE, SGX_DEVICE};
use crate::images::{ContainerEngine, ImageReference};
use crate::utils::forward_chunk;
use anyhow::{Result, anyhow, bail};
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, DeviceMapping, HostConfig, Mount, MountTypeEnum};
use bollard::query_parameters::{
    CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use futures::{StreamExt, TryStreamExt};
use log::{debug, info, warn};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;

/// Fail unless the host exposes the SGX devices and the AESM socket a
/// graphenized container needs.
pub async fn check_host_support() -> Result<()> {
    for path in [SGX_DEVICE, GSGX_DEVICE, AESM_SOCKET] {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            bail!(
                "{path} not found; please install the SGX driver, the Graphene kernel module and the SGX SDK/AESM service"
            );
        }
    }

    Ok(())
}

pub const RUN_USAGE: &str = "\
usage: gsc run [<options>] <image name>[:<tag>] [<application arguments>]

  image name  name of the image without the gsc- prefix
  tag         tag of the image

options (a subset of docker run's):
  -t, --tty             allocate a pseudo-TTY
  -i, --interactive     accepted for compatibility; stdin is not forwarded
  -e, --env KEY=VALUE   set an environment variable
  -w, --workdir DIR     working directory inside the container
  -u, --user USER       user to run the application as";

/// Container settings taken from the leading `run` options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub tty: bool,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
}

/// Arguments of the `run` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    pub options: RunOptions,
    pub image: ImageReference,
    pub app_args: Vec<String>,
}

impl RunArgs {
    /// Parse `[<option> ...] <image> [<application argument> ...]`.
    ///
    /// Options end at the first argument not starting with `-`; everything
    /// after the image belongs to the application.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut options = RunOptions::default();
        let mut args = args.iter().map(AsRef::<str>::as_ref);

        let image = loop {
            let Some(arg) = args.next() else {
                bail!("too few arguments to command run\n\n{RUN_USAGE}");
            };
            if !arg.starts_with('-') {
                break arg;
            }

            let (flag, inline_value) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag, Some(value)),
                _ => (arg, None),
            };
            let mut value = || match inline_value.or_else(|| args.next()) {
                Some(value) => Ok(value.to_string()),
                None => Err(anyhow!("option {flag} requires a value\n\n{RUN_USAGE}")),
            };

            match flag {
                "-t" | "--tty" => options.tty = true,
                "-i" | "--interactive" => warn!("stdin is not forwarded, ignoring {flag}"),
                "-it" | "-ti" => {
                    warn!("stdin is not forwarded, ignoring -i");
                    options.tty = true;
                }
                "-e" | "--env" => options.env.push(value()?),
                "-w" | "--workdir" => options.working_dir = Some(value()?),
                "-u" | "--user" => options.user = Some(value()?),
                _ => bail!("unrecognized option {arg:?}\n\n{RUN_USAGE}"),
            }
        };

        Ok(Self {
            options,
            image: ImageReference::parse(image)?,
            app_args: args.map(str::to_string).collect(),
        })
    }
}

fn sgx_device(path: &str) -> DeviceMapping {
    DeviceMapping {
        path_on_host: Some(path.to_string()),
        path_in_container: Some(path.to_string()),
        cgroup_permissions: Some(String::from("rwm")),
    }
}

fn container_config(image: &str, options: RunOptions, app_args: Vec<String>) -> ContainerCreateBody {
    ContainerCreateBody {
        image: Some(image.to_string()),
        tty: Some(options.tty),
        env: if options.env.is_empty() {
            None
        } else {
            Some(options.env)
        },
        working_dir: options.working_dir,
        user: options.user,
        cmd: if app_args.is_empty() {
            None
        } else {
            Some(app_args)
        },
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            devices: Some(vec![sgx_device(GSGX_DEVICE), sgx_device(SGX_DEVICE)]),
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(String::from(AESM_SOCKET)),
                target: Some(String::from(AESM_SOCKET)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Runs graphenized images in the local Docker daemon.
pub struct GscRunner {
    docker: Arc<Docker>,
    container_id: Option<String>,
}

impl GscRunner {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self {
            docker,
            container_id: None,
        }
    }

    /// Run the graphenized variant of `args.image`, forwarding its stdout to
    /// `out`. Returns the container's exit status.
    pub async fn run<E: ContainerEngine, W: Write>(
        &mut self,
        engine: &E,
        args: RunArgs,
        out: &mut W,
    ) -> Result<i64> {
        let RunArgs {
            options,
            image,
            app_args,
        } = args;
        let gsc_image = image.gsc_name();
        if !engine.image_exists(&gsc_image).await {
            bail!("unable to find image {gsc_image}");
        }

        info!(
            "running graphenized docker image {gsc_image} with arguments ({}) {}",
            app_args.len(),
            app_args.join(" ")
        );

        let container_id = self
            .docker
            .create_container(
                None::<CreateContainerOptions>,
                container_config(&gsc_image, options, app_args),
            )
            .await?
            .id;
        debug!("created container {container_id}");
        self.container_id = Some(container_id.clone());

        self.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await?;

        self.forward_output(&container_id, out).await?;
        self.wait_container(&container_id).await
    }

    async fn forward_output<W: Write>(&self, container_id: &str, out: &mut W) -> Result<()> {
        let mut logs = self.docker.logs(
            container_id,
            Some(LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        while let Some(chunk) = logs.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    forward_chunk(out, &String::from_utf8_lossy(&message))?;
                }
                LogOutput::StdErr { message } => {
                    for line in String::from_utf8_lossy(&message).lines() {
                        info!(target: "gsc::container", "{}", line);
                    }
                }
                LogOutput::StdIn { .. } => {}
            }
        }

        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let responses = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions>)
            .try_collect::<Vec<_>>()
            .await;

        match responses {
            Ok(responses) => Ok(responses
                .first()
                .ok_or_else(|| anyhow!("missing wait response from daemon"))?
                .status_code),
            // The daemon reports non-zero exits as errors.
            Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => Ok(code),
            Err(e) => Err(e.into()),
        }
    }

    /// [`GscRunner::run`] until the container exits or `shutdown` resolves.
    /// The container is removed either way; an interrupted run is an error.
    pub async fn run_until<E, W, F>(
        &mut self,
        engine: &E,
        args: RunArgs,
        out: &mut W,
        shutdown: F,
    ) -> Result<i64>
    where
        E: ContainerEngine,
        W: Write,
        F: Future,
    {
        let res = tokio::select! {
            res = self.run(engine, args, out) => res,
            _ = shutdown => {
                debug!("signal received, cleaning up...");
                Err(anyhow!("interrupted before the container exited"))
            }
        };

        self.cleanup().await?;
        res
    }

    /// Remove the container started by [`GscRunner::run`], if any.
    pub async fn cleanup(&mut self) -> Result<()> {
        if let Some(container_id) = self.container_id.take() {
            debug!("removing container {container_id}");
            self.docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await?;
        }

        Ok(())
    }
}
