use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use gsc::{
    build::{BuildOutcome, BuildSettings, GscBuilder},
    images::{DockerEngine, connect_docker},
    options::BuildArgs,
    run::{GscRunner, RunArgs, check_host_support},
};
use log::info;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(author, version)]
/// Build and run Graphene-hardened Docker images.
struct Cli {
    #[clap(subcommand)]
    subcommand: Commands,

    #[clap(long = "verbose", short = 'v', action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    #[clap(long = "gsc-dir", env = "GSC_HOME", default_value = ".", global = true)]
    /// Directory holding templates/, config.yaml and the finalize script.
    gsc_dir: PathBuf,

    #[clap(long = "config", global = true)]
    /// Configuration file. Defaults to config.yaml in the gsc directory.
    config_file: Option<PathBuf>,

    #[clap(long = "context-root", default_value = ".", global = true)]
    /// Directory in which per-image build contexts are created.
    context_root: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(name = "build")]
    /// Build a graphenized docker image.
    ///
    /// Usage: gsc build [-d] [-L] <image name>[:<tag>] <manifest> [<manifest> ...]
    ///
    /// -d, --debug compiles Graphene with debug output; -L, --linux also
    /// compiles the Linux PAL. Each manifest is appended to the generated
    /// manifest of the application named by its file name.
    Build {
        #[clap(
            value_name = "ARGS",
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        args: Vec<String>,
    },

    #[clap(name = "run")]
    /// Run a previously built graphenized docker image.
    ///
    /// Usage: gsc run [<options>] <image name>[:<tag>] [<application arguments>]
    ///
    /// Requires the SGX driver, the Graphene kernel module and the AESM
    /// service on this host. Leading options are a subset of docker run's:
    /// -t, -i, -e KEY=VALUE, -w DIR and -u USER.
    Run {
        #[clap(
            value_name = "ARGS",
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        args: Vec<String>,
    },
}

async fn run(args: Cli) -> Result<()> {
    match args.subcommand {
        Commands::Build { args: build_args } => {
            // Flags are validated before anything touches the filesystem or engine.
            let build_args = BuildArgs::parse(build_args.as_slice())?;

            let mut settings = BuildSettings::new(args.gsc_dir);
            settings.context_root = args.context_root;
            if let Some(config_file) = args.config_file {
                settings.config_file = config_file;
            }

            let engine = DockerEngine::new(connect_docker()?);
            let builder = GscBuilder::new(&engine, settings);

            match builder.build(&build_args, &mut std::io::stdout()).await? {
                BuildOutcome::AlreadyBuilt { image } => {
                    info!("nothing to do, {image} is up to date");
                }
                BuildOutcome::Built { image, context_dir } => {
                    info!("built {image} from context {}", context_dir.display());
                }
            }

            Ok(())
        }

        Commands::Run { args: run_args } => {
            let run_args = RunArgs::parse(run_args.as_slice())?;
            check_host_support().await?;

            let docker = connect_docker()?;
            let engine = DockerEngine::new(docker.clone());
            let mut runner = GscRunner::new(docker);

            let shutdown_signal = gsc::utils::register_shutdown_signal_handler().await?;
            let status = runner
                .run_until(&engine, run_args, &mut std::io::stdout(), shutdown_signal)
                .await?;

            match status {
                0 => Ok(()),
                code => bail!("container exited with status {code}"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    gsc::utils::init_logging(args.verbosity);

    #[cfg(feature = "tracing")]
    console_subscriber::ConsoleLayer::builder()
        .with_default_env()
        .server_addr(([127, 0, 0, 1], 51002))
        .init();

    run(args).await
}
