use crate::images::ImageReference;
use crate::substitutions::Layer;
use anyhow::{Result, bail};
use std::path::PathBuf;

pub const BUILD_USAGE: &str = "\
usage: gsc build [<options>] <image name>[:<tag>] <manifest> [<manifest> ...]

  image name  name of the base image to be graphenized
  tag         tag of the image
  manifest    application specific manifest appended to the generated manifest

options:
  -d, --debug  compile Graphene with debug output
  -L, --linux  also compile the Linux PAL";

/// A recognized `build` flag. Each flag contributes a patch to the
/// substitution set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOption {
    Debug,
    LinuxPal,
}

impl BuildOption {
    pub fn from_flag(flag: &str) -> Result<Self> {
        match flag {
            "-d" | "--debug" => Ok(Self::Debug),
            "-L" | "--linux" => Ok(Self::LinuxPal),
            _ => bail!("unrecognized option {flag:?}\n\n{BUILD_USAGE}"),
        }
    }

    pub fn patch(&self) -> Layer {
        match self {
            Self::Debug => Layer::new("-d")
                .with("DEBUG", "DEBUG=1")
                .with("debug_output", "inline"),
            // ${DEBUG} is resolved once all flags are applied.
            Self::LinuxPal => Layer::new("-L").with(
                "MAKE_LINUX_PAL",
                "RUN make -C /graphene/Pal/src ${DEBUG} PAL_HOST=Linux",
            ),
        }
    }
}

/// Arguments of the `build` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArgs {
    pub options: Vec<BuildOption>,
    pub image: ImageReference,
    pub manifests: Vec<PathBuf>,
}

impl BuildArgs {
    /// Parse `[<flag> ...] <image> <manifest> [<manifest> ...]`.
    ///
    /// Every leading argument starting with `-` must be a recognized flag;
    /// the first one that is not ends the flag list.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let flag_count = args.iter().take_while(|arg| arg.starts_with('-')).count();

        let options = args[..flag_count]
            .iter()
            .map(|flag| BuildOption::from_flag(flag))
            .collect::<Result<Vec<_>>>()?;

        let (image, manifests) = match &args[flag_count..] {
            [image, manifests @ ..] if !manifests.is_empty() => (image, manifests),
            _ => bail!("too few arguments to command build\n\n{BUILD_USAGE}"),
        };

        Ok(Self {
            options,
            image: ImageReference::parse(image)?,
            manifests: manifests.iter().map(PathBuf::from).collect(),
        })
    }
}
