//! Runtime metadata of a base image: what it runs, with which arguments, and where.
//!
//! The start command is split with a convention-based heuristic rather than a
//! shell parser. Images whose start command is not a single `sh -c "..."`
//! wrapper, or whose program path contains whitespace, are mis-split.

use crate::images::{ImageRef, ImageReference};
use crate::substitutions::Layer;
use anyhow::{Result, bail};
use log::debug;

const SHELLS: [&str; 2] = ["/bin/sh", "sh"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub reference: ImageReference,
    pub binary: String,
    pub binary_arguments: String,
    pub working_dir: String,
}

impl ImageMetadata {
    /// Derive the entrypoint binary, its arguments and working directory from
    /// the engine's record of `reference`.
    ///
    /// The recorded `Cmd` is used; an image without one falls back to its
    /// `Entrypoint`.
    pub fn extract(reference: &ImageReference, image: &ImageRef) -> Result<Self> {
        let tokens = if image.cmd.is_empty() {
            &image.entrypoint
        } else {
            &image.cmd
        };

        let Some((binary, binary_arguments)) = split_start_command(tokens) else {
            bail!("image {reference} records no start command");
        };
        debug!("{reference}: binary {binary:?}, arguments {binary_arguments:?}");

        Ok(Self {
            reference: reference.clone(),
            binary,
            binary_arguments,
            working_dir: image.working_dir.clone(),
        })
    }

    pub fn to_layer(&self) -> Layer {
        Layer::new("image metadata")
            .with("app", self.reference.app_name())
            .with("binary", &self.binary)
            .with("binary_arguments", &self.binary_arguments)
            .with("working_dir", &self.working_dir)
            .with("appImage", self.reference.as_str())
    }
}

/// Split a recorded start command into `(binary, arguments)`.
///
/// A leading `sh -c` wrapper is dropped, the remaining tokens are joined with
/// spaces and the result is split at its first run of whitespace. Returns
/// `None` when nothing remains.
pub fn split_start_command(tokens: &[String]) -> Option<(String, String)> {
    let tokens = match tokens {
        [shell, flag, rest @ ..] if SHELLS.contains(&shell.as_str()) && flag == "-c" => rest,
        _ => tokens,
    };

    let command = tokens.join(" ");
    let command = command.trim_start();
    if command.is_empty() {
        return None;
    }

    let (binary, arguments) = match command.split_once(char::is_whitespace) {
        Some((binary, rest)) => (binary, rest.trim_start()),
        None => (command, ""),
    };

    Some((binary.to_string(), arguments.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{ImageMetadata, split_start_command};
    use crate::images::{ImageRef, ImageReference};
    use crate::substitutions::SubstitutionSet;

    fn tokens(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_shell_wrapped_command() {
        assert_eq!(
            split_start_command(&tokens(&["/bin/sh", "-c", "/usr/bin/myapp --serve"])),
            Some(("/usr/bin/myapp".to_string(), "--serve".to_string()))
        );
        assert_eq!(
            split_start_command(&tokens(&["sh", "-c", "redis-server"])),
            Some(("redis-server".to_string(), String::new()))
        );
    }

    #[test]
    fn test_split_exec_form_command() {
        assert_eq!(
            split_start_command(&tokens(&["nginx", "-g", "daemon off;"])),
            Some(("nginx".to_string(), "-g daemon off;".to_string()))
        );
        assert_eq!(
            split_start_command(&tokens(&["python3"])),
            Some(("python3".to_string(), String::new()))
        );
    }

    #[test]
    fn test_split_collapses_leading_whitespace_run() {
        assert_eq!(
            split_start_command(&tokens(&["/bin/sh", "-c", "  app   -x  y"])),
            Some(("app".to_string(), "-x  y".to_string()))
        );
    }

    #[test]
    fn test_split_empty_command() {
        assert_eq!(split_start_command(&[]), None);
        assert_eq!(split_start_command(&tokens(&["/bin/sh", "-c"])), None);
        assert_eq!(split_start_command(&tokens(&["  "])), None);
    }

    #[test]
    fn test_extract_metadata() {
        let reference = ImageReference::parse("ns/myapp:latest").unwrap();
        let image = ImageRef {
            id: "sha256:feed".to_string(),
            cmd: tokens(&["/bin/sh", "-c", "/usr/bin/myapp --serve"]),
            working_dir: "/srv".to_string(),
            ..Default::default()
        };

        let metadata = ImageMetadata::extract(&reference, &image).unwrap();
        assert_eq!(metadata.binary, "/usr/bin/myapp");
        assert_eq!(metadata.binary_arguments, "--serve");
        assert_eq!(metadata.working_dir, "/srv");

        let layer = SubstitutionSet::fold([&metadata.to_layer()]);
        assert_eq!(layer.get("app"), Some("myapp"));
        assert_eq!(layer.get("appImage"), Some("ns/myapp:latest"));
    }

    #[test]
    fn test_extract_falls_back_to_entrypoint() {
        let reference = ImageReference::parse("postgres").unwrap();
        let image = ImageRef {
            entrypoint: tokens(&["docker-entrypoint.sh", "postgres"]),
            ..Default::default()
        };

        let metadata = ImageMetadata::extract(&reference, &image).unwrap();
        assert_eq!(metadata.binary, "docker-entrypoint.sh");
        assert_eq!(metadata.binary_arguments, "postgres");
        assert_eq!(metadata.working_dir, "");
    }

    #[test]
    fn test_extract_without_start_command() {
        let reference = ImageReference::parse("scratch-app").unwrap();
        let err = ImageMetadata::extract(&reference, &ImageRef::default()).unwrap_err();
        assert!(err.to_string().contains("no start command"));
    }
}
