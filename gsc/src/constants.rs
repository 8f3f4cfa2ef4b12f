/// Prefix prepended to a base image reference to name its hardened counterpart.
pub const GSC_IMAGE_PREFIX: &str = "gsc-";

pub const DOCKERFILE_NAME: &str = "Dockerfile";
pub const APPLOADER_NAME: &str = "apploader.sh";
pub const FINALIZE_SCRIPT_NAME: &str = "finalize_manifests.sh";
pub const MANIFEST_EXTENSION: &str = "manifest";

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const TEMPLATES_DIR: &str = "templates";

pub const MANIFEST_TEMPLATE: &str = "manifest.template";
pub const APPLOADER_TEMPLATE: &str = "apploader.template";

// Host resources a hardened container needs at run time.
pub const SGX_DEVICE: &str = "/dev/isgx";
pub const GSGX_DEVICE: &str = "/dev/gsgx";
pub const AESM_SOCKET: &str = "/var/run/aesmd/aesm.socket";

/// Name of the first (toolchain build) stage template for a distro.
pub fn build_stage_template(distro: &str) -> String {
    format!("Dockerfile.{distro}.build.template")
}

/// Name of the second (application) stage template for a distro.
pub fn app_stage_template(distro: &str) -> String {
    format!("Dockerfile.{distro}.app.template")
}
