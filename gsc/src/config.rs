use crate::substitutions::Layer;
use crate::utils::expand_env_vars;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

/// Persistent tool configuration, loaded once per invocation.
#[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Selects the distro-keyed Dockerfile templates.
    pub distro: String,
    pub graphene: Option<SourceRepo>,
    pub sgx_driver: Option<SourceRepo>,
    /// Free-form extra template parameters.
    #[serde(default)]
    pub substitutions: BTreeMap<String, String>,
}

#[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceRepo {
    pub repository: String,
    pub branch: String,
}

impl Config {
    /// Flatten the configuration into a substitution layer.
    pub fn to_layer(&self) -> Layer {
        let mut layer = Layer::new("config").with("distro", &self.distro);

        if let Some(graphene) = &self.graphene {
            layer = layer
                .with("graphene_repository", &graphene.repository)
                .with("graphene_branch", &graphene.branch);
        }

        if let Some(driver) = &self.sgx_driver {
            layer = layer
                .with("sgx_driver_repository", &driver.repository)
                .with("sgx_driver_branch", &driver.branch);
        }

        for (key, value) in &self.substitutions {
            layer = layer.with(key, value);
        }

        layer
    }

    fn expand_env_vars(&mut self) {
        self.distro = expand_env_vars(&self.distro);

        for repo in [self.graphene.as_mut(), self.sgx_driver.as_mut()]
            .into_iter()
            .flatten()
        {
            repo.repository = expand_env_vars(&repo.repository);
            repo.branch = expand_env_vars(&repo.branch);
        }

        for value in self.substitutions.values_mut() {
            *value = expand_env_vars(value);
        }
    }
}

fn parse_config(buf: &[u8]) -> Result<Config> {
    let config: Config = serde_yaml::from_slice(buf)?;

    Ok(config)
}

pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let buf = match fs::read(path).await {
        Ok(buf) => buf,
        Err(err) => anyhow::bail!("failed to open {}: {err}", path.display()),
    };

    let mut config = parse_config(&buf)
        .map_err(|e| anyhow!("invalid configuration in {}: {e}", path.display()))?;

    config.expand_env_vars();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::{load_config, parse_config};
    use crate::substitutions::SubstitutionSet;

    #[test]
    fn test_parse_config_with_unknown_fields() {
        assert!(parse_config(b"distro: ubuntu18.04\nfoo: bar\n").is_err());
    }

    #[test]
    fn test_parse_config_requires_distro() {
        assert!(parse_config(b"substitutions: {}\n").is_err());
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config(b"distro: ubuntu18.04\n").unwrap();

        assert_eq!(config.distro, "ubuntu18.04");
        assert!(config.graphene.is_none());
        assert!(config.substitutions.is_empty());

        let layer = SubstitutionSet::fold([&config.to_layer()]);
        assert_eq!(layer.get("distro"), Some("ubuntu18.04"));
        assert_eq!(layer.get("graphene_repository"), None);
    }

    #[test]
    fn test_parse_full_config() {
        let raw_config = br#"
distro: "ubuntu18.04"
graphene:
  repository: "https://github.com/oscarlab/graphene.git"
  branch: "master"
sgx_driver:
  repository: "https://github.com/01org/linux-sgx-driver.git"
  branch: "sgx_driver_1.9"
substitutions:
  debug_output: "file"
"#;

        let layer = SubstitutionSet::fold([&parse_config(raw_config).unwrap().to_layer()]);

        assert_eq!(
            layer.get("graphene_repository"),
            Some("https://github.com/oscarlab/graphene.git")
        );
        assert_eq!(layer.get("graphene_branch"), Some("master"));
        assert_eq!(layer.get("sgx_driver_branch"), Some("sgx_driver_1.9"));
        assert_eq!(layer.get("debug_output"), Some("file"));
    }

    #[tokio::test]
    async fn test_load_config_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, "distro: [unterminated").await.unwrap();

        let err = load_config(&path).await.unwrap_err();
        assert!(err.to_string().contains("invalid configuration in"));

        let err = load_config(dir.path().join("missing.yaml")).await.unwrap_err();
        assert!(err.to_string().contains("failed to open"));
    }

    #[tokio::test]
    async fn test_load_config_expands_env_vars() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(
            &path,
            "distro: ubuntu18.04\ngraphene:\n  repository: r\n  branch: ${GSC_TEST_UNSET_BRANCH:-v1.0}\n",
        )
        .await
        .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.graphene.unwrap().branch, "v1.0");
    }
}
