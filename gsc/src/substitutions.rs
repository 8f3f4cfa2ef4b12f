//! The single set of named parameters used to render every template of a build.
//!
//! The set is folded from immutable layers, each overriding the keys of the
//! ones before it:
//!
//! 1. hard defaults,
//! 2. one patch per build flag, in the order given,
//! 3. the extra make flags with their `${DEBUG}` placeholder resolved,
//! 4. the persistent configuration,
//! 5. metadata extracted from the base image.

use crate::config::Config;
use crate::metadata::ImageMetadata;
use crate::options::BuildOption;
use crate::template::Template;
use anyhow::{Context, Result};
use log::trace;
use std::collections::BTreeMap;

const MAKE_LINUX_PAL: &str = "MAKE_LINUX_PAL";

/// A named patch of substitutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    name: String,
    entries: BTreeMap<String, String>,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Defaults every build starts from.
pub fn defaults() -> Layer {
    Layer::new("defaults")
        .with("DEBUG", "")
        .with("debug_output", "none")
        .with(MAKE_LINUX_PAL, "")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionSet(BTreeMap<String, String>);

impl SubstitutionSet {
    /// Fold layers in order; later layers win on conflicting keys.
    pub fn fold<'a, I>(layers: I) -> Self
    where
        I: IntoIterator<Item = &'a Layer>,
    {
        layers.into_iter().fold(Self::default(), Self::merge)
    }

    fn merge(self, layer: &Layer) -> Self {
        trace!("applying substitution layer {:?}", layer.name());
        let mut entries = self.0;
        entries.extend(layer.entries.clone());
        Self(entries)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Build the substitution set for one build.
pub fn build_substitutions(
    options: &[BuildOption],
    config: &Config,
    metadata: &ImageMetadata,
) -> Result<SubstitutionSet> {
    let mut flag_layers = vec![defaults()];
    flag_layers.extend(options.iter().map(BuildOption::patch));
    let flagged = SubstitutionSet::fold(&flag_layers);

    let derived = derive_make_flags(&flagged)?;

    let layers = [
        Layer::from(flagged),
        derived,
        config.to_layer(),
        metadata.to_layer(),
    ];

    Ok(SubstitutionSet::fold(&layers))
}

/// Resolve the placeholders embedded in the extra make flags against the
/// flag-derived values.
fn derive_make_flags(values: &SubstitutionSet) -> Result<Layer> {
    let mut layer = Layer::new("derived");

    if let Some(make_flags) = values.get(MAKE_LINUX_PAL).filter(|f| !f.is_empty()) {
        let resolved = Template::parse(MAKE_LINUX_PAL, make_flags)?
            .substitute(values)
            .with_context(|| format!("resolving {MAKE_LINUX_PAL}"))?;
        layer = layer.with(MAKE_LINUX_PAL, resolved);
    }

    Ok(layer)
}

impl From<SubstitutionSet> for Layer {
    fn from(set: SubstitutionSet) -> Self {
        Self {
            name: "flags".to_string(),
            entries: set.0,
        }
    }
}
