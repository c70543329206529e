//! Layered configuration merging.
//!
//! Each source of configuration is a [`ValueProvider`] applied onto the
//! running tree. [`ConfigMerger`] applies them left to right, so a provider
//! added later wins on key collisions. Tree-shaped sources are folded in with
//! [`deep_merge`]; inline sets are written onto the merged tree path by path,
//! so `list[1].key=x` edits one entry of an existing list. The standard
//! order, lowest precedence first:
//!
//! 1. installer defaults
//! 2. values persisted by a previous enable
//! 3. legacy image/version flags
//! 4. `--helm-values` files, in order
//! 5. `--helm-set-file`
//! 6. `--helm-set-string`
//! 7. `--helm-set`

use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::strvals::{self, SetKind};
use super::{deep_merge, prune_nulls, set_path, ResolvedValues};
use crate::params::Parameters;
use crate::{Error, Result};

/// A source of partial configuration
pub trait ValueProvider: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Apply this provider's configuration onto `tree`
    fn apply(&self, tree: &mut Value) -> Result<()>;
}

/// A fixed tree (installer defaults, persisted values)
pub struct StaticValues {
    name: &'static str,
    tree: Value,
}

impl StaticValues {
    /// Provider returning `tree` as is
    pub fn new(name: &'static str, tree: Value) -> Self {
        Self { name, tree }
    }
}

impl ValueProvider for StaticValues {
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, tree: &mut Value) -> Result<()> {
        deep_merge(tree, self.tree.clone());
        Ok(())
    }
}

/// The legacy enable flags mapped to their value paths
pub struct FlagValues {
    tree: Value,
}

impl FlagValues {
    /// Map the flags of `params`. Relay and UI toggles are always emitted;
    /// image overrides only when set.
    pub fn from_params(params: &Parameters) -> Self {
        let mut tree = json!({
            "hubble": {
                "enabled": true,
                "relay": {"enabled": params.relay},
                "ui": {"enabled": params.ui},
            }
        });

        let optional = [
            ("hubble.relay.image.override", &params.relay_image),
            ("hubble.relay.image.tag", &params.relay_version),
            ("hubble.ui.frontend.image.override", &params.ui_image),
            ("hubble.ui.backend.image.override", &params.ui_backend_image),
            ("hubble.ui.frontend.image.tag", &params.ui_version),
            ("hubble.ui.backend.image.tag", &params.ui_version),
        ];
        for (path, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                set_path(&mut tree, path, Value::String(value.to_string()));
            }
        }
        Self { tree }
    }
}

impl ValueProvider for FlagValues {
    fn name(&self) -> &str {
        "flags"
    }

    fn apply(&self, tree: &mut Value) -> Result<()> {
        deep_merge(tree, self.tree.clone());
        Ok(())
    }
}

/// `--helm-values` YAML files, merged in the order given
pub struct ValueFiles {
    paths: Vec<PathBuf>,
}

impl ValueFiles {
    /// Provider reading `paths`
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl ValueProvider for ValueFiles {
    fn name(&self) -> &str {
        "value-files"
    }

    fn apply(&self, tree: &mut Value) -> Result<()> {
        for path in &self.paths {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!("unable to read values file {}: {}", path.display(), e))
            })?;
            let parsed = ResolvedValues::from_yaml(&content).map_err(|e| {
                Error::config(format!("values file {}: {}", path.display(), e))
            })?;
            deep_merge(tree, parsed.into_tree());
        }
        Ok(())
    }
}

/// One class of inline `--helm-set*` overrides
pub struct InlineSets {
    kind: SetKind,
    entries: Vec<String>,
}

impl InlineSets {
    /// Provider parsing `entries` as `kind`
    pub fn new(kind: SetKind, entries: Vec<String>) -> Self {
        Self { kind, entries }
    }
}

impl ValueProvider for InlineSets {
    fn name(&self) -> &str {
        match self.kind {
            SetKind::Typed => "helm-set",
            SetKind::String => "helm-set-string",
            SetKind::File => "helm-set-file",
        }
    }

    fn apply(&self, tree: &mut Value) -> Result<()> {
        for entry in &self.entries {
            strvals::parse_into(entry, self.kind, tree)?;
        }
        // `key=null` removes the key
        prune_nulls(tree);
        Ok(())
    }
}

/// Ordered list of providers, lowest precedence first
#[derive(Default)]
pub struct ConfigMerger {
    providers: Vec<Box<dyn ValueProvider>>,
}

impl ConfigMerger {
    /// Empty merger
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider that takes precedence over all earlier ones
    pub fn with(mut self, provider: impl ValueProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// The standard provider chain for an enable invocation
    pub fn for_enable(
        params: &Parameters,
        defaults: Value,
        prior: Option<&ResolvedValues>,
    ) -> Self {
        let inputs = &params.helm_values;
        let mut merger = Self::new().with(StaticValues::new("defaults", defaults));
        if let Some(prior) = prior {
            merger = merger.with(StaticValues::new("persisted", prior.tree().clone()));
        }
        merger
            .with(FlagValues::from_params(params))
            .with(ValueFiles::new(inputs.value_files.clone()))
            .with(InlineSets::new(SetKind::File, inputs.set_file.clone()))
            .with(InlineSets::new(SetKind::String, inputs.set_string.clone()))
            .with(InlineSets::new(SetKind::Typed, inputs.set.clone()))
    }

    /// Fold all providers into one tree
    pub fn resolve(&self) -> Result<ResolvedValues> {
        let mut tree = Value::Object(Map::new());
        for provider in &self.providers {
            provider.apply(&mut tree)?;
            debug!(provider = provider.name(), "Applied value provider");
        }
        Ok(ResolvedValues::new(tree))
    }
}

/// Resolve the effective values for `params` on top of `defaults` and any
/// previously persisted values.
pub fn resolve(
    params: &Parameters,
    defaults: Value,
    prior: Option<&ResolvedValues>,
) -> Result<ResolvedValues> {
    ConfigMerger::for_enable(params, defaults, prior).resolve()
}
