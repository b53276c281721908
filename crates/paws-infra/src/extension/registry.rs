//! Extension registry: the catalog and invoker handed to the engine.
//!
//! Maps extension names to boxed invokers and routes each request by its
//! `extension` field. The same registry answers catalog lookups for the
//! document validator.

use std::collections::BTreeMap;
use std::time::Duration;

use paws_core::workflow::boundary::{
    BoxExtensionInvoker, DispatchError, ExtensionCatalog, ExtensionInvoker, ExtensionRequest,
    ExtensionResponse,
};
use paws_types::config::PawsConfig;

use super::shell::{SHELL_EXTENSION, ShellExtension};

/// Named extensions available to a run.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: BTreeMap<String, BoxExtensionInvoker>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in extensions configured from `config`.
    pub fn with_builtins(config: &PawsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(
            SHELL_EXTENSION,
            ShellExtension::new(Duration::from_secs(config.shell_timeout_secs)),
        );
        registry
    }

    /// Register `invoker` under `name`, replacing any previous entry.
    pub fn register<T: ExtensionInvoker + 'static>(&mut self, name: impl Into<String>, invoker: T) {
        let name = name.into();
        tracing::debug!(extension = name.as_str(), "registering extension");
        self.extensions.insert(name, BoxExtensionInvoker::new(invoker));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.extensions.keys().map(String::as_str).collect()
    }
}

impl ExtensionCatalog for ExtensionRegistry {
    fn contains(&self, extension: &str) -> bool {
        self.extensions.contains_key(extension)
    }
}

impl ExtensionInvoker for ExtensionRegistry {
    fn has_extension(&self, extension: &str) -> bool {
        self.extensions.contains_key(extension)
    }

    async fn invoke(&self, request: ExtensionRequest) -> Result<ExtensionResponse, DispatchError> {
        let Some(invoker) = self.extensions.get(&request.extension) else {
            return Err(DispatchError::UnknownExtension(request.extension));
        };
        invoker.invoke(request).await
    }
}
