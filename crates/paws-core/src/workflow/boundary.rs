//! Extension and output validator boundaries.
//!
//! The engine never constructs the collaborators that do real work. Callers
//! hand it an [`ExtensionInvoker`] (one request/response call per dispatch)
//! and optionally an [`OutputValidator`]. Both use native async fn in traits;
//! [`BoxExtensionInvoker`] and [`BoxOutputValidator`] provide dynamic dispatch
//! through an object-safe `*Dyn` twin with a blanket impl.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Extension catalog
// ---------------------------------------------------------------------------

/// Lookup of the extension names a run may use. Consulted by the validator.
pub trait ExtensionCatalog {
    fn contains(&self, extension: &str) -> bool;
}

impl ExtensionCatalog for HashSet<String> {
    fn contains(&self, extension: &str) -> bool {
        HashSet::contains(self, extension)
    }
}

impl ExtensionCatalog for BTreeSet<String> {
    fn contains(&self, extension: &str) -> bool {
        BTreeSet::contains(self, extension)
    }
}

impl ExtensionCatalog for [&str] {
    fn contains(&self, extension: &str) -> bool {
        self.iter().any(|e| *e == extension)
    }
}

/// Adapts an [`ExtensionInvoker`] into a catalog.
pub struct InvokerCatalog<'a, X: ?Sized>(pub &'a X);

impl<X: ExtensionInvoker + ?Sized> ExtensionCatalog for InvokerCatalog<'_, X> {
    fn contains(&self, extension: &str) -> bool {
        self.0.has_extension(extension)
    }
}

// ---------------------------------------------------------------------------
// Extension invocation
// ---------------------------------------------------------------------------

/// One dispatch to an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRequest {
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub inputs: BTreeMap<String, String>,
    pub timeout_ms: u64,
    /// `"{run_id}-{step_id}-{attempt}"`, for adapters that deduplicate
    /// re-issued calls after a crash.
    pub attempt_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExtensionResponse {
    pub fn success(outputs: BTreeMap<String, String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            outputs,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            outputs: BTreeMap::new(),
            error_message: Some(message.into()),
        }
    }
}

/// Dispatch failures. All of them flow into the step's failure policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("extension '{0}' is not registered")]
    UnknownExtension(String),

    #[error("extension '{extension}' unreachable: {reason}")]
    Unreachable { extension: String, reason: String },

    #[error("extension '{extension}' returned an error: {message}")]
    Status { extension: String, message: String },

    #[error("extension '{extension}' timed out after {timeout_ms}ms")]
    Timeout { extension: String, timeout_ms: u64 },

    #[error("entitlement denied: {0}")]
    Denied(String),
}

/// Invokes extensions on behalf of the engine.
///
/// Implementations must tolerate re-issued requests carrying an
/// `attempt_id` they have already seen.
pub trait ExtensionInvoker: Send + Sync {
    /// Whether this invoker can dispatch to `extension`.
    fn has_extension(&self, extension: &str) -> bool;

    /// Perform one request/response exchange.
    fn invoke(
        &self,
        request: ExtensionRequest,
    ) -> impl Future<Output = Result<ExtensionResponse, DispatchError>> + Send;
}

/// Object-safe version of [`ExtensionInvoker`] with boxed futures.
pub trait ExtensionInvokerDyn: Send + Sync {
    fn has_extension_dyn(&self, extension: &str) -> bool;

    fn invoke_boxed<'a>(
        &'a self,
        request: ExtensionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExtensionResponse, DispatchError>> + Send + 'a>>;
}

impl<T: ExtensionInvoker> ExtensionInvokerDyn for T {
    fn has_extension_dyn(&self, extension: &str) -> bool {
        self.has_extension(extension)
    }

    fn invoke_boxed<'a>(
        &'a self,
        request: ExtensionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExtensionResponse, DispatchError>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased extension invoker for runtime selection.
pub struct BoxExtensionInvoker {
    inner: Box<dyn ExtensionInvokerDyn>,
}

impl BoxExtensionInvoker {
    pub fn new<T: ExtensionInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }
}

impl ExtensionInvoker for BoxExtensionInvoker {
    fn has_extension(&self, extension: &str) -> bool {
        self.inner.has_extension_dyn(extension)
    }

    fn invoke(
        &self,
        request: ExtensionRequest,
    ) -> impl Future<Output = Result<ExtensionResponse, DispatchError>> + Send {
        self.inner.invoke_boxed(request)
    }
}

// ---------------------------------------------------------------------------
// Output validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub step_id: String,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationVerdict {
    pub fn accept() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorError {
    #[error("validator unavailable: {0}")]
    Unavailable(String),
}

/// Checks a step's outputs against its success criteria.
pub trait OutputValidator: Send + Sync {
    fn validate(
        &self,
        request: ValidationRequest,
    ) -> impl Future<Output = Result<ValidationVerdict, ValidatorError>> + Send;
}

/// Object-safe version of [`OutputValidator`] with boxed futures.
pub trait OutputValidatorDyn: Send + Sync {
    fn validate_boxed<'a>(
        &'a self,
        request: ValidationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ValidationVerdict, ValidatorError>> + Send + 'a>>;
}

impl<T: OutputValidator> OutputValidatorDyn for T {
    fn validate_boxed<'a>(
        &'a self,
        request: ValidationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ValidationVerdict, ValidatorError>> + Send + 'a>> {
        Box::pin(self.validate(request))
    }
}

/// Type-erased output validator, attached to the engine at runtime.
pub struct BoxOutputValidator {
    inner: Box<dyn OutputValidatorDyn>,
}

impl BoxOutputValidator {
    pub fn new<T: OutputValidator + 'static>(validator: T) -> Self {
        Self {
            inner: Box::new(validator),
        }
    }
}

impl OutputValidator for BoxOutputValidator {
    fn validate(
        &self,
        request: ValidationRequest,
    ) -> impl Future<Output = Result<ValidationVerdict, ValidatorError>> + Send {
        self.inner.validate_boxed(request)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
