use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("ManagedCluster {0} does not exist")]
    ClusterNotFound(String),

    #[error("Invalid add-on configuration: {message}")]
    ConfigurationWrong { message: String, reason: String },

    #[error("Failed to render agent manifests: {0}")]
    RenderError(String),

    #[error("Template error: {0}")]
    TemplateError(#[from] Box<handlebars::RenderError>),

    #[error("Template value {0} is not a string")]
    NonStringValue(String),

    #[error("Unsupported manifest location {0}")]
    UnsupportedManifestLocation(String),

    #[error("No agent provider registered for add-on {0}")]
    ProviderNotRegistered(String),

    #[error("Add-on {addon} is not yet available: {message}")]
    NotAvailable {
        message: String,
        addon: String,
        requeue_after: Option<Duration>,
    },

    #[error("Pre-delete hook for add-on {0} has not completed")]
    HookNotCompleted(String),

    #[error("Failed to parse certificate signing request: {0}")]
    CsrParseError(String),

    #[error("Discovery failed for config kind {group}/{resource}: {message}")]
    ConfigKindNotDiscovered {
        group: String,
        resource: String,
        message: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::ClusterNotFound(_) => "ClusterNotFound",
            Error::ConfigurationWrong { .. } => "ConfigurationWrong",
            Error::RenderError(_) => "RenderError",
            Error::TemplateError(_) => "TemplateError",
            Error::NonStringValue(_) => "NonStringValue",
            Error::UnsupportedManifestLocation(_) => "UnsupportedManifestLocation",
            Error::ProviderNotRegistered(_) => "ProviderNotRegistered",
            Error::NotAvailable { .. } => "NotAvailable",
            Error::HookNotCompleted(_) => "HookNotCompleted",
            Error::CsrParseError(_) => "CsrParseError",
            Error::ConfigKindNotDiscovered { .. } => "ConfigKindNotDiscovered",
        }
    }
}

impl From<handlebars::RenderError> for Error {
    fn from(err: handlebars::RenderError) -> Self {
        Error::TemplateError(Box::new(err))
    }
}

/// Agent providers: rendering, value pipeline, probers and registration hooks
pub mod agent;

pub mod controllers;
pub use controllers::{run, State};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Hub-side CRDs and the external API kinds we consume
pub mod resources;
