//! The handler framework registry.
//!
//! A single static table describes what each handler kind needs before a
//! runtime can be launched with it: whether a provider must be named,
//! whether a model must be named, and where the set of valid models comes
//! from. The supervisor validates launch requests against this table and
//! the control plane serves it as UI hints, so the two can never disagree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The closed set of handler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Returns the trigger verbatim. Testing and wiring checks.
    Echo,
    /// Local inference through an Ollama-compatible endpoint.
    Ollama,
    /// `OpenAI` chat completions.
    Openai,
    /// Anthropic messages API.
    Anthropic,
    /// Graph agent framework: caller picks the provider underneath.
    Graph,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Echo => "echo",
            Self::Ollama => "ollama",
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Graph => "graph",
        };
        f.write_str(name)
    }
}

impl FromStr for HandlerKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "echo" => Ok(Self::Echo),
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::Openai),
            "anthropic" => Ok(Self::Anthropic),
            "graph" => Ok(Self::Graph),
            other => Err(RegistryError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// Where a handler kind's valid model names come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ModelSource {
    /// The kind takes no model at all.
    NotApplicable,
    /// A fixed list maintained with the kind.
    Fixed {
        /// The accepted model names.
        models: &'static [&'static str],
    },
    /// Enumerated from the local inference endpoint at launch time.
    LocalEndpoint,
    /// Depends on which provider the caller picked.
    ProviderDefined,
}

/// One row of the framework registry.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FrameworkSpec {
    /// Handler kind this row describes.
    pub kind: HandlerKind,
    /// Whether a provider must be named at launch.
    pub needs_provider: bool,
    /// Whether a model must be named at launch.
    pub needs_model: bool,
    /// Provider implied when none is required.
    pub implicit_provider: Option<&'static str>,
    /// Where valid model names come from.
    pub models: ModelSource,
}

const OPENAI_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4.1", "gpt-4.1-mini"];
const ANTHROPIC_MODELS: &[&str] = &[
    "claude-sonnet-4-20250514",
    "claude-opus-4-20250514",
    "claude-3-5-haiku-20241022",
];

/// The registry itself. Order matches operator-facing listings.
pub const FRAMEWORKS: &[FrameworkSpec] = &[
    FrameworkSpec {
        kind: HandlerKind::Echo,
        needs_provider: false,
        needs_model: false,
        implicit_provider: None,
        models: ModelSource::NotApplicable,
    },
    FrameworkSpec {
        kind: HandlerKind::Ollama,
        needs_provider: false,
        needs_model: true,
        implicit_provider: Some("ollama"),
        models: ModelSource::LocalEndpoint,
    },
    FrameworkSpec {
        kind: HandlerKind::Openai,
        needs_provider: false,
        needs_model: true,
        implicit_provider: Some("openai"),
        models: ModelSource::Fixed {
            models: OPENAI_MODELS,
        },
    },
    FrameworkSpec {
        kind: HandlerKind::Anthropic,
        needs_provider: false,
        needs_model: true,
        implicit_provider: Some("anthropic"),
        models: ModelSource::Fixed {
            models: ANTHROPIC_MODELS,
        },
    },
    FrameworkSpec {
        kind: HandlerKind::Graph,
        needs_provider: true,
        needs_model: true,
        implicit_provider: None,
        models: ModelSource::ProviderDefined,
    },
];

/// Errors from launch-request validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The handler kind is not in the registry.
    #[error("unknown handler kind '{kind}'")]
    UnknownKind {
        /// The rejected kind string.
        kind: String,
    },

    /// The kind requires a provider and none was given.
    #[error("handler kind '{kind}' requires a provider")]
    MissingProvider {
        /// The kind that was requested.
        kind: HandlerKind,
    },

    /// The kind requires a model and none was given.
    #[error("handler kind '{kind}' requires a model")]
    MissingModel {
        /// The kind that was requested.
        kind: HandlerKind,
    },

    /// The model is not in the kind's accepted list.
    #[error("model '{model}' is not valid for handler kind '{kind}'")]
    UnknownModel {
        /// The kind that was requested.
        kind: HandlerKind,
        /// The rejected model name.
        model: String,
    },
}

/// Looks up the registry row for a kind.
#[must_use]
pub fn spec_for(kind: HandlerKind) -> &'static FrameworkSpec {
    FRAMEWORKS
        .iter()
        .find(|spec| spec.kind == kind)
        .expect("every handler kind has a registry row")
}

/// Validates a launch request against the registry.
///
/// Model names from [`ModelSource::LocalEndpoint`] kinds are checked by the
/// supervisor against the live endpoint; this function only enforces that a
/// model was named.
///
/// # Errors
///
/// Returns a [`RegistryError`] describing the first unmet requirement.
pub fn validate(
    kind: HandlerKind,
    provider: Option<&str>,
    model: Option<&str>,
) -> Result<(), RegistryError> {
    let spec = spec_for(kind);

    if spec.needs_provider && provider.is_none() {
        return Err(RegistryError::MissingProvider { kind });
    }
    if spec.needs_model && model.is_none() {
        return Err(RegistryError::MissingModel { kind });
    }
    if let (ModelSource::Fixed { models }, Some(model)) = (spec.models, model)
        && !models.iter().any(|m| *m == model)
    {
        return Err(RegistryError::UnknownModel {
            kind,
            model: model.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_needs_nothing() {
        assert!(validate(HandlerKind::Echo, None, None).is_ok());
    }

    #[test]
    fn model_requirements_are_enforced() {
        assert_eq!(
            validate(HandlerKind::Openai, None, None),
            Err(RegistryError::MissingModel {
                kind: HandlerKind::Openai
            })
        );
        assert!(validate(HandlerKind::Openai, None, Some("gpt-4o")).is_ok());
        assert!(matches!(
            validate(HandlerKind::Openai, None, Some("gpt-2")),
            Err(RegistryError::UnknownModel { .. })
        ));
    }

    #[test]
    fn graph_requires_an_explicit_provider() {
        assert_eq!(
            validate(HandlerKind::Graph, None, Some("some-model")),
            Err(RegistryError::MissingProvider {
                kind: HandlerKind::Graph
            })
        );
        assert!(validate(HandlerKind::Graph, Some("anthropic"), Some("some-model")).is_ok());
    }

    #[test]
    fn local_models_are_deferred_to_the_endpoint() {
        // Any model name passes static validation for ollama.
        assert!(validate(HandlerKind::Ollama, None, Some("qwen3:8b")).is_ok());
        assert_eq!(
            validate(HandlerKind::Ollama, None, None),
            Err(RegistryError::MissingModel {
                kind: HandlerKind::Ollama
            })
        );
    }

    #[test]
    fn kind_strings_round_trip() {
        for spec in FRAMEWORKS {
            let parsed: HandlerKind = spec.kind.to_string().parse().unwrap();
            assert_eq!(parsed, spec.kind);
        }
        assert!("lisp-machine".parse::<HandlerKind>().is_err());
    }

    #[test]
    fn every_kind_has_exactly_one_row() {
        for spec in FRAMEWORKS {
            assert_eq!(spec_for(spec.kind).kind, spec.kind);
        }
        assert_eq!(FRAMEWORKS.len(), 5);
    }
}
