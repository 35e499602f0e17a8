//! Deployment ref handling for image-based (rpm-ostree) systems
//!
//! A rebase to a new release keeps the current ref and swaps only the
//! version segment:
//!
//! ```text
//! fedora:fedora/40/x86_64/silverblue  ->  fedora:fedora/42/x86_64/silverblue
//! ```

use crate::types::DistroIdentity;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Failure to obtain or understand the current deployment
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("deployment status query failed: {0}")]
    Query(String),

    #[error("deployment status is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no booted deployment in status output")]
    NoBootedDeployment,

    #[error("unrecognized deployment ref format: {0}")]
    UnrecognizedRefFormat(String),
}

/// A ref split around its version segment
///
/// `base` keeps its trailing `/` and `tail` its leading `/`, so
/// concatenating the three parts reproduces the original string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRef {
    pub base: String,
    pub version_segment: String,
    pub tail: String,
}

impl DeploymentRef {
    /// Parse `<base>/<digits>/<tail>`, using the first all-digit segment
    pub fn parse(reference: &str) -> Result<Self, ProbeError> {
        let segments: Vec<&str> = reference.split('/').collect();

        // The version segment needs a non-empty base before it and a tail after it
        let index = segments
            .iter()
            .enumerate()
            .skip(1)
            .take(segments.len().saturating_sub(2))
            .find(|(_, seg)| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()))
            .map(|(i, _)| i)
            .ok_or_else(|| ProbeError::UnrecognizedRefFormat(reference.to_string()))?;

        let base = segments[..index].join("/");
        let tail = segments[index + 1..].join("/");
        if base.is_empty() || tail.is_empty() {
            return Err(ProbeError::UnrecognizedRefFormat(reference.to_string()));
        }

        Ok(Self {
            base: format!("{}/", base),
            version_segment: segments[index].to_string(),
            tail: format!("/{}", tail),
        })
    }
}

impl fmt::Display for DeploymentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.base, self.version_segment, self.tail)
    }
}

/// Ref for a version-targeted rebase: only the version segment changes
///
/// The target is substituted verbatim; whether it names a real release is
/// only known once the rebase command runs.
pub fn next_ref(current: &DeploymentRef, target_version: &str) -> String {
    format!("{}{}{}", current.base, target_version, current.tail)
}

/// Template ref used when the current deployment cannot be read
pub fn fallback_ref(identity: &DistroIdentity, target_version: &str) -> String {
    format!(
        "fedora:fedora/{}/{}/{}",
        target_version,
        std::env::consts::ARCH,
        identity.variant.as_deref().unwrap_or("silverblue")
    )
}

/// Structured status interface of the image-based system
#[async_trait]
pub trait DeploymentSource: Send + Sync {
    /// Raw JSON status document
    async fn status_json(&self) -> Result<String, ProbeError>;
}

/// `rpm-ostree status --json`
#[derive(Debug, Default)]
pub struct RpmOstreeStatus;

#[async_trait]
impl DeploymentSource for RpmOstreeStatus {
    async fn status_json(&self) -> Result<String, ProbeError> {
        let output = Command::new("rpm-ostree")
            .args(["status", "--json"])
            .output()
            .await
            .map_err(|e| ProbeError::Query(format!("failed to run rpm-ostree: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Query(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    deployments: Vec<Deployment>,
}

#[derive(Debug, Deserialize)]
struct Deployment {
    #[serde(default)]
    booted: bool,
    origin: Option<String>,
    #[serde(rename = "container-image-reference")]
    container_image_reference: Option<String>,
}

/// Reads the booted deployment's ref
#[derive(Clone)]
pub struct RefResolver {
    source: Arc<dyn DeploymentSource>,
}

impl RefResolver {
    pub fn new(source: Arc<dyn DeploymentSource>) -> Self {
        Self { source }
    }

    pub async fn current_ref(&self) -> Result<DeploymentRef, ProbeError> {
        let json = self.source.status_json().await?;
        let reference = booted_ref(&json)?;
        debug!(reference = %reference, "current deployment ref");
        DeploymentRef::parse(&reference)
    }
}

/// Extract the booted deployment's origin ref from a status document
fn booted_ref(json: &str) -> Result<String, ProbeError> {
    let status: StatusDocument = serde_json::from_str(json)?;
    let booted = status
        .deployments
        .into_iter()
        .find(|d| d.booted)
        .ok_or(ProbeError::NoBootedDeployment)?;

    booted
        .origin
        .or(booted.container_image_reference)
        .ok_or_else(|| ProbeError::UnrecognizedRefFormat("<no origin>".to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Canned status document
    pub struct FakeStatus(pub Result<String, String>);

    #[async_trait]
    impl DeploymentSource for FakeStatus {
        async fn status_json(&self) -> Result<String, ProbeError> {
            self.0.clone().map_err(ProbeError::Query)
        }
    }

    pub fn status_with_origin(origin: &str) -> String {
        format!(
            r#"{{"deployments":[
                {{"booted":false,"origin":"fedora:fedora/39/x86_64/silverblue"}},
                {{"booted":true,"origin":"{}","version":"40.20240501.0"}}
            ]}}"#,
            origin
        )
    }

    #[test]
    fn test_parse_and_round_trip() {
        let original = "fedora:fedora/40/x86_64/silverblue";
        let parsed = DeploymentRef::parse(original).unwrap();
        assert_eq!(parsed.base, "fedora:fedora/");
        assert_eq!(parsed.version_segment, "40");
        assert_eq!(parsed.tail, "/x86_64/silverblue");
        assert_eq!(parsed.to_string(), original);
    }

    #[test]
    fn test_next_ref_only_changes_version() {
        let current = DeploymentRef::parse("fedora:fedora/40/x86_64/silverblue").unwrap();
        assert_eq!(next_ref(&current, "42"), "fedora:fedora/42/x86_64/silverblue");
        // Not validated: passed through as-is
        assert_eq!(next_ref(&current, "rawhide"), "fedora:fedora/rawhide/x86_64/silverblue");
    }

    #[test]
    fn test_unrecognized_formats() {
        for bad in [
            "ostree-image-signed:docker://quay.io/fedora/fedora-silverblue:40",
            "40/x86_64/silverblue",
            "fedora:fedora/40",
            "fedora:fedora/40/",
            "",
        ] {
            assert!(
                matches!(DeploymentRef::parse(bad), Err(ProbeError::UnrecognizedRefFormat(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_fallback_ref_uses_variant() {
        let identity = DistroIdentity {
            variant: Some("kinoite".into()),
            is_image_based: true,
            ..DistroIdentity::named("fedora")
        };
        let reference = fallback_ref(&identity, "42");
        assert!(reference.starts_with("fedora:fedora/42/"));
        assert!(reference.ends_with("/kinoite"));
    }

    #[tokio::test]
    async fn test_current_ref_from_booted_deployment() {
        let source = FakeStatus(Ok(status_with_origin("fedora:fedora/40/x86_64/silverblue")));
        let resolver = RefResolver::new(Arc::new(source));

        let current = resolver.current_ref().await.unwrap();
        assert_eq!(current.version_segment, "40");
    }

    #[tokio::test]
    async fn test_current_ref_errors() {
        let resolver = RefResolver::new(Arc::new(FakeStatus(Err("daemon not running".into()))));
        assert!(matches!(resolver.current_ref().await, Err(ProbeError::Query(_))));

        let resolver = RefResolver::new(Arc::new(FakeStatus(Ok("not json".into()))));
        assert!(matches!(resolver.current_ref().await, Err(ProbeError::Json(_))));

        let resolver = RefResolver::new(Arc::new(FakeStatus(Ok(
            r#"{"deployments":[{"booted":false,"origin":"a/1/b"}]}"#.into(),
        ))));
        assert!(matches!(
            resolver.current_ref().await,
            Err(ProbeError::NoBootedDeployment)
        ));
    }
}
