//! Distribution detection
//!
//! Detects:
//! - The distribution ID (and ID_LIKE family hints) from os-release
//! - Whether the system is image-based (rpm-ostree present)
//! - The running kernel release, for display

use crate::types::DistroIdentity;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

/// Marker binary present on image-based (ostree) Fedora variants
pub const IMAGE_MARKER: &str = "/usr/bin/rpm-ostree";

/// Reads the live system every time `detect` is called; nothing is cached
#[derive(Debug, Clone)]
pub struct DistroProbe {
    release_files: Vec<PathBuf>,
    lsb_file: PathBuf,
    image_markers: Vec<PathBuf>,
    kernel_file: PathBuf,
}

impl Default for DistroProbe {
    fn default() -> Self {
        Self {
            release_files: vec![
                PathBuf::from("/etc/os-release"),
                PathBuf::from("/usr/lib/os-release"),
            ],
            lsb_file: PathBuf::from("/etc/lsb-release"),
            image_markers: vec![PathBuf::from(IMAGE_MARKER)],
            kernel_file: PathBuf::from("/proc/sys/kernel/osrelease"),
        }
    }
}

impl DistroProbe {
    /// Probe with custom file locations (used by tests)
    pub fn with_paths(
        release_files: Vec<PathBuf>,
        lsb_file: PathBuf,
        image_markers: Vec<PathBuf>,
        kernel_file: PathBuf,
    ) -> Self {
        Self {
            release_files,
            lsb_file,
            image_markers,
            kernel_file,
        }
    }

    /// Detect the running distribution
    ///
    /// Never fails: missing or unparsable descriptors yield an "unknown"
    /// identity, which the dispatch table maps to an unimplemented plan.
    pub fn detect(&self) -> DistroIdentity {
        let mut identity = match self.read_os_release() {
            Some(identity) => identity,
            None => match self.read_lsb_release() {
                Some(name) => {
                    warn!(distro = %name, "os-release unavailable, using lsb-release");
                    DistroIdentity::named(&name)
                }
                None => {
                    warn!("could not detect distribution, falling back to unknown");
                    DistroIdentity::unknown()
                }
            },
        };

        identity.is_image_based = self.image_markers.iter().any(|p| p.exists());
        identity.kernel = self.kernel_release();

        debug!(
            distro = %identity.name,
            image_based = identity.is_image_based,
            "detected distribution"
        );
        identity
    }

    fn read_os_release(&self) -> Option<DistroIdentity> {
        let content = self
            .release_files
            .iter()
            .find_map(|path| fs::read_to_string(path).ok())?;
        let fields = parse_key_values(&content);

        let name = fields.get("ID").map(|id| id.to_lowercase())?;
        if name.is_empty() {
            return None;
        }

        Some(DistroIdentity {
            name,
            like: fields
                .get("ID_LIKE")
                .map(|l| l.split_whitespace().map(|s| s.to_lowercase()).collect())
                .unwrap_or_default(),
            pretty_name: fields.get("PRETTY_NAME").cloned(),
            variant: fields.get("VARIANT_ID").map(|v| v.to_lowercase()),
            is_image_based: false,
            kernel: None,
        })
    }

    fn read_lsb_release(&self) -> Option<String> {
        let content = fs::read_to_string(&self.lsb_file).ok()?;
        parse_key_values(&content)
            .get("DISTRIB_ID")
            .map(|id| id.to_lowercase())
            .filter(|id| !id.is_empty())
    }

    fn kernel_release(&self) -> Option<String> {
        if let Ok(release) = fs::read_to_string(&self.kernel_file) {
            let release = release.trim().to_string();
            if !release.is_empty() {
                return Some(release);
            }
        }

        // Fallback to uname
        let output = Command::new("uname").arg("-r").output().ok()?;
        let release = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if release.is_empty() {
            None
        } else {
            Some(release)
        }
    }
}

/// Parse a shell-style KEY=VALUE descriptor (os-release, lsb-release)
fn parse_key_values(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    value
}
