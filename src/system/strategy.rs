//! Intent -> command plan dispatch
//!
//! Maps a detected distribution and an intent onto the fixed, ordered
//! command template for its family. Resolution is pure: the same identity,
//! intent and target always produce the same plan.

use crate::types::{CommandStep, DistroIdentity, Intent, Plan, TargetKind, TargetPrompt};

/// Default package list installed by Setup
pub const SETUP_PACKAGES: &[&str] = &["git", "curl", "htop"];

/// Source of command plans, selected once when the orchestrator is built
pub trait CommandStrategy: Send + Sync {
    /// Prompt to show when the path for this intent needs a target version
    fn target_prompt(&self, identity: &DistroIdentity, intent: Intent) -> Option<TargetPrompt>;

    /// Resolve the plan for an intent
    ///
    /// `target` is the full deployment ref for image-based upgrades and the
    /// channel name for channel-based upgrades; ignored elsewhere.
    fn resolve(&self, identity: &DistroIdentity, intent: Intent, target: Option<&str>) -> Plan;
}

/// Group of distributions sharing one command template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Fedora,
    Ostree,
    Debian,
    Arch,
    Suse,
    Bazzite,
    Nobara,
    NixOs,
}

impl Family {
    /// Family for a single os-release ID
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "fedora" | "rhel" | "centos" => Some(Family::Fedora),
            "ubuntu" | "debian" => Some(Family::Debian),
            "arch" | "manjaro" => Some(Family::Arch),
            "opensuse" | "suse" | "opensuse-tumbleweed" | "opensuse-leap" => Some(Family::Suse),
            "bazzite" => Some(Family::Bazzite),
            "nobara" => Some(Family::Nobara),
            "nixos" => Some(Family::NixOs),
            _ => None,
        }
    }

    /// Classify an identity, routing image-based Fedora members to the ostree branch
    pub fn classify(identity: &DistroIdentity) -> Option<Self> {
        let family = Self::from_id(&identity.name).or_else(|| {
            identity
                .like
                .iter()
                .find_map(|like| Self::from_id(like))
        })?;

        if family == Family::Fedora && identity.is_image_based {
            Some(Family::Ostree)
        } else {
            Some(family)
        }
    }

    fn note(&self) -> Option<&'static str> {
        match self {
            Family::Ostree => Some("rpm-ostree system"),
            Family::Bazzite => Some("using Topgrade"),
            Family::Nobara => Some("using nobara-sync"),
            _ => None,
        }
    }
}

/// Human-readable distribution line, e.g. "Fedora (rpm-ostree system)"
pub fn describe(identity: &DistroIdentity) -> String {
    if identity.is_unknown() {
        return "Unknown".to_string();
    }
    match Family::classify(identity).and_then(|f| f.note()) {
        Some(note) => format!("{} ({})", identity.title(), note),
        None => identity.title(),
    }
}

/// The built-in dispatch table
#[derive(Debug, Clone)]
pub struct DistroTable {
    setup_packages: Vec<String>,
}

impl Default for DistroTable {
    fn default() -> Self {
        Self::new(SETUP_PACKAGES.iter().map(|p| p.to_string()).collect())
    }
}

impl DistroTable {
    pub fn new(setup_packages: Vec<String>) -> Self {
        Self { setup_packages }
    }

    fn update(&self, family: Family) -> Option<Vec<CommandStep>> {
        let steps = match family {
            Family::Fedora => vec![dnf_upgrade()],
            Family::Ostree => vec![CommandStep::new("rpm-ostree", &["upgrade"])],
            Family::Debian => vec![apt_update()],
            Family::Arch => vec![pacman_syu()],
            Family::Suse => vec![zypper_dup()],
            Family::Bazzite => vec![topgrade()],
            Family::Nobara => vec![CommandStep::new("nobara-sync", &["cli"])],
            Family::NixOs => vec![
                CommandStep::new("nix-channel", &["--update"]).privileged(),
                nixos_rebuild(),
            ],
        };
        Some(steps)
    }

    fn upgrade(&self, family: Family, target: Option<&str>) -> Result<Option<Vec<CommandStep>>, MissingTarget> {
        let steps = match family {
            Family::Fedora => vec![dnf_upgrade()],
            Family::Ostree => {
                let new_ref = target.ok_or(MissingTarget)?;
                vec![
                    CommandStep::new("rpm-ostree", &["status"]).allow_failure(),
                    CommandStep::new("rpm-ostree", &["rebase", new_ref]),
                ]
            }
            Family::Debian => vec![
                apt_update(),
                CommandStep::new("apt", &["upgrade", "-y"]).privileged(),
                CommandStep::new("do-release-upgrade", &["-f", "DistUpgradeViewNonInteractive"])
                    .privileged(),
            ],
            Family::Arch => vec![pacman_syu()],
            Family::Suse => vec![zypper_dup()],
            Family::Bazzite => vec![topgrade()],
            Family::Nobara => return Ok(None),
            Family::NixOs => {
                let channel = target.ok_or(MissingTarget)?;
                let url = format!("https://nixos.org/channels/{}", channel);
                vec![
                    CommandStep::new("nix-channel", &["--add", url.as_str(), "nixos"]).privileged(),
                    CommandStep::new("nix-channel", &["--update"]).privileged(),
                    nixos_rebuild(),
                ]
            }
        };
        Ok(Some(steps))
    }

    fn setup(&self, family: Family) -> Option<Vec<CommandStep>> {
        let packages = &self.setup_packages;
        let steps = match family {
            Family::Fedora | Family::Nobara => {
                vec![CommandStep::new("dnf", &["install", "-y"])
                    .privileged()
                    .with_args(packages.iter().cloned())]
            }
            Family::Ostree | Family::Bazzite => {
                vec![CommandStep::new("rpm-ostree", &["install", "--idempotent"])
                    .with_args(packages.iter().cloned())]
            }
            Family::Debian => vec![
                apt_update(),
                CommandStep::new("apt", &["install", "-y"])
                    .privileged()
                    .with_args(packages.iter().cloned()),
            ],
            Family::Arch => {
                vec![CommandStep::new("pacman", &["-S", "--needed", "--noconfirm"])
                    .privileged()
                    .with_args(packages.iter().cloned())]
            }
            Family::Suse => {
                vec![CommandStep::new("zypper", &["install", "-y"])
                    .privileged()
                    .with_args(packages.iter().cloned())]
            }
            // Packages are declared in configuration.nix, not installed imperatively
            Family::NixOs => return None,
        };
        Some(steps)
    }
}

/// A version-targeted path was resolved without its target
struct MissingTarget;

impl CommandStrategy for DistroTable {
    fn target_prompt(&self, identity: &DistroIdentity, intent: Intent) -> Option<TargetPrompt> {
        if intent != Intent::Upgrade {
            return None;
        }
        match Family::classify(identity)? {
            Family::Ostree => Some(TargetPrompt {
                kind: TargetKind::DeploymentVersion,
                message: "Enter the release version to rebase to (leave blank to skip)".into(),
                example: "42".into(),
            }),
            Family::NixOs => Some(TargetPrompt {
                kind: TargetKind::Channel,
                message: "Enter the NixOS channel to upgrade to (leave blank to skip)".into(),
                example: "nixos-24.05".into(),
            }),
            _ => None,
        }
    }

    fn resolve(&self, identity: &DistroIdentity, intent: Intent, target: Option<&str>) -> Plan {
        // Restart is an OS-level reboot, independent of the distribution
        if intent == Intent::Restart {
            return Plan::execute(intent, vec![reboot()]);
        }

        let family = match Family::classify(identity) {
            Some(family) => family,
            None => return Plan::unimplemented(intent),
        };

        let steps = match intent {
            Intent::Update => self.update(family),
            Intent::Upgrade => match self.upgrade(family, target) {
                Ok(steps) => steps,
                Err(MissingTarget) => return Plan::missing_target(intent),
            },
            Intent::Setup => self.setup(family),
            Intent::Restart => Some(vec![reboot()]),
        };

        match steps {
            Some(steps) => Plan::execute(intent, steps),
            None => Plan::unimplemented(intent),
        }
    }
}

// Shared step templates

fn dnf_upgrade() -> CommandStep {
    CommandStep::new("dnf", &["upgrade", "--refresh", "-y"]).privileged()
}

fn apt_update() -> CommandStep {
    CommandStep::new("apt", &["update"]).privileged()
}

fn pacman_syu() -> CommandStep {
    CommandStep::new("pacman", &["-Syu", "--noconfirm"]).privileged()
}

fn zypper_dup() -> CommandStep {
    CommandStep::new("zypper", &["dup", "-y"]).privileged()
}

fn topgrade() -> CommandStep {
    CommandStep::new("topgrade", &["--yes"])
}

fn reboot() -> CommandStep {
    CommandStep::new("reboot", &[]).privileged()
}

fn nixos_rebuild() -> CommandStep {
    CommandStep::new("nixos-rebuild", &["switch", "--upgrade"]).privileged()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlanPolicy;

    fn identity(name: &str) -> DistroIdentity {
        DistroIdentity::named(name)
    }

    fn image_based(name: &str) -> DistroIdentity {
        DistroIdentity {
            is_image_based: true,
            ..DistroIdentity::named(name)
        }
    }

    fn commands(plan: &Plan) -> Vec<String> {
        plan.steps.iter().map(|s| s.display()).collect()
    }

    #[test]
    fn test_debian_update_is_single_apt_update() {
        let table = DistroTable::default();
        for name in ["ubuntu", "debian"] {
            let plan = table.resolve(&identity(name), Intent::Update, None);
            assert_eq!(plan.policy, PlanPolicy::Execute);
            assert_eq!(commands(&plan), vec!["apt update"]);
            assert!(plan.steps[0].requires_privilege);
        }
    }

    #[test]
    fn test_arch_upgrade() {
        let table = DistroTable::default();
        for name in ["arch", "manjaro"] {
            let plan = table.resolve(&identity(name), Intent::Upgrade, None);
            assert_eq!(commands(&plan), vec!["pacman -Syu --noconfirm"]);
        }
    }

    #[test]
    fn test_debian_upgrade_order() {
        let plan = DistroTable::default().resolve(&identity("ubuntu"), Intent::Upgrade, None);
        assert_eq!(
            commands(&plan),
            vec![
                "apt update",
                "apt upgrade -y",
                "do-release-upgrade -f DistUpgradeViewNonInteractive",
            ]
        );
    }

    #[test]
    fn test_known_families_resolve_non_empty() {
        let table = DistroTable::default();
        let names = [
            "fedora", "rhel", "centos", "ubuntu", "debian", "arch", "manjaro", "opensuse", "suse",
            "bazzite", "nobara", "nixos",
        ];
        for name in names {
            for intent in [Intent::Update, Intent::Restart] {
                let plan = table.resolve(&identity(name), intent, None);
                assert_eq!(plan.policy, PlanPolicy::Execute, "{} {}", name, intent);
                assert!(!plan.is_empty(), "{} {}", name, intent);
            }
        }
    }

    #[test]
    fn test_unknown_distro_is_unimplemented() {
        let table = DistroTable::default();
        for intent in [Intent::Update, Intent::Upgrade, Intent::Setup] {
            let plan = table.resolve(&identity("gentoo"), intent, None);
            assert_eq!(plan.policy, PlanPolicy::Unimplemented);
            assert!(plan.is_empty());
        }
    }

    #[test]
    fn test_restart_is_distro_independent() {
        let table = DistroTable::default();
        let plan = table.resolve(&DistroIdentity::unknown(), Intent::Restart, None);
        assert_eq!(commands(&plan), vec!["reboot"]);
        assert!(plan.steps[0].requires_privilege);
    }

    #[test]
    fn test_image_based_fedora_routes_to_ostree() {
        let table = DistroTable::default();
        let plan = table.resolve(&image_based("fedora"), Intent::Update, None);
        assert_eq!(commands(&plan), vec!["rpm-ostree upgrade"]);
        assert!(!plan.steps[0].requires_privilege);

        let plan = table.resolve(&identity("fedora"), Intent::Update, None);
        assert_eq!(commands(&plan), vec!["dnf upgrade --refresh -y"]);
    }

    #[test]
    fn test_ostree_upgrade_needs_target() {
        let table = DistroTable::default();
        let silverblue = image_based("fedora");

        let prompt = table.target_prompt(&silverblue, Intent::Upgrade).unwrap();
        assert_eq!(prompt.kind, TargetKind::DeploymentVersion);
        assert!(table.target_prompt(&silverblue, Intent::Update).is_none());

        let plan = table.resolve(&silverblue, Intent::Upgrade, None);
        assert_eq!(plan.policy, PlanPolicy::MissingTarget);

        let plan = table.resolve(
            &silverblue,
            Intent::Upgrade,
            Some("fedora:fedora/42/x86_64/silverblue"),
        );
        assert_eq!(
            commands(&plan),
            vec!["rpm-ostree status", "rpm-ostree rebase fedora:fedora/42/x86_64/silverblue"]
        );
        assert!(plan.steps[0].allow_failure);
        assert!(!plan.steps[1].allow_failure);
    }

    #[test]
    fn test_nixos_upgrade_channel() {
        let table = DistroTable::default();
        let nixos = identity("nixos");

        let prompt = table.target_prompt(&nixos, Intent::Upgrade).unwrap();
        assert_eq!(prompt.kind, TargetKind::Channel);

        let plan = table.resolve(&nixos, Intent::Upgrade, Some("nixos-24.05"));
        assert_eq!(
            commands(&plan),
            vec![
                "nix-channel --add https://nixos.org/channels/nixos-24.05 nixos",
                "nix-channel --update",
                "nixos-rebuild switch --upgrade",
            ]
        );
    }

    #[test]
    fn test_setup_uses_configured_packages() {
        let table = DistroTable::new(vec!["vim".into(), "tmux".into()]);
        let plan = table.resolve(&identity("arch"), Intent::Setup, None);
        assert_eq!(commands(&plan), vec!["pacman -S --needed --noconfirm vim tmux"]);

        let plan = table.resolve(&identity("nixos"), Intent::Setup, None);
        assert_eq!(plan.policy, PlanPolicy::Unimplemented);
    }

    #[test]
    fn test_nobara_upgrade_unimplemented() {
        let plan = DistroTable::default().resolve(&identity("nobara"), Intent::Upgrade, None);
        assert_eq!(plan.policy, PlanPolicy::Unimplemented);
    }

    #[test]
    fn test_id_like_fallback() {
        let mint = DistroIdentity {
            like: vec!["ubuntu".into(), "debian".into()],
            ..DistroIdentity::named("linuxmint")
        };
        assert_eq!(Family::classify(&mint), Some(Family::Debian));
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&image_based("fedora")), "Fedora (rpm-ostree system)");
        assert_eq!(describe(&identity("bazzite")), "Bazzite (using Topgrade)");
        assert_eq!(describe(&identity("arch")), "Arch");
        assert_eq!(describe(&DistroIdentity::unknown()), "Unknown");
    }
}
