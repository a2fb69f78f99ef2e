//! Capability gate
//!
//! Decides whether a named effect may run. Filesystem effects are first
//! checked for root containment; then the guarantee layers are consulted,
//! highest first: per-tool override, app policy, the subject's pack, engine
//! default (allow). Every decision is recorded exactly once as a
//! `capability_check` trace event.

use super::context::ExecutionContext;
use super::errors::{self, EngineError, ErrorKind};
use super::trace::{GuaranteeSource, TraceEvent};
use super::types::Effect;
use crate::config::CapabilityConfig;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Who is asking: a tool, an AI profile, or the engine itself
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub name: &'a str,
    pub pack: Option<&'a str>,
}

impl<'a> Subject<'a> {
    pub const ENGINE: Subject<'static> = Subject {
        name: "engine",
        pack: None,
    };

    pub fn tool(name: &'a str, pack: Option<&'a str>) -> Self {
        Self { name, pack }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityCheck {
    pub capability: Effect,
    pub allowed: bool,
    pub source: GuaranteeSource,
    pub reason: String,
    pub message: String,
}

/// Resolve a decision without recording it
pub fn resolve(
    config: &CapabilityConfig,
    project_root: Option<&Path>,
    effect: Effect,
    subject: Subject<'_>,
    target: Option<&str>,
) -> CapabilityCheck {
    if effect.is_filesystem() {
        if let Some(target) = target {
            if let Some(check) = check_roots(config, project_root, effect, target) {
                return check;
            }
        }
    }

    let guarantee = effect.guarantee();
    let layers = [
        (GuaranteeSource::Tool, config.tools.get(subject.name)),
        (GuaranteeSource::Policy, Some(&config.policy)),
    ];
    let packs = config
        .packs
        .iter()
        .filter(|pack| subject.pack == Some(pack.name.as_str()))
        .map(|pack| (GuaranteeSource::Pack, Some(&pack.guarantees)));

    for (source, guarantees) in layers.into_iter().chain(packs) {
        let Some(forbidden) = guarantees.and_then(|g| g.get(&guarantee)) else {
            continue;
        };
        return if *forbidden {
            CapabilityCheck {
                capability: effect,
                allowed: false,
                source,
                reason: errors::GUARANTEE_DENIED.to_string(),
                message: format!(
                    "Capability '{}' is forbidden for '{}' by the {} guarantee '{}'",
                    effect.as_str(),
                    subject.name,
                    source_name(source),
                    guarantee
                ),
            }
        } else {
            CapabilityCheck {
                capability: effect,
                allowed: true,
                source,
                reason: "explicitly_allowed".to_string(),
                message: format!("Capability '{}' allowed by {} override", effect.as_str(), source_name(source)),
            }
        };
    }

    CapabilityCheck {
        capability: effect,
        allowed: true,
        source: GuaranteeSource::Engine,
        reason: "engine_default".to_string(),
        message: format!("Capability '{}' allowed by engine default", effect.as_str()),
    }
}

fn source_name(source: GuaranteeSource) -> &'static str {
    match source {
        GuaranteeSource::Engine => "engine",
        GuaranteeSource::Pack => "pack",
        GuaranteeSource::Policy => "policy",
        GuaranteeSource::Tool => "tool",
    }
}

/// Root containment; `None` when the path is inside a root or no roots apply
fn check_roots(
    config: &CapabilityConfig,
    project_root: Option<&Path>,
    effect: Effect,
    target: &str,
) -> Option<CapabilityCheck> {
    let roots: Vec<PathBuf> = if config.allowed_roots.is_empty() {
        project_root.map(|p| vec![p.to_path_buf()]).unwrap_or_default()
    } else {
        config.allowed_roots.clone()
    };
    if roots.is_empty() {
        return None;
    }

    let base = project_root.unwrap_or_else(|| Path::new("."));
    let resolved = normalize(&base.join(target));
    let inside = roots
        .iter()
        .map(|root| normalize(&base.join(root)))
        .any(|root| resolved.starts_with(&root));
    if inside {
        return None;
    }
    Some(CapabilityCheck {
        capability: effect,
        allowed: false,
        source: GuaranteeSource::Engine,
        reason: errors::PATH_OUTSIDE_ROOT.to_string(),
        message: format!(
            "Path '{}' resolves outside the allowed roots for {}",
            target,
            effect.as_str()
        ),
    })
}

/// Lexical normalization: drops `.` and resolves `..` without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve and record a decision; the caller decides what a denial means
pub fn check(
    ctx: &mut ExecutionContext<'_>,
    effect: Effect,
    subject: Subject<'_>,
    target: Option<&str>,
    step_id: &str,
) -> CapabilityCheck {
    let project_root = ctx.config.project_root.as_deref();
    let decision = resolve(&ctx.config.capabilities, project_root, effect, subject, target);
    if !decision.allowed {
        warn!(capability = effect.as_str(), subject = subject.name, reason = %decision.reason, "Capability denied");
    }
    ctx.trace(TraceEvent::CapabilityCheck {
        step_id: step_id.to_string(),
        capability: effect.as_str().to_string(),
        allowed: decision.allowed,
        source: decision.source,
        reason: decision.reason.clone(),
        subject: subject.name.to_string(),
        target: target.map(str::to_string),
    });
    decision
}

/// Resolve, record and raise `CapabilityViolation` on denial
pub fn enforce(
    ctx: &mut ExecutionContext<'_>,
    effect: Effect,
    subject: Subject<'_>,
    target: Option<&str>,
    step_id: &str,
) -> Result<CapabilityCheck, EngineError> {
    let decision = check(ctx, effect, subject, target, step_id);
    if decision.allowed {
        return Ok(decision);
    }
    let hint = if decision.reason == errors::PATH_OUTSIDE_ROOT {
        "Use a path inside the project or add its directory to capabilities.allowed_roots.".to_string()
    } else {
        format!(
            "Set {} = false for '{}' under capabilities.tools, or remove the guarantee.",
            effect.guarantee(),
            subject.name
        )
    };
    Err(
        EngineError::new(ErrorKind::CapabilityViolation, &decision.reason, decision.message.clone())
            .with_capability(effect.as_str())
            .with_step(step_id)
            .with_hint(hint),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackConfig;
    use maplit::btreemap;

    fn config() -> CapabilityConfig {
        CapabilityConfig {
            packs: vec![PackConfig {
                name: "files".to_string(),
                guarantees: btreemap! { "no_filesystem_write".to_string() => true },
            }],
            policy: btreemap! { "no_network".to_string() => true },
            tools: btreemap! {
                "fetch".to_string() => btreemap! { "no_network".to_string() => false },
                "writer".to_string() => btreemap! { "no_filesystem_write".to_string() => false },
            },
            allowed_roots: vec![PathBuf::from("/srv/app")],
        }
    }

    #[test]
    fn test_engine_default_allows() {
        let check = resolve(&config(), None, Effect::Subprocess, Subject::tool("shell", None), None);
        assert!(check.allowed);
        assert_eq!(check.source, GuaranteeSource::Engine);
    }

    #[test]
    fn test_policy_denies_and_tool_override_wins() {
        let denied = resolve(&config(), None, Effect::Network, Subject::tool("crawl", None), None);
        assert!(!denied.allowed);
        assert_eq!(denied.source, GuaranteeSource::Policy);

        let allowed = resolve(&config(), None, Effect::Network, Subject::tool("fetch", None), None);
        assert!(allowed.allowed);
        assert_eq!(allowed.source, GuaranteeSource::Tool);
    }

    #[test]
    fn test_pack_applies_only_to_its_tools() {
        let target = Some("/srv/app/out.txt");
        let packed = resolve(&config(), None, Effect::FilesystemWrite, Subject::tool("save", Some("files")), target);
        assert!(!packed.allowed);
        assert_eq!(packed.source, GuaranteeSource::Pack);

        let unpacked = resolve(&config(), None, Effect::FilesystemWrite, Subject::tool("save", None), target);
        assert!(unpacked.allowed);

        let overridden = resolve(&config(), None, Effect::FilesystemWrite, Subject::tool("writer", Some("files")), target);
        assert!(overridden.allowed);
        assert_eq!(overridden.source, GuaranteeSource::Tool);
    }

    #[test]
    fn test_root_containment_is_checked_first_with_distinct_message() {
        let escaped = resolve(
            &config(),
            None,
            Effect::FilesystemWrite,
            Subject::tool("writer", None),
            Some("/srv/app/../etc/passwd"),
        );
        assert!(!escaped.allowed);
        assert_eq!(escaped.reason, errors::PATH_OUTSIDE_ROOT);
        assert!(escaped.message.contains("outside the allowed roots"));

        let forbidden = resolve(
            &config(),
            None,
            Effect::FilesystemWrite,
            Subject::tool("save", Some("files")),
            Some("/srv/app/data.txt"),
        );
        assert_eq!(forbidden.reason, errors::GUARANTEE_DENIED);
        assert_ne!(escaped.message, forbidden.message);
    }

    #[test]
    fn test_relative_paths_resolve_against_project_root() {
        let mut cfg = config();
        cfg.allowed_roots.clear();
        let root = Path::new("/work/project");
        let inside = resolve(&cfg, Some(root), Effect::FilesystemRead, Subject::ENGINE, Some("data/a.csv"));
        assert!(inside.allowed);
        let outside = resolve(&cfg, Some(root), Effect::FilesystemRead, Subject::ENGINE, Some("../secret"));
        assert_eq!(outside.reason, errors::PATH_OUTSIDE_ROOT);
    }

    #[test]
    fn test_normalize_is_lexical() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
    }
}
