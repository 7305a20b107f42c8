//! Scope guard: every resource a step touches must sit inside its scope.
//!
//! Filesystem resources match by path-component prefix against `fs_roots`.
//! Both sides are resolved first: symlinks along the part of the path that
//! exists are followed, the remainder is folded lexically. A link inside a
//! root therefore counts as wherever it points.
//! Network resources are anything containing `://`; their host must match a
//! `network_hosts` entry exactly or through `*` (one DNS label), and the
//! scope must allow network access at all. Nothing is granted implicitly.

use crate::internal::{
    plan::{intent::Scope, ir::Step},
    tools::spec::ToolDescriptor,
};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

const MAX_LINK_DEPTH: usize = 40;

/// Expands `~` and anchors relative paths at the working directory.
fn anchor(raw: &str) -> PathBuf {
    let expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
            PathBuf::from(format!("{}{}", home, rest))
        }
        _ => PathBuf::from(raw),
    };

    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(expanded)
    }
}

fn resolve_from(path: &Path, depth: usize) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                match std::fs::canonicalize(&resolved) {
                    Ok(real) => resolved = real,
                    // Dangling link: it still names its target.
                    Err(_) if depth < MAX_LINK_DEPTH => {
                        if let Ok(target) = std::fs::read_link(&resolved) {
                            resolved.pop();
                            let joined = resolved.join(target);
                            resolved = resolve_from(&joined, depth + 1);
                        }
                    }
                    Err(_) => {}
                }
            }
        }
    }
    resolved
}

/// Absolute form of `raw` as the filesystem would see it: `~` expanded,
/// symlinks in the existing prefix followed, `.` / `..` folded.
pub fn resolve_path(raw: &str) -> PathBuf {
    resolve_from(&anchor(raw), 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Path(PathBuf),
    Host(String),
    Invalid(String),
}

impl Resource {
    pub fn parse(raw: &str) -> Self {
        if raw.contains("://") {
            return match reqwest::Url::parse(raw) {
                Ok(url) => match url.host_str() {
                    Some(host) => Resource::Host(host.to_ascii_lowercase()),
                    None => Resource::Invalid(raw.to_string()),
                },
                Err(_) => Resource::Invalid(raw.to_string()),
            };
        }
        if raw.trim().is_empty() {
            return Resource::Invalid(raw.to_string());
        }
        Resource::Path(resolve_path(raw))
    }
}

pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if !pattern.contains('*') {
        return pattern == host;
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^.]+");
    Regex::new(&format!("^{}$", body))
        .map(|re| re.is_match(&host))
        .unwrap_or(false)
}

fn path_within_roots(path: &Path, roots: &[String]) -> bool {
    roots.iter().any(|root| path.starts_with(resolve_path(root)))
}

/// True when `raw` is covered by `scope`.
pub fn in_scope(raw: &str, scope: &Scope) -> bool {
    match Resource::parse(raw) {
        Resource::Path(path) => path_within_roots(&path, &scope.fs_roots),
        Resource::Host(host) => {
            scope.allow_network && scope.network_hosts.iter().any(|p| host_matches(p, &host))
        }
        Resource::Invalid(_) => false,
    }
}

/// Every resource a step targets: declared effects plus the tool's resource inputs.
pub fn resource_targets(step: &Step, tool: Option<&ToolDescriptor>) -> Vec<String> {
    let mut targets: Vec<String> = step.declared_resources().map(str::to_string).collect();
    if let Some(tool) = tool {
        for field in &tool.resource_inputs {
            match step.inputs.get(field) {
                Some(Value::String(s)) => targets.push(s.clone()),
                Some(Value::Array(items)) => {
                    targets.extend(items.iter().filter_map(Value::as_str).map(str::to_string))
                }
                _ => {}
            }
        }
    }
    targets
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeCheck {
    pub targets: Vec<String>,
    pub violations: Vec<String>,
}

impl ScopeCheck {
    pub fn is_allowed(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct ScopeGuard;

impl ScopeGuard {
    pub fn check(step: &Step, tool: Option<&ToolDescriptor>, scope: &Scope) -> ScopeCheck {
        let targets = resource_targets(step, tool);
        let violations = targets
            .iter()
            .filter(|target| !in_scope(target, scope))
            .cloned()
            .collect();
        ScopeCheck {
            targets,
            violations,
        }
    }
}

/// Checks `inner ⊆ outer`. Returns the first widening found.
pub fn scope_within(inner: &Scope, outer: &Scope) -> Result<(), String> {
    for root in &inner.fs_roots {
        if !path_within_roots(&resolve_path(root), &outer.fs_roots) {
            return Err(format!("fs root {} is outside the intent scope", root));
        }
    }
    if inner.allow_network && !outer.allow_network {
        return Err("network access is not allowed by the intent scope".to_string());
    }
    for pattern in &inner.network_hosts {
        let covered = outer.network_hosts.iter().any(|outer_pattern| {
            outer_pattern.eq_ignore_ascii_case(pattern)
                || (!pattern.contains('*') && host_matches(outer_pattern, pattern))
        });
        if !covered {
            return Err(format!("network host {} is outside the intent scope", pattern));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::plan::ir::Phase;
    use serde_json::json;

    #[test]
    fn dot_dot_cannot_escape_a_root() {
        let scope = Scope::fs(["/tmp/a"]);
        assert!(in_scope("/tmp/a/b/c.txt", &scope));
        assert!(in_scope("/tmp/a", &scope));
        assert!(!in_scope("/tmp/a/../b", &scope));
        assert!(!in_scope("/tmp/ab", &scope));
        assert!(!in_scope("/etc/passwd", &scope));
    }

    #[test]
    fn network_requires_flag_and_listed_host() {
        let closed = Scope::fs(["/tmp/a"]);
        assert!(!in_scope("https://api.example.com/ping", &closed));

        let open = Scope::fs(["/tmp/a"]).with_network(["*.example.com", "hooks.slack.com"]);
        assert!(in_scope("https://api.example.com/ping", &open));
        assert!(in_scope("https://hooks.slack.com/x", &open));
        assert!(!in_scope("https://a.b.example.com/", &open));
        assert!(!in_scope("https://evil.com/", &open));
    }

    #[test]
    fn tool_resource_inputs_are_checked() {
        let tool = ToolDescriptor::new("fs.stat").resource_inputs(&["path"]);
        let step = Step::new("s1", Phase::Staging, "fs.stat").with_input("path", json!("/"));
        let check = ScopeGuard::check(&step, Some(&tool), &Scope::fs(["/tmp/a"]));
        assert!(!check.is_allowed());
        assert_eq!(check.violations, vec!["/".to_string()]);
    }

    #[test]
    fn plan_scope_may_narrow_but_not_widen() {
        let intent = Scope::fs(["/tmp/a"]).with_network(["*.example.com"]);
        assert!(scope_within(&Scope::fs(["/tmp/a/sub"]), &intent).is_ok());
        assert!(scope_within(&Scope::fs(["/tmp"]), &intent).is_err());
        assert!(scope_within(
            &Scope::fs(["/tmp/a"]).with_network(["api.example.com"]),
            &intent
        )
        .is_ok());
        assert!(scope_within(&Scope::fs(["/tmp/a"]).with_network(["*.com"]), &intent).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_judged_by_their_target() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("in");
        let outside = dir.path().join("out");
        std::fs::create_dir_all(inside.join("sub")).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, inside.join("link")).unwrap();
        std::os::unix::fs::symlink(inside.join("sub"), inside.join("alias")).unwrap();
        std::os::unix::fs::symlink(outside.join("missing"), inside.join("dangling")).unwrap();

        let scope = Scope::fs([inside.to_string_lossy().into_owned()]);
        let at = |rel: &str| inside.join(rel).to_string_lossy().into_owned();

        assert!(!in_scope(&at("link"), &scope));
        assert!(!in_scope(&at("link/created"), &scope));
        assert!(!in_scope(&at("alias/../link/x"), &scope));
        assert!(!in_scope(&at("dangling/x"), &scope));
        assert!(in_scope(&at("alias/new.txt"), &scope));
        assert!(in_scope(&at("sub/../fresh"), &scope));
        assert!(in_scope(&at("link/../in/ok"), &scope));
    }
}
