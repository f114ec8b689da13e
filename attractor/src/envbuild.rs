//! Stage environment construction.
//!
//! Every stage runs in an environment derived from the ambient process env:
//! nested-session markers are stripped, toolchain paths are pinned to
//! absolute values so later HOME rewrites cannot break them, and CLI
//! backends with Codex-like semantics get a fully isolated home directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

/// Env vars that hold CLI state directories and must be absolute before a
/// subprocess changes its working directory.
pub const CLI_STATE_VARS: &[&str] = &["CODEX_HOME", "CLAUDE_CONFIG_DIR", "GEMINI_CONFIG_DIR"];

/// Builds the base environment for a stage as an ordered key/value list.
///
/// Overrides replace existing entries in place; new keys are appended in
/// sorted order so the result is stable across runs.
pub fn base_env(
    worktree: Option<&Path>,
    overrides: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let ambient: Vec<(String, String)> = std::env::vars().collect();
    base_env_from(ambient, worktree, overrides)
}

/// Same as [`base_env`] but over an explicit ambient snapshot (testable).
pub fn base_env_from(
    ambient: Vec<(String, String)>,
    worktree: Option<&Path>,
    overrides: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = ambient
        .into_iter()
        .filter(|(k, _)| k != "CLAUDECODE")
        .collect();

    let home = lookup(&env, "HOME").unwrap_or_default();
    let pin = |env: &mut Vec<(String, String)>, key: &str, value: String| {
        if lookup(env, key).is_none() && !value.is_empty() {
            env.push((key.to_string(), value));
        }
    };

    if !home.is_empty() {
        pin(&mut env, "CARGO_HOME", format!("{home}/.cargo"));
        pin(&mut env, "RUSTUP_HOME", format!("{home}/.rustup"));
        pin(&mut env, "GOPATH", format!("{home}/go"));
    }
    // GOMODCACHE derives from the first GOPATH entry, computed after GOPATH.
    if lookup(&env, "GOMODCACHE").is_none() {
        if let Some(gopath) = lookup(&env, "GOPATH") {
            let first = gopath.split(':').next().unwrap_or(&gopath).to_string();
            if !first.is_empty() {
                env.push(("GOMODCACHE".to_string(), format!("{first}/pkg/mod")));
            }
        }
    }

    // Shared worktrees often sit on a different filesystem than $HOME; a
    // worktree-local target dir avoids EXDEV renames from cargo.
    if let Some(worktree) = worktree {
        if lookup(&env, "CARGO_TARGET_DIR").is_none() {
            env.push((
                "CARGO_TARGET_DIR".to_string(),
                worktree.join(".cargo-target").to_string_lossy().into_owned(),
            ));
        }
    }

    merge_overrides(&mut env, overrides);
    env
}

/// Replaces matching keys in place and appends the rest sorted.
fn merge_overrides(env: &mut Vec<(String, String)>, overrides: &BTreeMap<String, String>) {
    let mut appended: Vec<(String, String)> = Vec::new();
    for (key, value) in overrides {
        if let Some(slot) = env.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.clone();
        } else {
            appended.push((key.clone(), value.clone()));
        }
    }
    // BTreeMap iteration is already sorted; keep the append order stable.
    env.extend(appended);
}

fn lookup(env: &[(String, String)], key: &str) -> Option<String> {
    env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

/// Returns absolutized values for any relative CLI-state env var, keyed by
/// var name. Recorded under `env_path_overrides` in the invocation record.
pub fn absolutize_state_vars(cwd: &Path) -> BTreeMap<String, String> {
    let mut overrides = BTreeMap::new();
    for var in CLI_STATE_VARS {
        if let Ok(value) = std::env::var(var) {
            let path = Path::new(&value);
            if !value.is_empty() && !path.is_absolute() {
                overrides.insert(
                    var.to_string(),
                    cwd.join(path).to_string_lossy().into_owned(),
                );
            }
        }
    }
    overrides
}

/// An isolated home directory for Codex-like CLI launches.
///
/// The directory is keyed by a deterministic hash of `(stage_dir | name)` so
/// retries of the same stage reuse the same state; passing a distinct `name`
/// (e.g. `codex-home-retry1`) forces fresh state.
#[derive(Debug, Clone)]
pub struct IsolatedHome {
    pub home: PathBuf,
    pub codex_home: PathBuf,
}

impl IsolatedHome {
    /// Creates (or reuses) the isolated home and copies `auth.json` /
    /// `config.toml` from the real `$HOME/.codex` at mode 0600.
    pub fn build(state_base: &Path, stage_dir: &Path, name: &str) -> std::io::Result<IsolatedHome> {
        let key = format!("{}|{}", stage_dir.display(), name);
        let digest = Sha256::digest(key.as_bytes());
        let mut hash = String::with_capacity(12);
        for byte in digest.iter().take(6) {
            hash.push_str(&format!("{byte:02x}"));
        }

        let home = state_base.join(format!("codex-home-{hash}"));
        let codex_home = home.join(".codex");
        std::fs::create_dir_all(&codex_home)?;
        std::fs::create_dir_all(home.join(".config"))?;
        std::fs::create_dir_all(home.join(".local/share"))?;
        std::fs::create_dir_all(home.join(".local/state"))?;

        if let Ok(real_home) = std::env::var("HOME") {
            let real_codex = Path::new(&real_home).join(".codex");
            for file in ["auth.json", "config.toml"] {
                let src = real_codex.join(file);
                if src.is_file() {
                    let dst = codex_home.join(file);
                    if let Err(err) = copy_private(&src, &dst) {
                        warn!(file, error = %err, "failed to seed isolated codex home");
                    }
                }
            }
        }

        Ok(IsolatedHome { home, codex_home })
    }

    /// Env entries that redirect HOME and the XDG dirs into the isolated home.
    pub fn env_overrides(&self) -> BTreeMap<String, String> {
        let home = self.home.to_string_lossy().into_owned();
        let mut map = BTreeMap::new();
        map.insert("HOME".to_string(), home.clone());
        map.insert(
            "CODEX_HOME".to_string(),
            self.codex_home.to_string_lossy().into_owned(),
        );
        map.insert("XDG_CONFIG_HOME".to_string(), format!("{home}/.config"));
        map.insert("XDG_DATA_HOME".to_string(), format!("{home}/.local/share"));
        map.insert("XDG_STATE_HOME".to_string(), format!("{home}/.local/state"));
        map
    }
}

fn copy_private(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::copy(src, dst)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ambient(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    /// **Scenario**: CLAUDECODE is stripped and toolchain paths are pinned off HOME.
    #[test]
    fn strips_nested_session_and_pins_toolchains() {
        let env = base_env_from(
            ambient(&[("HOME", "/home/u"), ("CLAUDECODE", "1"), ("PATH", "/bin")]),
            None,
            &BTreeMap::new(),
        );
        assert!(!env.iter().any(|(k, _)| k == "CLAUDECODE"));
        assert!(env.contains(&("CARGO_HOME".into(), "/home/u/.cargo".into())));
        assert!(env.contains(&("RUSTUP_HOME".into(), "/home/u/.rustup".into())));
        assert!(env.contains(&("GOPATH".into(), "/home/u/go".into())));
        assert!(env.contains(&("GOMODCACHE".into(), "/home/u/go/pkg/mod".into())));
    }

    /// **Scenario**: Explicitly set toolchain vars are left alone; GOMODCACHE follows the first GOPATH entry.
    #[test]
    fn explicit_values_win_and_gomodcache_follows_gopath() {
        let env = base_env_from(
            ambient(&[("HOME", "/home/u"), ("GOPATH", "/srv/go:/other/go")]),
            None,
            &BTreeMap::new(),
        );
        assert!(env.contains(&("GOPATH".into(), "/srv/go:/other/go".into())));
        assert!(env.contains(&("GOMODCACHE".into(), "/srv/go/pkg/mod".into())));
    }

    /// **Scenario**: CARGO_TARGET_DIR is pinned into the worktree only when unset.
    #[test]
    fn cargo_target_dir_pinned_to_worktree() {
        let env = base_env_from(
            ambient(&[("HOME", "/home/u")]),
            Some(Path::new("/work/tree")),
            &BTreeMap::new(),
        );
        assert!(env.contains(&("CARGO_TARGET_DIR".into(), "/work/tree/.cargo-target".into())));

        let env = base_env_from(
            ambient(&[("HOME", "/home/u"), ("CARGO_TARGET_DIR", "/custom")]),
            Some(Path::new("/work/tree")),
            &BTreeMap::new(),
        );
        assert!(env.contains(&("CARGO_TARGET_DIR".into(), "/custom".into())));
    }

    /// **Scenario**: Overrides replace in place and new keys append in sorted order.
    #[test]
    fn overrides_preserve_positions_and_append_sorted() {
        let mut overrides = BTreeMap::new();
        overrides.insert("PATH".to_string(), "/override".to_string());
        overrides.insert("ZZZ".to_string(), "z".to_string());
        overrides.insert("AAA".to_string(), "a".to_string());

        let env = base_env_from(
            ambient(&[("PATH", "/bin"), ("HOME", "/home/u")]),
            None,
            &overrides,
        );
        let path_pos = env.iter().position(|(k, _)| k == "PATH").unwrap();
        assert_eq!(path_pos, 0, "PATH keeps its original slot");
        assert_eq!(env[path_pos].1, "/override");

        let aaa = env.iter().position(|(k, _)| k == "AAA").unwrap();
        let zzz = env.iter().position(|(k, _)| k == "ZZZ").unwrap();
        assert!(aaa < zzz, "appended keys are sorted");
    }

    /// **Scenario**: Isolated homes are deterministic per (stage_dir, name) and differ per name.
    #[test]
    fn isolated_home_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let stage = tmp.path().join("stage");
        let a = IsolatedHome::build(tmp.path(), &stage, "codex-home").unwrap();
        let b = IsolatedHome::build(tmp.path(), &stage, "codex-home").unwrap();
        assert_eq!(a.home, b.home);

        let retry = IsolatedHome::build(tmp.path(), &stage, "codex-home-retry1").unwrap();
        assert_ne!(a.home, retry.home);

        let env = a.env_overrides();
        assert_eq!(env.get("HOME"), Some(&a.home.to_string_lossy().into_owned()));
        assert!(env.get("CODEX_HOME").unwrap().ends_with(".codex"));
        assert!(a.codex_home.is_dir());
    }
}
