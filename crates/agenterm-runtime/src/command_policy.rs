//! Command policy deny list applied to every `send_text` (SPEC_FULL.md
//! §4.6). Grounded in the teacher's policy-violation-check shape (a
//! function that returns an optional denial reason) but fully rewritten
//! against this spec's concrete rule set.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDenial {
    pub rule: String,
    pub detail: String,
}

/// Checks `command` against the deny list. `workdir` is the session's
/// resolved work directory; `None` triggers fail-closed behavior when the
/// command contains path tokens.
pub fn check_command_policy(command: &str, workdir: Option<&Path>) -> Option<PolicyDenial> {
    if command.contains('`') || command.contains("$(") {
        return Some(PolicyDenial {
            rule: "no_shell_substitution".to_string(),
            detail: "command contains a backtick or $(...) substitution".to_string(),
        });
    }

    if shell_dash_c_re().is_match(command) {
        return Some(PolicyDenial {
            rule: "no_shell_dash_c".to_string(),
            detail: "command invokes a shell with -c".to_string(),
        });
    }

    if eval_re().is_match(command) {
        return Some(PolicyDenial {
            rule: "no_eval".to_string(),
            detail: "command invokes eval".to_string(),
        });
    }

    if command.contains("../") || command.contains("..\\") {
        return Some(PolicyDenial {
            rule: "no_path_traversal".to_string(),
            detail: "command contains a path-traversal segment".to_string(),
        });
    }

    let tokens = extract_path_tokens(command);

    for token in &tokens {
        if token.contains('$') || token.contains('%') {
            return Some(PolicyDenial {
                rule: "no_env_expansion".to_string(),
                detail: format!("path token `{token}` expands an environment variable"),
            });
        }
        if token == "~" || token.starts_with("~/") {
            return Some(PolicyDenial {
                rule: "no_home_expansion".to_string(),
                detail: format!("path token `{token}` expands the home directory"),
            });
        }
    }

    if let Some(denial) = check_rm_rf_absolute(command) {
        return Some(denial);
    }

    match workdir {
        Some(workdir) => {
            for token in &tokens {
                if token == "~" || token.starts_with('~') {
                    continue;
                }
                if let Some(denial) = check_workdir_boundary(token, workdir) {
                    return Some(denial);
                }
            }
        }
        None if !tokens.is_empty() => {
            return Some(PolicyDenial {
                rule: "missing_workdir_scope".to_string(),
                detail: "no work directory configured for a command with path tokens".to_string(),
            });
        }
        None => {}
    }

    None
}

fn shell_dash_c_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[;&|]\s*)(bash|sh|zsh|fish)\s+-c(?:\s|$)").expect("valid regex"))
}

fn eval_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[;&|]\s*)eval(?:\s|$)").expect("valid regex"))
}

/// Very small heuristic path-token extractor: anything that looks like a
/// unix or windows path fragment (contains a `/` or starts with `~`).
fn extract_path_tokens(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .filter(|tok| tok.contains('/') || tok.starts_with('~'))
        .map(|tok| tok.trim_matches(|c| c == '"' || c == '\'').to_string())
        .collect()
}

fn check_rm_rf_absolute(command: &str) -> Option<PolicyDenial> {
    let words: Vec<&str> = command.split_whitespace().collect();
    let mut idx = 0;
    while idx < words.len() {
        let primary = unwrap_prefixes(&words, &mut idx)?;
        if primary != "rm" {
            return None;
        }
        let rest = &words[idx + 1..];
        let has_r_flag = rest
            .iter()
            .any(|w| w.starts_with('-') && !w.starts_with("--") && w.contains('r'));
        let has_absolute_arg = rest.iter().any(|w| !w.starts_with('-') && w.starts_with('/'));
        if has_r_flag && has_absolute_arg {
            return Some(PolicyDenial {
                rule: "no_rm_rf_absolute".to_string(),
                detail: "rm with a recursive flag targets an absolute path".to_string(),
            });
        }
        return None;
    }
    None
}

/// Walks past `sudo`, `command`, `nohup` and `env K=V …` prefixes, returning
/// the resolved primary command name and advancing `idx` to its position.
fn unwrap_prefixes<'a>(words: &[&'a str], idx: &mut usize) -> Option<&'a str> {
    loop {
        let word = *words.get(*idx)?;
        match word {
            "sudo" | "command" | "nohup" => {
                *idx += 1;
                continue;
            }
            "env" => {
                *idx += 1;
                while words.get(*idx).is_some_and(|w| w.contains('=')) {
                    *idx += 1;
                }
                continue;
            }
            other => return Some(other),
        }
    }
}

fn check_workdir_boundary(token: &str, workdir: &Path) -> Option<PolicyDenial> {
    let candidate = if Path::new(token).is_absolute() {
        PathBuf::from(token)
    } else {
        workdir.join(token)
    };
    let resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate);
    let workdir_resolved = std::fs::canonicalize(workdir)
        .unwrap_or_else(|_| workdir.to_path_buf());
    if !resolved.starts_with(&workdir_resolved) {
        return Some(PolicyDenial {
            rule: "workdir_boundary".to_string(),
            detail: format!("path token `{token}` resolves outside the session's work directory"),
        });
    }
    None
}

/// Best-effort append to `<workdir>/.orchestra/command-policy-audit.log`.
pub fn audit_denial(workdir: &Path, session_id: &str, command: &str, denial: &PolicyDenial) {
    let dir = workdir.join(".orchestra");
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let line = format!(
        "{} session={} rule={} detail={:?} command={:?}\n",
        Utc::now().to_rfc3339(),
        session_id,
        denial.rule,
        denial.detail,
        command
    );
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("command-policy-audit.log"))
    {
        let _ = file.write_all(line.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_backtick_substitution() {
        let denial = check_command_policy("echo `whoami`", None);
        assert_eq!(denial.unwrap().rule, "no_shell_substitution");
    }

    #[test]
    fn denies_shell_dash_c() {
        let denial = check_command_policy("bash -c 'rm -rf /'", None);
        assert_eq!(denial.unwrap().rule, "no_shell_dash_c");
    }

    #[test]
    fn denies_rm_rf_absolute_path() {
        let denial = check_command_policy("rm -rf /var/data", None);
        assert_eq!(denial.unwrap().rule, "no_rm_rf_absolute");
    }

    #[test]
    fn denies_rm_rf_absolute_through_sudo_env_prefix() {
        let denial = check_command_policy("sudo env FOO=bar rm -rf /var/data", None);
        assert_eq!(denial.unwrap().rule, "no_rm_rf_absolute");
    }

    #[test]
    fn allows_plain_command_with_no_path_tokens() {
        assert!(check_command_policy("ls -la", None).is_none());
    }

    #[test]
    fn fails_closed_without_workdir_when_path_tokens_present() {
        let denial = check_command_policy("cat src/main.rs", None);
        assert_eq!(denial.unwrap().rule, "missing_workdir_scope");
    }

    #[test]
    fn denies_paths_outside_workdir_boundary() {
        let tmp = std::env::temp_dir().join(format!("agenterm-policy-test-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).expect("create tmp workdir");
        let denial = check_command_policy("cat /etc/passwd", Some(&tmp));
        assert_eq!(denial.unwrap().rule, "workdir_boundary");
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
