//! Rendering of a decrypted env to shell-consumable output, and the env
//! pairs handed to executed child processes.

use std::collections::HashMap;

use envkey_core::EnvMap;

/// Name of the bookkeeping var listing everything this tool loaded into
/// the current shell.
pub const LOADED_VAR: &str = "__ENVKEY_LOADED";

/// Name of the bookkeeping var listing vars that changed in the latest
/// reload.
pub const UPDATED_VAR: &str = "__ENVKEY_UPDATED";

fn single_quote_escape(s: &str) -> String {
    s.replace('\'', r#"'"'"'"#)
}

fn strip_newlines(s: &str) -> String {
    s.replace('\n', "")
}

/// Render `export` statements for the env.
///
/// Vars already present in the process environment are skipped unless they
/// were loaded by a previous invocation (tracked via `__ENVKEY_LOADED`) or
/// `force` is set. PAM output follows `/etc/environment` rules: one var
/// per line, no quoting of names, newlines removed.
pub fn source(env: &EnvMap, force: bool, pam: bool, dot_env: bool) -> String {
    if env.is_empty() {
        return "echo 'No vars set'".to_string();
    }

    let previously_loaded: HashMap<String, bool> = std::env::var(LOADED_VAR)
        .map(|loaded| {
            loaded
                .split(',')
                .map(|k| (k.to_string(), true))
                .collect()
        })
        .unwrap_or_default();

    let mut res = if pam || dot_env {
        String::new()
    } else {
        "export".to_string()
    };

    let mut loaded: Vec<&str> = Vec::new();
    for (i, (key, value)) in env.iter().enumerate() {
        let skip = !force
            && !previously_loaded.contains_key(key)
            && std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false);
        if skip {
            continue;
        }
        loaded.push(key);

        let (k, v) = if pam {
            (strip_newlines(key), strip_newlines(value))
        } else {
            (single_quote_escape(key), single_quote_escape(value))
        };

        if pam {
            if i > 0 {
                res.push('\n');
            }
            res.push_str(&format!("export {k}='{v}'"));
        } else if dot_env {
            res.push_str(&format!("{k}='{v}'\n"));
        } else {
            res.push_str(&format!(" '{k}'='{v}'"));
        }
    }

    if loaded.is_empty() {
        return String::new();
    }

    if !pam && !dot_env {
        loaded.sort_unstable();
        res.push_str(&format!(" '{LOADED_VAR}'='{}'", loaded.join(",")));
    }

    res
}

/// Render `unset` statements for everything a previous invocation loaded.
pub fn unload() -> String {
    let loaded = match std::env::var(LOADED_VAR) {
        Ok(loaded) if !loaded.is_empty() => loaded,
        _ => return String::new(),
    };

    let mut res = String::new();
    for key in loaded.split(',') {
        res.push_str(&format!("unset '{key}'; "));
    }
    res.push_str(&format!("unset {LOADED_VAR};"));
    res
}

/// Env pairs applied to an executed child on top of the inherited
/// environment. Adds `__ENVKEY_LOADED`, and when a previous env is given,
/// `__PREV_<K>` plus `__ENVKEY_UPDATED` for changed and removed vars.
pub fn child_env(env: &EnvMap, previous: Option<&EnvMap>, force: bool) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut loaded: Vec<String> = Vec::new();

    for (key, value) in env {
        if force || std::env::var(key).map(|v| v.is_empty()).unwrap_or(true) {
            pairs.push((key.clone(), value.clone()));
            loaded.push(key.clone());
        }
    }

    loaded.sort_unstable();
    pairs.push((LOADED_VAR.to_string(), loaded.join(",")));

    if let Some(previous) = previous {
        let mut updated: Vec<String> = Vec::new();

        for key in &loaded {
            let val = env.get(key);
            let prev = previous.get(key);
            if val != prev {
                updated.push(key.clone());
                pairs.push((
                    format!("__PREV_{key}"),
                    prev.cloned().unwrap_or_default(),
                ));
            }
        }

        for (key, prev) in previous {
            let removed = !env.contains_key(key)
                && (force || std::env::var(key).map(|v| v.is_empty()).unwrap_or(true));
            if removed {
                updated.push(key.clone());
                pairs.push((format!("__PREV_{key}"), prev.clone()));
            }
        }

        updated.sort_unstable();
        pairs.push((UPDATED_VAR.to_string(), updated.join(",")));
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_source_exports_sorted_with_loaded_var() {
        let env = env_of(&[("ENVKEY_TEST_B", "two"), ("ENVKEY_TEST_A", "one")]);
        let out = source(&env, true, false, false);
        assert_eq!(
            out,
            "export 'ENVKEY_TEST_A'='one' 'ENVKEY_TEST_B'='two' \
             '__ENVKEY_LOADED'='ENVKEY_TEST_A,ENVKEY_TEST_B'"
        );
    }

    #[test]
    fn test_source_escapes_single_quotes() {
        let env = env_of(&[("ENVKEY_TEST_QUOTED", "it's")]);
        let out = source(&env, true, false, false);
        assert!(out.contains(r#"'ENVKEY_TEST_QUOTED'='it'"'"'s'"#));
    }

    #[test]
    fn test_source_empty_env() {
        let out = source(&EnvMap::new(), false, false, false);
        assert_eq!(out, "echo 'No vars set'");
    }

    #[test]
    fn test_dot_env_format() {
        let env = env_of(&[("ENVKEY_TEST_A", "one")]);
        let out = source(&env, true, false, true);
        assert_eq!(out, "ENVKEY_TEST_A='one'\n");
    }

    #[test]
    fn test_pam_format_strips_newlines() {
        let env = env_of(&[("ENVKEY_TEST_A", "line1\nline2")]);
        let out = source(&env, true, true, false);
        assert_eq!(out, "export ENVKEY_TEST_A='line1line2'");
    }

    #[test]
    fn test_child_env_marks_updated_and_removed() {
        let current = env_of(&[("ENVKEY_TEST_KEPT", "same"), ("ENVKEY_TEST_NEW", "v2")]);
        let previous = env_of(&[
            ("ENVKEY_TEST_KEPT", "same"),
            ("ENVKEY_TEST_NEW", "v1"),
            ("ENVKEY_TEST_GONE", "old"),
        ]);

        let pairs = child_env(&current, Some(&previous), true);
        let map: HashMap<_, _> = pairs.into_iter().collect();

        assert_eq!(map.get("ENVKEY_TEST_NEW").map(String::as_str), Some("v2"));
        assert_eq!(
            map.get("__PREV_ENVKEY_TEST_NEW").map(String::as_str),
            Some("v1")
        );
        assert_eq!(
            map.get("__PREV_ENVKEY_TEST_GONE").map(String::as_str),
            Some("old")
        );
        assert_eq!(
            map.get(UPDATED_VAR).map(String::as_str),
            Some("ENVKEY_TEST_GONE,ENVKEY_TEST_NEW")
        );
        assert!(!map.contains_key("__PREV_ENVKEY_TEST_KEPT"));
    }

    #[test]
    fn test_child_env_loaded_listing() {
        let env = env_of(&[("ENVKEY_TEST_A", "1")]);
        let pairs = child_env(&env, None, true);
        let map: HashMap<_, _> = pairs.into_iter().collect();
        assert_eq!(map.get(LOADED_VAR).map(String::as_str), Some("ENVKEY_TEST_A"));
    }
}
