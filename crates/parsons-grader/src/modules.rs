//! Import allowlist for the learner's script.
//!
//! `os.path` is special: importing it loads the `os` parent first, so `os`
//! is granted whenever `os.path` is listed. Submodules of a listed package,
//! such as `collections.abc`, are granted too.

use std::collections::HashSet;

use crate::types::GraderSettings;

/// Whether a direct import of `module_name` is permitted.
pub fn is_module_allowed(module_name: &str, allowed_set: &HashSet<String>) -> bool {
    if allowed_set.contains(module_name) {
        return true;
    }
    if module_name == "os" && allowed_set.contains("os.path") {
        return true;
    }
    match module_name.split_once('.') {
        Some((parent, _)) => allowed_set.contains(parent),
        None => false,
    }
}

pub fn build_allowed_set(settings: &GraderSettings) -> HashSet<String> {
    settings.allowed_modules.iter().cloned().collect()
}
