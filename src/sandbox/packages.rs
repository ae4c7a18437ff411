//! Computing the set of packages a sandbox needs before it is usable.

/// Packages the executor needs inside the sandbox to ship images back.
pub const IMAGE_DECODING_PACKAGES: &[&str] = &["pillow"];

/// Import names whose distribution is published under a different name.
const DISTRIBUTION_ALIASES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("sklearn", "scikit-learn"),
    ("skimage", "scikit-image"),
    ("yaml", "pyyaml"),
];

/// Standard library modules; importing them never requires an install.
const STDLIB_MODULES: &[&str] = &[
    "abc", "argparse", "array", "ast", "asyncio", "base64", "bisect", "calendar", "cmath",
    "collections", "copy", "csv", "dataclasses", "datetime", "decimal", "difflib", "enum",
    "fractions", "functools", "glob", "hashlib", "heapq", "html", "io", "itertools", "json",
    "logging", "math", "operator", "os", "pathlib", "pickle", "pprint", "queue", "random", "re",
    "shutil", "stat", "statistics", "string", "struct", "subprocess", "sys", "tempfile",
    "textwrap", "threading", "time", "timeit", "typing", "unicodedata", "urllib", "uuid", "xml",
    "zipfile", "zlib",
];

/// Map an import spec (`numpy.linalg`, `PIL.*`, `pandas`) to the name `pip`
/// installs it under, or `None` when nothing needs installing.
pub fn normalize_package(spec: &str) -> Option<String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }

    // Version pins and extras are already distribution names.
    if spec.contains(['=', '<', '>', '[', '~', '!']) {
        return Some(spec.to_string());
    }

    let top_level = spec.split('.').next().unwrap_or(spec).trim();
    if top_level.is_empty() || top_level == "*" {
        return None;
    }
    if STDLIB_MODULES.contains(&top_level) {
        return None;
    }

    let name = DISTRIBUTION_ALIASES
        .iter()
        .find(|(import, _)| *import == top_level)
        .map(|(_, dist)| *dist)
        .unwrap_or(top_level);
    Some(name.to_string())
}

/// Compute the ordered install list: base packages, then explicit imports,
/// then tool requirements, then what image decoding needs. Duplicates are
/// dropped (case-insensitively) keeping the first occurrence.
pub fn resolve_packages(base: &[String], explicit: &[String], tools: &[String]) -> Vec<String> {
    let implicit: Vec<String> = IMAGE_DECODING_PACKAGES
        .iter()
        .map(|p| p.to_string())
        .collect();

    let mut resolved: Vec<String> = Vec::new();
    for spec in base
        .iter()
        .chain(explicit)
        .chain(tools)
        .chain(implicit.iter())
    {
        let Some(name) = normalize_package(spec) else {
            continue;
        };
        let key = requirement_key(&name);
        if !resolved.iter().any(|p| requirement_key(p) == key) {
            resolved.push(name);
        }
    }
    resolved
}

/// Distribution name without version constraints, lowercased.
fn requirement_key(requirement: &str) -> String {
    requirement
        .split(|c: char| matches!(c, '=' | '<' | '>' | '[' | '~' | '!' | ' '))
        .next()
        .unwrap_or(requirement)
        .replace('_', "-")
        .to_lowercase()
}
