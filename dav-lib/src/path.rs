use crate::{DavError, DavResult};

pub const ROOT_PATH: &str = "/";

/// Canonical form: leading '/', no trailing '/', no empty, "." or ".." segments.
pub fn normalize_path(path: &str) -> DavResult<String> {
    if !path.starts_with('/') {
        return Err(DavError::InvalidInput(format!(
            "path must be absolute: {}",
            path
        )));
    }

    let mut segments = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" => continue,
            "." | ".." => {
                return Err(DavError::InvalidInput(format!(
                    "relative segment in path: {}",
                    path
                )))
            }
            s if s.chars().any(|c| c.is_control()) => {
                return Err(DavError::InvalidInput(format!(
                    "control character in path: {:?}",
                    path
                )))
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Ok(ROOT_PATH.to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Parent of a normalized path; `None` for the root.
pub fn parent_path(path: &str) -> Option<String> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT_PATH.to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

pub fn path_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

pub fn path_depth(path: &str) -> usize {
    if path == ROOT_PATH {
        return 0;
    }
    path.matches('/').count()
}

/// Root first, then every intermediate folder, ending with `path` itself.
pub fn ancestor_chain(path: &str) -> Vec<String> {
    let mut chain = vec![path.to_string()];
    let mut current = path.to_string();
    while let Some(parent) = parent_path(&current) {
        chain.push(parent.clone());
        current = parent;
    }
    chain.reverse();
    chain
}
