//! Positional parsing of cloud resource URIs
//!
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/{ns}/{type}/{name}[/{child}/{childName}]...`

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{FenceError, Result};

/// Non-empty `/`-delimited segments of a resource id
fn segments(resource_id: &str) -> Vec<&str> {
    resource_id
        .trim()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

/// Storage key derived from the resource id. Stable across casing
/// differences so the same resource always maps to the same document.
pub fn document_id(resource_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(resource_id.trim().to_ascii_lowercase().as_bytes())
}

pub fn subscription_id(resource_id: &str) -> Result<String> {
    let segs = segments(resource_id);
    if segs.len() < 2 || !segs[0].eq_ignore_ascii_case("subscriptions") {
        return Err(FenceError::validation(format!(
            "cannot derive subscription from '{resource_id}'"
        )));
    }
    Ok(segs[1].to_string())
}

pub fn resource_group(resource_id: &str) -> Result<String> {
    let segs = segments(resource_id);
    if segs.len() < 4 {
        return Err(FenceError::validation(format!(
            "cannot derive resource group from '{resource_id}'"
        )));
    }
    Ok(segs[3].to_string())
}

/// Lower-cased provider type, e.g. `microsoft.web/sites` or
/// `microsoft.network/virtualnetworks/subnets` for child resources.
pub fn resource_type(resource_id: &str) -> Result<String> {
    let segs = segments(resource_id);
    if segs.len() < 8 {
        return Err(FenceError::validation(format!(
            "cannot derive resource type from '{resource_id}'"
        )));
    }
    let mut parts = vec![segs[5], segs[6]];
    let mut i = 8;
    while i + 1 < segs.len() {
        parts.push(segs[i]);
        i += 2;
    }
    Ok(parts.join("/").to_ascii_lowercase())
}

pub fn resource_name(resource_id: &str) -> Result<String> {
    segments(resource_id)
        .last()
        .map(|s| s.to_string())
        .ok_or_else(|| FenceError::validation("empty resource id"))
}

/// Id of the parent resource for child ids (`.../sites/app/slots/staging` -> `.../sites/app`)
pub fn parent_id(resource_id: &str) -> Option<String> {
    let segs = segments(resource_id);
    if segs.len() < 10 {
        return None;
    }
    Some(format!("/{}", segs[..segs.len() - 2].join("/")))
}

pub fn same_id(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
