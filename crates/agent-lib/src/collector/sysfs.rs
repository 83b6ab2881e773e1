//! Small read/write helpers shared by the cgroup and GPU probes

use super::ProbeError;
use std::path::Path;
use tokio::fs;

/// Parse an unsigned control-file value; negative values (e.g. `-1` for
/// "unlimited") read as 0
pub fn parse_u64(content: &str) -> Option<u64> {
    let trimmed = content.trim();
    if let Ok(value) = trimmed.parse::<u64>() {
        return Some(value);
    }
    match trimmed.parse::<i64>() {
        Ok(value) if value < 0 => Some(0),
        _ => None,
    }
}

/// Read a single integer from a control file
pub async fn read_u64(path: &Path) -> Result<u64, ProbeError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| ProbeError::from_io(path, e))?;

    parse_u64(&content).ok_or_else(|| ProbeError::Parse {
        path: path.to_path_buf(),
        reason: format!("not an integer: {:?}", content.trim()),
    })
}

/// Overwrite a control file with `value`
pub async fn write_value(path: &Path, value: &str) -> Result<(), ProbeError> {
    fs::write(path, value)
        .await
        .map_err(|e| ProbeError::from_io(path, e))
}

pub async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}
