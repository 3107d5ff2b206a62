//! Virtual path resolution and G-code file inspection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

use dcs_core::error::IpcError;

/// Directories exposed under the virtual `0:/` drive.
const VIRTUAL_DIRS: [&str; 5] = ["gcodes", "sys", "macros", "filaments", "www"];

/// How many comment lines at the top of a job file are scanned for slicer
/// metadata before giving up.
const HEADER_SCAN_LINES: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_layers: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
}

pub struct FileService {
    base_dir: PathBuf,
}

impl FileService {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Map a virtual path (`0:/gcodes/x.g`, `gcodes/x.g`, `sys/config.g`)
    /// to a physical one. Paths escaping the base directory are refused.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf, IpcError> {
        let trimmed = virtual_path
            .strip_prefix("0:/")
            .or_else(|| virtual_path.strip_prefix("0:"))
            .unwrap_or(virtual_path)
            .trim_start_matches('/');

        let mut resolved = self.base_dir.clone();
        let mut first = true;
        for part in Path::new(trimmed) {
            let part = part.to_string_lossy();
            if part == ".." || part == "." {
                return Err(IpcError::invalid_argument(format!(
                    "path {virtual_path:?} escapes the virtual filesystem"
                )));
            }
            if first && !VIRTUAL_DIRS.contains(&part.as_ref()) {
                // Bare file names land in gcodes, like firmware does.
                resolved.push("gcodes");
            }
            first = false;
            resolved.push(part.as_ref());
        }
        if first {
            return Err(IpcError::invalid_argument("empty path"));
        }
        Ok(resolved)
    }

    pub async fn file_info(&self, file_name: &str) -> Result<FileInfo, IpcError> {
        let path = self.resolve(file_name)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    IpcError::not_found(format!("no such file {file_name}"))
                }
                _ => IpcError::io(&err),
            })?;
        if !meta.is_file() {
            return Err(IpcError::invalid_argument(format!(
                "{file_name} is not a regular file"
            )));
        }

        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut info = FileInfo {
            file_name: file_name.to_string(),
            size: meta.len(),
            last_modified,
            height: None,
            layer_height: None,
            num_layers: None,
            generated_by: None,
        };
        scan_header(&path, &mut info).await?;
        Ok(info)
    }
}

/// Pull slicer metadata out of leading comment lines. Slicers disagree on
/// exact spelling, so the match is a loose `key = value` scan over the
/// usual suspects.
async fn scan_header(path: &Path, info: &mut FileInfo) -> Result<(), IpcError> {
    let file = fs::File::open(path).await.map_err(|err| IpcError::io(&err))?;
    let mut lines = BufReader::new(file).lines();
    let mut scanned = 0usize;
    while let Some(line) = lines.next_line().await.map_err(|err| IpcError::io(&err))? {
        scanned += 1;
        if scanned > HEADER_SCAN_LINES {
            break;
        }
        let Some(comment) = line.trim().strip_prefix(';') else {
            continue;
        };
        let comment = comment.trim();
        if let Some(value) = comment_value(comment, &["generated by", "generated with", "Sliced by"])
        {
            info.generated_by.get_or_insert(value.to_string());
        } else if let Some(value) = comment_value(comment, &["layer_height", "layerHeight"]) {
            info.layer_height = info.layer_height.or_else(|| value.parse().ok());
        } else if let Some(value) = comment_value(comment, &["max_z_height", "total height", "HEIGHT"])
        {
            info.height = info.height.or_else(|| value.parse().ok());
        } else if let Some(value) = comment_value(comment, &["num_layers", "LAYER_COUNT"]) {
            info.num_layers = info.num_layers.or_else(|| value.parse().ok());
        }
    }
    Ok(())
}

fn comment_value<'a>(comment: &'a str, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(rest) = comment.strip_prefix(key) {
            let rest = rest.trim_start();
            let rest = rest.strip_prefix('=').or(rest.strip_prefix(':')).unwrap_or(rest);
            let value = rest.trim();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_base(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("dcs-files-{name}-{nanos}"));
        std::fs::create_dir_all(dir.join("gcodes")).expect("mkdir");
        std::fs::create_dir_all(dir.join("sys")).expect("mkdir");
        dir
    }

    #[test]
    fn resolves_virtual_prefixes() {
        let base = temp_base("resolve");
        let service = FileService::new(base.clone());

        assert_eq!(
            service.resolve("0:/gcodes/job.g").expect("resolve"),
            base.join("gcodes/job.g")
        );
        assert_eq!(
            service.resolve("sys/config.g").expect("resolve"),
            base.join("sys/config.g")
        );
        assert_eq!(
            service.resolve("job.g").expect("resolve"),
            base.join("gcodes/job.g")
        );
        assert!(service.resolve("../etc/passwd").is_err());
        std::fs::remove_dir_all(base).ok();
    }

    #[tokio::test]
    async fn file_info_scans_slicer_comments() {
        let base = temp_base("info");
        let service = FileService::new(base.clone());
        let body = "\
; generated by SuperSlicer 2.5.1
;HEIGHT: 24.6
; layer_height = 0.2
;LAYER_COUNT: 123
G28
G1 Z0.2 F600
";
        std::fs::write(base.join("gcodes/cube.gcode"), body).expect("write");

        let info = service.file_info("0:/gcodes/cube.gcode").await.expect("info");
        assert_eq!(info.size, body.len() as u64);
        assert_eq!(info.generated_by.as_deref(), Some("SuperSlicer 2.5.1"));
        assert_eq!(info.layer_height, Some(0.2));
        assert_eq!(info.height, Some(24.6));
        assert_eq!(info.num_layers, Some(123));

        let missing = service.file_info("0:/gcodes/nope.gcode").await;
        assert_eq!(
            missing.expect_err("missing").error_type,
            dcs_core::ErrorType::NotFound
        );
        std::fs::remove_dir_all(base).ok();
    }
}
