//! JSON 文件持久化
//!
//! 单文件 JSON 读写；写入先落临时文件再 rename，避免进程中断留下半截文件。

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回 None
    pub fn load<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let value = serde_json::from_str(&data)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Some(value))
    }

    /// 写入 JSON；父目录不存在时自动创建
    pub fn save<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {}", self.path.display()))?;
        Ok(())
    }
}

/// 会话 ID 转为安全的文件名（只保留字母数字、`-`、`_`）
///
/// 清洗改变了 ID 时追加 8 位 UUIDv5 后缀，`a/b`、`a.b`、`a_b` 落到不同文件。
pub fn file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if !stem.is_empty() && stem == id {
        return stem;
    }
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()).simple().to_string();
    format!("{}-{}", if stem.is_empty() { "_" } else { &stem }, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("nope.json"));
        let loaded: Option<Vec<String>> = file.load().unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("a/b/items.json"));
        file.save(&vec!["x".to_string()]).unwrap();
        let loaded: Option<Vec<String>> = file.load().unwrap();
        assert_eq!(loaded, Some(vec!["x".to_string()]));
        assert!(!dir.path().join("a/b/items.json.tmp").exists());
    }

    #[test]
    fn test_file_stem_sanitizes() {
        assert_eq!(file_stem("abc-123_x"), "abc-123_x");
        let escaped = file_stem("../etc/passwd");
        assert!(escaped.starts_with("___etc_passwd-"));
        assert_eq!(escaped.len(), "___etc_passwd-".len() + 8);
        assert!(file_stem("").starts_with("_-"));
        assert_eq!(file_stem("../etc/passwd"), escaped);
    }

    #[test]
    fn test_file_stem_keeps_sanitized_ids_apart() {
        let stems = [file_stem("a/b"), file_stem("a.b"), file_stem("a_b")];
        assert_eq!(stems[2], "a_b");
        assert_ne!(stems[0], stems[1]);
        assert_ne!(stems[0], stems[2]);
        assert_ne!(stems[1], stems[2]);
        assert!(stems.iter().all(|s| !s.contains('/') && !s.contains('.')));
    }
}
