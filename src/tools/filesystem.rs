//! 沙箱文件操作工具
//!
//! SafeFs 绑定 base_path，所有路径按词法校验必须落在根下（拒绝绝对路径与 `..` 逃逸），
//! 目标文件可以尚不存在；FileOperations 基于它提供创建 / 读取 / 列目录 / 删除。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::registry::{mentions_any, required_str, str_param, Capability};
use crate::workflow::Params;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析相对路径；绝对路径或 `..` 越过根目录都视为逃逸
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let mut resolved = self.root_dir.clone();
        let mut depth = 0usize;
        for component in Path::new(path).components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir if depth > 0 => {
                    resolved.pop();
                    depth -= 1;
                }
                _ => return Err("Path outside base directory not allowed".to_string()),
            }
        }
        Ok(resolved)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOp {
    CreateFile,
    ReadFile,
    CreateDirectory,
    ListDirectory,
    DeleteFile,
}

impl FileOp {
    const ALL: [FileOp; 5] = [
        FileOp::CreateFile,
        FileOp::ReadFile,
        FileOp::CreateDirectory,
        FileOp::ListDirectory,
        FileOp::DeleteFile,
    ];

    fn as_str(self) -> &'static str {
        match self {
            FileOp::CreateFile => "create_file",
            FileOp::ReadFile => "read_file",
            FileOp::CreateDirectory => "create_directory",
            FileOp::ListDirectory => "list_directory",
            FileOp::DeleteFile => "delete_file",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

/// 文件操作工具（`file_operations`）
pub struct FileOperations {
    fs: SafeFs,
}

impl FileOperations {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(base_path),
        }
    }

    async fn create_file(&self, params: &Params) -> Result<Value, String> {
        let file_path = required_str(params, "file_path")?;
        let content = str_param(params, "content").unwrap_or("");
        let overwrite = params
            .get("overwrite")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let full = self.fs.resolve(file_path)?;

        if !overwrite && tokio::fs::try_exists(&full).await.unwrap_or(false) {
            return Ok(json!({"success": false, "error": format!("File already exists: {file_path}")}));
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Create directory failed: {e}"))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| format!("Write failed: {e}"))?;
        tracing::info!(path = %full.display(), "file created");
        Ok(json!({
            "success": true,
            "file_path": full.to_string_lossy(),
            "message": format!("File created: {file_path}"),
        }))
    }

    async fn read_file(&self, params: &Params) -> Result<Value, String> {
        let file_path = required_str(params, "file_path")?;
        let full = self.fs.resolve(file_path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(json!({
                "success": true,
                "content": content,
                "file_path": full.to_string_lossy(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(json!({"success": false, "error": format!("File not found: {file_path}")}))
            }
            Err(e) => Err(format!("Read failed: {e}")),
        }
    }

    async fn create_directory(&self, params: &Params) -> Result<Value, String> {
        let dir_path = required_str(params, "dir_path")?;
        let full = self.fs.resolve(dir_path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| format!("Create directory failed: {e}"))?;
        Ok(json!({
            "success": true,
            "dir_path": full.to_string_lossy(),
            "message": format!("Directory created: {dir_path}"),
        }))
    }

    async fn list_directory(&self, params: &Params) -> Result<Value, String> {
        let dir_path = str_param(params, "dir_path").unwrap_or(".");
        let full = self.fs.resolve(dir_path)?;
        if !full.is_dir() {
            return Ok(json!({"success": false, "error": format!("Directory not found: {dir_path}")}));
        }

        let mut reader = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| format!("List failed: {e}"))?;
        let mut items = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| format!("List failed: {e}"))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            items.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "type": if is_dir { "directory" } else { "file" },
                "path": self.fs.relative(&entry.path()),
            }));
        }
        items.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(json!({"success": true, "items": items, "path": full.to_string_lossy()}))
    }

    /// 默认要求确认：未显式传 `require_confirmation=false` 时不删除
    async fn delete_file(&self, params: &Params) -> Result<Value, String> {
        let file_path = required_str(params, "file_path")?;
        let require_confirmation = params
            .get("require_confirmation")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let full = self.fs.resolve(file_path)?;
        if !full.is_file() {
            return Ok(json!({"success": false, "error": format!("File not found: {file_path}")}));
        }
        if require_confirmation {
            return Ok(json!({
                "success": false,
                "error": "Deletion requires confirmation",
                "requires_confirmation": true,
            }));
        }
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| format!("Delete failed: {e}"))?;
        tracing::warn!(path = %full.display(), "file deleted");
        Ok(json!({"success": true, "message": format!("File deleted: {file_path}")}))
    }
}

#[async_trait]
impl Capability for FileOperations {
    fn name(&self) -> &str {
        "file_operations"
    }

    fn description(&self) -> &str {
        "Create, read, list and delete files inside the workspace base path"
    }

    fn operations(&self) -> Vec<&'static str> {
        FileOp::ALL.iter().map(|op| op.as_str()).collect()
    }

    fn default_operation(&self, description: &str) -> Option<&'static str> {
        let op = if mentions_any(description, &["create", "write"]) {
            FileOp::CreateFile
        } else if mentions_any(description, &["read"]) {
            FileOp::ReadFile
        } else if mentions_any(description, &["directory", "folder"]) {
            FileOp::CreateDirectory
        } else if mentions_any(description, &["list"]) {
            FileOp::ListDirectory
        } else if mentions_any(description, &["delete"]) {
            FileOp::DeleteFile
        } else {
            return None;
        };
        Some(op.as_str())
    }

    async fn execute(&self, operation: &str, params: &Params) -> Result<Value, String> {
        let op = FileOp::parse(operation).ok_or_else(|| format!("Unsupported operation: {operation}"))?;
        let result = match op {
            FileOp::CreateFile => self.create_file(params).await,
            FileOp::ReadFile => self.read_file(params).await,
            FileOp::CreateDirectory => self.create_directory(params).await,
            FileOp::ListDirectory => self.list_directory(params).await,
            FileOp::DeleteFile => self.delete_file(params).await,
        };
        // 越界路径等校验错误以失败结果返回，而不是工具异常
        Ok(result.unwrap_or_else(|e| json!({"success": false, "error": e})))
    }
}
