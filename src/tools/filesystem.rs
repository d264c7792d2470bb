//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径先做词法归一化（禁止绝对路径与 ../ 逃逸），读取时再
//! canonicalize 校验一次；FileReadTool / FileWriteTool 基于 SafeFs 提供读写能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tools::schema::{object_schema, DataType};
use crate::tools::{Capability, RawOutput, Tool, ToolError};

/// 沙箱文件系统：绑定根目录，路径必须落在根下
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

    /// 词法解析相对路径；越界（如 ../../etc/passwd）返回 InvalidInput
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let mut normalized = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(escape(path));
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape(path)),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(ToolError::InvalidInput("missing path".to_string()));
        }
        Ok(self.root_dir.join(normalized))
    }

    pub async fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.resolve(path)?;
        let canonical = tokio::fs::canonicalize(&resolved)
            .await
            .map_err(|_| ToolError::Failed(format!("missing file: {}", path)))?;
        let root_canon = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());
        if !canonical.starts_with(root_canon) {
            return Err(escape(path)); // 符号链接指向沙箱外
        }
        tokio::fs::read_to_string(&canonical)
            .await
            .map_err(|e| ToolError::Failed(format!("read failed: {}", e)))
    }

    /// 写入文件，按需创建父目录；返回写入字节数
    pub async fn write_file(&self, path: &str, content: &str, append: bool) -> Result<usize, ToolError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Failed(format!("create dir failed: {}", e)))?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&resolved)
                .await
                .map_err(|e| ToolError::Failed(format!("open failed: {}", e)))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| ToolError::Failed(format!("write failed: {}", e)))?;
        } else {
            tokio::fs::write(&resolved, content)
                .await
                .map_err(|e| ToolError::Failed(format!("write failed: {}", e)))?;
        }
        Ok(content.len())
    }
}

fn escape(path: &str) -> ToolError {
    ToolError::InvalidInput(format!("permission denied: {} escapes workspace", path))
}

fn path_arg(input: &Value) -> Result<&str, ToolError> {
    input
        .get("path")
        .and_then(|v| v.as_str())
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidInput("missing argument: path".to_string()))
}

/// 读取文件内容
pub struct FileReadTool {
    fs: SafeFs,
}

impl FileReadTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a file inside the workspace. Args: {\"path\": \"relative path\"}"
    }

    fn capability(&self) -> Capability {
        Capability::FileRead
    }

    fn input_schema(&self) -> Value {
        object_schema(&[("path", "string", "file path relative to workspace")], &["path"])
    }

    fn output_type(&self) -> Option<DataType> {
        Some(DataType::Text)
    }

    async fn invoke(&self, input: Value, _cancel: CancellationToken) -> Result<RawOutput, ToolError> {
        let path = path_arg(&input)?;
        tracing::info!(path = %path, "file_read");
        self.fs.read_file(path).await.map(RawOutput::Text)
    }
}

/// 写入（或追加）文件
pub struct FileWriteTool {
    fs: SafeFs,
}

impl FileWriteTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file inside the workspace. Args: {\"path\": \"relative path\", \"content\": \"text\", \"append\": false}"
    }

    fn capability(&self) -> Capability {
        Capability::FileWrite
    }

    fn input_schema(&self) -> Value {
        object_schema(
            &[
                ("path", "string", "file path relative to workspace"),
                ("content", "string", "text to write"),
                ("append", "boolean", "append instead of overwrite"),
            ],
            &["path", "content"],
        )
    }

    fn output_type(&self) -> Option<DataType> {
        Some(DataType::Json)
    }

    async fn invoke(&self, input: Value, _cancel: CancellationToken) -> Result<RawOutput, ToolError> {
        let path = path_arg(&input)?;
        let content = input
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing argument: content".to_string()))?;
        let append = input.get("append").and_then(|v| v.as_bool()).unwrap_or(false);
        tracing::info!(path = %path, append, "file_write");
        let bytes = self.fs.write_file(path, content, append).await?;
        Ok(RawOutput::Json(serde_json::json!({
            "path": path,
            "bytes_written": bytes,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        assert!(fs.resolve("notes/a.txt").is_ok());
        assert!(fs.resolve("notes/../a.txt").is_ok());
        assert!(matches!(fs.resolve("../../etc/passwd"), Err(ToolError::InvalidInput(_))));
        assert!(matches!(fs.resolve("/etc/passwd"), Err(ToolError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let writer = FileWriteTool::new(fs.clone());
        let reader = FileReadTool::new(fs);

        let out = writer
            .invoke(json!({"path": "a/b.txt", "content": "hello"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, RawOutput::Json(json!({"path": "a/b.txt", "bytes_written": 5})));

        writer
            .invoke(
                json!({"path": "a/b.txt", "content": " world", "append": true}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let text = reader
            .invoke(json!({"path": "a/b.txt"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, RawOutput::Text("hello world".into()));
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FileReadTool::new(SafeFs::new(dir.path()));
        let err = reader
            .invoke(json!({"path": "nope.txt"}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed(msg) if msg.contains("missing file")));
    }

    #[tokio::test]
    async fn test_missing_path_argument() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FileReadTool::new(SafeFs::new(dir.path()));
        let err = reader.invoke(json!({}), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }
}
