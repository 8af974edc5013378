/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! File staging for uploaded attachments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::TaskError;

/// Validates and stages one uploaded file for a grievance.
#[async_trait]
pub trait FileService: Send + Sync {
    /// `file_data` carries at least `file_name` and `file_path` (the
    /// temporary upload location). Returns the staged file metadata.
    async fn process_upload(
        &self,
        grievance_id: &str,
        file_data: &Value,
    ) -> Result<Value, TaskError>;
}

/// Stages uploads on the local filesystem under one directory per
/// grievance, validating the extension against the allowed set.
pub struct LocalFileService {
    upload_dir: PathBuf,
    allowed_extensions: Vec<String>,
}

impl LocalFileService {
    pub fn new(upload_dir: PathBuf, allowed_extensions: Vec<String>) -> Self {
        Self {
            upload_dir,
            allowed_extensions,
        }
    }

    fn validate_extension(&self, file_name: &str) -> Result<String, TaskError> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| {
                TaskError::Input(format!("file '{}' has no extension", file_name))
            })?;
        if !self.allowed_extensions.contains(&extension) {
            return Err(TaskError::Input(format!(
                "file type '{}' is not allowed",
                extension
            )));
        }
        Ok(extension)
    }
}

#[async_trait]
impl FileService for LocalFileService {
    async fn process_upload(
        &self,
        grievance_id: &str,
        file_data: &Value,
    ) -> Result<Value, TaskError> {
        let file_name = file_data
            .get("file_name")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::Input("file_data missing file_name".to_string()))?;
        let source_path = file_data
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::Input("file_data missing file_path".to_string()))?;

        let extension = self.validate_extension(file_name)?;

        let metadata = tokio::fs::metadata(source_path).await?;
        let file_size = metadata.len();

        let target_dir = self.upload_dir.join(grievance_id);
        tokio::fs::create_dir_all(&target_dir).await?;
        let file_id = Uuid::new_v4().to_string();
        let target_path = target_dir.join(format!("{}.{}", file_id, extension));
        tokio::fs::copy(source_path, &target_path).await?;

        Ok(json!({
            "file_id": file_id,
            "file_name": file_name,
            "file_path": target_path.to_string_lossy(),
            "file_type": extension,
            "file_size": file_size,
        }))
    }
}

/// Mock file service: validates nothing, stages nothing.
#[derive(Default)]
pub struct MockFileService {
    processed: Mutex<Vec<(String, Value)>>,
    fail_next: Mutex<Option<TaskError>>,
}

impl MockFileService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: TaskError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn processed(&self) -> Vec<(String, Value)> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl FileService for MockFileService {
    async fn process_upload(
        &self,
        grievance_id: &str,
        file_data: &Value,
    ) -> Result<Value, TaskError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        self.processed
            .lock()
            .push((grievance_id.to_string(), file_data.clone()));
        Ok(json!({
            "file_id": Uuid::new_v4().to_string(),
            "file_name": file_data.get("file_name").cloned().unwrap_or(json!("mock.pdf")),
            "file_size": 1024,
        }))
    }
}
