//! Manifest rendering via the external `kustomize` binary.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::clients::ManifestRenderer;
use crate::error::{Error, Result};

/// Renders a kustomization directory into a list of manifest documents.
#[derive(Debug, Clone, Default)]
pub struct Kustomizer;

impl Kustomizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Split multi-document YAML output into its documents, dropping empties.
fn split_documents(output: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in output.lines() {
        if line.trim() == "---" {
            flush_document(&mut documents, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    flush_document(&mut documents, &mut current);
    documents
}

fn flush_document(documents: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        documents.push(format!("{trimmed}\n"));
    }
    current.clear();
}

#[async_trait]
impl ManifestRenderer for Kustomizer {
    async fn render(&self, dir: &Path) -> Result<Vec<String>> {
        info!(dir = %dir.display(), "building kustomize resources");

        let output = Command::new("kustomize")
            .arg("build")
            .arg(dir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Command {
                program: "kustomize".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(split_documents(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_documents_in_order() {
        let output = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: dev\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: svc-api\n";
        let documents = split_documents(output);
        assert_eq!(documents.len(), 2);
        assert!(documents[0].contains("kind: Namespace"));
        assert!(documents[1].contains("kind: Deployment"));
    }

    #[test]
    fn drops_empty_documents() {
        let output = "---\n\n---\nkind: Service\nmetadata:\n  name: svc\n";
        let documents = split_documents(output);
        assert_eq!(documents.len(), 1);
        assert!(documents[0].starts_with("kind: Service"));
    }

    #[test]
    fn single_document_passes_through() {
        let output = "kind: ConfigMap\nmetadata:\n  name: cfg\n";
        let documents = split_documents(output);
        assert_eq!(documents, vec!["kind: ConfigMap\nmetadata:\n  name: cfg\n"]);
    }
}
