//! Template lookup and document URL construction.

use std::path::{Path, PathBuf};

use url::Url;

use super::types::{RenderError, RenderJob};

const TEMPLATE_EXTENSION: &str = "html";

/// Directory of `<name>.html` card templates.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    root: PathBuf,
}

impl TemplateCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a template name to an existing file.
    ///
    /// Names are plain identifiers; anything that could step outside the
    /// template directory is reported as not found.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf, RenderError> {
        if !is_template_name(name) {
            return Err(RenderError::template_not_found(name));
        }

        let path = self.root.join(format!("{name}.{TEMPLATE_EXTENSION}"));
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(RenderError::template_not_found(name)),
        }
    }

    /// `file://` URL of the template with the title and options as query parameters.
    pub async fn document_url(&self, job: &RenderJob) -> Result<Url, RenderError> {
        let path = self.resolve(&job.template).await?;
        let absolute = tokio::fs::canonicalize(&path)
            .await
            .map_err(|_| RenderError::template_not_found(&job.template))?;
        let mut url = Url::from_file_path(&absolute)
            .map_err(|_| RenderError::page_load(format!("`{}` is not a file URL", absolute.display())))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("title", &job.title);
            for (key, value) in job.options.iter() {
                query.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

fn is_template_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
