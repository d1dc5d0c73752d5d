//! Named composition templates stored on disk.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::domain::request::validate_template_name;
use crate::{Error, Result};

/// File extensions probed for a template, in order.
const TEMPLATE_EXTENSIONS: &[&str] = &["json", "js", "tsx", "jsx", "ts"];

/// A resolved template.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub path: PathBuf,
    pub source: String,
}

impl Template {
    /// File name the source is written under when compiled.
    pub fn file_name(&self) -> String {
        let ext = self
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("js");
        format!("composition.{ext}")
    }
}

/// Directory of `<name>.<ext>` template files.
#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    dir: PathBuf,
}

impl TemplateLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        TEMPLATE_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{name}.{ext}")))
            .find(|path| path.is_file())
    }

    /// Whether a template with this name exists. Invalid names never exist.
    pub fn exists(&self, name: &str) -> bool {
        validate_template_name(name).is_ok() && self.locate(name).is_some()
    }

    /// Load a template's source text.
    pub async fn resolve(&self, name: &str) -> Result<Template> {
        validate_template_name(name)?;
        let path = self
            .locate(name)
            .ok_or_else(|| Error::validation(format!("unknown template '{name}'")))?;

        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::io_path("reading template", &path, e))?;
        debug!(template = %name, path = %path.display(), "Resolved template");

        Ok(Template {
            name: name.to_string(),
            path,
            source,
        })
    }

    /// Names of all templates in the library, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io_path("listing templates", &self.dir, e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext))
            })
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
            .filter(|name| validate_template_name(name).is_ok())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
