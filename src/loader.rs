//! Document loaders keyed by file extension.
//!
//! A [`LoaderMapping`] maps lowercase extensions to [`Loader`]s. The
//! ingestion pipeline builds its file filter from the same mapping
//! ([`LoaderMapping::globset`]), so a file with an unsupported extension is
//! never handed to a loader.
//!
//! | Extension | Loader | Units | Extra metadata |
//! |-----------|--------|-------|----------------|
//! | `txt` | [`TextLoader`] | 1 | - |
//! | `md` | [`MarkdownLoader`] | 1 | `title`, `slug`, `tags` (from `<name>.json`) |
//! | `csv` | [`CsvLoader`] | 1 per row | `row` |
//! | `html`, `htm` | [`HtmlLoader`] | 1 | `title`, `link_urls`, `link_texts`, `emphasized_text_*` |
//! | `pdf` | [`PdfLoader`] | 1 | - |
//! | `docx` | [`DocxLoader`] | 1 | - |
//! | `pptx` | [`PptxLoader`] | 1 | - |
//!
//! Every unit also carries `source` (path relative to the corpus root) in
//! its metadata.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use thiserror::Error;

use crate::extract::{self, ExtractError};
use crate::filter::modified_millis;
use crate::models::DocumentUnit;

/// A load failure annotated with the file it came from.
#[derive(Debug, Error)]
#[error("{}: {source}", .path.display())]
pub struct LoadError {
    pub path: PathBuf,
    #[source]
    pub source: ExtractError,
}

/// Converts one file into zero or more document units.
pub trait Loader: Send + Sync {
    /// `source` is the relative path recorded on every unit.
    fn load(
        &self,
        path: &Path,
        source: &str,
        modified_at: i64,
    ) -> Result<Vec<DocumentUnit>, ExtractError>;
}

pub struct TextLoader;

impl Loader for TextLoader {
    fn load(
        &self,
        path: &Path,
        source: &str,
        modified_at: i64,
    ) -> Result<Vec<DocumentUnit>, ExtractError> {
        let text = std::fs::read_to_string(path)?;
        Ok(vec![DocumentUnit::new(source, text, modified_at)])
    }
}

#[derive(Debug, Default, Deserialize)]
struct Sidecar {
    slug: Option<String>,
    title: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Markdown with optional `<name>.json` sidecar metadata.
pub struct MarkdownLoader;

impl Loader for MarkdownLoader {
    fn load(
        &self,
        path: &Path,
        source: &str,
        modified_at: i64,
    ) -> Result<Vec<DocumentUnit>, ExtractError> {
        let text = std::fs::read_to_string(path)?;
        let sidecar_path = path.with_extension("json");
        let sidecar: Sidecar = if sidecar_path.is_file() {
            serde_json::from_str(&std::fs::read_to_string(&sidecar_path)?)?
        } else {
            Sidecar::default()
        };

        let title = sidecar.title.or_else(|| first_heading(&text));
        let mut unit = DocumentUnit::new(source, text, modified_at);
        if let Some(title) = title {
            unit = unit.with_meta("title", title);
        }
        if let Some(slug) = sidecar.slug {
            unit = unit.with_meta("slug", slug);
        }
        if !sidecar.tags.is_empty() {
            unit = unit.with_meta("tags", sidecar.tags);
        }
        Ok(vec![unit])
    }
}

fn first_heading(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| l.starts_with('#'))
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
}

/// One unit per data row, rendered as `header: value` lines.
pub struct CsvLoader;

impl Loader for CsvLoader {
    fn load(
        &self,
        path: &Path,
        source: &str,
        modified_at: i64,
    ) -> Result<Vec<DocumentUnit>, ExtractError> {
        let content = std::fs::read_to_string(path)?;
        let (header, rows) = extract::parse_csv(&content)?;
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let text = header
                    .iter()
                    .zip(row.iter())
                    .map(|(h, v)| format!("{}: {}", h.trim(), v.trim()))
                    .collect::<Vec<_>>()
                    .join("\n");
                DocumentUnit::new(source, text, modified_at).with_meta("row", i.to_string())
            })
            .collect())
    }
}

pub struct HtmlLoader;

impl Loader for HtmlLoader {
    fn load(
        &self,
        path: &Path,
        source: &str,
        modified_at: i64,
    ) -> Result<Vec<DocumentUnit>, ExtractError> {
        let bytes = std::fs::read(path)?;
        let page = extract::extract_html(&String::from_utf8_lossy(&bytes));

        let mut unit = DocumentUnit::new(source, page.text, modified_at);
        if let Some(title) = page.title {
            unit = unit.with_meta("title", title);
        }
        for (key, values) in [
            ("link_urls", page.link_urls),
            ("link_texts", page.link_texts),
            ("emphasized_text_contents", page.emphasized_text_contents),
            ("emphasized_text_tags", page.emphasized_text_tags),
        ] {
            if !values.is_empty() {
                unit = unit.with_meta(key, values);
            }
        }
        Ok(vec![unit])
    }
}

pub struct PdfLoader;

impl Loader for PdfLoader {
    fn load(
        &self,
        path: &Path,
        source: &str,
        modified_at: i64,
    ) -> Result<Vec<DocumentUnit>, ExtractError> {
        let text = extract::extract_pdf(&std::fs::read(path)?)?;
        Ok(vec![DocumentUnit::new(source, text, modified_at)])
    }
}

pub struct DocxLoader;

impl Loader for DocxLoader {
    fn load(
        &self,
        path: &Path,
        source: &str,
        modified_at: i64,
    ) -> Result<Vec<DocumentUnit>, ExtractError> {
        let text = extract::extract_docx(&std::fs::read(path)?)?;
        Ok(vec![DocumentUnit::new(source, text, modified_at)])
    }
}

pub struct PptxLoader;

impl Loader for PptxLoader {
    fn load(
        &self,
        path: &Path,
        source: &str,
        modified_at: i64,
    ) -> Result<Vec<DocumentUnit>, ExtractError> {
        let text = extract::extract_pptx(&std::fs::read(path)?)?;
        Ok(vec![DocumentUnit::new(source, text, modified_at)])
    }
}

/// Extension → loader table.
#[derive(Clone, Default)]
pub struct LoaderMapping {
    loaders: BTreeMap<String, Arc<dyn Loader>>,
}

impl LoaderMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut mapping = Self::new();
        mapping.register("txt", Arc::new(TextLoader));
        mapping.register("md", Arc::new(MarkdownLoader));
        mapping.register("csv", Arc::new(CsvLoader));
        mapping.register("html", Arc::new(HtmlLoader));
        mapping.register("htm", Arc::new(HtmlLoader));
        mapping.register("pdf", Arc::new(PdfLoader));
        mapping.register("docx", Arc::new(DocxLoader));
        mapping.register("pptx", Arc::new(PptxLoader));
        mapping
    }

    /// Registers `loader` for `ext` (without the dot, any case).
    pub fn register(&mut self, ext: &str, loader: Arc<dyn Loader>) {
        self.loaders
            .insert(ext.trim_start_matches('.').to_lowercase(), loader);
    }

    /// Case-insensitive `**/*.<ext>` globs for every registered extension.
    pub fn globset(&self) -> Result<GlobSet, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for ext in self.loaders.keys() {
            builder.add(
                GlobBuilder::new(&format!("**/*.{}", ext))
                    .case_insensitive(true)
                    .literal_separator(false)
                    .build()?,
            );
        }
        builder.build()
    }

    pub fn loader_for(&self, path: &Path) -> Option<Arc<dyn Loader>> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.loaders.get(&ext).cloned()
    }

    /// Loads `path`, recording it relative to `root`.
    pub fn load_file(&self, root: &Path, path: &Path) -> Result<Vec<DocumentUnit>, LoadError> {
        let annotate = |source: ExtractError| LoadError {
            path: path.to_path_buf(),
            source,
        };
        let loader = self.loader_for(path).ok_or_else(|| {
            annotate(ExtractError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no loader for extension",
            )))
        })?;
        let source = relative_source(root, path);
        let modified_at = modified_millis(path).map_err(|e| annotate(e.into()))?;
        let units = loader
            .load(path, &source, modified_at)
            .map_err(annotate)?;
        Ok(units
            .into_iter()
            .map(|u| {
                let source = u.source.clone();
                u.with_meta("source", source)
            })
            .collect())
    }
}

/// `path` relative to `root`, with forward slashes.
pub fn relative_source(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
