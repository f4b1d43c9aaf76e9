//! Cleaning raw Markdown exports into ingestible documents.
//!
//! `proto prepare <client>` walks `<client>/original_documents` and, for every
//! Markdown file:
//!
//! 1. normalizes the markup (line endings, `<br>`, images, blank-line runs,
//!    `###NAME###` brand placeholders);
//! 2. moves the YAML front matter into a `<name>.json` sidecar, the format
//!    [`MarkdownLoader`](crate::loader::MarkdownLoader) reads;
//! 3. fills `{{< param key >}}` shortcodes from that front matter;
//! 4. optionally translates the prose line by line. Fenced code blocks pass
//!    through untouched, and list or heading markers are kept in front of the
//!    translated text.
//!
//! Results are written to the client's `source_documents`. Files whose name
//! (or any parent directory) starts with `_` are skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use gray_matter::engine::YAML;
use gray_matter::Matter;
use regex::{Captures, NoExpand, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::translate::{resilient_translate, Translator};

pub const ORIGINAL_DIR: &str = "original_documents";

/// Front matter fields carried into the sidecar.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct FrontMatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl FrontMatter {
    /// Value substituted for `{{< param key >}}`.
    fn param(&self, key: &str) -> Option<String> {
        match key {
            "slug" => self.slug.clone(),
            "title" => self.title.clone(),
            "description" => self.description.clone(),
            "tags" if !self.tags.is_empty() => Some(self.tags.join(", ")),
            _ => None,
        }
    }
}

/// Source and target language for translated output.
#[derive(Clone)]
pub struct TranslateSpec {
    pub translator: Arc<dyn Translator>,
    pub from: String,
    pub to: String,
}

#[derive(Clone, Default)]
pub struct PrepareOptions {
    pub translation: Option<TranslateSpec>,
    /// Replacement for `###NAME###` placeholders.
    pub brand: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub body: String,
    pub meta: FrontMatter,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PrepareReport {
    pub cleaned: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Preparer {
    options: PrepareOptions,
    placeholder: Regex,
    image: Regex,
    blank_runs: Regex,
    param: Regex,
    marker: Regex,
}

impl Preparer {
    pub fn new(options: PrepareOptions) -> Result<Self> {
        Ok(Self {
            options,
            placeholder: Regex::new(r"###[A-Z_]*###")?,
            image: Regex::new(r"!\[[^\]]*\]\([^)]*\)")?,
            blank_runs: Regex::new(r"[ \t]*\n[ \t]*\n(?:[ \t]*\n)+")?,
            param: Regex::new(r"\{\{<\s*param\s+([A-Za-z0-9_]+)\s*>\}\}")?,
            marker: Regex::new(r"^(\s*(?:#{1,6}\s+|[*+-]\s+|\d+\.\s+|>\s*)?)(.*)$")?,
        })
    }

    fn normalize(&self, raw: &str) -> String {
        let text = raw.replace("\r\n", "\n").replace('\r', "\n");
        let text = match &self.options.brand {
            Some(brand) => self
                .placeholder
                .replace_all(&text, NoExpand(brand))
                .into_owned(),
            None => text,
        };
        let text = text.replace("<br>", "\n");
        let text = self.image.replace_all(&text, "");
        self.blank_runs.replace_all(&text, "\n\n").into_owned()
    }

    async fn translate(&self, text: &str) -> Result<String> {
        match &self.options.translation {
            Some(spec) => Ok(resilient_translate(spec.translator.as_ref(), text, &spec.from, &spec.to).await?),
            None => Ok(text.to_string()),
        }
    }

    async fn translate_meta(&self, mut meta: FrontMatter) -> Result<FrontMatter> {
        if self.options.translation.is_none() {
            return Ok(meta);
        }
        if let Some(title) = meta.title.take() {
            meta.title = Some(self.translate(&title).await?);
        }
        if let Some(description) = meta.description.take() {
            meta.description = Some(self.translate(&description).await?);
        }
        let mut tags = Vec::with_capacity(meta.tags.len());
        for tag in &meta.tags {
            tags.push(self.translate(tag).await?);
        }
        meta.tags = tags;
        Ok(meta)
    }

    async fn translate_body(&self, body: &str) -> Result<String> {
        if self.options.translation.is_none() {
            return Ok(body.to_string());
        }
        let mut out = Vec::new();
        let mut in_code = false;
        for line in body.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("```") {
                let one_liner = trimmed.len() > 3 && trimmed.ends_with("```");
                if !one_liner {
                    in_code = !in_code;
                }
                out.push(line.to_string());
                continue;
            }
            if in_code || trimmed.is_empty() {
                out.push(line.to_string());
                continue;
            }
            let (marker, prose) = match self.marker.captures(line) {
                Some(caps) => (
                    caps.get(1).map_or("", |m| m.as_str()),
                    caps.get(2).map_or("", |m| m.as_str()),
                ),
                None => ("", line),
            };
            if prose.trim().is_empty() {
                out.push(line.to_string());
                continue;
            }
            out.push(format!("{}{}", marker, self.translate(prose).await?));
        }
        Ok(out.join("\n"))
    }

    /// Cleans one document. The body is empty when nothing but front matter
    /// remains.
    pub async fn prepare_document(&self, raw: &str) -> Result<Prepared> {
        let normalized = self.normalize(raw);
        let parsed = Matter::<YAML>::new()
            .parse::<FrontMatter>(&normalized)
            .context("Invalid front matter")?;
        let meta = parsed.data.unwrap_or_default();

        let body = self
            .param
            .replace_all(&parsed.content, |caps: &Captures| {
                meta.param(&caps[1]).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();
        let body = self.translate_body(&body).await?;
        let meta = self.translate_meta(meta).await?;

        let body = body.trim();
        Ok(Prepared {
            body: if body.is_empty() {
                String::new()
            } else {
                format!("{}\n", body)
            },
            meta,
        })
    }

    /// `guide.de.md` becomes `guide.en.md` when translating from `de` to
    /// `en`; other names are kept.
    pub fn target_name(&self, rel: &Path) -> PathBuf {
        let Some(spec) = &self.options.translation else {
            return rel.to_path_buf();
        };
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let from_suffix = format!(".{}.md", spec.from);
        match name.strip_suffix(&from_suffix) {
            Some(stem) => rel.with_file_name(format!("{}.{}.md", stem, spec.to)),
            None => rel.to_path_buf(),
        }
    }
}

fn is_hidden_draft(rel: &Path) -> bool {
    rel.components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('_'))
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md"))
}

/// Prepares every Markdown file under `input` into `output`.
pub async fn prepare_dir(preparer: &Preparer, input: &Path, output: &Path) -> Result<PrepareReport> {
    if !input.is_dir() {
        anyhow::bail!("Original documents directory does not exist: {}", input.display());
    }
    let mut report = PrepareReport::default();
    for entry in WalkDir::new(input).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(input).unwrap_or(entry.path());
        if !is_markdown(rel) || is_hidden_draft(rel) {
            debug!(path = %rel.display(), "Skipping");
            report.skipped += 1;
            continue;
        }

        let raw = match tokio::fs::read_to_string(entry.path()).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Failed to read document, skipping");
                report.failed += 1;
                continue;
            }
        };
        let prepared = match preparer.prepare_document(&raw).await {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %format!("{:#}", e), "Failed to prepare document, skipping");
                report.failed += 1;
                continue;
            }
        };
        if prepared.body.is_empty() {
            report.skipped += 1;
            continue;
        }

        let target = output.join(preparer.target_name(rel));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &prepared.body)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
        let sidecar = target.with_extension("json");
        tokio::fs::write(&sidecar, serde_json::to_string_pretty(&prepared.meta)?)
            .await
            .with_context(|| format!("Failed to write {}", sidecar.display()))?;
        debug!(target = %target.display(), "Prepared document");
        report.cleaned += 1;
    }
    Ok(report)
}

/// `proto prepare <client>`.
pub async fn run_prepare(config: &Config, client: &str, options: PrepareOptions) -> Result<PrepareReport> {
    let input = config.client_dir(client).join(ORIGINAL_DIR);
    let output = config.source_dir(client);
    info!(client, input = %input.display(), output = %output.display(), "Preparing documents");
    let preparer = Preparer::new(options)?;
    prepare_dir(&preparer, &input, &output).await
}
