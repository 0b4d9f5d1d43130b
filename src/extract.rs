//! Raw text extraction from PDF, EPUB and plain-text files.
//!
//! The format is chosen purely from the lower-cased file extension. PDF and
//! EPUB support are compiled in through the `pdf` and `epub` cargo features;
//! [`Capabilities::detect`] reports which ones this build carries.

use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Pdf,
    Epub,
}

impl DocumentFormat {
    /// Resolve the format of `path` from its extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = extension_of(path);
        match extension.as_str() {
            "pdf" => Ok(Self::Pdf),
            "epub" => Ok(Self::Epub),
            ext if TEXT_EXTENSIONS.contains(&ext) => Ok(Self::Text),
            _ => Err(Error::UnsupportedFormat {
                extension: display_extension(&extension),
            }),
        }
    }
}

/// Which extractors this build carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub text: bool,
    pub pdf: bool,
    pub epub: bool,
}

impl Capabilities {
    pub const fn detect() -> Self {
        Self {
            text: true,
            pdf: cfg!(feature = "pdf"),
            epub: cfg!(feature = "epub"),
        }
    }

    pub fn supports(&self, format: DocumentFormat) -> bool {
        match format {
            DocumentFormat::Text => self.text,
            DocumentFormat::Pdf => self.pdf,
            DocumentFormat::Epub => self.epub,
        }
    }

    /// Extensions (without the leading dot) that can be extracted.
    pub fn supported_extensions(&self) -> Vec<&'static str> {
        let mut extensions = TEXT_EXTENSIONS.to_vec();
        if self.pdf {
            extensions.push("pdf");
        }
        if self.epub {
            extensions.push("epub");
        }
        extensions
    }
}

/// Returns `true` if `path` has an extension this build can extract.
pub fn is_supported(path: &Path) -> bool {
    DocumentFormat::from_path(path)
        .is_ok_and(|format| Capabilities::detect().supports(format))
}

/// Extract the raw text of the document at `path`.
pub fn extract(path: &Path) -> Result<String> {
    let format = DocumentFormat::from_path(path)?;
    if !Capabilities::detect().supports(format) {
        return Err(Error::UnsupportedFormat {
            extension: format!(
                "{} (support not built in)",
                display_extension(&extension_of(path))
            ),
        });
    }

    tracing::debug!(path = %path.display(), ?format, "extracting text");

    match format {
        DocumentFormat::Text => extract_plain_text(path),
        DocumentFormat::Pdf => extract_pdf(path),
        DocumentFormat::Epub => extract_epub(path),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

fn display_extension(extension: &str) -> String {
    if extension.is_empty() {
        "(none)".to_string()
    } else {
        format!(".{extension}")
    }
}

fn extraction_error(path: &Path, message: impl std::fmt::Display) -> Error {
    Error::Extraction {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// UTF-8, falling back to Latin-1 when the bytes are not valid UTF-8.
fn extract_plain_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| extraction_error(path, e))?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(e) => {
            tracing::debug!(
                path = %path.display(),
                "not valid UTF-8, decoding as Latin-1"
            );
            Ok(e.into_bytes().into_iter().map(char::from).collect())
        }
    }
}

#[cfg(feature = "pdf")]
fn extract_pdf(path: &Path) -> Result<String> {
    // pdf-extract panics on some malformed inputs.
    let extracted = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
        || pdf_extract::extract_text(path),
    ))
    .map_err(|_| extraction_error(path, "PDF parser panicked"))?;
    extracted.map_err(|e| extraction_error(path, e))
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(path: &Path) -> Result<String> {
    Err(extraction_error(path, "PDF support not built in"))
}

#[cfg(feature = "epub")]
fn extract_epub(path: &Path) -> Result<String> {
    epub::extract(path)
}

#[cfg(not(feature = "epub"))]
fn extract_epub(path: &Path) -> Result<String> {
    Err(extraction_error(path, "EPUB support not built in"))
}

#[cfg(feature = "epub")]
mod epub {
    use std::{fs::File, io::Read, path::Path};

    use scraper::{Html, Selector};
    use zip::ZipArchive;

    use super::extraction_error;
    use crate::{error::Result, text_util::normalize_whitespace};

    const CONTAINER_PATH: &str = "META-INF/container.xml";

    pub(super) fn extract(path: &Path) -> Result<String> {
        let file = File::open(path).map_err(|e| extraction_error(path, e))?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| extraction_error(path, e))?;

        let documents = match spine_documents(&mut archive, path)? {
            Some(documents) if !documents.is_empty() => documents,
            _ => archive_documents(&mut archive),
        };

        let mut sections = Vec::new();
        for name in documents {
            let Ok(markup) = read_entry(&mut archive, &name) else {
                tracing::warn!(entry = %name, "skipping unreadable EPUB entry");
                continue;
            };
            let text = html_text(&markup, path)?;
            if !text.is_empty() {
                sections.push(text);
            }
        }

        Ok(sections.join("\n\n"))
    }

    fn read_entry(
        archive: &mut ZipArchive<File>,
        name: &str,
    ) -> std::io::Result<String> {
        let mut entry = archive.by_name(name)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn selector(css: &str, path: &Path) -> Result<Selector> {
        Selector::parse(css).map_err(|e| extraction_error(path, e))
    }

    /// Content documents in reading order, as listed by the OPF spine.
    fn spine_documents(
        archive: &mut ZipArchive<File>,
        path: &Path,
    ) -> Result<Option<Vec<String>>> {
        let Ok(container) = read_entry(archive, CONTAINER_PATH) else {
            return Ok(None);
        };
        let container = Html::parse_document(&container);
        let rootfile = selector("rootfile[full-path]", path)?;
        let Some(opf_path) = container
            .select(&rootfile)
            .next()
            .and_then(|el| el.value().attr("full-path"))
            .map(str::to_string)
        else {
            return Ok(None);
        };

        let Ok(opf) = read_entry(archive, &opf_path) else {
            return Ok(None);
        };
        let opf = Html::parse_document(&opf);
        let base = opf_path
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();

        let item = selector("item[id][href]", path)?;
        let manifest: Vec<(&str, &str)> = opf
            .select(&item)
            .filter_map(|el| {
                Some((el.value().attr("id")?, el.value().attr("href")?))
            })
            .collect();

        let itemref = selector("itemref[idref]", path)?;
        let documents = opf
            .select(&itemref)
            .filter_map(|el| el.value().attr("idref"))
            .filter_map(|idref| {
                manifest.iter().find(|(id, _)| *id == idref).map(|(_, href)| {
                    if base.is_empty() {
                        href.to_string()
                    } else {
                        format!("{base}/{href}")
                    }
                })
            })
            .collect();

        Ok(Some(documents))
    }

    /// Every (X)HTML entry, in archive order.
    fn archive_documents(archive: &mut ZipArchive<File>) -> Vec<String> {
        (0..archive.len())
            .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().to_string()))
            .filter(|name| {
                let lower = name.to_lowercase();
                lower.ends_with(".xhtml")
                    || lower.ends_with(".html")
                    || lower.ends_with(".htm")
            })
            .collect()
    }

    fn html_text(markup: &str, path: &Path) -> Result<String> {
        let document = Html::parse_document(markup);
        let body = selector("body", path)?;
        let text = match document.select(&body).next() {
            Some(body) => body.text().collect::<Vec<_>>().join(" "),
            None => document.root_element().text().collect::<Vec<_>>().join(" "),
        };
        Ok(normalize_whitespace(&text))
    }

}
