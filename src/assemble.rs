// src/assemble.rs

use crate::config::ProcessingMode;
use crate::document::SourceDocument;
use crate::error::WriteError;
use crate::grouper::{DriverBuckets, PageRef};
use crate::report::{DriverFailure, ProcessingReport};
use lopdf::{Dictionary, Document, Object, ObjectId, dictionary};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Page attributes a page may inherit from its page-tree ancestors.
const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

pub const UNMATCHED_FILE_NAME: &str = "Unmatched_Pages.pdf";
pub const REPORT_FILE_NAME: &str = "processing_report.json";

/// One driver document that made it to disk.
#[derive(Debug, Clone)]
pub struct DriverOutput {
    pub driver_id: String,
    pub path: PathBuf,
    pub pages: usize,
    /// Pages that made it into the file, in file order.
    pub included: Vec<PageRef>,
}

/// Pages placed in a written document, and those left out.
struct CopiedPages {
    included: Vec<PageRef>,
    skipped: Vec<WriteError>,
}

#[derive(Debug, Clone, Default)]
pub struct AssemblyOutcome {
    pub written: Vec<DriverOutput>,
    pub failures: Vec<DriverFailure>,
}

impl AssemblyOutcome {
    /// Copy written paths and failures into `report`.
    pub fn record(&self, report: &mut ProcessingReport) {
        report
            .written_files
            .extend(self.written.iter().map(|w| w.path.clone()));
        report.failures.extend(self.failures.iter().cloned());
    }
}

/// `Driver_<id>_Orders.pdf` or `Driver_<id>_Picking_Dockets.pdf`.
pub fn output_file_name(driver_id: &str, mode: ProcessingMode) -> String {
    let safe: String = driver_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match mode {
        ProcessingMode::Route => format!("Driver_{safe}_Orders.pdf"),
        ProcessingMode::Picking => format!("Driver_{safe}_Picking_Dockets.pdf"),
    }
}

/// Claim `name` in `used`, or the first free `<stem>_<n>.pdf` after it.
/// Names are compared case-insensitively.
fn claim_file_name(name: String, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_ascii_lowercase()) {
        return name;
    }
    let stem = name.strip_suffix(".pdf").unwrap_or(&name);
    let mut n = 2;
    loop {
        let candidate = format!("{stem}_{n}.pdf");
        if used.insert(candidate.to_ascii_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

/// Write one document per driver. A failing driver is reported and skipped.
/// Drivers whose ids sanitise to the same file name get numbered suffixes,
/// assigned in driver order.
pub fn assemble(
    buckets: &DriverBuckets,
    documents: &[SourceDocument],
    output_dir: &Path,
    mode: ProcessingMode,
) -> AssemblyOutcome {
    let mut outcome = AssemblyOutcome::default();

    if let Err(source) = fs::create_dir_all(output_dir) {
        let err = WriteError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        };
        error!(error = %err, "Cannot create output directory");
        outcome.failures = buckets
            .drivers()
            .map(|driver_id| DriverFailure {
                driver_id: driver_id.to_string(),
                reason: err.to_string(),
            })
            .collect();
        return outcome;
    }

    let mut used = HashSet::from([UNMATCHED_FILE_NAME.to_ascii_lowercase()]);
    for (driver_id, entries) in buckets.iter() {
        let base = output_file_name(driver_id, mode);
        let name = claim_file_name(base.clone(), &mut used);
        if name != base {
            warn!(
                taken = %base,
                file = %name,
                "Output name already used by another driver"
            );
        }
        let path = output_dir.join(name);
        let span = tracing::info_span!("driver", driver = %driver_id);
        let _guard = span.enter();

        let pages: Vec<PageRef> = entries.iter().map(|e| e.source).collect();
        if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
            info!(
                pages = pages.len(),
                first_order = %first.order_id,
                first_stop = first.sequence_number,
                last_order = %last.order_id,
                last_stop = last.sequence_number,
                "Creating {}",
                path.display()
            );
        }

        match write_pages(documents, &pages, &path) {
            Ok(CopiedPages { included, skipped }) => {
                for err in &skipped {
                    outcome.failures.push(DriverFailure {
                        driver_id: driver_id.to_string(),
                        reason: err.to_string(),
                    });
                }
                info!(pages = included.len(), "Created {}", path.display());
                outcome.written.push(DriverOutput {
                    driver_id: driver_id.to_string(),
                    path,
                    pages: included.len(),
                    included,
                });
            }
            Err(err) => {
                error!(error = %err, "Failed to write driver document");
                outcome.failures.push(DriverFailure {
                    driver_id: driver_id.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    outcome
}

/// Catch-all document for pages that resolved to no driver, in arrival order.
pub fn write_unmatched(
    unmatched: &[PageRef],
    documents: &[SourceDocument],
    output_dir: &Path,
) -> Result<Option<PathBuf>, WriteError> {
    if unmatched.is_empty() {
        return Ok(None);
    }
    fs::create_dir_all(output_dir).map_err(|source| WriteError::OutputDir {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let path = output_dir.join(UNMATCHED_FILE_NAME);
    let copied = write_pages(documents, unmatched, &path)?;
    for err in &copied.skipped {
        warn!(error = %err, "Page left out of unmatched document");
    }
    info!(pages = copied.included.len(), "Created {}", path.display());
    Ok(Some(path))
}

/// Text summary and JSON report. Returns the paths written.
pub fn write_summary(
    report: &ProcessingReport,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    fs::create_dir_all(output_dir)?;
    let text_name = match report.mode {
        ProcessingMode::Route => "processing_summary.txt",
        ProcessingMode::Picking => "picking_dockets_summary.txt",
    };
    let text_path = output_dir.join(text_name);
    fs::write(&text_path, report.render_text())?;

    let json_path = output_dir.join(REPORT_FILE_NAME);
    fs::write(&json_path, serde_json::to_string_pretty(report)?)?;

    Ok(vec![text_path, json_path])
}

/// Copy `pages`, in order, into a new PDF at `path`. Pages that cannot be copied
/// are left out and reported; the document fails only if none survive.
fn write_pages(
    documents: &[SourceDocument],
    pages: &[PageRef],
    path: &Path,
) -> Result<CopiedPages, WriteError> {
    let mut output = Document::with_version("1.5");
    let pages_id = output.new_object_id();
    let mut next_id = output.max_id + 1;

    // (document, page) -> object id in `output`
    let mut copied: HashMap<PageRef, ObjectId> = HashMap::new();
    let mut seen: Vec<usize> = Vec::new();
    for page in pages {
        if !seen.contains(&page.document) {
            seen.push(page.document);
        }
    }

    for &position in &seen {
        let Some(source) = documents.get(position) else {
            continue;
        };
        let mut doc = source.pdf().clone();
        doc.renumber_objects_with(next_id);
        next_id = doc.max_id + 1;

        let wanted: Vec<(PageRef, ObjectId)> = doc
            .get_pages()
            .into_iter()
            .map(|(number, id)| {
                (
                    PageRef {
                        document: position,
                        page: number as usize,
                    },
                    id,
                )
            })
            .filter(|(page_ref, _)| pages.contains(page_ref))
            .collect();

        let mut inherited: BTreeMap<ObjectId, Vec<(Vec<u8>, Object)>> = BTreeMap::new();
        for (page_ref, id) in &wanted {
            inherited.insert(*id, inherited_attributes(&doc, *id));
            copied.insert(*page_ref, *id);
        }

        for (id, object) in doc.objects {
            if is_structural(&object) {
                continue;
            }
            output.objects.insert(id, object);
        }

        for (id, attributes) in inherited {
            if let Ok(Object::Dictionary(dict)) = output.get_object_mut(id) {
                for (key, value) in attributes {
                    dict.set(key, value);
                }
            }
        }
    }
    output.max_id = next_id.saturating_sub(1).max(output.max_id);

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    let mut included = Vec::with_capacity(pages.len());
    let mut skipped = Vec::new();
    for page_ref in pages {
        let name = documents
            .get(page_ref.document)
            .map(SourceDocument::name)
            .unwrap_or_else(|| format!("document #{}", page_ref.document));
        let Some(&id) = copied.get(page_ref) else {
            skipped.push(WriteError::PageCopy {
                document: name,
                page: page_ref.page,
                reason: "page not found in source".into(),
            });
            continue;
        };
        match output.get_object_mut(id) {
            Ok(Object::Dictionary(dict)) => {
                dict.set("Parent", pages_id);
                kids.push(id.into());
                included.push(*page_ref);
            }
            _ => skipped.push(WriteError::PageCopy {
                document: name,
                page: page_ref.page,
                reason: "page object is not a dictionary".into(),
            }),
        }
    }

    if kids.is_empty() {
        return Err(WriteError::Empty {
            path: path.to_path_buf(),
        });
    }

    let count = kids.len() as i64;
    output.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = output.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    output.trailer.set("Root", catalog_id);
    output.prune_objects();

    output.save(path).map_err(|e| WriteError::Save {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(CopiedPages { included, skipped })
}

/// The source's document catalog, page tree nodes and outlines are rebuilt, not copied.
fn is_structural(object: &Object) -> bool {
    let Ok(dict) = object.as_dict() else {
        return false;
    };
    matches!(
        dict.get(b"Type").and_then(Object::as_name),
        Ok(b"Catalog" | b"Pages" | b"Outlines" | b"Outline")
    )
}

/// Attributes the page inherits from its ancestors and does not set itself.
fn inherited_attributes(doc: &Document, page_id: ObjectId) -> Vec<(Vec<u8>, Object)> {
    let mut found = Vec::new();
    let Ok(page) = doc.get_dictionary(page_id) else {
        return found;
    };
    let mut missing: Vec<&[u8]> = INHERITABLE
        .iter()
        .copied()
        .filter(|key| !page.has(key))
        .collect();

    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    // Bounded walk; malformed files can contain parent cycles.
    for _ in 0..64 {
        if missing.is_empty() {
            break;
        }
        let Some(parent_id) = parent else {
            break;
        };
        let Ok(node) = doc.get_dictionary(parent_id) else {
            break;
        };
        missing.retain(|key| match node.get(key) {
            Ok(value) => {
                found.push((key.to_vec(), value.clone()));
                false
            }
            Err(_) => true,
        });
        parent = parent_of(node);
    }
    found
}

fn parent_of(node: &Dictionary) -> Option<ObjectId> {
    node.get(b"Parent").and_then(Object::as_reference).ok()
}
