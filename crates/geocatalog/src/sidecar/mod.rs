//! Companion files that travel with a dataset: projection files, world
//! files, GDAL auxiliary XML and metadata documents.

pub mod document;
pub mod world;

use std::path::{Path, PathBuf};

use crate::crs::CrsDefinition;
use crate::record::{DescriptiveMetadata, SidecarFlags};

pub use document::{parse_document, DocumentError};
pub use world::{GeoTransform, WorldFile};

/// Inspects the files sitting next to a dataset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarInspector;

impl SidecarInspector {
    pub fn new() -> Self {
        Self
    }

    pub fn flags(&self, path: &Path) -> SidecarFlags {
        SidecarFlags {
            has_prj_file: find_prj(path).is_some(),
            has_world_file: find_world_file(path).is_some(),
            has_aux_xml: aux_xml_path(path).is_file(),
            has_metadata_xml: find_metadata_document(path).is_some(),
        }
    }

    /// Parses the first metadata document found next to `path`. Unreadable
    /// or malformed documents yield `None`.
    pub fn read_descriptive(&self, path: &Path) -> Option<DescriptiveMetadata> {
        let document = find_metadata_document(path)?;
        let text = match std::fs::read_to_string(&document) {
            Ok(text) => text,
            Err(e) => {
                log::debug!("Cannot read metadata document {}: {}", document.display(), e);
                return None;
            }
        };
        match parse_document(&text, &document.to_string_lossy()) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::debug!("Ignoring metadata document {}: {}", document.display(), e);
                None
            }
        }
    }
}

/// `<dir>/<stem>.<ext>`, trying the lower-case then upper-case extension.
fn sibling_with_extension(path: &Path, ext: &str) -> Option<PathBuf> {
    [ext.to_ascii_lowercase(), ext.to_ascii_uppercase()]
        .into_iter()
        .map(|e| path.with_extension(e))
        .find(|candidate| candidate.is_file())
}

pub fn find_prj(path: &Path) -> Option<PathBuf> {
    sibling_with_extension(path, "prj")
}

/// Reads the `.prj` next to `path` as a CRS definition.
pub fn read_prj(path: &Path) -> Option<CrsDefinition> {
    let prj = find_prj(path)?;
    let text = std::fs::read_to_string(&prj).ok()?;
    if text.trim().is_empty() {
        return None;
    }
    Some(CrsDefinition::from_wkt(&text))
}

/// World-file extensions for an image extension, most specific first.
fn world_file_extensions(ext: &str) -> Vec<String> {
    let ext = ext.to_ascii_lowercase();
    let mut out: Vec<String> = match ext.as_str() {
        "tif" | "tiff" => vec!["tfw".into(), "tifw".into(), "tiffw".into()],
        "jpg" | "jpeg" => vec!["jgw".into(), "jpgw".into(), "jpegw".into()],
        "png" => vec!["pgw".into(), "pngw".into()],
        "gif" => vec!["gfw".into(), "gifw".into()],
        "bmp" => vec!["bpw".into(), "bmpw".into()],
        _ => Vec::new(),
    };
    let mut chars = ext.chars();
    if let (Some(first), Some(last)) = (chars.next(), ext.chars().last()) {
        let short = format!("{}{}w", first, last);
        if ext.len() >= 2 && !out.contains(&short) {
            out.push(short);
        }
    }
    let long = format!("{}w", ext);
    if !ext.is_empty() && !out.contains(&long) {
        out.push(long);
    }
    out.push("wld".into());
    out
}

pub fn find_world_file(path: &Path) -> Option<PathBuf> {
    let ext = path.extension()?.to_str()?;
    world_file_extensions(ext)
        .iter()
        .find_map(|candidate| sibling_with_extension(path, candidate))
}

pub fn read_world_file(path: &Path) -> Option<GeoTransform> {
    find_world_file(path)
        .and_then(|p| WorldFile::read(&p))
        .map(|wf| wf.to_geotransform())
}

/// `<name>.aux.xml`, the GDAL persistent auxiliary metadata file.
pub fn aux_xml_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".aux.xml");
    PathBuf::from(name)
}

/// Spatial reference stored in the auxiliary XML (`PAMDataset/SRS`).
pub fn read_aux_srs(path: &Path) -> Option<CrsDefinition> {
    let text = std::fs::read_to_string(aux_xml_path(path)).ok()?;
    let root = document::parse_tree(&text).ok()?;
    let srs = if root.is("SRS") { Some(&root) } else { root.find("SRS") }?;
    let wkt = srs.value()?;
    CrsDefinition::from_authority_string(&wkt).or_else(|| Some(CrsDefinition::from_wkt(&wkt)))
}

/// Candidate metadata documents: `<stem>.xml`, `<name>.xml`, `<stem>.qmd`.
pub fn metadata_candidates(path: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![path.with_extension("xml")];
    let mut with_name = path.as_os_str().to_owned();
    with_name.push(".xml");
    candidates.push(PathBuf::from(with_name));
    candidates.push(path.with_extension("qmd"));
    candidates
        .into_iter()
        .filter(|c| c.as_path() != path)
        .filter(|c| {
            !c.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_ascii_lowercase().ends_with(".aux.xml"))
                .unwrap_or(false)
        })
        .collect()
}

pub fn find_metadata_document(path: &Path) -> Option<PathBuf> {
    metadata_candidates(path).into_iter().find(|c| c.is_file())
}
