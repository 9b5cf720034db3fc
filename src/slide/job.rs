use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Suffix appended to the slide identifier to name the output image.
pub const OUTPUT_SUFFIX: &str = "_gleason.tiff";

/// One input slide and the paths derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideJob {
    /// File name up to the first `.`
    pub id: String,
    pub source: PathBuf,
    /// `<output_root>/<id>_gleason.tiff`
    pub output: PathBuf,
    /// `<cache_root>/<id>`
    pub cache_dir: PathBuf,
}

impl SlideJob {
    pub fn new(
        source: impl Into<PathBuf>,
        output_root: &Path,
        cache_root: &Path,
    ) -> Result<Self, PipelineError> {
        let source = source.into();
        let id = slide_id_from_path(&source).ok_or_else(|| {
            PipelineError::InvalidInput(format!(
                "cannot derive a slide identifier from {}",
                source.display()
            ))
        })?;

        Ok(Self {
            output: output_root.join(format!("{}{}", id, OUTPUT_SUFFIX)),
            cache_dir: cache_root.join(&id),
            id,
            source,
        })
    }
}

/// Slide identifier: the file name up to its first `.`.
///
/// `"case_01.ome.tiff"` becomes `"case_01"`. Hidden files and names that
/// start with a dot have no identifier.
pub fn slide_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.split('.').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slide_id_from_path() {
        assert_eq!(
            slide_id_from_path(Path::new("/data/case_01.svs")),
            Some("case_01".to_string())
        );
        assert_eq!(
            slide_id_from_path(Path::new("case_01.ome.tiff")),
            Some("case_01".to_string())
        );
        assert_eq!(slide_id_from_path(Path::new("noext")), Some("noext".to_string()));
        assert_eq!(slide_id_from_path(Path::new(".hidden")), None);
        assert_eq!(slide_id_from_path(Path::new("/")), None);
    }

    #[test]
    fn test_job_paths() {
        let job = SlideJob::new("/in/slide_7.svs", Path::new("/out"), Path::new("/cache")).unwrap();
        assert_eq!(job.id, "slide_7");
        assert_eq!(job.output, PathBuf::from("/out/slide_7_gleason.tiff"));
        assert_eq!(job.cache_dir, PathBuf::from("/cache/slide_7"));
    }

    #[test]
    fn test_job_rejects_unnamed_input() {
        let err = SlideJob::new("/in/.svs", Path::new("/out"), Path::new("/cache")).unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }
}
