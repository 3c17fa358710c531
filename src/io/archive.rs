use crate::types::{PipelineError, PipelineResult};
use regex::Regex;
use std::fs::File;
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Raw elevation tile archive handling: extraction and tile discovery
pub struct TileExtractor {
    pattern: Regex,
}

impl TileExtractor {
    /// `pattern` is matched against tile file names (not full paths)
    pub fn new(pattern: &str) -> PipelineResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| PipelineError::Config(format!("Invalid tile pattern '{}': {}", pattern, e)))?;
        Ok(Self { pattern })
    }

    pub fn is_tile(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| self.pattern.is_match(&n.to_string_lossy()))
            .unwrap_or(false)
    }

    /// `.zip` and `.gz` files below `dir`, sorted by path
    pub fn find_archives<P: AsRef<Path>>(&self, dir: P) -> PipelineResult<Vec<PathBuf>> {
        let mut archives: Vec<PathBuf> = walk_files(dir.as_ref())?
            .into_iter()
            .filter(|p| archive_kind(p).is_some())
            .collect();
        archives.sort();
        log::debug!("Found {} archives in {}", archives.len(), dir.as_ref().display());
        Ok(archives)
    }

    /// Tile rasters below `dir`, sorted by path. Finding none is an error.
    pub fn find_tiles<P: AsRef<Path>>(&self, dir: P) -> PipelineResult<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let mut tiles: Vec<PathBuf> = walk_files(dir)?.into_iter().filter(|p| self.is_tile(p)).collect();
        tiles.sort();

        if tiles.is_empty() {
            return Err(PipelineError::Processing(format!(
                "No tiles matching '{}' found in {}",
                self.pattern.as_str(),
                dir.display()
            )));
        }
        log::info!("Found {} tiles in {}", tiles.len(), dir.display());
        Ok(tiles)
    }

    /// Extract the tiles of one archive into `out_dir`.
    ///
    /// An unreadable archive, or one holding no tile, is an error naming it.
    pub fn extract_archive(&self, archive: &Path, out_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        let fail = |reason: String| PipelineError::Archive {
            path: archive.to_path_buf(),
            reason,
        };

        std::fs::create_dir_all(out_dir)?;
        let extracted = match archive_kind(archive) {
            Some(ArchiveKind::Zip) => self.extract_zip(archive, out_dir).map_err(fail)?,
            Some(ArchiveKind::Gzip) => self.extract_gzip(archive, out_dir).map_err(fail)?,
            None => return Err(fail("not a .zip or .gz archive".to_string())),
        };

        if extracted.is_empty() {
            return Err(fail(format!("no entry matches '{}'", self.pattern.as_str())));
        }
        log::debug!("Extracted {} tile(s) from {}", extracted.len(), archive.display());
        Ok(extracted)
    }

    fn extract_zip(&self, archive: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, String> {
        let file = File::open(archive).map_err(|e| format!("cannot open: {}", e))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| format!("invalid zip: {}", e))?;

        let mut extracted = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| format!("cannot read entry {}: {}", i, e))?;
            if entry.is_dir() {
                continue;
            }
            let name = match entry.enclosed_name() {
                Some(n) => n.to_path_buf(),
                None => continue,
            };
            if !self.is_tile(&name) {
                continue;
            }

            let target = out_dir.join(&name);
            if extracted.contains(&target) {
                return Err(format!("duplicate entry {}", name.display()));
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
            }
            let mut out = File::create(&target).map_err(|e| format!("cannot create {}: {}", target.display(), e))?;
            std::io::copy(&mut entry, &mut out).map_err(|e| format!("cannot extract {}: {}", name.display(), e))?;
            extracted.push(target);
        }
        Ok(extracted)
    }

    fn extract_gzip(&self, archive: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, String> {
        let name = match archive.file_stem() {
            Some(stem) => PathBuf::from(stem),
            None => return Err("archive has no file name".to_string()),
        };
        if !self.is_tile(&name) {
            return Ok(Vec::new());
        }

        let file = File::open(archive).map_err(|e| format!("cannot open: {}", e))?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        let target = out_dir.join(&name);
        let mut out = File::create(&target).map_err(|e| format!("cannot create {}: {}", target.display(), e))?;
        let bytes = std::io::copy(&mut decoder, &mut out).map_err(|e| format!("cannot decompress: {}", e))?;
        if bytes == 0 {
            return Err("decompressed tile is empty".to_string());
        }
        Ok(vec![target])
    }

    /// Extract every archive (in parallel), each into its own folder under
    /// `out_dir`, and return the extracted tiles sorted by path.
    ///
    /// All archives are attempted; if any fails the first failure in path
    /// order is returned. Two archives sharing a folder name are an error.
    pub fn extract_all(&self, archives: &[PathBuf], out_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        log::info!("Extracting {} archives into {}", archives.len(), out_dir.display());
        std::fs::create_dir_all(out_dir)?;

        let mut folders: Vec<PathBuf> = Vec::with_capacity(archives.len());
        for archive in archives {
            let folder = out_dir.join(archive_folder(archive));
            if folders.contains(&folder) {
                return Err(PipelineError::Archive {
                    path: archive.clone(),
                    reason: format!("another archive also extracts into {}", folder.display()),
                });
            }
            folders.push(folder);
        }

        #[cfg(feature = "parallel")]
        let results: Vec<PipelineResult<Vec<PathBuf>>> = archives
            .par_iter()
            .zip(folders.par_iter())
            .map(|(a, folder)| self.extract_archive(a, folder))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let results: Vec<PipelineResult<Vec<PathBuf>>> = archives
            .iter()
            .zip(folders.iter())
            .map(|(a, folder)| self.extract_archive(a, folder))
            .collect();

        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            log::error!("{} of {} archives failed to extract", failures, archives.len());
        }

        let mut tiles = Vec::new();
        for result in results {
            tiles.extend(result?);
        }
        tiles.sort();
        Ok(tiles)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Gzip,
}

fn archive_kind(path: &Path) -> Option<ArchiveKind> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    match ext.as_str() {
        "zip" => Some(ArchiveKind::Zip),
        "gz" => Some(ArchiveKind::Gzip),
        _ => None,
    }
}

/// Folder an archive extracts into: its file name up to the first dot
fn archive_folder(archive: &Path) -> String {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match name.split('.').next() {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}

/// Regular files below `dir`, recursively
fn walk_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(PipelineError::MissingSource(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, zip::write::FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_zip_extracts_only_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ASTGTMV003_S10W075.zip");
        write_zip(
            &archive,
            &[
                ("ASTGTMV003_S10W075_dem.tif", b"dem"),
                ("ASTGTMV003_S10W075_num.tif", b"num"),
            ],
        );

        let extractor = TileExtractor::new(r"(?i)dem\.tif$").unwrap();
        let out = dir.path().join("out");
        let tiles = extractor.extract_archive(&archive, &out).unwrap();
        assert_eq!(tiles, vec![out.join("ASTGTMV003_S10W075_dem.tif")]);
        assert_eq!(std::fs::read(&tiles[0]).unwrap(), b"dem");
    }

    #[test]
    fn test_same_named_entries_keep_their_folders() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("tiles.zip");
        write_zip(&archive, &[("north/tile_dem.tif", b"north"), ("south/tile_dem.tif", b"south")]);

        let extractor = TileExtractor::new(r"(?i)dem\.tif$").unwrap();
        let out = dir.path().join("out");
        let tiles = extractor.extract_archive(&archive, &out).unwrap();
        assert_eq!(tiles, vec![out.join("north/tile_dem.tif"), out.join("south/tile_dem.tif")]);
        assert_eq!(std::fs::read(&tiles[0]).unwrap(), b"north");
        assert_eq!(std::fs::read(&tiles[1]).unwrap(), b"south");
    }

    #[test]
    fn test_extract_all_uses_one_folder_per_archive() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("S10W075.zip");
        let b = dir.path().join("S10W076.zip");
        write_zip(&a, &[("tile_dem.tif", b"a")]);
        write_zip(&b, &[("tile_dem.tif", b"b")]);

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("stale_dem.tif"), b"old run").unwrap();

        let extractor = TileExtractor::new(r"(?i)dem\.tif$").unwrap();
        let tiles = extractor.extract_all(&[a, b], &out).unwrap();
        assert_eq!(
            tiles,
            vec![out.join("S10W075/tile_dem.tif"), out.join("S10W076/tile_dem.tif")]
        );
        assert_eq!(std::fs::read(&tiles[1]).unwrap(), b"b");

        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        let twin = dir.path().join("sub/S10W075.zip");
        write_zip(&twin, &[("tile_dem.tif", b"twin")]);
        match extractor.extract_all(&[dir.path().join("S10W075.zip"), twin.clone()], &out) {
            Err(PipelineError::Archive { path, .. }) => assert_eq!(path, twin),
            other => panic!("expected archive error, got {:?}", other),
        }
    }

    #[test]
    fn test_gzip_tile_is_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("S11W076_DEM.tif.gz");
        let mut encoder = flate2::write::GzEncoder::new(File::create(&archive).unwrap(), flate2::Compression::default());
        encoder.write_all(b"elevation").unwrap();
        encoder.finish().unwrap();

        let extractor = TileExtractor::new(r"(?i)dem\.tif$").unwrap();
        let tiles = extractor.extract_archive(&archive, dir.path()).unwrap();
        assert_eq!(std::fs::read(&tiles[0]).unwrap(), b"elevation");
    }

    #[test]
    fn test_corrupt_archive_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.zip");
        write_zip(&good, &[("a_dem.tif", b"ok")]);
        let bad = dir.path().join("b.zip");
        std::fs::write(&bad, b"this is not a zip file").unwrap();

        let extractor = TileExtractor::new(r"(?i)dem\.tif$").unwrap();
        let archives = extractor.find_archives(dir.path()).unwrap();
        assert_eq!(archives, vec![good, bad.clone()]);

        match extractor.extract_all(&archives, &dir.path().join("out")) {
            Err(PipelineError::Archive { path, .. }) => assert_eq!(path, bad),
            other => panic!("expected archive error, got {:?}", other),
        }
    }

    #[test]
    fn test_archive_without_tiles_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("readme.zip");
        write_zip(&archive, &[("README.txt", b"nothing here")]);
        let extractor = TileExtractor::new(r"(?i)dem\.tif$").unwrap();
        assert!(matches!(
            extractor.extract_archive(&archive, dir.path()),
            Err(PipelineError::Archive { .. })
        ));
    }

    #[test]
    fn test_find_tiles_sorted_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        for name in ["sub/b_dem.tif", "a_dem.tif", "c_num.tif"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let extractor = TileExtractor::new(r"(?i)dem\.tif$").unwrap();
        let tiles = extractor.find_tiles(dir.path()).unwrap();
        assert_eq!(tiles, vec![dir.path().join("a_dem.tif"), dir.path().join("sub/b_dem.tif")]);

        let empty = tempfile::tempdir().unwrap();
        assert!(extractor.find_tiles(empty.path()).is_err());
    }
}
