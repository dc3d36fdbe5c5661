//! Test Files
//!
//! Seeds generate the file of each permutation on demand. Random files are
//! seeded with their position in the `file_size` list, so every seed
//! produces identical bytes and therefore publishes the same root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::tb_error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestFile {
    Random { size: u64, seed: u64 },
    Path { path: PathBuf, size: u64, is_dir: bool },
}

impl TestFile {
    pub fn size(&self) -> u64 {
        match self {
            TestFile::Random { size, .. } => *size,
            TestFile::Path { size, .. } => *size,
        }
    }

    /// Materialize the file contents.
    ///
    /// Directories are flattened: every regular file below it, in path
    /// order, concatenated.
    pub fn generate(&self) -> io::Result<Vec<u8>> {
        match self {
            TestFile::Random { size, seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                let mut data = vec![0u8; *size as usize];
                rng.fill_bytes(&mut data);
                Ok(data)
            }
            TestFile::Path { path, is_dir: false, .. } => fs::read(path),
            TestFile::Path { path, is_dir: true, size } => {
                let mut data = Vec::with_capacity(*size as usize);
                for file in walk_files(path)? {
                    data.extend(fs::read(file)?);
                }
                Ok(data)
            }
        }
    }
}

/// Regular files below `dir`, depth-first in sorted path order
fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();

    let mut files = Vec::new();
    for path in entries {
        if path.is_dir() {
            files.extend(walk_files(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut size = 0;
    for file in walk_files(dir)? {
        size += fs::metadata(file)?.len();
    }
    Ok(size)
}

/// Build the list of test files for `input_data`.
///
/// - `random`: one file per entry of `file_sizes`
/// - `files`: one file per entry of `data_dir`, `.gitkeep` skipped
pub fn file_list(input_data: &str, file_sizes: &[u64], data_dir: &Path) -> Result<Vec<TestFile>, ConfigError> {
    match input_data {
        "random" => {
            log::info!("Getting file list for random with sizes: {:?}", file_sizes);
            Ok(file_sizes
                .iter()
                .enumerate()
                .map(|(i, size)| TestFile::Random {
                    size: *size,
                    seed: i as u64,
                })
                .collect())
        }
        "files" => {
            log::info!("Getting file list for {}", data_dir.display());
            let dir_err = |source: io::Error| ConfigError::DataDir {
                path: data_dir.display().to_string(),
                source,
            };

            let mut entries: Vec<PathBuf> = fs::read_dir(data_dir)
                .map_err(dir_err)?
                .map(|e| e.map(|e| e.path()))
                .collect::<io::Result<_>>()
                .map_err(dir_err)?;
            entries.sort();

            let mut files = Vec::new();
            for path in entries {
                if path.file_name().and_then(|n| n.to_str()) == Some(".gitkeep") {
                    continue;
                }
                let is_dir = path.is_dir();
                let size = if is_dir {
                    dir_size(&path).map_err(dir_err)?
                } else {
                    fs::metadata(&path).map_err(dir_err)?.len()
                };
                files.push(TestFile::Path { path, size, is_dir });
            }
            Ok(files)
        }
        other => Err(ConfigError::UnsupportedInputData(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tb-files-{}-{}", name, rand::random::<u64>()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_random_files_are_seeded_by_position() {
        let files = file_list("random", &[64, 64, 128], Path::new("")).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[2].size(), 128);

        let a = files[0].generate().unwrap();
        let b = files[1].generate().unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);

        // same position, same bytes
        let again = file_list("random", &[64], Path::new("")).unwrap();
        assert_eq!(again[0].generate().unwrap(), a);
    }

    #[test]
    fn test_unsupported_input_data() {
        assert!(matches!(
            file_list("custom", &[], Path::new("")),
            Err(ConfigError::UnsupportedInputData(_))
        ));
    }

    #[test]
    fn test_data_dir_listing() {
        let dir = scratch_dir("list");
        fs::write(dir.join(".gitkeep"), b"").unwrap();
        fs::write(dir.join("a.bin"), vec![1u8; 10]).unwrap();
        fs::create_dir_all(dir.join("b/inner")).unwrap();
        fs::write(dir.join("b/x.bin"), vec![2u8; 5]).unwrap();
        fs::write(dir.join("b/inner/y.bin"), vec![3u8; 7]).unwrap();

        let files = file_list("files", &[], &dir).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].size(), 10);
        assert_eq!(files[1].size(), 12);
        assert!(matches!(files[1], TestFile::Path { is_dir: true, .. }));

        let flat = files[1].generate().unwrap();
        assert_eq!(flat.len(), 12);
        // inner/ sorts before x.bin
        assert_eq!(&flat[..7], &[3u8; 7]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_data_dir() {
        let missing = std::env::temp_dir().join("tb-files-does-not-exist-4d1c");
        assert!(matches!(
            file_list("files", &[], &missing),
            Err(ConfigError::DataDir { .. })
        ));
    }
}
