use std::fmt::{Debug, Formatter};
use std::fs;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

use crate::cache::VALUE_SIZE;
use crate::error::FingerprintError;

/// Fixed width BLAKE3 digest of a set of files.
///
/// The width matches [`VALUE_SIZE`], so a fingerprint can always be stored in
/// the [`Cache`](crate::Cache) as is.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; VALUE_SIZE]);

impl Fingerprint {
    fn from_hasher(hasher: &blake3::Hasher) -> Self {
        let mut bytes = [0u8; VALUE_SIZE];
        hasher.finalize_xof().fill(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(VALUE_SIZE * 2);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Resolves glob patterns and digests the matched files.
///
/// By default a file contributes its path, size and modification time. With
/// `content` set the file contents are hashed instead of the modification
/// time, which survives checkouts that touch every file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter {
    pub content: bool,
}

impl Fingerprinter {
    pub fn new(content: bool) -> Self {
        Self { content }
    }

    /// Fingerprints every path matching `pattern`, relative to `root` unless
    /// the pattern is absolute. No matches is not an error.
    pub fn fingerprint(
        &self,
        root: &Utf8Path,
        pattern: &str,
    ) -> Result<Fingerprint, FingerprintError> {
        let mut paths = self.resolve(root, pattern)?;
        // Order independence
        paths.sort();

        let mut hasher = blake3::Hasher::new();
        for path in &paths {
            self.update(&mut hasher, path)?;
        }

        Ok(Fingerprint::from_hasher(&hasher))
    }

    fn resolve(&self, root: &Utf8Path, pattern: &str) -> Result<Vec<Utf8PathBuf>, FingerprintError> {
        let full = if Utf8Path::new(pattern).is_absolute() {
            pattern.to_owned()
        } else {
            format!("{}/{pattern}", Pattern::escape(root.as_str()))
        };

        let options = MatchOptions {
            require_literal_leading_dot: true,
            ..MatchOptions::new()
        };

        let entries =
            glob::glob_with(&full, options).map_err(|source| FingerprintError::Pattern {
                pattern: pattern.to_owned(),
                source,
            })?;

        let mut paths = Vec::new();
        for entry in entries {
            paths.push(Utf8PathBuf::try_from(entry?)?);
        }

        Ok(paths)
    }

    fn update(&self, hasher: &mut blake3::Hasher, path: &Utf8Path) -> Result<(), FingerprintError> {
        let stat = |source| FingerprintError::Stat {
            path: path.to_owned(),
            source,
        };

        let meta = fs::metadata(path).map_err(stat)?;

        hasher.update(path.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&meta.len().to_be_bytes());

        if self.content && meta.is_file() {
            hasher.update_mmap_rayon(path).map_err(stat)?;
        } else {
            let modified = meta.modified().map_err(stat)?;
            let nanos = match modified.duration_since(UNIX_EPOCH) {
                Ok(after) => after.as_nanos() as i128,
                Err(before) => -(before.duration().as_nanos() as i128),
            };
            hasher.update(&nanos.to_be_bytes());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;

    use super::*;

    fn root(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
    }

    fn write(root: &Utf8Path, path: &str, content: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn set_mtime(path: &Utf8Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_empty_match_is_constant() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        let fp = Fingerprinter::default();

        let a = fp.fingerprint(&root, "*.missing").unwrap();
        let b = fp.fingerprint(&root, "nothing/**/*.here").unwrap();
        assert_eq!(a, b);

        write(&root, "new.missing", "x");
        assert_ne!(a, fp.fingerprint(&root, "*.missing").unwrap());
    }

    #[test]
    fn test_recursive_and_single_segment() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        write(&root, "src/a.py", "a");
        write(&root, "src/lib/lib.py", "lib");
        let fp = Fingerprinter::default();

        let star = fp.fingerprint(&root, "src/*.py").unwrap();
        let deep = fp.fingerprint(&root, "**/*.py").unwrap();

        write(&root, "src/lib/lib.py", "changed size");
        assert_eq!(star, fp.fingerprint(&root, "src/*.py").unwrap());
        assert_ne!(deep, fp.fingerprint(&root, "**/*.py").unwrap());
    }

    #[test]
    fn test_mtime_vs_content() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        write(&root, "a.txt", "same");
        let file = root.join("a.txt");
        set_mtime(&file, 1_000);

        let by_meta = Fingerprinter::new(false);
        let by_content = Fingerprinter::new(true);
        let meta_before = by_meta.fingerprint(&root, "a.txt").unwrap();
        let content_before = by_content.fingerprint(&root, "a.txt").unwrap();

        set_mtime(&file, 2_000);
        assert_ne!(meta_before, by_meta.fingerprint(&root, "a.txt").unwrap());
        assert_eq!(content_before, by_content.fingerprint(&root, "a.txt").unwrap());

        write(&root, "a.txt", "diff");
        assert_ne!(content_before, by_content.fingerprint(&root, "a.txt").unwrap());
    }

    #[test]
    fn test_absolute_pattern_ignores_root() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        write(&root, "x.rs", "x");
        let fp = Fingerprinter::default();

        let relative = fp.fingerprint(&root, "x.rs").unwrap();
        let absolute = fp
            .fingerprint(Utf8Path::new("/elsewhere"), root.join("x.rs").as_str())
            .unwrap();
        assert_eq!(relative, absolute);
    }

    #[test]
    fn test_malformed_pattern() {
        let dir = TempDir::new().unwrap();
        let err = Fingerprinter::default()
            .fingerprint(&root(&dir), "src/***")
            .unwrap_err();
        assert!(matches!(err, FingerprintError::Pattern { .. }));
    }
}
