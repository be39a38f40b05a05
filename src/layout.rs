use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::address::TreeAddress;
use crate::writer::{FileSet, SectorFile};

/// Directory and file naming for the engine's outputs. With more than one
/// sector, each sector gets a zero-padded subdirectory; with more than one
/// partition, tree files carry the partition index.
pub struct FileLayout {
    out: PathBuf,
    replica_root: Option<PathBuf>,
    sectors: usize,
    partitions: usize,
}

impl FileLayout {
    pub fn new(out: &Path, sectors: usize, partitions: usize) -> Self {
        let replicas = out.join("replicas");
        let replica_root = if replicas.is_dir() {
            Some(replicas)
        } else {
            None
        };
        FileLayout {
            out: out.to_path_buf(),
            replica_root,
            sectors,
            partitions,
        }
    }

    fn sector_dir(&self, base: &Path, sector: usize) -> PathBuf {
        if self.sectors == 1 {
            base.to_path_buf()
        } else {
            base.join(format!("{:03}", sector))
        }
    }

    pub fn tree_c_path(&self, sector: usize, partition: usize) -> PathBuf {
        self.sector_dir(&self.out, sector).join(if self.partitions > 1 {
            format!("sc-02-data-tree-c-{}.dat", partition)
        } else {
            "sc-02-data-tree-c.dat".to_string()
        })
    }

    pub fn tree_r_path(&self, sector: usize, partition: usize) -> PathBuf {
        self.sector_dir(&self.out, sector).join(if self.partitions > 1 {
            format!("sc-02-data-tree-r-last-{}.dat", partition)
        } else {
            "sc-02-data-tree-r-last.dat".to_string()
        })
    }

    /// The sealed replica lands under `<out>/replicas` when that directory
    /// exists, next to the trees otherwise.
    pub fn sealed_path(&self, sector: usize) -> PathBuf {
        let base = self.replica_root.as_deref().unwrap_or(&self.out);
        self.sector_dir(base, sector).join("sealed-file")
    }

    pub fn p_aux_path(&self, sector: usize) -> PathBuf {
        self.sector_dir(&self.out, sector).join("p_aux")
    }

    /// Create directories, preallocate every tree file to its final size,
    /// and open the sealed files at sector size. Pass `addr_c: None` for
    /// tree-r-only runs: no tree-c and no sealed files are created.
    pub fn open_files(
        &self,
        addr_c: Option<&TreeAddress>,
        addr_r: &TreeAddress,
        sector_size: u64,
    ) -> Result<FileSet> {
        for sector in 0..self.sectors {
            std::fs::create_dir_all(self.sector_dir(&self.out, sector))?;
            if let Some(base) = self.replica_root.as_deref() {
                std::fs::create_dir_all(self.sector_dir(base, sector))?;
            }
        }

        let mut tree_c = Vec::new();
        let mut tree_r = Vec::new();
        for partition in 0..self.partitions {
            if let Some(addr_c) = addr_c {
                tree_c.push(
                    (0..self.sectors)
                        .map(|s| open_preallocated(&self.tree_c_path(s, partition), addr_c.data_size()))
                        .collect::<Result<Vec<_>>>()?,
                );
            }
            tree_r.push(
                (0..self.sectors)
                    .map(|s| open_preallocated(&self.tree_r_path(s, partition), addr_r.data_size()))
                    .collect::<Result<Vec<_>>>()?,
            );
        }

        let sealed = if addr_c.is_some() {
            (0..self.sectors)
                .map(|s| open_preallocated(&self.sealed_path(s), sector_size))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        info!(
            "opened output files under {:?}: {} sectors x {} partitions",
            self.out, self.sectors, self.partitions
        );

        Ok(FileSet {
            sectors: self.sectors,
            tree_c,
            tree_r,
            sealed,
        })
    }

    /// Remove exactly the files this layout produces. Sector directories
    /// are removed when they end up empty.
    pub fn cleanup(&self) -> Result<()> {
        for sector in 0..self.sectors {
            for partition in 0..self.partitions {
                remove_if_present(&self.tree_c_path(sector, partition))?;
                remove_if_present(&self.tree_r_path(sector, partition))?;
            }
            remove_if_present(&self.sealed_path(sector))?;
            remove_if_present(&self.p_aux_path(sector))?;

            if self.sectors > 1 {
                // best effort; the directory may hold unrelated files
                let _ = std::fs::remove_dir(self.sector_dir(&self.out, sector));
                if let Some(base) = self.replica_root.as_deref() {
                    let _ = std::fs::remove_dir(self.sector_dir(base, sector));
                }
            }
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("removing {:?}", path))?;
        debug!("removed {:?}", path);
    }
    Ok(())
}

fn open_preallocated(path: &Path, size: u64) -> Result<SectorFile> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {:?}", path))?;
    file.set_len(size)
        .with_context(|| format!("preallocating {:?} to {} bytes", path, size))?;
    advise_random(&file);
    Ok(SectorFile::new(file))
}

// The write pattern is strided across layers; read-ahead only pollutes the
// page cache.
#[cfg(target_os = "linux")]
fn advise_random(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_random(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::NODE_SIZE;

    #[test]
    fn test_single_sector_paths_are_flat() {
        let layout = FileLayout::new(Path::new("/cache"), 1, 1);
        assert_eq!(
            layout.tree_c_path(0, 0),
            PathBuf::from("/cache/sc-02-data-tree-c.dat")
        );
        assert_eq!(layout.p_aux_path(0), PathBuf::from("/cache/p_aux"));
    }

    #[test]
    fn test_multi_sector_partitioned_paths() {
        let layout = FileLayout::new(Path::new("/cache"), 4, 8);
        assert_eq!(
            layout.tree_r_path(2, 7),
            PathBuf::from("/cache/002/sc-02-data-tree-r-last-7.dat")
        );
        assert_eq!(
            layout.sealed_path(3),
            PathBuf::from("/cache/003/sealed-file")
        );
    }

    #[test]
    fn test_replicas_directory_is_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("replicas")).unwrap();
        let layout = FileLayout::new(dir.path(), 2, 1);
        assert_eq!(
            layout.sealed_path(1),
            dir.path().join("replicas").join("001").join("sealed-file")
        );
    }

    #[test]
    fn test_open_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(dir.path(), 2, 1);
        let addr_c = TreeAddress::new(64, 8, NODE_SIZE).unwrap();
        let addr_r = TreeAddress::with_skipped_rows(64, 8, NODE_SIZE, 2).unwrap();

        let files = layout
            .open_files(Some(&addr_c), &addr_r, 64 * NODE_SIZE as u64)
            .unwrap();
        assert_eq!(files.tree_c.len(), 1);
        assert_eq!(files.tree_c[0].len(), 2);
        assert_eq!(
            std::fs::metadata(layout.tree_c_path(0, 0)).unwrap().len(),
            addr_c.data_size()
        );
        assert_eq!(
            std::fs::metadata(layout.sealed_path(1)).unwrap().len(),
            64 * NODE_SIZE as u64
        );
        drop(files);

        layout.cleanup().unwrap();
        assert!(!layout.tree_c_path(0, 0).exists());
        assert!(!layout.sealed_path(1).exists());
        assert!(!dir.path().join("000").exists());
    }
}
