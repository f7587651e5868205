use std::{
    fs, io,
    path::{Path, PathBuf},
};

use dotmatrix_core::{cartridge::CartridgeId, interfaces::SaveStore};
use log::debug;

/// Keeps `<key>.sav` and `<key>.rtc` files in one directory.
#[derive(Debug, Clone)]
pub struct FileSaveStore {
    dir: PathBuf,
}

impl FileSaveStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &CartridgeId, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", id.key()))
    }
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => {
            debug!("loaded {} bytes from {}", data.len(), path.display());
            Ok(Some(data))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write through a sibling file so a crash never leaves a half-written save.
fn write_replacing(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    debug!("wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

impl SaveStore for FileSaveStore {
    fn load_ram(&mut self, id: &CartridgeId) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.path(id, "sav"))
    }

    fn save_ram(&mut self, id: &CartridgeId, data: &[u8]) -> io::Result<()> {
        write_replacing(&self.path(id, "sav"), data)
    }

    fn load_rtc(&mut self, id: &CartridgeId) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.path(id, "rtc"))
    }

    fn save_rtc(&mut self, id: &CartridgeId, data: &[u8]) -> io::Result<()> {
        write_replacing(&self.path(id, "rtc"), data)
    }
}
