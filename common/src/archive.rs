use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    error::ContentError,
    payload::{ImageFormat, ImagePayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveSlot {
    Current,
    Last,
}

impl ArchiveSlot {
    pub fn name(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Last => "last",
        }
    }
}

/// Keeps the two most recently rendered images.
pub trait ContentArchive {
    /// Stores `image` as current; the previous current becomes last.
    fn store_current(&mut self, image: &ImagePayload) -> Result<(), ContentError>;
    fn load(&mut self, slot: ArchiveSlot) -> Result<ImagePayload, ContentError>;
}

#[derive(Debug, Default)]
pub struct MemoryArchive {
    current: Option<ImagePayload>,
    last: Option<ImagePayload>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentArchive for MemoryArchive {
    fn store_current(&mut self, image: &ImagePayload) -> Result<(), ContentError> {
        self.last = self.current.replace(image.clone());
        Ok(())
    }

    fn load(&mut self, slot: ArchiveSlot) -> Result<ImagePayload, ContentError> {
        let stored = match slot {
            ArchiveSlot::Current => &self.current,
            ArchiveSlot::Last => &self.last,
        };
        stored
            .clone()
            .ok_or(ContentError::NothingArchived(slot.name()))
    }
}

/// Filesystem archive: `current.<ext>` and `last.<ext>` under one directory.
#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
}

const EXTENSIONS: [&str; 3] = ["bmp", "png", "jpg"];

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn find(&self, slot: ArchiveSlot) -> Option<(PathBuf, ImageFormat)> {
        EXTENSIONS.iter().find_map(|ext| {
            let path = self.root.join(format!("{}.{ext}", slot.name()));
            let format = ImageFormat::from_extension(ext)?;
            path.is_file().then_some((path, format))
        })
    }

    fn remove_slot(&self, slot: ArchiveSlot) -> Result<(), ContentError> {
        for ext in EXTENSIONS {
            let path = self.root.join(format!("{}.{ext}", slot.name()));
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(archive_error(&path, err)),
            }
        }
        Ok(())
    }
}

impl ContentArchive for FsArchive {
    fn store_current(&mut self, image: &ImagePayload) -> Result<(), ContentError> {
        fs::create_dir_all(&self.root).map_err(|err| archive_error(&self.root, err))?;

        if let Some((current, format)) = self.find(ArchiveSlot::Current) {
            self.remove_slot(ArchiveSlot::Last)?;
            let last = self
                .root
                .join(format!("{}.{}", ArchiveSlot::Last.name(), format.extension()));
            fs::rename(&current, &last).map_err(|err| archive_error(&current, err))?;
        }

        let path = self.root.join(format!(
            "{}.{}",
            ArchiveSlot::Current.name(),
            image.format().extension()
        ));
        fs::write(&path, image.bytes()).map_err(|err| archive_error(&path, err))?;
        info!("archived {} bytes to {}", image.len(), path.display());
        Ok(())
    }

    fn load(&mut self, slot: ArchiveSlot) -> Result<ImagePayload, ContentError> {
        let (path, format) = self
            .find(slot)
            .ok_or(ContentError::NothingArchived(slot.name()))?;
        let bytes = fs::read(&path).map_err(|err| archive_error(&path, err))?;
        ImagePayload::with_format(bytes, format)
    }
}

fn archive_error(path: &Path, err: std::io::Error) -> ContentError {
    ContentError::Archive(format!("{}: {err}", path.display()))
}
