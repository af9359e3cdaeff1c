//! Frame source reading still images from a directory, in name order,
//! looping when the sequence ends.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use veriface_core::{Camera, CameraError, Frame};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

pub struct DirectoryCamera {
    dir: PathBuf,
    frames: Vec<PathBuf>,
    next: usize,
}

impl DirectoryCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            frames: Vec::new(),
            next: 0,
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn io_error(dir: &Path, e: std::io::Error) -> CameraError {
    match e.kind() {
        ErrorKind::PermissionDenied => CameraError::PermissionDenied,
        ErrorKind::NotFound => CameraError::Unavailable(format!("{} does not exist", dir.display())),
        _ => CameraError::Io(e.to_string()),
    }
}

impl Camera for DirectoryCamera {
    fn open(&mut self) -> Result<(), CameraError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        if frames.is_empty() {
            return Err(CameraError::Unavailable(format!(
                "no image frames in {}",
                self.dir.display()
            )));
        }
        frames.sort();
        tracing::info!(dir = %self.dir.display(), frames = frames.len(), "frame source opened");
        self.frames = frames;
        self.next = 0;
        Ok(())
    }

    fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.frames.is_empty() {
            return Err(CameraError::Unavailable("frame source is not open".into()));
        }
        let path = &self.frames[self.next % self.frames.len()];
        self.next = self.next.wrapping_add(1);
        let image = std::fs::read(path).map_err(|e| io_error(&self.dir, e))?;
        Ok(Some(Frame::new(image)))
    }

    fn release(&mut self) {
        if !self.frames.is_empty() {
            tracing::debug!(dir = %self.dir.display(), captured = self.next, "frame source released");
        }
        self.frames.clear();
    }
}
