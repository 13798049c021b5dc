use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{RendererError, Result};

/// Tightly packed 8-bit RGBA pixels, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Supplies shader bytecode and decoded images by path. The renderer never
/// looks at file formats itself.
pub trait AssetSource {
    fn shader_bytes(&self, path: &Path) -> Result<Vec<u8>>;
    fn image_rgba(&self, path: &Path) -> Result<DecodedImage>;
}

/// Reads assets from a directory on disk, decoding images with `image`.
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

fn asset_error(path: &Path, reason: impl ToString) -> RendererError {
    RendererError::Asset {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

impl AssetSource for DirectoryAssets {
    fn shader_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        let bytes = std::fs::read(&full).map_err(|err| asset_error(&full, err))?;
        debug!(path = %full.display(), len = bytes.len(), "Shader read.");
        Ok(bytes)
    }

    fn image_rgba(&self, path: &Path) -> Result<DecodedImage> {
        let full = self.resolve(path);
        let decoded = image::open(&full)
            .map_err(|err| asset_error(&full, err))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        debug!(path = %full.display(), width, height, "Image decoded.");
        Ok(DecodedImage {
            width,
            height,
            rgba: decoded.into_raw(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "novade-paint-assets-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn png_brush_decodes_to_rgba8() {
        let dir = scratch_dir("png");
        let brush = image::RgbaImage::from_fn(4, 2, |x, _| image::Rgba([x as u8 * 60, 0, 0, 255]));
        brush.save(dir.join("brush.png")).unwrap();

        let assets = DirectoryAssets::new(&dir);
        let decoded = assets.image_rgba(Path::new("brush.png")).unwrap();
        assert_eq!((decoded.width, decoded.height), (4, 2));
        assert_eq!(decoded.rgba.len(), 4 * 2 * 4);
        assert_eq!(&decoded.rgba[4..8], &[60, 0, 0, 255]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_files_name_the_path() {
        let assets = DirectoryAssets::new(scratch_dir("missing"));
        match assets.shader_bytes(Path::new("nope.spv")) {
            Err(RendererError::Asset { path, .. }) => assert!(path.ends_with("nope.spv")),
            other => panic!("expected asset error, got {other:?}"),
        }
    }
}
