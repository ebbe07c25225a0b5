use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Soft limits for uploads; oversize files are logged, not rejected.
pub const PRODUCT_SOFT_LIMIT: u64 = 10 * 1024 * 1024;
pub const LOGO_SOFT_LIMIT: u64 = 5 * 1024 * 1024;

/// An in-memory image as (mime type, base64 payload). This is the shape the
/// generation API takes inline and the shape it returns, so encoded bytes
/// travel through a whole batch without re-reading the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mime = sniff_mime(bytes)
            .context("unrecognized image format; PNG or JPEG expected")?;
        Ok(Self {
            mime_type: mime.to_string(),
            data: BASE64.encode(bytes),
        })
    }

    /// Read and encode an image file once. `label` names the slot (product,
    /// logo) in diagnostics.
    pub async fn read(path: &Path, soft_limit: u64, label: &str) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {label} image {}", path.display()))?;
        if bytes.len() as u64 > soft_limit {
            tracing::warn!(
                label,
                size = bytes.len(),
                limit = soft_limit,
                "image exceeds the soft size limit; sending anyway"
            );
        }
        Self::from_bytes(&bytes)
            .with_context(|| format!("{label} image {} is not a usable image", path.display()))
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.data.as_bytes())
            .context("image payload is not valid base64")
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Magic-byte sniffing for the formats the intake accepts.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(sniff_mime(PNG_HEADER), Some("image/png"));
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]), Some("image/jpeg"));
        assert_eq!(sniff_mime(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"GIF89a"), None);
        assert_eq!(sniff_mime(b""), None);
    }

    #[test]
    fn from_bytes_rejects_non_images() {
        assert!(InlineImage::from_bytes(b"not an image").is_err());
        let img = InlineImage::from_bytes(PNG_HEADER).unwrap();
        assert_eq!(img.mime_type, "image/png");
        assert_eq!(img.decode().unwrap(), PNG_HEADER);
    }

    #[test]
    fn data_url_embeds_mime_and_payload() {
        let img = InlineImage::from_bytes(PNG_HEADER).unwrap();
        let url = img.data_url();
        assert!(url.starts_with("data:image/png;base64,"));
        assert!(url.ends_with(&img.data));
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let img = InlineImage {
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        };
        let json = serde_json::to_string(&img).unwrap();
        assert_eq!(json, r#"{"mimeType":"image/png","data":"AAAA"}"#);
    }

    #[tokio::test]
    async fn read_encodes_file_contents_once() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(PNG_HEADER).unwrap();
        let img = InlineImage::read(tmp.path(), PRODUCT_SOFT_LIMIT, "product")
            .await
            .unwrap();
        assert_eq!(img.mime_type, "image/png");
        assert_eq!(img.decode().unwrap(), PNG_HEADER);
    }

    #[tokio::test]
    async fn read_surfaces_missing_file() {
        let err = InlineImage::read(Path::new("/nonexistent/x.png"), LOGO_SOFT_LIMIT, "logo")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("logo"));
    }
}
