use anyhow::{Context, Result};
use chrono::Utc;
use std::io::{Cursor, Write};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::orchestrator::GenerationResult;
use crate::prompt::AspectRatio;

/// Filename prefix derived from the headline; `"ad"` when nothing slugs.
pub fn brand_prefix(headline: &str) -> String {
    let s = slug::slugify(headline);
    if s.is_empty() {
        "ad".to_string()
    } else {
        s
    }
}

/// Archive entry: `<prefix>-<ratio-x-form>-<sequence>.png`. The global
/// sequence number keeps entries unique even when ratios repeat.
pub fn archive_entry_name(prefix: &str, ratio: AspectRatio, seq: usize) -> String {
    format!("{prefix}-{}-{seq}.png", ratio.file_slug())
}

/// Single-download name: `<prefix>-<ratio-x-form>-<result-id>.png`.
pub fn download_name(prefix: &str, ratio: AspectRatio, id: &Uuid) -> String {
    format!("{prefix}-{}-{id}.png", ratio.file_slug())
}

pub fn archive_name(prefix: &str) -> String {
    format!("{prefix}-ads-{}.zip", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Package every result into an in-memory zip, one file per image, in
/// result order. PNGs are already compressed, so entries are stored.
pub fn build_archive(prefix: &str, results: &[GenerationResult]) -> Result<Vec<u8>> {
    let mut zw = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (i, result) in results.iter().enumerate() {
        let name = archive_entry_name(prefix, result.ratio, i + 1);
        zw.start_file(name.clone(), opts)
            .with_context(|| format!("failed to add archive entry {name}"))?;
        zw.write_all(&result.image.decode()?)
            .with_context(|| format!("failed to write archive entry {name}"))?;
    }
    let cursor = zw.finish().context("failed to finalize archive")?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::InlineImage;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use std::collections::HashSet;
    use std::io::Read;

    fn result(ratio: AspectRatio, payload: &[u8]) -> GenerationResult {
        GenerationResult {
            id: Uuid::new_v4(),
            image: InlineImage {
                mime_type: "image/png".into(),
                data: BASE64.encode(payload),
            },
            ratio,
        }
    }

    #[test]
    fn brand_prefix_slugs_the_headline() {
        assert_eq!(brand_prefix("Fresh Deal!"), "fresh-deal");
        assert_eq!(brand_prefix("  Diskon 50% Hari Ini  "), "diskon-50-hari-ini");
        assert_eq!(brand_prefix(""), "ad");
        assert_eq!(brand_prefix("!!!"), "ad");
    }

    #[test]
    fn names_replace_colon_with_x() {
        assert_eq!(
            archive_entry_name("fresh-deal", AspectRatio::Story, 7),
            "fresh-deal-9x16-7.png"
        );
        let id = Uuid::new_v4();
        assert_eq!(
            download_name("ad", AspectRatio::Square, &id),
            format!("ad-1x1-{id}.png")
        );
    }

    #[test]
    fn archive_entries_are_unique_even_with_repeated_ratios() {
        let results = vec![
            result(AspectRatio::Square, b"one"),
            result(AspectRatio::Portrait, b"two"),
            result(AspectRatio::Square, b"three"),
        ];
        let bytes = build_archive("fresh-deal", &results).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);

        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "fresh-deal-1x1-1.png",
                "fresh-deal-4x5-2.png",
                "fresh-deal-1x1-3.png",
            ]
        );
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());

        let mut payload = Vec::new();
        archive
            .by_name("fresh-deal-4x5-2.png")
            .unwrap()
            .read_to_end(&mut payload)
            .unwrap();
        assert_eq!(payload, b"two");
    }

    #[test]
    fn empty_result_set_produces_an_empty_archive() {
        let bytes = build_archive("ad", &[]).unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 0);
    }
}
