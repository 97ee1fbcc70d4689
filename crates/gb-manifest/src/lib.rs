//! gb-manifest: decode Greybus manifest blobs to JSON and back.

use std::path::Path;

use anyhow::Context;
use greybus::Manifest;

/// Read and decode a manifest blob.
pub fn decode_file(path: &Path) -> anyhow::Result<Manifest> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    tracing::debug!(path = %path.display(), len = bytes.len(), "Decoding manifest");
    Manifest::parse(&bytes).with_context(|| format!("invalid manifest {}", path.display()))
}

/// Decode a manifest blob and render it as pretty JSON.
pub fn decode_to_json(path: &Path) -> anyhow::Result<String> {
    let manifest = decode_file(path)?;
    serde_json::to_string_pretty(&manifest).context("JSON serialization failed")
}

/// Encode the JSON manifest description at `input` into a blob at `output`.
/// Returns the number of bytes written.
pub fn encode_file(input: &Path, output: &Path) -> anyhow::Result<usize> {
    let json = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let manifest: Manifest = serde_json::from_str(&json)
        .with_context(|| format!("invalid manifest description {}", input.display()))?;

    let bytes = manifest.encode();
    // The size field is 16 bits; anything larger cannot be decoded again.
    Manifest::parse(&bytes).context("encoded manifest does not decode")?;

    std::fs::write(output, &bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;
    tracing::info!(output = %output.display(), len = bytes.len(), "Wrote manifest");
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use greybus::ManifestBuilder;

    #[test]
    fn decode_renders_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.mnfb");
        let bytes = ManifestBuilder::new()
            .module(0x0042, 0x0001, 0x0003, 77, 1, 2)
            .string(1, "Acme")
            .string(2, "Vibrator")
            .cport(2, 0)
            .build();
        std::fs::write(&path, &bytes).unwrap();

        let json = decode_to_json(&path).unwrap();
        insta::assert_snapshot!(json, @r#"
        {
          "module": {
            "vendor": 66,
            "product": 1,
            "version": 3,
            "serial_number": 77,
            "vendor_string": "Acme",
            "product_string": "Vibrator"
          },
          "cports": [
            {
              "number": 2,
              "speed": 0
            }
          ]
        }
        "#);
    }

    #[test]
    fn decode_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.mnfb");
        std::fs::write(&path, [4u8, 0, 0, 1]).unwrap();

        let err = decode_file(&path).unwrap_err();
        assert!(err.to_string().starts_with("invalid manifest"));
        assert!(format!("{err:#}").contains("manifest too short (4 bytes)"));
    }

    #[test]
    fn encode_then_decode() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("module.json");
        let output = dir.path().join("module.mnfb");
        std::fs::write(
            &input,
            r#"{
                "module": {
                    "vendor": 1,
                    "product": 2,
                    "version": 3,
                    "serial_number": 4,
                    "vendor_string": null,
                    "product_string": "Widget"
                }
            }"#,
        )
        .unwrap();

        let written = encode_file(&input, &output).unwrap();
        // header + module + string("Widget")
        assert_eq!(written, 4 + 19 + 12);

        let manifest = decode_file(&output).unwrap();
        assert_eq!(manifest.module.product_string.as_deref(), Some("Widget"));
        assert_eq!(manifest.module.vendor_string, None);
        assert!(manifest.cports.is_empty());
    }

    #[test]
    fn encode_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.json");
        std::fs::write(&input, "{}").unwrap();
        let err = encode_file(&input, &dir.path().join("out.mnfb")).unwrap_err();
        assert!(err.to_string().starts_with("invalid manifest description"));
    }
}
