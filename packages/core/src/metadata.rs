//! Submission metadata consumed by the core.

use serde::Deserialize;

use crate::{CoreError, Dimensions};

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(rename = "photoCount")]
    photo_count: Option<serde_json::Value>,
    #[serde(default)]
    dimensions: Option<RawDimensions>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDimensions {
    length: Option<serde_json::Value>,
    width: Option<serde_json::Value>,
    height: Option<serde_json::Value>,
}

/// Dimension values supplied next to the bundle. They take precedence over
/// the ones found in the metadata document.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DimensionOverrides {
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

/// A validated reconstruction request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanRequest {
    pub photo_count: u32,
    pub dimensions: Dimensions,
}

impl ScanRequest {
    /// Parse the metadata document. Unknown fields are ignored.
    pub fn from_metadata(json: &[u8], overrides: DimensionOverrides) -> Result<Self, CoreError> {
        let raw: RawMetadata = serde_json::from_slice(json)
            .map_err(|e| CoreError::invalid_input(format!("metadata is not valid JSON: {e}")))?;

        let photo_count = match raw.photo_count {
            Some(value) => value
                .as_u64()
                .filter(|n| *n >= 1)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    CoreError::invalid_input(format!(
                        "photoCount must be an integer >= 1, got {value}"
                    ))
                })?,
            None => return Err(CoreError::invalid_input("photoCount is required")),
        };

        let dims = raw.dimensions.unwrap_or_default();
        let length = pick("length", overrides.length, dims.length)?;
        let width = pick("width", overrides.width, dims.width)?;
        let height = pick("height", overrides.height, dims.height)?;

        Ok(Self {
            photo_count,
            dimensions: Dimensions::new(length, width, height)?,
        })
    }
}

fn pick(
    name: &str,
    supplied: Option<f64>,
    documented: Option<serde_json::Value>,
) -> Result<f64, CoreError> {
    if let Some(value) = supplied {
        return Ok(value);
    }
    match documented {
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| CoreError::invalid_input(format!("dimensions.{name} is not a number"))),
        // Upload forms tend to send numeric text.
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().map_err(|_| {
            CoreError::invalid_input(format!("dimensions.{name} is not a number: {s}"))
        }),
        Some(other) => Err(CoreError::invalid_input(format!(
            "dimensions.{name} is not a number: {other}"
        ))),
        None => Err(CoreError::invalid_input(format!(
            "dimensions.{name} is required"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_metadata_and_ignores_extra_fields() {
        let json = br#"{
            "photoCount": 24,
            "dimensions": {"length": 50, "width": 40.5, "height": "100"},
            "captureMode": "circular",
            "angles": [0, 15, 30]
        }"#;
        let req = ScanRequest::from_metadata(json, DimensionOverrides::default()).unwrap();
        assert_eq!(req.photo_count, 24);
        assert_eq!(req.dimensions.length, 50.0);
        assert_eq!(req.dimensions.width, 40.5);
        assert_eq!(req.dimensions.height, 100.0);
    }

    #[test]
    fn supplied_dimensions_override_the_document() {
        let json = br#"{"photoCount": 3, "dimensions": {"length": 1, "width": 2, "height": 3}}"#;
        let overrides = DimensionOverrides {
            length: Some(10.0),
            width: None,
            height: Some(30.0),
        };
        let req = ScanRequest::from_metadata(json, overrides).unwrap();
        assert_eq!(req.dimensions.length, 10.0);
        assert_eq!(req.dimensions.width, 2.0);
        assert_eq!(req.dimensions.height, 30.0);
    }

    #[test]
    fn rejects_bad_photo_counts_and_dimensions() {
        let cases: [&[u8]; 6] = [
            br#"{"dimensions": {"length": 1, "width": 1, "height": 1}}"#,
            br#"{"photoCount": 0, "dimensions": {"length": 1, "width": 1, "height": 1}}"#,
            br#"{"photoCount": 2.5, "dimensions": {"length": 1, "width": 1, "height": 1}}"#,
            br#"{"photoCount": 2, "dimensions": {"length": 0, "width": 1, "height": 1}}"#,
            br#"{"photoCount": 2, "dimensions": {"length": 1, "width": 1}}"#,
            b"not json",
        ];
        for case in cases {
            let result = ScanRequest::from_metadata(case, DimensionOverrides::default());
            assert!(
                matches!(result, Err(CoreError::InvalidInput(_))),
                "expected rejection for {}",
                String::from_utf8_lossy(case)
            );
        }
    }
}
