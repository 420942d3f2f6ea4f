//! Footage Formats
//!
//! Resolution records linked to a Shot or Asset. The online input format and
//! the preview output format drive the `width`, `height` and aspect ratio
//! template fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::entity::{get_field, render_value, Fields};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FootageType {
    #[serde(rename = "Input Online")]
    InputOnline,
    #[serde(rename = "Input Offline")]
    InputOffline,
    #[serde(rename = "Input Other")]
    InputOther,
    #[serde(rename = "Output Render")]
    OutputRender,
    #[serde(rename = "Output Preview")]
    OutputPreview,
    #[serde(rename = "Output Other")]
    OutputOther,
    Delivery,
}

/// Where each footage format attribute lives on the tracking record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FootageFormatFields {
    #[serde(default = "default_type_field")]
    pub footage_type: String,
    #[serde(default = "default_resolution_field")]
    pub resolution: String,
    #[serde(default = "default_crop_field")]
    pub crop: String,
}

fn default_type_field() -> String { "sg_footage_type".to_string() }
fn default_resolution_field() -> String { "sg_resolution".to_string() }
fn default_crop_field() -> String { "sg_crop".to_string() }

impl Default for FootageFormatFields {
    fn default() -> Self {
        Self {
            footage_type: default_type_field(),
            resolution: default_resolution_field(),
            crop: default_crop_field(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FootageFormat {
    pub footage_type: FootageType,
    pub width: i64,
    pub height: i64,
    /// Pixels cropped from each side, horizontally and vertically
    pub crop: (i64, i64),
}

impl FootageFormat {
    /// Read one linked record. Records with an unknown type are ignored and
    /// a resolution that does not parse reads as `0x0`.
    pub fn from_record(record: &Value, mapping: &FootageFormatFields) -> Option<Self> {
        let fields: Fields = record.as_object()?.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let text = |field: &str| get_field(&fields, field).and_then(render_value);

        let footage_type = serde_json::from_value(Value::from(text(&mapping.footage_type)?)).ok()?;
        let (width, height) = text(&mapping.resolution)
            .and_then(|res| parse_pair(&res, 'x'))
            .unwrap_or((0, 0));
        let crop = match text(&mapping.crop) {
            Some(crop) if crop.contains(',') => parse_pair(&crop, ',').unwrap_or((0, 0)),
            Some(crop) => crop.trim().parse().map(|c| (c, c)).unwrap_or((0, 0)),
            None => (0, 0),
        };
        Some(Self { footage_type, width, height, crop })
    }
}

fn parse_pair(text: &str, separator: char) -> Option<(i64, i64)> {
    let (a, b) = text.split_once(separator)?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// `w / h` with two decimals, `?` without a height
pub fn aspect_ratio(width: i64, height: i64) -> String {
    if height <= 0 {
        return "?".to_string();
    }
    format!("{:.2}", width as f64 / height as f64)
}

/// Template fields derived from an owner's footage formats.
///
/// Without formats only the defaults are set: zero size and an aspect ratio
/// of `1`. The preview output format sets the delivered size. The online
/// input format, cropped by the output format, sets the aspect ratio.
pub fn format_fields(formats: Option<&[FootageFormat]>) -> Fields {
    let mut fields = Fields::new();
    fields.insert("width".into(), Value::from(0));
    fields.insert("height".into(), Value::from(0));
    fields.insert("aspect_ratio".into(), Value::from("1"));

    let formats = match formats {
        Some(formats) => formats,
        None => return fields,
    };
    let find = |footage_type| formats.iter().find(|f| f.footage_type == footage_type);
    let output = find(FootageType::OutputPreview);
    let input = find(FootageType::InputOnline);
    debug!("Footage formats: input {:?}, output {:?}", input, output);

    if let Some(output) = output {
        let ratio = aspect_ratio(output.width, output.height);
        fields.insert("output_width".into(), Value::from(output.width));
        fields.insert("output_height".into(), Value::from(output.height));
        fields.insert("width".into(), Value::from(output.width));
        fields.insert("height".into(), Value::from(output.height));
        fields.insert("output_aspect_ratio".into(), Value::from(ratio.clone()));
        fields.insert("aspect_ratio".into(), Value::from(ratio));
    }

    if let Some(input) = input {
        fields.insert("input_width".into(), Value::from(input.width));
        fields.insert("input_height".into(), Value::from(input.height));
        fields.insert("input_aspect_ratio".into(), Value::from(aspect_ratio(input.width, input.height)));

        let ratio = match output {
            None => {
                fields.insert("width".into(), Value::from(input.width));
                fields.insert("height".into(), Value::from(input.height));
                aspect_ratio(input.width, input.height)
            }
            Some(output) => {
                let (crop_x, crop_y) = output.crop;
                aspect_ratio(input.width - crop_x * 2, input.height - crop_y * 2)
            }
        };
        fields.insert("aspect_ratio".into(), Value::from(ratio));
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn format(footage_type: &str, resolution: &str, crop: Option<&str>) -> FootageFormat {
        let record = json!({"sg_footage_type": footage_type, "sg_resolution": resolution, "sg_crop": crop});
        FootageFormat::from_record(&record, &FootageFormatFields::default()).unwrap()
    }

    #[test]
    fn test_parse_record() {
        let output = format("Output Preview", "1920x1080", Some("0,140"));
        assert_eq!(output.footage_type, FootageType::OutputPreview);
        assert_eq!((output.width, output.height), (1920, 1080));
        assert_eq!(output.crop, (0, 140));
        assert_eq!(format("Input Online", "bad", Some("8")).crop, (8, 8));
        assert_eq!(format("Input Online", "bad", None).width, 0);

        let unknown = json!({"sg_footage_type": "Proxy", "sg_resolution": "10x10"});
        assert!(FootageFormat::from_record(&unknown, &FootageFormatFields::default()).is_none());
    }

    #[test]
    fn test_defaults_without_formats() {
        let fields = format_fields(None);
        assert_eq!(fields["width"], json!(0));
        assert_eq!(fields["aspect_ratio"], json!("1"));
        assert!(!fields.contains_key("output_width"));
    }

    #[test]
    fn test_output_sets_size_and_cropped_input_sets_ratio() {
        let formats = vec![
            format("Input Online", "4096x2160", None),
            format("Output Preview", "2048x1080", Some("0,138")),
        ];
        let fields = format_fields(Some(&formats));
        assert_eq!(fields["width"], json!(2048));
        assert_eq!(fields["output_height"], json!(1080));
        assert_eq!(fields["output_aspect_ratio"], json!("1.90"));
        assert_eq!(fields["input_aspect_ratio"], json!("1.90"));
        assert_eq!(fields["aspect_ratio"], json!("2.17"));
    }

    #[test]
    fn test_input_only_sets_size() {
        let formats = vec![format("Input Online", "3840x2160", None), format("Delivery", "0x0", None)];
        let fields = format_fields(Some(&formats));
        assert_eq!(fields["width"], json!(3840));
        assert_eq!(fields["height"], json!(2160));
        assert_eq!(fields["aspect_ratio"], json!("1.78"));
        assert_eq!(aspect_ratio(10, 0), "?");
    }
}
