use std::path::Path;

use anyhow::{bail, Context, Result};
use dicom_object::{open_file, DefaultDicomObject};
use dicom_pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use log::debug;

use crate::frames::{MultiFrameBuffer, Rescale};
use crate::window::DisplayWindow;

/// A decoded multi-frame DICOM instance plus the display hints it declares.
#[derive(Debug, Clone)]
pub struct DicomSeries {
    pub buffer: MultiFrameBuffer,
    pub declared_window: Option<DisplayWindow>,
    pub invert: bool,
    pub recommended_cine_fps: Option<f32>,
    pub pixel_spacing: Option<(f32, f32)>,
}

pub fn load_multiframe(path: &Path) -> Result<DicomSeries> {
    let obj = open_file(path).with_context(|| format!("Could not open {}", path.display()))?;

    let width: usize = obj
        .element_by_name("Columns")
        .context("Missing Columns tag")?
        .to_int()
        .context("Invalid Columns value")?;
    let height: usize = obj
        .element_by_name("Rows")
        .context("Missing Rows tag")?
        .to_int()
        .context("Invalid Rows value")?;

    let declared_frame_count = match read_int_first(&obj, "NumberOfFrames") {
        Some(value) if value > 0 => Some(value as usize),
        Some(value) => bail!("Invalid NumberOfFrames={} (must be >= 1)", value),
        None => None,
    };

    let photometric = read_string(&obj, "PhotometricInterpretation")
        .unwrap_or_else(|| "MONOCHROME2".to_string());
    let invert = photometric.eq_ignore_ascii_case("MONOCHROME1");

    let decoded = obj
        .decode_pixel_data()
        .with_context(|| format!("Failed to decode PixelData in {}", path.display()))?;
    if decoded.samples_per_pixel() != 1 {
        bail!(
            "Unsupported SamplesPerPixel={} (only monochrome frames are supported)",
            decoded.samples_per_pixel()
        );
    }
    let bits_allocated = decoded.bits_allocated();
    if bits_allocated != 8 && bits_allocated != 16 {
        bail!("BitsAllocated={} is not supported (only 8/16)", bits_allocated);
    }
    let signed = read_int_first(&obj, "PixelRepresentation") == Some(1);

    // Stored values only; the rescale travels with the buffer.
    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
    let decoded_frames = decoded.number_of_frames() as usize;
    let mut samples = Vec::with_capacity(width * height * decoded_frames.max(1));
    for frame_index in 0..decoded_frames {
        let frame_samples: Vec<i32> = decoded
            .to_vec_frame_with_options(frame_index as u32, &options)
            .with_context(|| {
                format!("Could not convert decoded frame {frame_index} to i32 samples")
            })?;
        samples.extend(frame_samples);
    }
    debug!(
        "Decoded {} frames ({}x{}, {}-bit) from {}",
        decoded_frames,
        width,
        height,
        bits_allocated,
        path.display()
    );

    let rescale = Rescale::new(
        read_float_first(&obj, "RescaleSlope").unwrap_or(1.0),
        read_float_first(&obj, "RescaleIntercept").unwrap_or(0.0),
    );
    let buffer = MultiFrameBuffer::from_samples(width, height, bits_allocated, signed, samples)
        .with_declared_frame_count(declared_frame_count)
        .with_rescale(rescale);

    let declared_window = read_float_first(&obj, "WindowWidth")
        .zip(read_float_first(&obj, "WindowCenter"))
        .filter(|(width, _)| *width > 0.0)
        .map(|(width, center)| DisplayWindow::new(width, center));

    let recommended_cine_fps = read_float_first(&obj, "FrameTime")
        .filter(|value| *value > 0.0)
        .map(|frame_time_ms| 1000.0 / frame_time_ms)
        .or_else(|| read_float_first(&obj, "CineRate").filter(|value| *value > 0.0));

    let pixel_spacing = read_string(&obj, "PixelSpacing").and_then(|value| {
        let mut parts = value.split('\\').map(parse_number);
        Some((parts.next()??, parts.next()??))
    });

    Ok(DicomSeries {
        buffer,
        declared_window,
        invert,
        recommended_cine_fps,
        pixel_spacing,
    })
}

fn read_string(obj: &DefaultDicomObject, name: &str) -> Option<String> {
    obj.element_by_name(name)
        .ok()
        .and_then(|el| el.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_float_first(obj: &DefaultDicomObject, name: &str) -> Option<f32> {
    read_string(obj, name).and_then(|value| parse_number(value.split('\\').next()?))
}

fn read_int_first(obj: &DefaultDicomObject, name: &str) -> Option<i32> {
    read_string(obj, name).and_then(|value| value.split('\\').next()?.trim().parse().ok())
}

fn parse_number(value: &str) -> Option<f32> {
    value.trim().parse::<f32>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

    use super::*;

    const SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";
    const SOP_INSTANCE: &str = "1.2.826.0.1.3680043.2.1125.1";

    fn put(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: PrimitiveValue) {
        obj.put(DataElement::new(tag, vr, value));
    }

    /// Three 2x2 frames of unsigned 16-bit samples: frame n holds n*10 + i.
    fn write_fixture(path: &Path) {
        let mut obj = InMemDicomObject::new_empty();
        put(&mut obj, Tag(0x0008, 0x0016), VR::UI, PrimitiveValue::from(SOP_CLASS));
        put(&mut obj, Tag(0x0008, 0x0018), VR::UI, PrimitiveValue::from(SOP_INSTANCE));
        put(&mut obj, Tag(0x0018, 0x1063), VR::DS, PrimitiveValue::from("40"));
        put(&mut obj, Tag(0x0028, 0x0002), VR::US, PrimitiveValue::from(1_u16));
        put(&mut obj, Tag(0x0028, 0x0004), VR::CS, PrimitiveValue::from("MONOCHROME1"));
        put(&mut obj, Tag(0x0028, 0x0008), VR::IS, PrimitiveValue::from("3"));
        put(&mut obj, Tag(0x0028, 0x0010), VR::US, PrimitiveValue::from(2_u16));
        put(&mut obj, Tag(0x0028, 0x0011), VR::US, PrimitiveValue::from(2_u16));
        put(&mut obj, Tag(0x0028, 0x0030), VR::DS, PrimitiveValue::from("0.5\\0.25"));
        put(&mut obj, Tag(0x0028, 0x0100), VR::US, PrimitiveValue::from(16_u16));
        put(&mut obj, Tag(0x0028, 0x0101), VR::US, PrimitiveValue::from(16_u16));
        put(&mut obj, Tag(0x0028, 0x0102), VR::US, PrimitiveValue::from(15_u16));
        put(&mut obj, Tag(0x0028, 0x0103), VR::US, PrimitiveValue::from(0_u16));
        put(&mut obj, Tag(0x0028, 0x1052), VR::DS, PrimitiveValue::from("-10"));
        put(&mut obj, Tag(0x0028, 0x1053), VR::DS, PrimitiveValue::from("2"));
        let samples = (0..3u16)
            .flat_map(|frame| (0..4u16).map(move |i| frame * 10 + i))
            .collect::<Vec<_>>();
        put(&mut obj, Tag(0x7FE0, 0x0010), VR::OW, PrimitiveValue::U16(samples.into()));

        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax("1.2.840.10008.1.2.1")
                    .media_storage_sop_class_uid(SOP_CLASS)
                    .media_storage_sop_instance_uid(SOP_INSTANCE),
            )
            .expect("file meta");
        file.write_to_file(path).expect("write fixture");
    }

    #[test]
    fn loads_geometry_rescale_and_display_hints() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("cine.dcm");
        write_fixture(&path);

        let series = load_multiframe(&path).expect("fixture loads");
        let buffer = &series.buffer;
        assert_eq!((buffer.width, buffer.height), (2, 2));
        assert_eq!(buffer.bits_allocated, 16);
        assert!(!buffer.signed);
        assert_eq!(buffer.declared_frame_count(), Some(3));
        assert_eq!(buffer.frame_count().expect("consistent buffer"), 3);
        assert_eq!(&buffer.samples()[4..8], &[10, 11, 12, 13]);
        assert_eq!(buffer.rescale(), Rescale::new(2.0, -10.0));
        assert!(series.invert);
        assert_eq!(series.declared_window, None);
        assert_eq!(series.recommended_cine_fps, Some(25.0));
        assert_eq!(series.pixel_spacing, Some((0.5, 0.25)));
    }

    #[test]
    fn parse_number_rejects_non_finite() {
        assert_eq!(parse_number(" 0.5 "), Some(0.5));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_multiframe(Path::new("does/not/exist.dcm")).expect_err("no file");
        assert!(format!("{err:#}").contains("does/not/exist.dcm"));
    }
}
