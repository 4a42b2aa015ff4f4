use anyhow::{bail, ensure, Context};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::path::Path;

/// Magic number at the start of every Middlebury `.flo` file.
pub const FLO_TAG: f32 = 202021.25;

/// Dense flow field, channel-planar: all `u` values, then all `v` values.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

/// Reads a `.flo` record. `record_bytes`, when given, is the exact file size
/// expected for the configured flow shape.
pub fn read_flo(path: &Path, record_bytes: Option<usize>) -> anyhow::Result<FlowField> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if let Some(expected) = record_bytes {
        ensure!(
            bytes.len() == expected,
            "{} has {} bytes, expected {}",
            path.display(),
            bytes.len(),
            expected
        );
    }
    decode_flo(&bytes).with_context(|| format!("decoding {}", path.display()))
}

pub fn decode_flo(bytes: &[u8]) -> anyhow::Result<FlowField> {
    let mut rdr = Cursor::new(bytes);
    let tag = rdr.read_f32::<LittleEndian>()?;
    if tag != FLO_TAG {
        bail!("bad .flo tag {tag}");
    }
    let width = rdr.read_i32::<LittleEndian>()?;
    let height = rdr.read_i32::<LittleEndian>()?;
    ensure!(
        width > 0 && height > 0,
        "bad .flo dimensions {width}x{height}"
    );
    let (width, height) = (width as usize, height as usize);
    let payload = bytes.len() - 12;
    ensure!(
        payload % 8 == 0 && width.checked_mul(height) == Some(payload / 8),
        "truncated .flo payload: {} bytes for {width}x{height}",
        bytes.len()
    );
    let n = payload / 8;

    let mut interleaved = vec![0f32; n * 2];
    rdr.read_f32_into::<LittleEndian>(&mut interleaved)?;
    let mut data = vec![0f32; n * 2];
    for (i, uv) in interleaved.chunks_exact(2).enumerate() {
        data[i] = uv[0];
        data[n + i] = uv[1];
    }
    Ok(FlowField {
        height,
        width,
        data,
    })
}

#[cfg(test)]
pub fn write_flo(path: &Path, flow: &FlowField) -> anyhow::Result<()> {
    use byteorder::WriteBytesExt;
    use std::io::{BufWriter, Write};

    let n = flow.height * flow.width;
    ensure!(flow.data.len() == n * 2, "flow buffer does not match its shape");
    let mut w = BufWriter::new(std::fs::File::create(path)?);
    w.write_f32::<LittleEndian>(FLO_TAG)?;
    w.write_i32::<LittleEndian>(flow.width as i32)?;
    w.write_i32::<LittleEndian>(flow.height as i32)?;
    for i in 0..n {
        w.write_f32::<LittleEndian>(flow.data[i])?;
        w.write_f32::<LittleEndian>(flow.data[n + i])?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn ramp(height: usize, width: usize) -> FlowField {
        let n = height * width;
        let data = (0..2 * n).map(|i| i as f32 * 0.5 - 3.0).collect();
        FlowField {
            height,
            width,
            data,
        }
    }

    #[test]
    fn written_file_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a_flow.flo");
        let flow = ramp(3, 5);
        write_flo(&path, &flow).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 12 + 3 * 5 * 8);
        assert_eq!(read_flo(&path, Some(12 + 3 * 5 * 8)).unwrap(), flow);
    }

    #[test]
    fn record_size_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a_flow.flo");
        write_flo(&path, &ramp(2, 2)).unwrap();
        assert!(read_flo(&path, Some(1_572_876)).is_err());
    }

    #[test]
    fn interleaved_values_are_split_into_planes() {
        let mut bytes = Vec::new();
        bytes.write_f32::<LittleEndian>(FLO_TAG).unwrap();
        bytes.write_i32::<LittleEndian>(2).unwrap();
        bytes.write_i32::<LittleEndian>(1).unwrap();
        for v in [1.0f32, -1.0, 2.0, -2.0] {
            bytes.write_f32::<LittleEndian>(v).unwrap();
        }
        let flow = decode_flo(&bytes).unwrap();
        assert_eq!((flow.height, flow.width), (1, 2));
        assert_eq!(flow.data, vec![1.0, 2.0, -1.0, -2.0]);
    }

    #[test]
    fn bad_tag_is_rejected() {
        let mut bytes = Vec::new();
        bytes.write_f32::<LittleEndian>(1.0).unwrap();
        bytes.write_i32::<LittleEndian>(1).unwrap();
        bytes.write_i32::<LittleEndian>(1).unwrap();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(decode_flo(&bytes).is_err());
    }

    #[test]
    fn oversized_header_is_an_error() {
        let mut bytes = Vec::new();
        bytes.write_f32::<LittleEndian>(FLO_TAG).unwrap();
        bytes.write_i32::<LittleEndian>(i32::MAX).unwrap();
        bytes.write_i32::<LittleEndian>(i32::MAX).unwrap();
        bytes.extend_from_slice(&[0u8; 16]);
        let err = decode_flo(&bytes).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }
}
