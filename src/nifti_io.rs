// NIfTI reading and writing on top of the nifti crate. Images are handed to the rest of the crate
// as f32 with the intensity scaling applied; results are written back with the header of the
// input so they keep its datatype, voxel size and spatial transform.

use crate::error::{DenoiseError, Result};
use ndarray::ArrayD;
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, ReaderOptions};
use std::path::Path;

/// A loaded image: its header and its voxel values as `f32`, indexed [x, y, z, ...].
#[derive(Debug, Clone)]
pub struct NiftiImage {
    pub header: NiftiHeader,
    pub data: ArrayD<f32>,
}

/// a default header that stores voxels as `datatype`
pub fn header_for(datatype: NiftiType) -> NiftiHeader {
    NiftiHeader {
        datatype: datatype as i16,
        scl_slope: 1.,
        scl_inter: 0.,
        ..NiftiHeader::default()
    }
}

/// reads a `.nii` or `.nii.gz` file
pub fn read_nifti(path: impl AsRef<Path>) -> Result<NiftiImage> {
    let obj = ReaderOptions::new().read_file(path.as_ref())?;
    let header = obj.header().clone();
    let data = obj.into_volume().into_ndarray::<f32>()?;
    Ok(NiftiImage { header, data })
}

/// rounds to the nearest integer in [lo, hi]; non-finite values become 0
fn saturate(data: &ArrayD<f32>, lo: f64, hi: f64) -> ArrayD<f64> {
    data.mapv(|v| if v.is_finite() { (v as f64).round().clamp(lo, hi) } else { 0. })
}

/// writes `data` in the datatype of `reference`, which also supplies the voxel size and the
/// spatial transform. The stored values are unscaled. The file is gzip-compressed when the path
/// ends in `.gz`.
pub fn write_nifti(path: impl AsRef<Path>, reference: &NiftiHeader, data: &ArrayD<f32>) -> Result<()> {
    let mut header = reference.clone();
    header.scl_slope = 1.;
    header.scl_inter = 0.;
    let writer = WriterOptions::new(path.as_ref()).reference_header(&header);
    match header.data_type()? {
        NiftiType::Uint8 => writer.write_nifti(&saturate(data, u8::MIN as f64, u8::MAX as f64).mapv(|v| v as u8)),
        NiftiType::Int8 => writer.write_nifti(&saturate(data, i8::MIN as f64, i8::MAX as f64).mapv(|v| v as i8)),
        NiftiType::Int16 => writer.write_nifti(&saturate(data, i16::MIN as f64, i16::MAX as f64).mapv(|v| v as i16)),
        NiftiType::Uint16 => writer.write_nifti(&saturate(data, u16::MIN as f64, u16::MAX as f64).mapv(|v| v as u16)),
        NiftiType::Int32 => writer.write_nifti(&saturate(data, i32::MIN as f64, i32::MAX as f64).mapv(|v| v as i32)),
        NiftiType::Uint32 => writer.write_nifti(&saturate(data, u32::MIN as f64, u32::MAX as f64).mapv(|v| v as u32)),
        NiftiType::Float32 => writer.write_nifti(data),
        NiftiType::Float64 => writer.write_nifti(&data.mapv(f64::from)),
        other => return Err(DenoiseError::InvalidNifti(format!("cannot write voxels of type {:?}", other))),
    }?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::nifti_io::{header_for, read_nifti, write_nifti};
    use ndarray::{ArrayD, IxDyn};
    use nifti::NiftiType;

    #[test]
    fn float_volume_keeps_axis_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii");
        let data = ArrayD::from_shape_fn(IxDyn(&[3, 4, 2, 5]), |ix| (ix[0] + 10 * ix[1] + 100 * ix[2] + 1000 * ix[3]) as f32);
        write_nifti(&path, &header_for(NiftiType::Float32), &data).unwrap();

        let image = read_nifti(&path).unwrap();
        assert_eq!(image.header.dim[..5], [4, 3, 4, 2, 5]);
        assert_eq!(image.data.shape(), &[3, 4, 2, 5]);
        assert_eq!(image.data, data);
    }

    #[test]
    fn integers_are_rounded_and_saturated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii.gz");
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 2, 1]), vec![10., 11.4, -1e9, 1e9]).unwrap();
        write_nifti(&path, &header_for(NiftiType::Int16), &data).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

        let image = read_nifti(&path).unwrap();
        assert_eq!(image.header.data_type().unwrap(), NiftiType::Int16);
        assert_eq!(image.data[[0, 0, 0]], 10.);
        assert_eq!(image.data[[0, 1, 0]], 11.);
        assert_eq!(image.data[[1, 0, 0]], i16::MIN as f32);
        assert_eq!(image.data[[1, 1, 0]], i16::MAX as f32);
    }

    #[test]
    fn output_follows_the_reference_header() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.nii");
        let b = dir.path().join("b.nii");
        let mut header = header_for(NiftiType::Uint8);
        header.pixdim = [1., 2., 2., 2.5, 1., 1., 1., 1.];
        write_nifti(&a, &header, &ArrayD::zeros(IxDyn(&[2, 2, 2, 3]))).unwrap();
        let loaded = read_nifti(&a).unwrap();
        write_nifti(&b, &loaded.header, &ArrayD::from_elem(IxDyn(&[2, 2, 2, 5]), 3.)).unwrap();

        let image = read_nifti(&b).unwrap();
        assert_eq!(image.header.data_type().unwrap(), NiftiType::Uint8);
        assert_eq!(image.header.pixdim[..4], [1., 2., 2., 2.5]);
        assert_eq!(image.data.shape(), &[2, 2, 2, 5]);
        assert!(image.data.iter().all(|&v| v == 3.));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.nii");
        write_nifti(&path, &header_for(NiftiType::Float32), &ArrayD::zeros(IxDyn(&[4, 4, 4]))).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..400]).unwrap();
        assert!(read_nifti(&path).is_err());
    }
}
