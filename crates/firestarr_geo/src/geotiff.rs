//! GeoTIFF persistence for single-band f32 rasters.
//!
//! Reads and writes the minimal GeoTIFF tag set the pipeline exchanges with
//! the simulator: ModelPixelScale (33550), ModelTiepoint (33922),
//! GeoKeyDirectory (34735) and the GDAL nodata tag (42113).

use crate::proj::Crs;
use crate::raster::{PixelTransform, Raster};
use crate::{GeoError, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Write a raster as a tiled-free, single-strip-per-row GeoTIFF.
pub fn write_raster(path: &Path, raster: &Raster) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;
    let mut image =
        encoder.new_image::<colortype::Gray32Float>(raster.width as u32, raster.height as u32)?;

    let scale = [
        raster.transform.pixel_width,
        raster.transform.pixel_height,
        0.0,
    ];
    let tiepoint = [
        0.0,
        0.0,
        0.0,
        raster.transform.origin_x,
        raster.transform.origin_y,
        0.0,
    ];
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    image.encoder().write_tag(
        Tag::GeoKeyDirectoryTag,
        &geo_key_directory(raster.crs)[..],
    )?;
    let nodata = format_nodata(raster.nodata);
    image
        .encoder()
        .write_tag(Tag::GdalNodata, nodata.as_str())?;

    image.write_data(&raster.data)?;
    Ok(())
}

/// Read a single-band f32 GeoTIFF written by [`write_raster`] or by the
/// simulator.
pub fn read_raster(path: &Path) -> Result<Raster> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;

    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag)?;
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag)?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(GeoError::Raster(format!(
            "{}: malformed georeferencing tags",
            path.display()
        )));
    }
    let transform = PixelTransform {
        origin_x: tiepoint[3],
        origin_y: tiepoint[4],
        pixel_width: scale[0],
        pixel_height: scale[1],
    };

    let crs = read_crs(&mut decoder)
        .ok_or_else(|| GeoError::Raster(format!("{}: unsupported CRS", path.display())))?;
    let nodata = decoder
        .get_tag_ascii_string(Tag::GdalNodata)
        .ok()
        .and_then(|s| s.trim().trim_end_matches('\0').parse::<f32>().ok())
        .unwrap_or(f32::NAN);

    let data = match decoder.read_image()? {
        DecodingResult::F32(data) => data,
        other => {
            return Err(GeoError::Raster(format!(
                "{}: expected 32-bit float band, got {:?}",
                path.display(),
                sample_kind(&other)
            )))
        }
    };
    if data.len() != (width as usize) * (height as usize) {
        return Err(GeoError::Raster(format!(
            "{}: band size does not match dimensions",
            path.display()
        )));
    }

    Ok(Raster {
        width: width as usize,
        height: height as usize,
        data,
        nodata,
        transform,
        crs,
    })
}

/// Read only the CRS of a GeoTIFF, without decoding the band.
pub fn read_crs_only(path: &Path) -> Result<Option<Crs>> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(file)?;
    Ok(read_crs(&mut decoder))
}

/// Georeferencing of a GeoTIFF without its band data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterHeader {
    pub crs: Crs,
    pub transform: PixelTransform,
    pub width: usize,
    pub height: usize,
}

/// Read a GeoTIFF's grid geometry without decoding the band.
pub fn read_header(path: &Path) -> Result<RasterHeader> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag)?;
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag)?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(GeoError::Raster(format!(
            "{}: malformed georeferencing tags",
            path.display()
        )));
    }
    let crs = read_crs(&mut decoder)
        .ok_or_else(|| GeoError::Raster(format!("{}: unsupported CRS", path.display())))?;
    Ok(RasterHeader {
        crs,
        transform: PixelTransform {
            origin_x: tiepoint[3],
            origin_y: tiepoint[4],
            pixel_width: scale[0],
            pixel_height: scale[1],
        },
        width: width as usize,
        height: height as usize,
    })
}

fn geo_key_directory(crs: Crs) -> Vec<u16> {
    let mut keys: Vec<[u16; 4]> = vec![[KEY_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA]];
    match crs {
        Crs::Wgs84 => {
            keys.insert(0, [KEY_MODEL_TYPE, 0, 1, MODEL_TYPE_GEOGRAPHIC]);
            keys.push([KEY_GEOGRAPHIC_TYPE, 0, 1, 4326]);
        }
        _ => {
            keys.insert(0, [KEY_MODEL_TYPE, 0, 1, MODEL_TYPE_PROJECTED]);
            keys.push([KEY_PROJECTED_CS_TYPE, 0, 1, crs.epsg() as u16]);
        }
    }
    let mut dir = vec![1, 1, 0, keys.len() as u16];
    for key in keys {
        dir.extend_from_slice(&key);
    }
    dir
}

fn read_crs<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<Crs> {
    let dir = decoder
        .get_tag_u16_vec(Tag::GeoKeyDirectoryTag)
        .ok()?;
    if dir.len() < 4 {
        return None;
    }
    let entries = dir[3] as usize;
    for i in 0..entries {
        let base = 4 + i * 4;
        if base + 3 >= dir.len() {
            break;
        }
        let (key, value) = (dir[base], dir[base + 3]);
        match key {
            KEY_PROJECTED_CS_TYPE => return Crs::from_epsg(u32::from(value)),
            KEY_GEOGRAPHIC_TYPE if value == 4326 => return Some(Crs::Wgs84),
            _ => {}
        }
    }
    None
}

fn format_nodata(nodata: f32) -> String {
    if nodata.is_nan() {
        "nan".to_string()
    } else if nodata == nodata.trunc() && nodata.abs() < 1e15 {
        format!("{}", nodata as i64)
    } else {
        format!("{nodata}")
    }
}

fn sample_kind(result: &DecodingResult) -> &'static str {
    match result {
        DecodingResult::U8(_) => "u8",
        DecodingResult::U16(_) => "u16",
        DecodingResult::U32(_) => "u32",
        DecodingResult::U64(_) => "u64",
        DecodingResult::I8(_) => "i8",
        DecodingResult::I16(_) => "i16",
        DecodingResult::I32(_) => "i32",
        DecodingResult::I64(_) => "i64",
        DecodingResult::F32(_) => "f32",
        DecodingResult::F64(_) => "f64",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raster() -> Raster {
        let mut r = Raster::filled(
            8,
            6,
            0.0,
            PixelTransform {
                origin_x: 1_200_000.0,
                origin_y: 900_000.0,
                pixel_width: 100.0,
                pixel_height: 100.0,
            },
            Crs::LambertCanada,
        );
        r.set(2, 3, 4.5);
        r.set(7, 0, 1.0);
        r
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.tif");
        let original = sample_raster();
        write_raster(&path, &original).unwrap();
        let read = read_raster(&path).unwrap();
        assert!(read.same_grid(&original));
        assert_eq!(read.data, original.data);
        assert_eq!(read.nodata, 0.0);

        let header = read_header(&path).unwrap();
        assert_eq!(header.crs, original.crs);
        assert_eq!(header.transform, original.transform);
        assert_eq!((header.width, header.height), (8, 6));
    }

    #[test]
    fn test_nodata_formatting() {
        assert_eq!(format_nodata(0.0), "0");
        assert_eq!(format_nodata(-9999.0), "-9999");
        assert_eq!(format_nodata(f32::NAN), "nan");
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_raster(&dir.path().join("absent.tif")).is_err());
    }
}
