//! On-disk fixtures shared by the unit tests.

use image::{Rgb, RgbImage};
use std::{fmt::Write as _, fs, path::Path};

pub(crate) const IMAGE_SIDE: u32 = 8;

pub(crate) fn write_image(path: &Path, value: u8) {
    RgbImage::from_pixel(IMAGE_SIDE, IMAGE_SIDE, Rgb([value; 3]))
        .save(path)
        .unwrap();
}

/// Writes a training manifest with one folder per subject, each holding
/// `mask1.jpg`, `incorrect_mask.jpg` and `normal1.jpg`.
pub(crate) fn write_training_set(root: &Path, subjects: &[(&str, i64)]) -> std::path::PathBuf {
    let mut csv = String::from("id,gender,race,age,path,mask,incorrect,normal\n");
    for (i, (gender, age)) in subjects.iter().enumerate() {
        let folder = format!("{i:06}_{gender}_{age}");
        writeln!(csv, "{i:06},{gender},Asian,{age},{folder},1,1,1").unwrap();
        let dir = root.join(&folder);
        fs::create_dir_all(&dir).unwrap();
        for (name, value) in [("mask1.jpg", 0), ("incorrect_mask.jpg", 128), ("normal1.jpg", 255)] {
            write_image(&dir.join(name), value);
        }
    }
    let manifest = root.join("train.csv");
    fs::write(&manifest, csv).unwrap();
    manifest
}

/// Writes an inference manifest and a flat image directory, image `i` filled with `values[i]`.
pub(crate) fn write_inference_set(root: &Path, values: &[u8]) -> std::path::PathBuf {
    let images = root.join("images");
    fs::create_dir_all(&images).unwrap();
    let mut csv = String::from("ImageID,ans\n");
    for (i, value) in values.iter().enumerate() {
        let name = format!("{i:03}.jpg");
        write_image(&images.join(&name), *value);
        writeln!(csv, "{name},0").unwrap();
    }
    let manifest = root.join("info.csv");
    fs::write(&manifest, csv).unwrap();
    manifest
}
