use chrono::Utc;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{PoolError, Result};
use crate::rembg::Cutout;

/// Zip a batch of results. Cutouts land as `{stem}.png` (plus
/// `{stem}.mask.png` with `include_mask`), failures as `{stem}.error.txt`.
pub fn write_zip(entries: &[(String, Result<Cutout>)], include_mask: bool) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut buffer);
    // PNGs are already compressed.
    let options = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);

    let mut taken = HashSet::new();
    for (name, result) in entries {
        let suffixes: &[&str] = match result {
            Ok(_) if include_mask => &[".png", ".mask.png"],
            Ok(_) => &[".png"],
            Err(_) => &[".error.txt"],
        };
        let stem = claim_stem(name, suffixes, &mut taken);

        match result {
            Ok(cutout) => {
                add_file(&mut zip, format!("{}.png", stem), &cutout.encode_png()?, options)?;
                if include_mask {
                    let mask = cutout.encode_mask_png()?;
                    add_file(&mut zip, format!("{}.mask.png", stem), &mask, options)?;
                }
            }
            Err(e) => {
                let report = format!(
                    "{}\n{}\n",
                    e.message(),
                    Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
                );
                add_file(&mut zip, format!("{}.error.txt", stem), report.as_bytes(), options)?;
            }
        }
    }

    zip.finish()
        .map_err(|e| PoolError::new("zip_finish_failed").push_std(e))?;
    Ok(buffer.into_inner())
}

fn add_file<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    name: String,
    data: &[u8],
    options: FileOptions<()>,
) -> Result<()> {
    zip.start_file(name, options)
        .map_err(|e| PoolError::new("zip_create_failed").push_std(e))?;
    zip.write_all(data)
        .map_err(|e| PoolError::new("zip_write_failed").push_std(e))?;
    Ok(())
}

/// Pick a stem for `name` whose files (stem + each suffix) are all unused,
/// trying `_2`, `_3`, ... in turn, and reserve those file names.
fn claim_stem(name: &str, suffixes: &[&str], taken: &mut HashSet<String>) -> String {
    let base = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");

    let mut stem = base.to_string();
    let mut n = 1;
    while suffixes
        .iter()
        .any(|suffix| taken.contains(&format!("{}{}", stem, suffix)))
    {
        n += 1;
        stem = format!("{}_{}", base, n);
    }

    for suffix in suffixes {
        taken.insert(format!("{}{}", stem, suffix));
    }
    stem
}
