// Spreadsheet sources for ingest.
//
// A source is a .csv file (one sheet, named by its file stem) or a directory
// of .csv files (one sheet each). Rows are read as dictionaries keyed by
// column header.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::constants::SPREADSHEET_EXTENSION;
use crate::error::{ArcaError, Result};

#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<BTreeMap<String, String>>,
}

fn sheet_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "sheet".to_string())
}

fn read_sheet(path: &Path) -> Result<Sheet> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = BTreeMap::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            row.insert(header.clone(), field.to_string());
        }
        rows.push(row);
    }

    Ok(Sheet {
        name: sheet_name(path),
        rows,
    })
}

/// Read every sheet of a spreadsheet source.
pub fn read_sheets(path: &Path) -> Result<Vec<Sheet>> {
    if path.is_file() {
        return Ok(vec![read_sheet(path)?]);
    }

    if path.is_dir() {
        let mut csv_paths: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase() == SPREADSHEET_EXTENSION)
                    .unwrap_or(false)
            })
            .collect();
        csv_paths.sort();

        let mut sheets = Vec::new();
        for csv_path in csv_paths {
            sheets.push(read_sheet(&csv_path)?);
        }
        return Ok(sheets);
    }

    Err(ArcaError::DoesNotExist(format!(
        "spreadsheet source {}",
        path.display()
    )))
}

/// Media paths in a `files` column resolve against this directory.
pub fn media_base_dir(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent().map(|p| p.to_path_buf()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_read_single_csv_as_one_sheet() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("inventory.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Title,files").unwrap();
        writeln!(file, "First,a.png").unwrap();
        writeln!(file, "Second,").unwrap();
        drop(file);

        let sheets = read_sheets(&path).unwrap();
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].name, "inventory");
        assert_eq!(sheets[0].rows.len(), 2);
        assert_eq!(sheets[0].rows[0].get("Title").unwrap(), "First");
        assert_eq!(sheets[0].rows[0].get("files").unwrap(), "a.png");
    }

    #[test]
    fn test_read_directory_as_workbook() {
        let tmp = TempDir::new().unwrap();
        for name in ["b.csv", "a.csv"] {
            let mut file = std::fs::File::create(tmp.path().join(name)).unwrap();
            writeln!(file, "col").unwrap();
            writeln!(file, "v").unwrap();
        }
        std::fs::write(tmp.path().join("ignore.txt"), "x").unwrap();

        let sheets = read_sheets(tmp.path()).unwrap();
        assert_eq!(sheets.len(), 2);
        assert_eq!(sheets[0].name, "a");
        assert_eq!(sheets[1].name, "b");
    }
}
