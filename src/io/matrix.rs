use nalgebra::{Matrix3, Matrix4, Vector3};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{PipelineError, PipelineResult};

/// Reads a whitespace-separated 4x4 matrix (flirt `-omat`, also what
/// numpy's `loadtxt` accepts). Blank lines are ignored.
pub fn read_matrix<P: AsRef<Path>>(path: P) -> PipelineResult<Matrix4<f64>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    parse_matrix(&content).map_err(|message| PipelineError::Matrix {
        path: path.to_path_buf(),
        message,
    })
}

pub fn parse_matrix(content: &str) -> Result<Matrix4<f64>, String> {
    let rows: Vec<Vec<f64>> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_whitespace()
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|e| format!("invalid value '{}': {}", v, e))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<_, _>>()?;

    if rows.len() != 4 {
        return Err(format!("expected 4 rows, found {}", rows.len()));
    }
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != 4) {
        return Err(format!("row {} has {} values, expected 4", i, row.len()));
    }

    let values: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(Matrix4::from_row_slice(&values))
}

/// Reads the first linear transform of an ITK text transform file
/// (`-oitk` of c3d_affine_tool, ConvertTransformFile output).
pub fn read_itk_affine<P: AsRef<Path>>(path: P) -> PipelineResult<Matrix4<f64>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    parse_itk_affine(&content).map_err(|message| PipelineError::Matrix {
        path: path.to_path_buf(),
        message,
    })
}

/// ITK stores a 3x3 matrix `A`, a translation `t` and a centre `c`; the
/// homogeneous matrix is `[A | t + c - A c]`.
pub fn parse_itk_affine(content: &str) -> Result<Matrix4<f64>, String> {
    fn values(line: &str) -> Result<Vec<f64>, String> {
        line.split_whitespace()
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|e| format!("invalid value '{}': {}", v, e))
            })
            .collect()
    }

    let mut parameters: Option<Vec<f64>> = None;
    let mut fixed = vec![0.0; 3];
    for line in content.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("FixedParameters:") {
            fixed = values(rest)?;
        } else if let Some(rest) = line.strip_prefix("Parameters:") {
            if parameters.is_none() {
                parameters = Some(values(rest)?);
            }
        }
    }

    let parameters = parameters.ok_or_else(|| "no Parameters line".to_string())?;
    if parameters.len() != 12 {
        return Err(format!(
            "expected 12 affine parameters, found {}",
            parameters.len()
        ));
    }
    if fixed.len() != 3 {
        return Err(format!("expected 3 fixed parameters, found {}", fixed.len()));
    }

    let linear = Matrix3::from_row_slice(&parameters[..9]);
    let translation = Vector3::new(parameters[9], parameters[10], parameters[11]);
    let centre = Vector3::new(fixed[0], fixed[1], fixed[2]);
    let offset = translation + centre - linear * centre;

    let mut matrix = linear.to_homogeneous();
    matrix[(0, 3)] = offset.x;
    matrix[(1, 3)] = offset.y;
    matrix[(2, 3)] = offset.z;
    Ok(matrix)
}

/// Writes a matrix in the same layout flirt uses, creating parent
/// directories as needed.
pub fn write_matrix<P: AsRef<Path>>(path: P, matrix: &Matrix4<f64>) -> PipelineResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for i in 0..4 {
        let row: Vec<String> = (0..4).map(|j| format!("{:.10}", matrix[(i, j)])).collect();
        writeln!(writer, "{}  ", row.join("  "))?;
    }
    writer.flush()?;
    Ok(())
}
