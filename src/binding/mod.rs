use pyo3::prelude::*;
use pyo3::wrap_pyfunction;
use std::path::Path;

use crate::config::PipelineConfig;
use crate::entry::{run_longitudinal, run_symmetrization};
use crate::processing::report::RunReport;
use crate::transform::decompose::decompose;
use crate::transform::{Stage, Transform};

fn to_py_err<E: std::fmt::Display>(e: E) -> PyErr {
    pyo3::exceptions::PyRuntimeError::new_err(e.to_string())
}

fn load_config(config_path: &str, dry_run: bool, force: bool) -> PyResult<PipelineConfig> {
    let mut config = PipelineConfig::from_file(config_path).map_err(to_py_err)?;
    config.dry_run |= dry_run;
    config.force |= force;
    Ok(config)
}

fn report_json(report: &RunReport) -> PyResult<String> {
    serde_json::to_string_pretty(report).map_err(to_py_err)
}

/// Builds a symmetric template for every session of a TOML config.
///
/// Arguments
/// ---------
///
/// - ``config_path``: Path to the pipeline TOML file.
/// - ``dry_run`` (default: False): Log the engine commands without running them.
/// - ``force`` (default: False): Recompute outputs that already exist.
///
/// Returns
/// -------
///
/// The run report as a JSON string.
///
/// Raises
/// ------
///
/// ``RuntimeError`` if the configuration is invalid or the report cannot be written.
///
/// Example
/// -------
///
/// .. code-block:: python
///
///    import json
///    import symtemplate as st
///    report = json.loads(st.symmetrize("pipeline.toml", dry_run=True))
///    print([s["status"] for s in report["sessions"]])
///
#[pyfunction]
#[pyo3(signature = (config_path, dry_run = false, force = false))]
pub fn symmetrize(config_path: &str, dry_run: bool, force: bool) -> PyResult<String> {
    let config = load_config(config_path, dry_run, force)?;
    let report = run_symmetrization(&config).map_err(to_py_err)?;
    report_json(&report)
}

/// Registers consecutive sessions and propagates contrasts along the
/// composed chains.
///
/// Arguments are the same as for ``symmetrize``; at least two sessions
/// are required. Returns the run report as a JSON string.
#[pyfunction]
#[pyo3(signature = (config_path, dry_run = false, force = false))]
pub fn longitudinal(config_path: &str, dry_run: bool, force: bool) -> PyResult<String> {
    let config = load_config(config_path, dry_run, force)?;
    let report = run_longitudinal(&config).map_err(to_py_err)?;
    report_json(&report)
}

/// Splits a 4x4 rigid matrix (row-major nested lists) into translation
/// and x-y-z Euler angles in degrees.
///
/// .. code-block:: python
///
///    (tx, ty, tz), (rx, ry, rz) = st.decompose_matrix(rows)
///
#[pyfunction]
pub fn decompose_matrix(rows: Vec<Vec<f64>>) -> PyResult<((f64, f64, f64), (f64, f64, f64))> {
    if rows.len() != 4 || rows.iter().any(|r| r.len() != 4) {
        return Err(pyo3::exceptions::PyValueError::new_err(
            "expected a 4x4 matrix",
        ));
    }
    let matrix = nalgebra::Matrix4::from_fn(|i, j| rows[i][j]);
    let transform = Transform::rigid(matrix, "moving", "fixed", Stage::SessionHop);
    let d = decompose(&transform).map_err(to_py_err)?;
    let [tx, ty, tz] = d.translation;
    let [rx, ry, rz] = d.angles_deg;
    Ok(((tx, ty, tz), (rx, ry, rz)))
}

/// Reads a flirt matrix file and decomposes it like ``decompose_matrix``.
#[pyfunction]
pub fn decompose_matrix_file(path: &str) -> PyResult<((f64, f64, f64), (f64, f64, f64))> {
    let (_, d) = crate::entry::decompose_matrix_file(Path::new(path)).map_err(to_py_err)?;
    let [tx, ty, tz] = d.translation;
    let [rx, ry, rz] = d.angles_deg;
    Ok(((tx, ty, tz), (rx, ry, rz)))
}

/// Module importable from Python:
///
/// ```python
/// import symtemplate as st
/// st.symmetrize("pipeline.toml")
/// ```
#[pymodule]
fn symtemplate(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add_function(wrap_pyfunction!(symmetrize, m)?)?;
    m.add_function(wrap_pyfunction!(longitudinal, m)?)?;
    m.add_function(wrap_pyfunction!(decompose_matrix, m)?)?;
    m.add_function(wrap_pyfunction!(decompose_matrix_file, m)?)?;
    Ok(())
}
