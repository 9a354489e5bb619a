//! Trace and diagnostic plots.
//!
//! Two modes:
//! - **PNG export** via plotters: the multi-panel trace plot of a run and the
//!   Pareto k diagnostic of PSIS-LOO-CV.
//! - **Terminal preview**: one Unicode sparkline per parameter.

use indexmap::IndexMap;
use ndarray::{ArrayView1, Axis};
use plotters::prelude::*;
use plotters::series::DashedLineSeries;
use std::error::Error;
use std::path::Path;

use crate::chain::StepArray;
use crate::criteria::PARETO_K_WARNING;

const PANEL_HEIGHT: u32 = 240;
const PLOT_WIDTH: u32 = 1000;
const PREVIEW_WIDTH: usize = 60;

/// `(min, max)` of the finite values, padded by 5% so lines do not touch the frame.
fn padded_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (-1.0, 1.0);
    }
    if hi - lo < f64::EPSILON {
        return (lo - 1.0, hi + 1.0);
    }
    let pad = 0.05 * (hi - lo);
    (lo - pad, hi + pad)
}

/// Saves the trace plot of every parameter to `output` and, when `show` is
/// set, prints a sparkline preview to standard output.
///
/// One panel per parameter, one line per chain. A dashed vertical line marks
/// the end of the warmup, a dashed horizontal line the parameter's marker.
pub fn timeseries(
    steps: &StepArray,
    names: &[String],
    labels: &[String],
    markers: &IndexMap<String, Option<f64>>,
    warmup: usize,
    output: &Path,
    show: bool,
) -> Result<(), Box<dyn Error>> {
    let (n_steps, n_chains, ndim) = steps.dim();
    if names.len() != ndim || labels.len() != ndim {
        return Err(format!(
            "Got {} names and {} labels for {ndim} parameters",
            names.len(),
            labels.len()
        )
        .into());
    }

    let root = BitMapBackend::new(output, (PLOT_WIDTH, PANEL_HEIGHT * ndim as u32)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((ndim, 1));
    let x_max = n_steps.max(1) as f64;

    for (i, panel) in panels.iter().enumerate() {
        let trace = steps.index_axis(Axis(2), i);
        let marker = markers.get(&names[i]).copied().flatten();
        let (lo, hi) = padded_range(trace.iter().copied().chain(marker));
        let last = i + 1 == ndim;

        let mut chart = ChartBuilder::on(panel)
            .margin(10)
            .x_label_area_size(if last { 40 } else { 20 })
            .y_label_area_size(70)
            .build_cartesian_2d(0.0..x_max, lo..hi)?;

        let mut mesh = chart.configure_mesh();
        mesh.disable_mesh().y_desc(labels[i].as_str());
        if last {
            mesh.x_desc("step number");
        }
        mesh.draw()?;

        for j in 0..n_chains {
            let color = Palette99::pick(j).mix(0.75);
            chart.draw_series(LineSeries::new(
                trace
                    .column(j)
                    .iter()
                    .enumerate()
                    .map(|(t, &v)| (t as f64, v)),
                &color,
            ))?;
        }

        if warmup > 0 {
            chart.draw_series(DashedLineSeries::new(
                vec![(warmup as f64, lo), (warmup as f64, hi)],
                6,
                4,
                BLACK.stroke_width(1),
            ))?;
        }
        if let Some(m) = marker {
            chart.draw_series(DashedLineSeries::new(
                vec![(0.0, m), (x_max, m)],
                6,
                4,
                BLACK.stroke_width(1),
            ))?;
        }
    }

    root.present()?;

    if show {
        print!("{}", preview(steps, labels, warmup));
    }
    Ok(())
}

/// Saves the Pareto k diagnostic of every observation to `output`, with
/// dashed reference lines at 0.5 and 0.7.
pub fn khat(pareto_k: ArrayView1<f64>, output: &Path) -> Result<(), Box<dyn Error>> {
    let n = pareto_k.len();
    let finite_max = pareto_k
        .iter()
        .copied()
        .filter(|k| k.is_finite())
        .fold(1.0_f64, f64::max);
    let (lo, _) = padded_range(pareto_k.iter().copied().chain([0.0, 1.0]));
    let hi = finite_max + 0.1;

    let root = BitMapBackend::new(output, (PLOT_WIDTH, 500)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("PSIS diagnostic", ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5..(n as f64 - 0.5).max(0.5), lo..hi)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("data point")
        .y_desc("shape parameter k")
        .draw()?;

    chart.draw_series(pareto_k.iter().enumerate().map(|(i, &k)| {
        let color = if k > PARETO_K_WARNING { RED } else { BLUE };
        Circle::new((i as f64, k.min(hi)), 3, color.filled())
    }))?;

    for level in [0.5, PARETO_K_WARNING] {
        chart.draw_series(DashedLineSeries::new(
            vec![(-0.5, level), (n as f64 - 0.5, level)],
            6,
            4,
            BLACK.mix(0.6).stroke_width(1),
        ))?;
    }

    root.present()?;
    Ok(())
}

/// Renders `values` as a line of block characters, resampled to `width`.
pub fn sparkline(values: &[f64], width: usize) -> String {
    if values.is_empty() {
        return " ".repeat(width);
    }

    let chars = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = (max - min).max(1e-12);

    (0..width)
        .map(|i| {
            let idx = if values.len() <= width {
                if i < values.len() {
                    i
                } else {
                    return ' ';
                }
            } else {
                i * values.len() / width
            };
            let normalized = (values[idx] - min) / range;
            chars[((normalized * 7.0).round() as usize).min(7)]
        })
        .collect()
}

/// Terminal preview of a run: per parameter, the chain-averaged trace as a
/// sparkline with the warmup separated by `|`.
pub fn preview(steps: &StepArray, labels: &[String], warmup: usize) -> String {
    let n_steps = steps.len_of(Axis(0));
    let warmup_width = if n_steps == 0 {
        0
    } else {
        (PREVIEW_WIDTH * warmup).div_ceil(n_steps).min(PREVIEW_WIDTH)
    };
    let label_width = labels.iter().map(|l| l.chars().count()).max().unwrap_or(0);

    let mut out = String::new();
    for (i, label) in labels.iter().enumerate() {
        let trace = steps.index_axis(Axis(2), i);
        let means: Vec<f64> = trace
            .mean_axis(Axis(1))
            .map(|m| m.to_vec())
            .unwrap_or_default();
        let (head, tail) = means.split_at(warmup.min(means.len()));
        let mut line = sparkline(head, warmup_width);
        if !head.is_empty() {
            line.push('|');
        }
        line.push_str(&sparkline(tail, PREVIEW_WIDTH - warmup_width));
        out.push_str(&format!("{label:>label_width$} {}\n", line.trim_end()));
    }
    out
}
