//! Synthetic binary classification datasets plus utilities for plotting them,
//! rendering decision boundaries, and dumping computation graphs.
//!
//! By convention class 0 is plotted in red and class 1 is plotted in blue.

use std::{
    collections::HashSet,
    error::Error,
    f32::consts::PI,
    fmt::{self, Display, Write as _},
    fs,
};

use clap::ValueEnum;
use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, Circle, IntoDrawingArea, Rectangle},
    style::{BLUE, Color, RED, RGBColor, WHITE},
};
use rand::Rng;

use crate::{
    nn::Module,
    ops::argmax,
    var::{SharedNode, Var},
};

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy)]
pub enum Dataset {
    Line,
    Circle,
    Xor,
    Moon,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::Xor => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
        }
    }
}

/// Loads a dataset based on the dataset type. Labels are integer class
/// indices.
pub fn load_dataset(dataset: Dataset, class_size: usize) -> (Vec<Vec<f32>>, Vec<usize>) {
    match dataset {
        Dataset::Line => gen_linear_data(class_size),
        Dataset::Circle => gen_circle_data(class_size),
        Dataset::Xor => gen_xor_data(class_size),
        Dataset::Moon => gen_moon_data(class_size),
    }
}

/// Generates a simple linearly separable dataset
pub fn gen_linear_data(class_size: usize) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut rng = rand::rng();
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(usize::from(x <= y));
    }

    (data, labels)
}

/// Generates a binary classification dataset of two concentric rings
pub fn gen_circle_data(class_size: usize) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut rng = rand::rng();
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for (radius, label) in [(3.0f32, 0), (5.0f32, 1)] {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let r = radius * (1.0 + rng.random_range(-0.25..0.25));
            data.push(vec![r * angle.cos(), r * angle.sin()]);
            labels.push(label);
        }
    }

    (data, labels)
}

/// Generates an XOR-patterned dataset: quadrant parity decides the class
pub fn gen_xor_data(class_size: usize) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut rng = rand::rng();
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(usize::from(x.signum() != y.signum()));
    }

    (data, labels)
}

/// Generates a moons dataset (two interleaving partial circles)
pub fn gen_moon_data(class_size: usize) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut rng = rand::rng();
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let radius = 3.0f32;

    for _ in 0..class_size {
        let theta = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
        let noise_x = rng.random_range(-0.1..0.1);
        let noise_y = rng.random_range(-0.1..0.1);
        data.push(vec![
            radius * theta.cos() + noise_x,
            radius * theta.sin() + noise_y,
        ]);
        labels.push(0);

        let theta = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
        let noise_x = rng.random_range(-0.1..0.1);
        let noise_y = rng.random_range(-0.1..0.1);
        data.push(vec![
            radius * theta.cos() + 2.0 + noise_x,
            -radius * theta.sin() - 0.2 + noise_y,
        ]);
        labels.push(1);
    }

    (data, labels)
}

/// Plots the data points and labels for a given dataset
pub fn plot_data(
    data: &[Vec<f32>],
    labels: &[usize],
    file_name: &str,
    dataset: Dataset,
) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(format!("Dataset: {}", dataset), ("sans-serif", 50))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(-6.0f32..6.0f32, -6.0f32..6.0f32)?;

    chart.configure_mesh().draw()?;

    chart.draw_series(data.iter().zip(labels.iter()).map(|(point, &label)| {
        let color = if label == 0 { RED } else { BLUE };
        Circle::new((point[0], point[1]), 3, color.filled())
    }))?;

    root_area.present()?;
    log::info!("Data plot has been saved to '{}'.", file_name);

    Ok(())
}

/// Plots the decision boundary for a given model on a given dataset by
/// sampling a grid of points and evaluating the model. Callers should switch
/// the model to evaluation mode first so dropout does not perturb the grid.
pub fn plot_decision_boundary(
    model: &dyn Module,
    file_name: &str,
    dataset: Dataset,
    data: &[Vec<f32>],
    labels: &[usize],
) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let grid_min = -6.0;
    let grid_max = 6.0;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(
            format!("Decision Boundary for {}", dataset),
            ("sans-serif", 50),
        )
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(grid_min..grid_max, grid_min..grid_max)?;

    chart.configure_mesh().draw()?;

    let red_bg = RGBColor(255, 200, 200);
    let blue_bg = RGBColor(200, 200, 255);

    let step = 0.20;
    let n_steps: f32 = (grid_max - grid_min) / step;
    let n_steps = n_steps.round() as i32;
    let grid_points = (0..n_steps).flat_map(|xi| {
        let x = grid_min + (xi as f32 * step);
        (0..n_steps).map(move |yi| {
            let y = grid_min + (yi as f32 * step);
            (x, y)
        })
    });

    let mut cells = Vec::new();
    for (x, y) in grid_points {
        let input = [Var::constant(x), Var::constant(y)];
        let output = model.forward(&input)?;
        let color = if argmax(&output) == 0 { red_bg } else { blue_bg };
        cells.push(Rectangle::new(
            [
                (x - step / 2.0, y - step / 2.0),
                (x + step / 2.0, y + step / 2.0),
            ],
            color.filled(),
        ));
    }
    chart.draw_series(cells)?;

    // plot the data points over the grid
    chart.draw_series(data.iter().zip(labels.iter()).map(|(point, &label)| {
        let color = if label == 0 { RED } else { BLUE };
        Circle::new((point[0], point[1]), 3, color.filled())
    }))?;

    root_area.present()?;
    log::info!("Decision boundary plot saved to '{}'.", file_name);
    Ok(())
}

/// Dumps a node's computation graph in graphviz DOT format, one record per
/// node showing the producing op, payload and accumulated gradient.
pub fn draw_dot(root: &Var, file_name: &str) -> std::io::Result<()> {
    let mut out = String::from("digraph {\n  rankdir=LR;\n  node [shape=record];\n");
    let mut visited: HashSet<u64> = HashSet::new();
    let mut stack: Vec<SharedNode> = vec![root.0.clone()];
    while let Some(node) = stack.pop() {
        let inner = node.borrow();
        if !visited.insert(inner.id) {
            continue;
        }
        let op = inner
            .op
            .map_or_else(|| "leaf".to_string(), |op| format!("{:?}", op));
        let _ = writeln!(
            out,
            "  n{} [label=\"{} | data {:.4} | grad {:.4}\"];",
            inner.id, op, inner.data, inner.grad
        );
        for parent in &inner.parents {
            let _ = writeln!(out, "  n{} -> n{};", parent.borrow().id, inner.id);
            stack.push(parent.clone());
        }
    }
    out.push_str("}\n");
    fs::write(file_name, out)?;
    log::info!("Computation graph saved to '{}'.", file_name);
    Ok(())
}
