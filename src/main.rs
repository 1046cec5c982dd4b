//! A neural-network classifier for synthetic 2-D datasets, built on the
//! `nanograd` library.
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run
//! ```
//!
//! Supports a few classic datasets out of the box and allows custom learning
//! rate, momentum, optimizer, batch size, dropout and checkpointing.

use std::fmt::{self, Display};

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

use nanograd::{
    checkpoint::Checkpoint,
    dataloader::DataLoader,
    datasets::{Dataset, draw_dot, load_dataset, plot_data, plot_decision_boundary},
    loss::NllLoss,
    nn::{Mlp, Module},
    optim::{Adam, Optim, Sgd},
    train::{evaluate, train_epoch},
    var::Var,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OptimChoice {
    Sgd,
    Adam,
}

impl Display for OptimChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimChoice::Sgd => write!(f, "sgd"),
            OptimChoice::Adam => write!(f, "adam"),
        }
    }
}

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Dataset::Xor)]
    dataset: Dataset,
    #[clap(short, long, default_value_t = 500)]
    class_size: usize,
    #[clap(short, long, default_value_t = 32)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 50)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.05)]
    lr: f32,
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(long, default_value_t = OptimChoice::Sgd)]
    optimizer: OptimChoice,
    // Note that when increasing the hidden size, activation values may
    // explode if the weights are not initialized properly
    #[clap(long, default_value_t = 16)]
    hidden_units: usize,
    #[clap(long, default_value_t = 0.0)]
    dropout: f32,
    /// Seed for reproducible weight initialization
    #[clap(long)]
    seed: Option<u64>,
    /// Resume from a checkpoint instead of initializing fresh weights
    #[clap(long)]
    load: Option<String>,
    /// Write the trained model to this path
    #[clap(long)]
    save: Option<String>,
    #[clap(short, long, default_value_t = 5)]
    print_epochs: usize,
    #[clap(short, long, default_value_t = format!("output"))]
    output_dir: String,
    #[clap(long, default_value_t = false)]
    graphviz: bool,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let (data, labels) = load_dataset(args.dataset, args.class_size);
    let n_classes = labels.iter().copied().max().map_or(0, |c| c + 1);

    plot_data(
        &data,
        &labels,
        &format!("{}/dataset_{}.png", args.output_dir, args.dataset),
        args.dataset,
    )
    .unwrap();

    let mut model = match &args.load {
        Some(path) => {
            let checkpoint = Checkpoint::load(path).unwrap();
            let model = Mlp::from_checkpoint(&checkpoint).unwrap();
            log::info!("resumed {} model from '{}'", model.arch(), path);
            model
        }
        None => match args.seed {
            Some(seed) => Mlp::with_rng(
                2,
                &[args.hidden_units],
                n_classes,
                args.dropout,
                &mut Pcg64Mcg::seed_from_u64(seed),
            )
            .unwrap(),
            None => Mlp::new(2, &[args.hidden_units], n_classes, args.dropout).unwrap(),
        },
    };

    let mut optim: Box<dyn Optim> = match args.optimizer {
        OptimChoice::Sgd => Box::new(Sgd::new(model.parameters(), args.lr, args.momentum)),
        OptimChoice::Adam => Box::new(Adam::with_defaults(model.parameters(), args.lr)),
    };
    let loader = DataLoader::new(data.clone(), labels.clone(), args.batch_size, true).unwrap();

    for epoch in 0..args.epochs {
        let stats = train_epoch(&mut model, &loader, optim.as_mut()).unwrap();
        log::debug!(
            "dead ReLU units after epoch {}: {}",
            epoch + 1,
            model.n_dead_units()
        );
        if epoch % args.print_epochs == 0 || epoch == args.epochs - 1 {
            log::info!(
                "epoch: {}, avg_loss: {:.4}, accuracy: {:.3}",
                epoch + 1,
                stats.avg_loss,
                stats.accuracy
            );
            if args.graphviz {
                dump_graph(&model, &data, &labels, &args, epoch);
            }
            model.set_training(false);
            plot_decision_boundary(
                &model,
                &format!(
                    "{}/decision_boundary_epoch_{}_{}.png",
                    args.output_dir,
                    epoch + 1,
                    args.dataset
                ),
                args.dataset,
                &data,
                &labels,
            )
            .unwrap();
            model.set_training(true);
        }
    }

    let final_stats = evaluate(&mut model, &loader).unwrap();
    log::info!(
        "final: avg_loss {:.4}, accuracy {:.3}",
        final_stats.avg_loss,
        final_stats.accuracy
    );

    if let Some(path) = &args.save {
        model.checkpoint().save(path).unwrap();
        log::info!("saved {} model to '{}'", model.arch(), path);
    }
}

/// Renders the computation graph of a single-sample loss in DOT format.
fn dump_graph(model: &Mlp, data: &[Vec<f32>], labels: &[usize], args: &Args, epoch: usize) {
    let sample: Vec<Var> = data[0].iter().map(|&v| Var::new(v)).collect();
    let log_probs = model.forward(&sample).unwrap();
    let loss = NllLoss::call(&[log_probs], &labels[..1]).unwrap();
    loss.backward();
    draw_dot(
        &loss,
        &format!(
            "{}/loss_graph_epoch_{}_{}.dot",
            args.output_dir,
            epoch + 1,
            args.dataset
        ),
    )
    .unwrap();
}
