use anyhow::{bail, Context, Result};
use burn::prelude::*;
use burn::tensor::Distribution;
use diffusion_lora::cli::{parse_args, setup_logging, Commands, InitConfigArgs, PlanArgs, SimulateArgs};
use diffusion_lora::model::parts::{ModelPart, SetupDevices, TextEncoderPart};
use diffusion_lora::model::tokenizer::Vocabulary;
use diffusion_lora::model::ModelConfig;
use diffusion_lora::setup::placement::{Placement, PlacementFlags};
use diffusion_lora::setup::{params, LoraSetup};
use diffusion_lora::training::{CsvMetricsSink, GroupScheduler, MetricsSink, TrainConfig, TrainProgress};
use diffusion_lora::utils::{format_number, memory};
use diffusion_lora::DefaultBackend;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{error, info};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", diffusion_lora::info());

    let result = match cli.command {
        Commands::InitConfig(args) => run_init_config(args),
        Commands::Plan(args) => run_plan(args),
        Commands::Simulate(args) => run_simulate(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<TrainConfig> {
    match path {
        Some(path) => {
            info!("Loading config from {:?}", path);
            TrainConfig::load(path)
        }
        None => {
            info!("No config given, using defaults");
            Ok(TrainConfig::default())
        }
    }
}

fn run_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        bail!("{:?} already exists, pass --force to overwrite", args.output);
    }

    TrainConfig::default().save(&args.output)?;
    info!("Default configuration written to {:?}", args.output);
    Ok(())
}

fn run_plan(args: PlanArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    let device = Default::default();
    let mut model = ModelConfig::new().init::<DefaultBackend>(&device);
    let setup = LoraSetup::new(SetupDevices::new(device, device));
    setup
        .setup_model(&mut model, &config)
        .context("Setup failed")?;

    let placement = Placement::resolve(&PlacementFlags::from_config(&config));
    let groups = params::create_parameter_groups(&model, &config)?;

    info!("\n=== Parameter Groups ===");
    for group in &groups {
        info!(
            "  {:<10} lr {:<10} {} tensors, {} weights",
            group.name,
            group.lr,
            group.params.len(),
            format_number(group.num_elements())
        );
    }
    info!("\n=== Placement ===");
    info!("  text encoder    {}", placement.text_encoder);
    info!("  vae             {}", placement.vae);
    info!("  unet            {}", placement.unet);
    info!("  depth estimator {}", placement.depth_estimator);

    if let Some(output) = args.output {
        let plan = serde_json::json!({
            "groups": groups
                .iter()
                .map(|g| serde_json::json!({
                    "name": g.name,
                    "learning_rate": g.lr,
                    "tensors": g.params.len(),
                    "weights": g.num_elements(),
                }))
                .collect::<Vec<_>>(),
            "placement": {
                "text_encoder": placement.text_encoder,
                "vae": placement.vae,
                "unet": placement.unet,
                "depth_estimator": placement.depth_estimator,
            },
        });
        let json = serde_json::to_string_pretty(&plan)?;
        std::fs::write(&output, json).with_context(|| format!("Failed to write plan to {:?}", output))?;
        info!("Plan saved to: {:?}", output);
    }

    Ok(())
}

fn run_simulate(args: SimulateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    diffusion_lora::utils::ensure_dir(&args.output)?;

    let device = Default::default();
    let mut model = ModelConfig::new()
        .with_seed(args.seed)
        .with_depth_estimator(true)
        .init::<DefaultBackend>(&device);

    if let Some(path) = &args.tokenizer {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer from {:?}: {}", path, e))?;
        let vocab_size = Vocabulary::len(&tokenizer);
        model.text_encoder.token_embeddings_mut().resize(vocab_size);
        model.tokenizer = Box::new(tokenizer);
        info!("Loaded tokenizer with {} tokens", format_number(vocab_size));
    }

    let setup = LoraSetup::new(SetupDevices::new(device, device));
    setup.setup_model(&mut model, &config).context("Setup failed")?;
    setup
        .setup_train_device(&mut model, &config)
        .context("Device placement failed")?;

    for lora in [model.text_encoder_lora.as_ref(), model.unet_lora.as_ref()]
        .into_iter()
        .flatten()
    {
        info!(
            "{}: {} layers, {}",
            lora.prefix(),
            lora.layers().len(),
            memory::format_bytes(lora.size_in_bytes())
        );
    }

    let optimizer = model
        .optimizer
        .as_ref()
        .context("Optimizer missing after setup")?;
    let mut scheduler = GroupScheduler::for_optimizer(config.scheduler.clone(), optimizer);

    let metrics_path = args.output.join("metrics.csv");
    let mut sink = CsvMetricsSink::create(&metrics_path)?;

    let total_steps = (args.epochs * args.steps_per_epoch) as u64;
    let pb = ProgressBar::new(total_steps);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    let mut progress = TrainProgress::new();
    for _ in 0..args.epochs {
        for _ in 0..args.steps_per_epoch {
            simulate_update(&mut model, &config);

            let optimizer = model
                .optimizer
                .as_mut()
                .context("Optimizer missing after setup")?;
            optimizer.record_step(None);
            scheduler.step(optimizer);

            progress.next_step(config.batch_size);
            model.train_progress = progress;
            setup
                .after_optimizer_step(&mut model, &config, &progress)
                .context("After-step hook failed")?;

            if let Some(ema) = model.ema.as_mut() {
                if ema.should_update(progress.global_step) {
                    ema.record_update();
                }
            }

            if args.report_every > 0 && progress.global_step % args.report_every == 0 {
                setup.report_learning_rates(&model, &config, &scheduler, &mut sink)?;
            }

            pb.set_message(format!("epoch {}", progress.epoch));
            pb.inc(1);
        }
        progress.next_epoch();
        model.train_progress = progress;
    }
    pb.finish_with_message("done");
    sink.flush()?;

    let guard = model
        .embedding_guard
        .as_ref()
        .context("Embedding guard missing after setup")?;
    if !guard.frozen_rows_intact(model.text_encoder.token_embeddings().weight())? {
        bail!("Frozen embedding rows drifted during simulation");
    }

    info!("\n=== Simulation Results ===");
    info!("Steps: {}", progress.global_step);
    info!("Trainable embedding rows: {:?}", guard.trainable_ids());
    info!("Text encoder mode: {:?}", model.text_encoder.mode());
    info!("Frozen embedding rows intact");
    info!("Metrics saved to: {:?}", metrics_path);

    Ok(())
}

/// Stand-in for an optimizer step: perturb the whole embedding matrix the way
/// weight decay and momentum would.
fn simulate_update(model: &mut diffusion_lora::DiffusionModel<DefaultBackend>, config: &TrainConfig) {
    let embeddings = model.text_encoder.token_embeddings_mut();
    let scale = config.learning_rate.max(1e-6);
    let noise = Tensor::random(
        embeddings.weight().dims(),
        Distribution::Uniform(-scale, scale),
        &embeddings.weight().device(),
    );
    let updated = embeddings.weight().clone().mul_scalar(1.0 - config.optimizer.weight_decay * scale) + noise;
    embeddings.set_weight(updated);
}
